use kube::CustomResourceExt;
use nfs_volume_controller_apis::NFSVolume;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&NFSVolume::crd()).unwrap());
}
