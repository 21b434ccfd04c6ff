use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

const METRICS_PATH: &str = "/metrics";

fn encode_metrics(registry: &Registry) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => {
            let mut response = Response::new(Full::new(Bytes::from(result)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("{}", e);
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = code;
    response
}

fn serve_req(req: &Request<Incoming>, registry: &Registry) -> Response<Full<Bytes>> {
    match req.uri().path() {
        METRICS_PATH | "/" => encode_metrics(registry),
        _ => status(StatusCode::NOT_FOUND),
    }
}

/// Serve the metrics gathered by `registry` on `addr` until the process exits.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        "serving metrics on http://{}{}",
        listener.local_addr()?,
        METRICS_PATH
    );
    serve(listener, registry).await;
    Ok(())
}

async fn serve(listener: TcpListener, registry: Registry) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("failed to accept metrics connection: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = serve_req(&req, &registry);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}
