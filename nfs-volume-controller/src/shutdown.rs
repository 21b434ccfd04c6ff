//! Termination signal handling.
//!
//! The first SIGINT/SIGTERM cancels the stop token and starts a graceful
//! shutdown, a second one terminates the process immediately.

use futures::{Stream, StreamExt};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub(crate) fn install_signal_handler(stop: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let interrupt = signal(SignalKind::interrupt())?;
    let terminate = signal(SignalKind::terminate())?;
    let signals = futures::stream::unfold(
        (interrupt, terminate),
        |(mut interrupt, mut terminate)| async move {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            Some((name, (interrupt, terminate)))
        },
    );
    Ok(tokio::spawn(handle_signals(signals, stop, || {
        std::process::exit(1)
    })))
}

async fn handle_signals<S, F>(signals: S, stop: CancellationToken, force_exit: F)
where
    S: Stream<Item = &'static str>,
    F: FnOnce(),
{
    let mut signals = std::pin::pin!(signals);
    match signals.next().await {
        Some(name) => {
            info!("received {}, shutting down gracefully", name);
            stop.cancel();
        }
        None => return,
    }
    if let Some(name) = signals.next().await {
        warn!("received second {}, exiting immediately", name);
        force_exit();
    }
}
