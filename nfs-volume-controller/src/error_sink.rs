use std::fmt::Display;

use opentelemetry::{KeyValue, global, metrics::Meter};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::utils::metric_name;

/// A non-fatal error reported by one of the controller components.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ReportedError {
    /// The reporting component.
    pub source: &'static str,
    pub message: String,
}

/// Process-wide, non-blocking reporting channel for non-fatal errors.
///
/// Reporting never blocks and never fails, if the receiving end is gone the
/// error is logged in place.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    sender: UnboundedSender<ReportedError>,
}

impl ErrorSink {
    pub fn new() -> (Self, UnboundedReceiver<ReportedError>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn report(&self, source: &'static str, error: impl Display) {
        let reported = ReportedError {
            source,
            message: error.to_string(),
        };
        if let Err(e) = self.sender.send(reported) {
            error!("{}: {}", e.0.source, e.0.message);
        }
    }
}

/// Log (and count) every reported error until all [`ErrorSink`]s are dropped.
pub(crate) async fn log_reported_errors(mut receiver: UnboundedReceiver<ReportedError>) {
    let meter: Meter = global::meter("error_sink");
    let errors_reported = meter
        .u64_counter(metric_name("errors_reported"))
        .with_description("Count of non-fatal errors reported by controller components")
        .build();
    while let Some(reported) = receiver.recv().await {
        error!("{}: {}", reported.source, reported.message);
        errors_reported.add(1, &[KeyValue::new("source", reported.source)]);
    }
    debug!("error sink closed");
}
