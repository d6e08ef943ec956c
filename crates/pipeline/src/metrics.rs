//! Stage and pipeline metrics
//!
//! Recorded through the `metrics` facade; the server installs the Prometheus
//! recorder. Without a recorder these calls are no-ops.

use std::time::Duration;
use voice_gateway_core::{Stage, StageError, StageErrorKind};

/// Record one capability call
pub fn record_stage(stage: Stage, backend: &str, elapsed: Duration, error: Option<&StageError>) {
    metrics::histogram!(
        "stage_duration_seconds",
        "stage" => stage.as_str(),
        "backend" => backend.to_string()
    )
    .record(elapsed.as_secs_f64());

    if let Some(err) = error {
        // Cancellation is the client leaving, not a stage fault
        if err.kind != StageErrorKind::Cancelled {
            metrics::counter!(
                "stage_errors_total",
                "stage" => stage.as_str(),
                "kind" => err.kind.as_str()
            )
            .increment(1);
        }
    }
}

/// Record one end-to-end pipeline run (`dialogue`, `speech_to_text`, ...)
pub fn record_pipeline(pipeline: &'static str, elapsed: Duration, success: bool) {
    metrics::histogram!("pipeline_duration_seconds", "pipeline" => pipeline)
        .record(elapsed.as_secs_f64());
    if !success {
        metrics::counter!("pipeline_errors_total", "pipeline" => pipeline).increment(1);
    }
}
