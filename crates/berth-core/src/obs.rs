//! Structured observability hooks for build and launch lifecycle events.
//!
//! Events are emitted at `info!` level; stage failures at `warn!`.
//! Filter with `RUST_LOG`, switch to JSON with `--json`.

use crate::stage::Stage;
use tracing::{info, warn};

/// Span that tags every event of one build with its id.
///
/// ```ignore
/// pipeline.execute(spec).instrument(build_span("0b7f...")).await
/// ```
pub fn build_span(build_id: &str) -> tracing::Span {
    tracing::info_span!("berth.build", build_id = %build_id)
}

pub fn emit_build_started(build_id: &str, environment: &str, source: &str) {
    info!(
        event = "build.started",
        build_id = %build_id,
        environment = %environment,
        source = %source,
    );
}

pub fn emit_stage_started(build_id: &str, stage: Stage) {
    info!(event = "stage.started", build_id = %build_id, stage = %stage);
}

pub fn emit_stage_finished(build_id: &str, stage: Stage, duration_ms: u64, success: bool) {
    if success {
        info!(
            event = "stage.finished",
            build_id = %build_id,
            stage = %stage,
            duration_ms = duration_ms,
            success = success,
        );
    } else {
        warn!(
            event = "stage.finished",
            build_id = %build_id,
            stage = %stage,
            duration_ms = duration_ms,
            success = success,
        );
    }
}

pub fn emit_build_finished(build_id: &str, duration_ms: u64, success: bool, image_id: Option<&str>) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        duration_ms = duration_ms,
        success = success,
        image_id = image_id.unwrap_or("-"),
    );
}

pub fn emit_launch_started(image_id: &str, program: &str) {
    info!(event = "launch.started", image_id = %image_id, program = %program);
}

pub fn emit_launch_exited(image_id: &str, exit_code: i32, duration_ms: u64) {
    info!(
        event = "launch.exited",
        image_id = %image_id,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Emit event: the build record could not be finalized (warning level).
pub fn emit_build_finalize_error(build_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "build.finalize_error", build_id = %build_id, error = %error);
}
