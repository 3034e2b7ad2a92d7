//! Build gate: decides from recorded events whether a build produced a
//! runnable image.

use crate::recorder::{BuildEvent, BuildEventKind};
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

#[derive(Default)]
struct StageTrace {
    started: bool,
    succeeded: bool,
    failure: Option<String>,
}

/// Build gate evaluation rules.
pub struct BuildGate;

impl BuildGate {
    /// Evaluate a build's events.
    ///
    /// Gate rule:
    /// - Every stage (provision, ingest, compile, bind) must have a
    ///   `stage_started` event followed by a `stage_succeeded` event
    /// - No stage may start before its predecessor succeeded
    /// - Any `stage_failed` event fails the gate
    pub fn evaluate(events: &[BuildEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut traces: HashMap<Stage, StageTrace> = HashMap::new();

        for event in events {
            match event.kind {
                BuildEventKind::StageStarted => {
                    if let Some(prev) = event.stage.predecessor() {
                        let ready = traces.get(&prev).map(|t| t.succeeded).unwrap_or(false);
                        if !ready {
                            violations.push(format!(
                                "Stage '{}' started before '{}' succeeded",
                                event.stage, prev
                            ));
                        }
                    }
                    traces.entry(event.stage).or_default().started = true;
                }
                BuildEventKind::StageSucceeded => {
                    let trace = traces.entry(event.stage).or_default();
                    if !trace.started {
                        violations.push(format!(
                            "Stage '{}' succeeded without being started",
                            event.stage
                        ));
                    }
                    trace.succeeded = true;
                }
                BuildEventKind::StageFailed => {
                    let error = event.payload["error"]
                        .as_str()
                        .unwrap_or("Unknown error")
                        .to_string();
                    traces.entry(event.stage).or_default().failure = Some(error);
                }
            }
        }

        for stage in Stage::ALL {
            match traces.get(&stage) {
                None => violations.push(format!("Stage '{}' never ran", stage)),
                Some(StageTrace {
                    failure: Some(error),
                    ..
                }) => violations.push(format!("Stage '{}' failed: {}", stage, error)),
                Some(trace) if !trace.succeeded => {
                    violations.push(format!("Stage '{}' was started but never completed", stage))
                }
                Some(_) => {}
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
