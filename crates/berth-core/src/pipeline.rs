//! Build pipeline orchestration.
//!
//! Runs Provision, Ingest, Compile and Bind strictly in order. A stage only
//! starts after its predecessor succeeded, the first failure ends the run,
//! and an image is committed to the store only when every stage passed.

use crate::bind::bind;
use crate::compile::compile;
use crate::error::{PipelineError, Result};
use crate::image::{Image, ImageManifest, ImageStore};
use crate::ingest::ingest;
use crate::obs;
use crate::provision::provision;
use crate::recorder::{BuildId, BuildLedger, BuildMetadata, BuildRecorder, BuildSummary};
use crate::spec::{BuildSpec, ImageId};
use crate::stage::Stage;
use berth_env::EnvironmentResolver;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{warn, Instrument};

/// Result of one pipeline run.
#[derive(Debug)]
pub struct BuildReport {
    pub build_id: BuildId,
    pub duration_ms: u64,
    pub outcome: std::result::Result<Image, PipelineError>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn image(&self) -> Option<&Image> {
        self.outcome.as_ref().ok()
    }

    pub fn into_result(self) -> Result<Image> {
        self.outcome
    }
}

/// Runs builds against an environment resolver, an image store and a
/// build ledger.
pub struct BuildPipeline<'a> {
    resolver: &'a dyn EnvironmentResolver,
    store: &'a ImageStore,
    ledger: Arc<dyn BuildLedger>,
}

impl<'a> BuildPipeline<'a> {
    pub fn new(
        resolver: &'a dyn EnvironmentResolver,
        store: &'a ImageStore,
        ledger: Arc<dyn BuildLedger>,
    ) -> Self {
        Self {
            resolver,
            store,
            ledger,
        }
    }

    /// Build `spec` into an image.
    ///
    /// Returns `Err` only when the spec is invalid or the build record cannot
    /// be created. Stage failures are reported through
    /// [`BuildReport::outcome`] and recorded in the ledger.
    pub async fn run(&self, spec: &BuildSpec) -> Result<BuildReport> {
        spec.validate()?;

        let start = Instant::now();
        let metadata = BuildMetadata {
            environment: spec.environment.to_string(),
            source: spec.source.display().to_string(),
            workdir: spec.workdir.display().to_string(),
            artifact: spec.artifact.clone(),
        };
        let mut recorder = BuildRecorder::start(self.ledger.clone(), metadata).await?;
        let build_id = recorder.build_id().clone();

        obs::emit_build_started(
            &build_id.0,
            &spec.environment.to_string(),
            &spec.source.display().to_string(),
        );

        let outcome = self
            .execute(spec, &mut recorder)
            .instrument(obs::build_span(&build_id.0))
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = match &outcome {
            Ok(image) => BuildSummary {
                success: true,
                duration_ms,
                total_events: recorder.event_count(),
                image_id: Some(image.id().to_string()),
                failed_stage: None,
                error: None,
            },
            Err(e) => BuildSummary {
                success: false,
                duration_ms,
                total_events: recorder.event_count(),
                image_id: None,
                failed_stage: recorder.current_stage().or_else(|| e.stage()),
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = recorder.finish(summary).await {
            obs::emit_build_finalize_error(&build_id.0, &e);
        }

        obs::emit_build_finished(
            &build_id.0,
            duration_ms,
            outcome.is_ok(),
            outcome.as_ref().ok().map(|image| image.id().as_str()),
        );

        Ok(BuildReport {
            build_id,
            duration_ms,
            outcome,
        })
    }

    async fn execute(&self, spec: &BuildSpec, recorder: &mut BuildRecorder) -> Result<Image> {
        // Provision
        let started = begin(recorder, Stage::Provision).await?;
        let environment = settle(
            recorder,
            Stage::Provision,
            started,
            provision(self.resolver, &spec.environment),
            |env| {
                json!({
                    "environment": env.reference.to_string(),
                    "digest": env.digest.as_str(),
                })
            },
        )
        .await?;

        // Ingest (the staging workspace is created here, so a provisioning
        // failure never touches the store)
        let started = begin(recorder, Stage::Ingest).await?;
        let staged = self
            .store
            .stage(&spec.workdir)
            .and_then(|workspace| ingest(&spec.source, &workspace).map(|s| (workspace, s)));
        let (workspace, source) = settle(recorder, Stage::Ingest, started, staged, |(_, s)| {
            json!({
                "source_digest": s.digest,
                "files": s.files,
                "dirs": s.dirs,
                "symlinks": s.symlinks,
                "bytes": s.bytes,
            })
        })
        .await?;

        // Compile
        let started = begin(recorder, Stage::Compile).await?;
        let compiled = compile(
            &environment,
            &workspace,
            &spec.artifact,
            spec.compile_timeout_secs,
        )
        .await;
        let compiled = settle(recorder, Stage::Compile, started, compiled, |c| {
            json!({
                "artifact": c.in_image.display().to_string(),
                "exit_code": c.output.exit_code,
                "toolchain_ms": c.output.duration_ms,
            })
        })
        .await?;

        // Bind (includes the commit into the store)
        let started = begin(recorder, Stage::Bind).await?;
        let committed = match bind(&workspace, &compiled) {
            Ok(command) => {
                let id = ImageId::compute(
                    environment.digest.as_str(),
                    &source.digest,
                    &environment.manifest.toolchain.build,
                    &spec.workdir,
                    &spec.artifact,
                );
                let manifest = ImageManifest::new(
                    id,
                    environment.reference.clone(),
                    source.digest.clone(),
                    spec.workdir.clone(),
                    compiled.in_image.clone(),
                    command,
                    environment.manifest.env.clone(),
                    recorder.build_id().to_string(),
                );
                self.store.commit(workspace, manifest)
            }
            Err(e) => Err(e),
        };
        settle(recorder, Stage::Bind, started, committed, |image| {
            json!({
                "image_id": image.id().as_str(),
                "default_command": image.manifest.default_command.argv(),
            })
        })
        .await
    }
}

async fn begin(recorder: &mut BuildRecorder, stage: Stage) -> Result<Instant> {
    recorder.stage_started(stage).await?;
    obs::emit_stage_started(&recorder.build_id().0, stage);
    Ok(Instant::now())
}

/// Record the outcome of `stage` and pass it through.
async fn settle<T>(
    recorder: &mut BuildRecorder,
    stage: Stage,
    started: Instant,
    result: Result<T>,
    payload: impl FnOnce(&T) -> Value,
) -> Result<T> {
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            let mut payload = payload(&value);
            payload["duration_ms"] = json!(duration_ms);
            recorder.stage_succeeded(stage, payload).await?;
            obs::emit_stage_finished(&recorder.build_id().0, stage, duration_ms, true);
            Ok(value)
        }
        Err(error) => {
            let payload = failure_payload(&error, duration_ms);
            if let Err(record_err) = recorder.stage_failed(stage, payload).await {
                warn!(stage = %stage, error = %record_err, "Failed to record stage failure");
            }
            obs::emit_stage_finished(&recorder.build_id().0, stage, duration_ms, false);
            Err(error)
        }
    }
}

fn failure_payload(error: &PipelineError, duration_ms: u64) -> Value {
    let mut payload = json!({
        "error": error.to_string(),
        "duration_ms": duration_ms,
    });
    if let PipelineError::Compile {
        exit_code,
        diagnostics,
    } = error
    {
        payload["exit_code"] = json!(exit_code);
        payload["diagnostics"] = json!(diagnostics);
    }
    payload
}
