//! Build run recording.
//!
//! Every pipeline run is recorded as a [`BuildRecord`]: metadata, an ordered
//! list of stage events and a final summary. Failed builds are recorded too,
//! so the failing stage's diagnostics survive the discarded workspace.

use crate::error::{PipelineError, Result};
use crate::image::write_json_atomic;
use crate::stage::Stage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Unique identifier of a build run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new() -> Self {
        BuildId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a recorded stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildEventKind {
    StageStarted,
    StageSucceeded,
    StageFailed,
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// 1-based sequence number within the build.
    pub seq: u64,
    pub kind: BuildEventKind,
    pub stage: Stage,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Inputs a build was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub environment: String,
    pub source: String,
    pub workdir: String,
    pub artifact: String,
}

/// Final state of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub success: bool,
    pub duration_ms: u64,
    pub total_events: u64,
    pub image_id: Option<String>,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
}

/// A complete build record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub metadata: BuildMetadata,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<BuildSummary>,
    pub events: Vec<BuildEvent>,
}

impl BuildRecord {
    fn new(build_id: BuildId, metadata: BuildMetadata) -> Self {
        Self {
            build_id,
            metadata,
            started_at: Utc::now(),
            finished_at: None,
            summary: None,
            events: Vec::new(),
        }
    }

    fn append(&mut self, event: BuildEvent) -> Result<()> {
        if self.summary.is_some() {
            return Err(PipelineError::Ledger(format!(
                "build {} already finished",
                self.build_id
            )));
        }
        let expected = self.events.len() as u64 + 1;
        if event.seq != expected {
            return Err(PipelineError::Ledger(format!(
                "build {}: expected seq {}, got {}",
                self.build_id, expected, event.seq
            )));
        }
        self.events.push(event);
        Ok(())
    }

    fn finish(&mut self, summary: BuildSummary) -> Result<()> {
        if self.summary.is_some() {
            return Err(PipelineError::Ledger(format!(
                "build {} already finished",
                self.build_id
            )));
        }
        self.finished_at = Some(Utc::now());
        self.summary = Some(summary);
        Ok(())
    }
}

/// Persistence for build records.
#[async_trait]
pub trait BuildLedger: Send + Sync {
    /// Start a new build record.
    async fn create_build(&self, metadata: BuildMetadata) -> Result<BuildId>;

    /// Append an event. Sequence numbers must be contiguous from 1.
    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> Result<()>;

    /// Finalize a build. A build can only be finished once.
    async fn finish_build(&self, build_id: &BuildId, summary: BuildSummary) -> Result<()>;

    async fn get_build(&self, build_id: &BuildId) -> Result<BuildRecord>;

    /// All builds, oldest first.
    async fn list_builds(&self) -> Result<Vec<BuildRecord>>;
}

// ---------------------------------------------------------------------------
// MemoryBuildLedger
// ---------------------------------------------------------------------------

/// In-memory ledger backed by a `HashMap<BuildId, BuildRecord>`.
#[derive(Debug, Default)]
pub struct MemoryBuildLedger {
    builds: Mutex<HashMap<String, BuildRecord>>,
}

impl MemoryBuildLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        build_id: &BuildId,
        f: impl FnOnce(&mut BuildRecord) -> Result<T>,
    ) -> Result<T> {
        let mut builds = self.builds.lock().unwrap();
        let record = builds
            .get_mut(&build_id.0)
            .ok_or_else(|| PipelineError::BuildNotFound(build_id.to_string()))?;
        f(record)
    }
}

#[async_trait]
impl BuildLedger for MemoryBuildLedger {
    async fn create_build(&self, metadata: BuildMetadata) -> Result<BuildId> {
        let build_id = BuildId::new();
        self.builds
            .lock()
            .unwrap()
            .insert(build_id.0.clone(), BuildRecord::new(build_id.clone(), metadata));
        Ok(build_id)
    }

    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> Result<()> {
        self.with_record(build_id, |r| r.append(event))
    }

    async fn finish_build(&self, build_id: &BuildId, summary: BuildSummary) -> Result<()> {
        self.with_record(build_id, |r| r.finish(summary))
    }

    async fn get_build(&self, build_id: &BuildId) -> Result<BuildRecord> {
        self.with_record(build_id, |r| Ok(r.clone()))
    }

    async fn list_builds(&self) -> Result<Vec<BuildRecord>> {
        let mut records: Vec<_> = self.builds.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// FsBuildLedger
// ---------------------------------------------------------------------------

/// Ledger storing one JSON document per build: `<dir>/<build-id>.json`.
///
/// Each update rewrites the document atomically.
#[derive(Debug, Clone)]
pub struct FsBuildLedger {
    dir: PathBuf,
}

impl FsBuildLedger {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, build_id: &BuildId) -> Result<PathBuf> {
        if uuid::Uuid::parse_str(&build_id.0).is_err() {
            return Err(PipelineError::BuildNotFound(build_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", build_id.0)))
    }

    fn read(&self, build_id: &BuildId) -> Result<BuildRecord> {
        let path = self.path(build_id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::BuildNotFound(build_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn update(
        &self,
        build_id: &BuildId,
        f: impl FnOnce(&mut BuildRecord) -> Result<()>,
    ) -> Result<()> {
        let mut record = self.read(build_id)?;
        f(&mut record)?;
        write_json_atomic(&self.path(build_id)?, &record)
    }
}

#[async_trait]
impl BuildLedger for FsBuildLedger {
    async fn create_build(&self, metadata: BuildMetadata) -> Result<BuildId> {
        let build_id = BuildId::new();
        let record = BuildRecord::new(build_id.clone(), metadata);
        write_json_atomic(&self.path(&build_id)?, &record)?;
        debug!(build_id = %build_id, "Build record created");
        Ok(build_id)
    }

    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> Result<()> {
        self.update(build_id, |r| r.append(event))
    }

    async fn finish_build(&self, build_id: &BuildId, summary: BuildSummary) -> Result<()> {
        self.update(build_id, |r| r.finish(summary))
    }

    async fn get_build(&self, build_id: &BuildId) -> Result<BuildRecord> {
        self.read(build_id)
    }

    async fn list_builds(&self) -> Result<Vec<BuildRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let bytes = std::fs::read(&path)?;
                records.push(serde_json::from_slice::<BuildRecord>(&bytes)?);
            }
        }
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// BuildRecorder
// ---------------------------------------------------------------------------

/// Appends stage events for one build with contiguous sequence numbers.
pub struct BuildRecorder {
    ledger: Arc<dyn BuildLedger>,
    build_id: BuildId,
    seq: u64,
    current: Option<Stage>,
}

impl BuildRecorder {
    /// Create the build record and return a recorder for it.
    pub async fn start(ledger: Arc<dyn BuildLedger>, metadata: BuildMetadata) -> Result<Self> {
        let build_id = ledger.create_build(metadata).await?;
        Ok(Self {
            ledger,
            build_id,
            seq: 0,
            current: None,
        })
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Number of events recorded so far.
    pub fn event_count(&self) -> u64 {
        self.seq
    }

    /// Stage most recently started, if any.
    pub fn current_stage(&self) -> Option<Stage> {
        self.current
    }

    async fn record(&mut self, kind: BuildEventKind, stage: Stage, payload: Value) -> Result<()> {
        self.seq += 1;
        let event = BuildEvent {
            seq: self.seq,
            kind,
            stage,
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.build_id, event).await
    }

    pub async fn stage_started(&mut self, stage: Stage) -> Result<()> {
        self.current = Some(stage);
        self.record(BuildEventKind::StageStarted, stage, Value::Null)
            .await
    }

    pub async fn stage_succeeded(&mut self, stage: Stage, payload: Value) -> Result<()> {
        self.record(BuildEventKind::StageSucceeded, stage, payload)
            .await
    }

    pub async fn stage_failed(&mut self, stage: Stage, payload: Value) -> Result<()> {
        self.record(BuildEventKind::StageFailed, stage, payload)
            .await
    }

    pub async fn finish(&self, summary: BuildSummary) -> Result<()> {
        self.ledger.finish_build(&self.build_id, summary).await
    }
}
