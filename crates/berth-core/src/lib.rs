//! berth core library
//!
//! Turns a source tree into a launchable image inside a pinned environment
//! (provision, ingest, compile, bind) and starts the image's default command.

pub mod artifact;
pub mod bind;
pub mod compile;
pub mod config;
pub mod error;
pub mod gate;
pub mod image;
pub mod ingest;
pub mod launch;
pub mod obs;
pub mod pipeline;
pub mod provision;
pub mod recorder;
pub mod runner;
pub mod spec;
pub mod stage;
pub mod telemetry;

pub use artifact::infer_artifact_name;
pub use bind::bind;
pub use compile::{artifact_path, compile, CompiledArtifact};
pub use config::{BerthConfig, ConfigOverrides, CONFIG_FILE_NAME};
pub use error::{LaunchError, PipelineError, Result, EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND};
pub use gate::{BuildGate, GateVerdict};
pub use image::{DefaultCommand, Image, ImageManifest, ImageStore, Workspace};
pub use ingest::{ingest, source_digest, SourceSummary};
pub use launch::{launch, resolve_command, LaunchOutcome};
pub use pipeline::{BuildPipeline, BuildReport};
pub use provision::provision;
pub use recorder::{
    BuildEvent, BuildEventKind, BuildId, BuildLedger, BuildMetadata, BuildRecord, BuildRecorder,
    BuildSummary, FsBuildLedger, MemoryBuildLedger,
};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, RunError};
pub use spec::{BuildSpec, ImageId, DEFAULT_WORKDIR};
pub use stage::Stage;
pub use telemetry::init_tracing;

pub use berth_env::{
    Environment, EnvironmentManifest, EnvironmentRef, EnvironmentResolver, LocalRegistry,
};
