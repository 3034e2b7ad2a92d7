//! Integration tests for the build pipeline, the image store and launch.
//!
//! Toolchains are `sh -c` scripts standing in for `cargo build --release`.
#![cfg(unix)]

use berth_core::{
    bind, compile, ingest, launch, provision, BuildGate, BuildLedger, BuildPipeline, BuildSpec,
    FsBuildLedger, ImageStore, PipelineError, Stage,
};
use berth_env::{EnvironmentManifest, EnvironmentRef, LocalRegistry, Toolchain};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Fake release build: "compiles" `run.sh` into `target/release/kprint`.
const RELEASE_BUILD: &str =
    "mkdir -p target/release && cp run.sh target/release/kprint && chmod +x target/release/kprint";

struct Fixture {
    root: TempDir,
    source: PathBuf,
    registry: LocalRegistry,
    store: ImageStore,
    ledger: Arc<FsBuildLedger>,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let source = root.path().join("kprint");
        fs::create_dir_all(source.join("src")).expect("create source");
        fs::write(
            source.join("Cargo.toml"),
            "[package]\nname = \"kprint\"\nversion = \"0.1.0\"\n",
        )
        .expect("write Cargo.toml");
        fs::write(source.join("src/main.rs"), "fn main() {}\n").expect("write main.rs");
        fs::write(source.join("run.sh"), "#!/bin/sh\nexit 7\n").expect("write run.sh");

        let registry = LocalRegistry::new(root.path().join("registry"));
        let store = ImageStore::open(root.path().join("store")).expect("open store");
        let ledger = Arc::new(FsBuildLedger::new(store.builds_dir()).expect("open ledger"));

        Self {
            root,
            source,
            registry,
            store,
            ledger,
        }
    }

    fn environment(&self, tag: &str, script: &str) -> EnvironmentRef {
        self.register(
            tag,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            BTreeMap::from([("KPRINT_MODE".to_string(), "release".to_string())]),
        )
    }

    fn register(
        &self,
        tag: &str,
        build: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> EnvironmentRef {
        let manifest = EnvironmentManifest {
            description: Some("test toolchain".to_string()),
            toolchain: Toolchain {
                build,
                output_dir: PathBuf::from("target/release"),
            },
            env,
        };
        self.registry
            .register("rust", tag, &manifest)
            .expect("register environment")
    }

    fn spec(&self, environment: EnvironmentRef) -> BuildSpec {
        BuildSpec::new(environment, self.source.clone(), "kprint")
    }

    fn pipeline(&self) -> BuildPipeline<'_> {
        BuildPipeline::new(&self.registry, &self.store, self.ledger.clone())
    }

    fn staging_is_empty(&self) -> bool {
        fs::read_dir(self.store.staging_dir())
            .expect("read staging")
            .next()
            .is_none()
    }
}

/// Test: clean source builds, and start runs the artifact and propagates its exit code
#[tokio::test]
async fn test_build_then_start() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    let image = report.into_result().expect("build should succeed");

    assert_eq!(
        image.manifest.default_command.program,
        Path::new("/app/target/release/kprint")
    );
    assert_eq!(
        image.manifest.env.get("KPRINT_MODE").map(String::as_str),
        Some("release")
    );

    let outcome = launch(&image, None).await.expect("launch");
    assert_eq!(outcome.exit_code, 7);
}

/// Test: after a successful build the default command resolves to an executable file
#[tokio::test]
async fn test_default_command_exists_and_is_executable() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    let image = fx
        .store
        .load(report.image().expect("image").id().as_str())
        .expect("load image");

    let host = image.host_path(&image.manifest.default_command.program);
    assert!(host.is_file());
    assert!(berth_env::is_executable(&host));
    // The whole source tree was carried into the image.
    assert!(image.working_dir().join("src/main.rs").is_file());
    assert!(fx.staging_is_empty());
}

/// Test: compile error fails the build with the toolchain's exit code and no image
#[tokio::test]
async fn test_compile_error_leaves_no_image() {
    let fx = Fixture::new();
    let env = fx.environment(
        "broken",
        "echo 'error[E0308]: mismatched types' >&2; exit 101",
    );

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    let err = report.outcome.as_ref().expect_err("build should fail");

    match err {
        PipelineError::Compile {
            exit_code,
            diagnostics,
        } => {
            assert_eq!(*exit_code, 101);
            assert!(diagnostics.contains("E0308"));
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 101);
    assert_eq!(err.stage(), Some(Stage::Compile));

    assert!(fx.store.images().expect("list images").is_empty());
    assert!(fx.staging_is_empty());

    let record = fx.ledger.get_build(&report.build_id).await.expect("record");
    let summary = record.summary.expect("summary");
    assert!(!summary.success);
    assert_eq!(summary.failed_stage, Some(Stage::Compile));
}

/// Test: unknown environment fails at provisioning before anything is copied
#[tokio::test]
async fn test_unknown_environment_fails_at_provision() {
    let fx = Fixture::new();
    fx.environment("1.75", RELEASE_BUILD);
    let missing: EnvironmentRef = "rust:9.99".parse().expect("parse reference");

    let report = fx
        .pipeline()
        .run(&fx.spec(missing))
        .await
        .expect("run pipeline");
    let err = report.outcome.as_ref().expect_err("build should fail");
    assert!(matches!(err, PipelineError::Provision(_)));
    assert_eq!(err.exit_code(), 1);

    let record = fx.ledger.get_build(&report.build_id).await.expect("record");
    assert!(record.events.iter().all(|e| e.stage == Stage::Provision));
    assert_eq!(record.events.len(), 2);

    let verdict = BuildGate::evaluate(&record.events);
    assert!(!verdict.passed);
    assert!(fx.store.images().expect("list images").is_empty());
}

/// Test: a toolchain only reachable through the environment's PATH builds
#[tokio::test]
async fn test_toolchain_on_environment_path_builds() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let bin = fx.root.path().join("toolchain-bin");
    fs::create_dir_all(&bin).expect("create bin dir");
    let tool = bin.join("berth-kprint-cc");
    fs::write(&tool, format!("#!/bin/sh\n{RELEASE_BUILD}\n")).expect("write tool");
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod tool");

    let env = fx.register(
        "private",
        vec!["berth-kprint-cc".to_string()],
        BTreeMap::from([(
            "PATH".to_string(),
            format!("{}:/usr/bin:/bin", bin.display()),
        )]),
    );

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    let image = report.into_result().expect("build should succeed");
    assert_eq!(launch(&image, None).await.expect("launch").exit_code, 7);
}

/// Test: a toolchain missing from the environment's PATH fails before ingest
#[tokio::test]
async fn test_toolchain_missing_from_environment_path_fails_at_provision() {
    let fx = Fixture::new();
    let empty = fx.root.path().join("empty-bin");
    fs::create_dir_all(&empty).expect("create empty dir");

    let env = fx.register(
        "stripped",
        vec!["sh".to_string(), "-c".to_string(), RELEASE_BUILD.to_string()],
        BTreeMap::from([("PATH".to_string(), empty.display().to_string())]),
    );

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    let err = report.outcome.as_ref().expect_err("build should fail");
    assert!(matches!(
        err,
        PipelineError::Provision(berth_env::EnvError::ToolchainNotFound(_))
    ));

    let record = fx.ledger.get_build(&report.build_id).await.expect("record");
    assert!(record.events.iter().all(|e| e.stage == Stage::Provision));
    assert!(fx.staging_is_empty());
}

/// Test: a digest that no longer matches the registered manifest is rejected
#[tokio::test]
async fn test_tampered_environment_rejected() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);
    let stale = env
        .with_digest(&"0".repeat(64))
        .expect("pin to stale digest");

    let report = fx.pipeline().run(&fx.spec(stale)).await.expect("run pipeline");
    assert!(matches!(
        report.outcome,
        Err(PipelineError::Provision(berth_env::EnvError::DigestMismatch { .. }))
    ));
}

/// Test: toolchain exits zero without writing the artifact
#[tokio::test]
async fn test_missing_output_fails_compile() {
    let fx = Fixture::new();
    let env = fx.environment("noop", "true");

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    assert!(matches!(
        report.outcome,
        Err(PipelineError::ArtifactNotProduced(_))
    ));
    assert!(fx.store.images().expect("list images").is_empty());
}

/// Test: artifact removed between compile and bind is never bound
#[tokio::test]
async fn test_artifact_removed_before_bind() {
    let fx = Fixture::new();
    let env_ref = fx.environment("1.75", RELEASE_BUILD);

    let env = provision(&fx.registry, &env_ref).expect("provision");
    let workspace = fx.store.stage(Path::new("/app")).expect("stage");
    ingest(&fx.source, &workspace).expect("ingest");
    let compiled = compile(&env, &workspace, "kprint", 0)
        .await
        .expect("compile");

    fs::remove_file(&compiled.host).expect("remove artifact");

    let err = bind(&workspace, &compiled).expect_err("bind should fail");
    assert!(matches!(err, PipelineError::MissingArtifact(_)));
    assert_eq!(err.stage(), Some(Stage::Bind));

    drop(workspace);
    assert!(fx.staging_is_empty());
}

/// Test: rebuilding unchanged inputs yields the same image id and default command
#[tokio::test]
async fn test_rebuild_is_deterministic() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let first = fx
        .pipeline()
        .run(&fx.spec(env.clone()))
        .await
        .expect("first run")
        .into_result()
        .expect("first build");
    let second = fx
        .pipeline()
        .run(&fx.spec(env))
        .await
        .expect("second run")
        .into_result()
        .expect("second build");

    assert_eq!(first.id(), second.id());
    assert_eq!(
        first.manifest.default_command,
        second.manifest.default_command
    );
    assert_eq!(fx.store.images().expect("list images").len(), 1);
    assert_eq!(fx.ledger.list_builds().await.expect("list builds").len(), 2);
}

/// Test: changing the source changes the image id
#[tokio::test]
async fn test_source_change_changes_image() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let first = fx
        .pipeline()
        .run(&fx.spec(env.clone()))
        .await
        .expect("first run")
        .into_result()
        .expect("first build");

    fs::write(fx.source.join("run.sh"), "#!/bin/sh\nexit 3\n").expect("edit source");
    let second = fx
        .pipeline()
        .run(&fx.spec(env))
        .await
        .expect("second run")
        .into_result()
        .expect("second build");

    assert_ne!(first.id(), second.id());
    assert_eq!(launch(&second, None).await.expect("launch").exit_code, 3);
}

/// Test: the recorded build of a successful run passes the gate
#[tokio::test]
async fn test_recorded_build_passes_gate() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let report = fx.pipeline().run(&fx.spec(env)).await.expect("run pipeline");
    assert!(report.success());

    let record = fx.ledger.get_build(&report.build_id).await.expect("record");
    let verdict = BuildGate::evaluate(&record.events);
    assert!(verdict.passed, "violations: {:?}", verdict.violations);

    let stages: Vec<Stage> = record.events.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Provision,
            Stage::Provision,
            Stage::Ingest,
            Stage::Ingest,
            Stage::Compile,
            Stage::Compile,
            Stage::Bind,
            Stage::Bind,
        ]
    );
}

/// Test: tagged images can be loaded and started by tag
#[tokio::test]
async fn test_start_by_tag() {
    let fx = Fixture::new();
    let env = fx.environment("1.75", RELEASE_BUILD);

    let image = fx
        .pipeline()
        .run(&fx.spec(env))
        .await
        .expect("run pipeline")
        .into_result()
        .expect("build");
    fx.store.tag("kprint", image.id()).expect("tag");

    let loaded = fx.store.load("kprint").expect("load by tag");
    assert_eq!(loaded.id(), image.id());
    assert_eq!(launch(&loaded, None).await.expect("launch").exit_code, 7);
}
