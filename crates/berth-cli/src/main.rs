//! berth - build a source tree into an image and start it
//!
//! ## Commands
//!
//! - `build`: provision, ingest, compile and bind a source tree
//! - `start`: run an image's default command
//! - `inspect`: print an image manifest
//! - `images`: list committed images
//! - `env`: resolve and register pinned environments
//! - `builds`: show recorded build runs

use anyhow::{Context, Result};
use berth_core::{
    launch, BerthConfig, BuildGate, BuildId, BuildLedger, BuildPipeline, ConfigOverrides,
    FsBuildLedger, ImageStore, LaunchError, PipelineError,
};
use berth_env::{EnvironmentManifest, EnvironmentRef, EnvironmentResolver, LocalRegistry};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

#[derive(Parser)]
#[command(name = "berth")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build source trees into pinned-environment images and run them", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./berth.toml if present)
    #[arg(short, long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Image store directory
    #[arg(long, global = true, env = "BERTH_STORE")]
    store: Option<PathBuf>,

    /// Environment registry directory
    #[arg(long, global = true, env = "BERTH_REGISTRY")]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a source tree into an image
    Build {
        /// Pinned environment reference (name:tag, name@sha256:..., or both)
        #[arg(short, long = "env", env = "BERTH_ENVIRONMENT")]
        environment: Option<String>,

        /// Source tree (default: current directory)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Artifact file name (default: inferred from Cargo.toml)
        #[arg(short, long)]
        artifact: Option<String>,

        /// Absolute working location inside the image (default: /app)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Compile timeout in seconds (0 = none)
        #[arg(long)]
        timeout: Option<u64>,

        /// Tag the image on success
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Run an image's default command
    Start {
        /// Image id, unique id prefix, or tag
        image: String,

        /// Replace the default command (program and arguments)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Print an image manifest as JSON
    Inspect {
        /// Image id, unique id prefix, or tag
        image: String,
    },

    /// List committed images
    Images,

    /// Environment operations
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Recorded build runs
    Builds {
        #[command(subcommand)]
        action: BuildsAction,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    /// Resolve a reference and print the pinned environment
    Resolve {
        /// Environment reference
        reference: String,
    },

    /// Register an environment manifest under name:tag
    Register {
        /// Environment name (e.g. rust)
        name: String,

        /// Tag (e.g. 1.75)
        tag: String,

        /// Manifest TOML file
        manifest: PathBuf,
    },
}

#[derive(Subcommand)]
enum BuildsAction {
    /// List recorded builds
    List,

    /// Show a build's events and gate verdict
    Show {
        /// Build id
        build_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    berth_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let base = BerthConfig::discover(cli.config.as_deref(), &cwd)?.with_overrides(
        ConfigOverrides {
            registry: cli.registry,
            store: cli.store,
            ..Default::default()
        },
    );

    match cli.command {
        Commands::Build {
            environment,
            source,
            artifact,
            workdir,
            timeout,
            tag,
        } => {
            let config = base.with_overrides(ConfigOverrides {
                environment,
                source,
                workdir,
                artifact,
                compile_timeout_secs: timeout,
                ..Default::default()
            });
            cmd_build(&config, tag.as_deref()).await
        }
        Commands::Start { image, command } => cmd_start(&base, &image, &command).await,
        Commands::Inspect { image } => cmd_inspect(&base, &image).map(|_| 0),
        Commands::Images => cmd_images(&base).map(|_| 0),
        Commands::Env { action } => match action {
            EnvAction::Resolve { reference } => cmd_env_resolve(&base, &reference).map(|_| 0),
            EnvAction::Register {
                name,
                tag,
                manifest,
            } => cmd_env_register(&base, &name, &tag, &manifest).map(|_| 0),
        },
        Commands::Builds { action } => match action {
            BuildsAction::List => cmd_builds_list(&base).await.map(|_| 0),
            BuildsAction::Show { build_id } => cmd_builds_show(&base, &build_id).await.map(|_| 0),
        },
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<LaunchError>() {
        e.exit_code()
    } else {
        1
    }
}

fn open_store(config: &BerthConfig) -> Result<ImageStore> {
    let dir = config.store_dir();
    ImageStore::open(&dir).with_context(|| format!("Failed to open image store at {:?}", dir))
}

fn open_ledger(store: &ImageStore) -> Result<FsBuildLedger> {
    FsBuildLedger::new(store.builds_dir()).context("Failed to open build ledger")
}

/// Run the build pipeline and print the image id
async fn cmd_build(config: &BerthConfig, tag: Option<&str>) -> Result<i32> {
    if let Some(tag) = tag {
        ImageStore::check_tag(tag)?;
    }
    let spec = config.build_spec()?;
    let registry = LocalRegistry::new(config.registry_dir());
    let store = open_store(config)?;
    let ledger = Arc::new(open_ledger(&store)?);

    let pipeline = BuildPipeline::new(&registry, &store, ledger);
    let report = pipeline.run(&spec).await?;

    match report.outcome {
        Ok(image) => {
            if let Some(tag) = tag {
                store.tag(tag, image.id())?;
            }
            println!("Build:    {}", report.build_id);
            println!("Image:    {}", image.id());
            println!(
                "Command:  {}",
                image.manifest.default_command.argv().join(" ")
            );
            println!("Duration: {}ms", report.duration_ms);
            Ok(0)
        }
        Err(e) => {
            eprintln!("Build {} failed", report.build_id);
            if let Some(stage) = e.stage() {
                eprintln!("Stage: {}", stage);
            }
            if let PipelineError::Compile { diagnostics, .. } = &e {
                eprintln!("{}", diagnostics.trim_end());
            }
            Err(e.into())
        }
    }
}

/// Start an image and return the program's exit code
async fn cmd_start(config: &BerthConfig, reference: &str, command: &[String]) -> Result<i32> {
    let store = open_store(config)?;
    let image = store.load(reference)?;

    let override_argv = (!command.is_empty()).then_some(command);
    let outcome = launch(&image, override_argv).await?;
    Ok(outcome.exit_code)
}

/// Print an image manifest
fn cmd_inspect(config: &BerthConfig, reference: &str) -> Result<()> {
    let store = open_store(config)?;
    let image = store.load(reference)?;
    println!("{}", serde_json::to_string_pretty(&image.manifest)?);
    Ok(())
}

/// List committed images
fn cmd_images(config: &BerthConfig) -> Result<()> {
    let store = open_store(config)?;
    let images = store.images()?;

    if images.is_empty() {
        println!("No images.");
        return Ok(());
    }

    println!("{:<14} {:<24} {:<22} COMMAND", "IMAGE", "ENVIRONMENT", "CREATED");
    for image in &images {
        let env = &image.manifest.environment;
        let env_label = match env.tag() {
            Some(tag) => format!("{}:{}", env.name(), tag),
            None => env.name().to_string(),
        };
        println!(
            "{:<14} {:<24} {:<22} {}",
            image.id().short(),
            env_label,
            image.manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
            image.manifest.default_command.argv().join(" ")
        );
    }
    Ok(())
}

/// Resolve an environment reference against the local registry
fn cmd_env_resolve(config: &BerthConfig, reference: &str) -> Result<()> {
    let reference: EnvironmentRef = reference.parse()?;
    let registry = LocalRegistry::new(config.registry_dir());
    let environment = registry
        .resolve(&reference)
        .with_context(|| format!("Failed to resolve environment {}", reference))?;

    println!("Reference: {}", environment.reference);
    println!("Digest:    sha256:{}", environment.digest);
    println!(
        "Build:     {}",
        environment.manifest.toolchain.build.join(" ")
    );
    println!(
        "Output:    {}",
        environment.manifest.toolchain.output_dir.display()
    );
    Ok(())
}

/// Register an environment manifest and print its pinned reference
fn cmd_env_register(config: &BerthConfig, name: &str, tag: &str, manifest: &Path) -> Result<()> {
    let manifest = EnvironmentManifest::load(manifest)
        .with_context(|| format!("Failed to load manifest {:?}", manifest))?;
    let registry = LocalRegistry::new(config.registry_dir());
    let pinned = registry.register(name, tag, &manifest)?;
    println!("{}", pinned);
    Ok(())
}

/// List recorded builds, oldest first
async fn cmd_builds_list(config: &BerthConfig) -> Result<()> {
    let store = open_store(config)?;
    let ledger = open_ledger(&store)?;

    for record in ledger.list_builds().await? {
        let status = match &record.summary {
            Some(s) if s.success => "✓",
            Some(_) => "✗",
            None => "…",
        };
        println!(
            "{} {} {} {}",
            status,
            record.build_id,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.metadata.environment
        );
    }
    Ok(())
}

/// Show one build's events and evaluate the gate over them
async fn cmd_builds_show(config: &BerthConfig, build_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let ledger = open_ledger(&store)?;
    let record = ledger.get_build(&BuildId(build_id.to_string())).await?;

    println!("Build:       {}", record.build_id);
    println!("Environment: {}", record.metadata.environment);
    println!("Source:      {}", record.metadata.source);
    println!("Started:     {}", record.started_at);
    if let Some(summary) = &record.summary {
        println!("Duration:    {}ms", summary.duration_ms);
        if let Some(image_id) = &summary.image_id {
            println!("Image:       {}", image_id);
        }
        if let Some(error) = &summary.error {
            println!("Error:       {}", error);
        }
    }
    println!();

    for event in &record.events {
        println!(
            "  #{:<3} {:<16} {:<10} {}",
            event.seq,
            serde_json::to_value(event.kind)?
                .as_str()
                .unwrap_or_default(),
            event.stage,
            event.payload
        );
    }

    let verdict = BuildGate::evaluate(&record.events);
    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_env::Toolchain;
    use std::collections::BTreeMap;

    fn config_in(dir: &Path) -> BerthConfig {
        BerthConfig {
            registry: Some(dir.join("registry")),
            store: Some(dir.join("store")),
            ..Default::default()
        }
    }

    #[test]
    fn test_cli_parses_start_override() {
        let cli = Cli::try_parse_from([
            "berth",
            "start",
            "kprint",
            "--",
            "/app/kprint",
            "--port",
            "9",
        ])
        .unwrap();
        match cli.command {
            Commands::Start { image, command } => {
                assert_eq!(image, "kprint");
                assert_eq!(command, vec!["/app/kprint", "--port", "9"]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["berth", "images", "--store", "/tmp/s", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn test_exit_code_mapping() {
        let compile = anyhow::Error::new(PipelineError::Compile {
            exit_code: 101,
            diagnostics: String::new(),
        });
        assert_eq!(exit_code_for(&compile), 101);

        let missing = anyhow::Error::new(LaunchError::MissingArtifact(PathBuf::from("/app/x")));
        assert_eq!(exit_code_for(&missing), 127);

        let not_exec = anyhow::Error::new(LaunchError::NotExecutable(PathBuf::from("/app/x")));
        assert_eq!(exit_code_for(&not_exec), 126);

        let other = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&other), 1);
    }

    /// Config for a source tree whose build copies `run.sh` to `out/app`.
    fn shell_build_config(dir: &Path, run_script: &str) -> BerthConfig {
        let source = dir.join("src-tree");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("run.sh"), run_script).unwrap();

        let mut config = config_in(dir);
        let registry = LocalRegistry::new(config.registry_dir());
        let manifest = EnvironmentManifest {
            description: None,
            toolchain: Toolchain {
                build: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "mkdir -p out && cp run.sh out/app && chmod +x out/app".to_string(),
                ],
                output_dir: PathBuf::from("out"),
            },
            env: BTreeMap::new(),
        };
        let pinned = registry.register("local/sh", "1", &manifest).unwrap();

        config.environment = Some(pinned.to_string());
        config.source = Some(source);
        config.artifact = Some("app".to_string());
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_then_start_via_commands() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = shell_build_config(temp_dir.path(), "#!/bin/sh\nexit 5\n");

        assert_eq!(cmd_build(&config, Some("app")).await.unwrap(), 0);
        assert_eq!(cmd_start(&config, "app", &[]).await.unwrap(), 5);
        cmd_inspect(&config, "app").unwrap();
        cmd_builds_list(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_tag_rejected_before_build() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = shell_build_config(temp_dir.path(), "#!/bin/sh\nexit 0\n");

        let err = cmd_build(&config, Some("../x")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidSpec(_))
        ));

        let store = ImageStore::open(config.store_dir()).unwrap();
        assert!(store.images().unwrap().is_empty());
        let ledger = open_ledger(&store).unwrap();
        assert!(ledger.list_builds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_unknown_image_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config_in(temp_dir.path());
        let err = cmd_start(&config, "nope", &[]).await.unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
        assert_eq!(exit_code_for(&err), 1);
    }
}
