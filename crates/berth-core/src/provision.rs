//! Provision stage: resolve the pinned environment image.

use crate::error::Result;
use berth_env::{locate_build_executable, Environment, EnvironmentRef, EnvironmentResolver};
use tracing::info;

/// Resolve `reference` to exactly one environment and check its toolchain
/// can be started with the environment's own variables. Any failure is
/// final; there is no fallback environment.
pub fn provision(resolver: &dyn EnvironmentResolver, reference: &EnvironmentRef) -> Result<Environment> {
    let environment = resolver.resolve(reference)?;
    let exe = locate_build_executable(&environment.manifest)?;

    info!(
        environment = %environment.reference,
        digest = %environment.digest.short(),
        toolchain = %exe.display(),
        "Environment provisioned"
    );
    Ok(environment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use berth_env::fakes::MemoryRegistry;
    use berth_env::{EnvError, EnvironmentManifest, Toolchain};
    use std::path::PathBuf;

    fn manifest(program: &str) -> EnvironmentManifest {
        EnvironmentManifest {
            description: None,
            toolchain: Toolchain {
                build: vec![program.to_string()],
                output_dir: PathBuf::from("out"),
            },
            env: Default::default(),
        }
    }

    #[test]
    fn test_provision_resolves_and_pins() {
        let registry = MemoryRegistry::new();
        registry.insert("shell", "posix", manifest("sh")).unwrap();

        let env = provision(&registry, &"shell:posix".parse().unwrap()).unwrap();
        assert!(env.reference.digest().is_some());
    }

    #[test]
    fn test_provision_unknown_environment() {
        let registry = MemoryRegistry::new();
        let err = provision(&registry, &"shell:posix".parse().unwrap()).unwrap_err();
        assert!(matches!(err, PipelineError::Provision(EnvError::NotFound(_))));
    }

    #[test]
    fn test_provision_uses_manifest_path() {
        let registry = MemoryRegistry::new();
        let mut hidden = manifest("sh");
        hidden
            .env
            .insert("PATH".to_string(), "/berth/no/such/dir".to_string());
        registry.insert("shell", "hidden", hidden).unwrap();

        let err = provision(&registry, &"shell:hidden".parse().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Provision(EnvError::ToolchainNotFound(_))
        ));
    }

    #[test]
    fn test_provision_missing_toolchain() {
        let registry = MemoryRegistry::new();
        registry
            .insert("ghost", "1", manifest("berth-no-such-compiler"))
            .unwrap();

        let err = provision(&registry, &"ghost:1".parse().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Provision(EnvError::ToolchainNotFound(_))
        ));
    }
}
