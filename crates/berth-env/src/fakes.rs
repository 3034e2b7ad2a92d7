//! In-memory resolver (testing only)
//!
//! Provides `MemoryRegistry`, which satisfies the `EnvironmentResolver`
//! contract without touching the filesystem.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::EnvError;
use crate::manifest::EnvironmentManifest;
use crate::reference::EnvironmentRef;
use crate::registry::{select, Environment, EnvironmentResolver};
use crate::Result;

/// In-memory registry keyed by `name -> tag -> manifest`.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    manifests: Mutex<BTreeMap<String, BTreeMap<String, EnvironmentManifest>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manifest under `name:tag`, returning the pinned reference.
    pub fn insert(
        &self,
        name: &str,
        tag: &str,
        manifest: EnvironmentManifest,
    ) -> Result<EnvironmentRef> {
        let reference = EnvironmentRef::new(name, Some(tag), None)?;
        let digest = manifest.digest()?;
        self.manifests
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), manifest);
        reference.with_digest(digest.as_str())
    }
}

impl EnvironmentResolver for MemoryRegistry {
    fn resolve(&self, reference: &EnvironmentRef) -> Result<Environment> {
        let candidates: Vec<_> = {
            let manifests = self.manifests.lock().unwrap();
            let tags = manifests
                .get(reference.name())
                .ok_or_else(|| EnvError::NotFound(reference.to_string()))?;
            tags.iter()
                .map(|(tag, manifest)| (tag.clone(), manifest.clone()))
                .collect()
        };
        select(reference, candidates)
    }
}
