//! Filesystem image store.
//!
//! Layout:
//!
//! ```text
//! <root>/images/<image-id>/manifest.json
//! <root>/images/<image-id>/rootfs/<workdir>/...
//! <root>/staging/<build-tmp>/          (in-flight builds only)
//! <root>/tags/<tag>                    (file containing an image id)
//! <root>/builds/<build-id>.json        (see `recorder`)
//! ```
//!
//! A build writes only into its staging directory. The directory is renamed
//! into `images/` once the Bind stage succeeds, so a failed build never
//! leaves a partial image behind.

use crate::error::{PipelineError, Result};
use crate::spec::ImageId;
use berth_env::EnvironmentRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";
const ROOTFS_DIR: &str = "rootfs";
const MANIFEST_SCHEMA_VERSION: u32 = 1;
const MIN_PREFIX_LEN: usize = 4;

/// Command run when an image starts without an override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultCommand {
    /// Absolute path inside the image.
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,
}

impl DefaultCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    /// Full argv as strings.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Static metadata of a committed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    pub id: ImageId,

    /// Fully pinned environment the image was built in.
    pub environment: EnvironmentRef,

    /// Digest of the ingested source tree.
    pub source_digest: String,

    /// Absolute in-image working location.
    pub workdir: PathBuf,

    /// Absolute in-image path of the build artifact.
    pub artifact: PathBuf,

    pub default_command: DefaultCommand,

    /// Environment variables applied at start.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Build run that produced this image.
    pub build_id: String,

    pub created_at: DateTime<Utc>,
}

impl ImageManifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ImageId,
        environment: EnvironmentRef,
        source_digest: String,
        workdir: PathBuf,
        artifact: PathBuf,
        default_command: DefaultCommand,
        env: BTreeMap<String, String>,
        build_id: String,
    ) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            id,
            environment,
            source_digest,
            workdir,
            artifact,
            default_command,
            env,
            build_id,
            created_at: Utc::now(),
        }
    }
}

/// Map an absolute in-image path onto a host root filesystem directory.
pub fn host_path(rootfs: &Path, in_image: &Path) -> PathBuf {
    in_image
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(rootfs.to_path_buf(), |path, part| path.join(part))
}

/// Pipeline-owned staging arena for one build.
///
/// Removed on drop unless committed.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    workdir: PathBuf,
}

impl Workspace {
    /// Staging directory (becomes the image directory on commit).
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Root filesystem of the image being built.
    pub fn rootfs(&self) -> PathBuf {
        self.dir.path().join(ROOTFS_DIR)
    }

    /// Absolute in-image working location.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Host path of the working location.
    pub fn working_dir(&self) -> PathBuf {
        host_path(&self.rootfs(), &self.workdir)
    }

    /// Host path of an in-image path.
    pub fn host_path(&self, in_image: &Path) -> PathBuf {
        host_path(&self.rootfs(), in_image)
    }
}

/// A committed image.
#[derive(Debug, Clone)]
pub struct Image {
    pub dir: PathBuf,
    pub manifest: ImageManifest,
}

impl Image {
    pub fn id(&self) -> &ImageId {
        &self.manifest.id
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join(ROOTFS_DIR)
    }

    /// Host path of the working location.
    pub fn working_dir(&self) -> PathBuf {
        host_path(&self.rootfs(), &self.manifest.workdir)
    }

    /// Host path of an in-image path.
    pub fn host_path(&self, in_image: &Path) -> PathBuf {
        host_path(&self.rootfs(), in_image)
    }
}

/// Directory-backed store of committed images, tags and build records.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["images", "staging", "tags", "builds"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    /// Create a fresh staging workspace with an empty working location.
    pub fn stage(&self, workdir: &Path) -> Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(self.staging_dir())?;
        let workspace = Workspace {
            dir,
            workdir: workdir.to_path_buf(),
        };
        fs::create_dir_all(workspace.working_dir())?;
        debug!(staging = %workspace.root().display(), "Workspace staged");
        Ok(workspace)
    }

    /// Write the manifest and move the staging directory into `images/`.
    ///
    /// An existing image with the same id is replaced.
    pub fn commit(&self, workspace: Workspace, manifest: ImageManifest) -> Result<Image> {
        write_json_atomic(&workspace.root().join(MANIFEST_FILE), &manifest)?;

        let target = self.images_dir().join(manifest.id.as_str());
        if target.exists() {
            debug!(image = %manifest.id.short(), "Replacing existing image");
            fs::remove_dir_all(&target)?;
        }
        // On failure the workspace is dropped here and cleans up staging.
        fs::rename(workspace.root(), &target)?;
        // Disarm the guard so it never touches the moved directory.
        let _ = workspace.dir.keep();

        info!(image = %manifest.id.short(), "Image committed");
        Ok(Image {
            dir: target,
            manifest,
        })
    }

    fn load_dir(&self, dir: PathBuf) -> Result<Image> {
        let bytes = fs::read(dir.join(MANIFEST_FILE))?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes)?;
        Ok(Image { dir, manifest })
    }

    /// All committed images, oldest first.
    pub fn images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(self.images_dir())? {
            let path = entry?.path();
            if path.join(MANIFEST_FILE).is_file() {
                images.push(self.load_dir(path)?);
            }
        }
        images.sort_by(|a, b| {
            a.manifest
                .created_at
                .cmp(&b.manifest.created_at)
                .then_with(|| a.manifest.id.as_str().cmp(b.manifest.id.as_str()))
        });
        Ok(images)
    }

    /// Load an image by full id, tag, or unique id prefix.
    pub fn load(&self, reference: &str) -> Result<Image> {
        if let Some(id) = ImageId::parse(reference) {
            let dir = self.images_dir().join(id.as_str());
            if dir.join(MANIFEST_FILE).is_file() {
                return self.load_dir(dir);
            }
            return Err(PipelineError::ImageNotFound(reference.to_string()));
        }

        if let Some(id) = self.resolve_tag(reference)? {
            return self.load(id.as_str());
        }

        let prefix = reference.to_ascii_lowercase();
        if prefix.len() < MIN_PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::ImageNotFound(reference.to_string()));
        }

        let mut matches: Vec<PathBuf> = fs::read_dir(self.images_dir())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect();

        match matches.len() {
            0 => Err(PipelineError::ImageNotFound(reference.to_string())),
            1 => self.load_dir(matches.remove(0)),
            count => Err(PipelineError::AmbiguousImage {
                reference: reference.to_string(),
                count,
            }),
        }
    }

    /// Check that `tag` is usable as an image tag without touching the store.
    pub fn check_tag(tag: &str) -> Result<()> {
        validate_tag(tag)
    }

    /// Point `tag` at `id`.
    pub fn tag(&self, tag: &str, id: &ImageId) -> Result<()> {
        validate_tag(tag)?;
        if !self.images_dir().join(id.as_str()).is_dir() {
            return Err(PipelineError::ImageNotFound(id.to_string()));
        }

        let path = self.tags_dir().join(tag);
        let mut tmp = NamedTempFile::new_in(self.tags_dir())?;
        tmp.write_all(id.as_str().as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;

        info!(tag = %tag, image = %id.short(), "Image tagged");
        Ok(())
    }

    /// Image id a tag points at, if the tag exists.
    pub fn resolve_tag(&self, tag: &str) -> Result<Option<ImageId>> {
        if validate_tag(tag).is_err() {
            return Ok(None);
        }
        let path = self.tags_dir().join(tag);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(ImageId::parse(content.trim())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with('.')
        && !tag.starts_with('-')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidSpec(format!("invalid image tag '{tag}'")))
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PipelineError::Config(format!("no parent dir for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
