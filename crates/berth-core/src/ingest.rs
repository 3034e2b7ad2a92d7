//! Ingest stage: total copy of the source tree into the working location.
//!
//! The copy is unconditional. Hidden files, `target/` and everything else
//! are mirrored as-is, symlinks are recreated rather than followed, and file
//! permission bits are preserved. The source digest covers exactly what was
//! copied.

use crate::error::{PipelineError, Result};
use crate::image::Workspace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What the ingest stage copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    /// SHA-256 over sorted relative paths, entry kinds and contents.
    pub digest: String,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    files: u64,
    dirs: u64,
    symlinks: u64,
    bytes: u64,
}

/// Copy `source` into the workspace's working location.
pub fn ingest(source: &Path, workspace: &Workspace) -> Result<SourceSummary> {
    let meta = fs::metadata(source).map_err(|_| PipelineError::SourceNotFound(source.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(PipelineError::SourceNotFound(source.to_path_buf()));
    }

    let dest = workspace.working_dir();
    ensure_disjoint(source, &dest)?;

    info!(source = %source.display(), dest = %dest.display(), "Ingesting source tree");

    let mut hasher = Sha256::new();
    let mut counters = Counters::default();
    copy_tree(source, source, &dest, &mut hasher, &mut counters)?;

    let summary = SourceSummary {
        digest: hex::encode(hasher.finalize()),
        files: counters.files,
        dirs: counters.dirs,
        symlinks: counters.symlinks,
        bytes: counters.bytes,
    };
    debug!(
        digest = %&summary.digest[..12],
        files = summary.files,
        bytes = summary.bytes,
        "Source ingested"
    );
    Ok(summary)
}

/// Digest a source tree without copying it.
pub fn source_digest(source: &Path) -> Result<String> {
    if !source.is_dir() {
        return Err(PipelineError::SourceNotFound(source.to_path_buf()));
    }
    let mut hasher = Sha256::new();
    hash_tree(source, source, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copying a tree into itself would never terminate.
fn ensure_disjoint(source: &Path, dest: &Path) -> Result<()> {
    let source_abs = source.canonicalize().map_err(|e| ingest_err(source, e))?;
    let dest_abs = dest.canonicalize().map_err(|e| ingest_err(dest, e))?;
    if dest_abs.starts_with(&source_abs) {
        return Err(PipelineError::WorkspaceInsideSource {
            workspace: dest_abs,
            source_tree: source_abs,
        });
    }
    Ok(())
}

fn ingest_err(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::Ingest {
        path: path.to_path_buf(),
        source,
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| ingest_err(dir, e))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ingest_err(dir, e))?;
    entries.sort();
    Ok(entries)
}

fn hash_entry_header(hasher: &mut Sha256, relative: &Path, kind: &[u8]) {
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(kind);
    hasher.update(b"\0");
}

fn copy_tree(
    root: &Path,
    dir: &Path,
    dest: &Path,
    hasher: &mut Sha256,
    counters: &mut Counters,
) -> Result<()> {
    for path in sorted_entries(dir)? {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let target = dest.join(path.strip_prefix(dir).unwrap_or(&path));
        let meta = fs::symlink_metadata(&path).map_err(|e| ingest_err(&path, e))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(&path).map_err(|e| ingest_err(&path, e))?;
            hash_entry_header(hasher, relative, b"l");
            hasher.update(link.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            create_symlink(&link, &target).map_err(|e| ingest_err(&path, e))?;
            counters.symlinks += 1;
        } else if file_type.is_dir() {
            hash_entry_header(hasher, relative, b"d");
            fs::create_dir_all(&target).map_err(|e| ingest_err(&target, e))?;
            counters.dirs += 1;
            copy_tree(root, &path, &target, hasher, counters)?;
        } else if file_type.is_file() {
            hash_entry_header(hasher, relative, b"f");
            let bytes = copy_file_hashed(&path, &target, hasher)?;
            hasher.update(b"\0");
            counters.files += 1;
            counters.bytes += bytes;
        } else {
            return Err(PipelineError::UnsupportedFileType(path));
        }
    }
    Ok(())
}

/// Writer that feeds everything written through it into a hasher.
struct HashingWriter<'a, W> {
    inner: W,
    hasher: &'a mut Sha256,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream `path` to `target` from one open handle, hashing the bytes
/// written, then carry the permission bits over.
fn copy_file_hashed(path: &Path, target: &Path, hasher: &mut Sha256) -> Result<u64> {
    let mut src = File::open(path).map_err(|e| ingest_err(path, e))?;
    let permissions = src
        .metadata()
        .map_err(|e| ingest_err(path, e))?
        .permissions();

    let mut dst = File::create(target).map_err(|e| ingest_err(target, e))?;
    let bytes = io::copy(
        &mut src,
        &mut HashingWriter {
            inner: &mut dst,
            hasher,
        },
    )
    .map_err(|e| ingest_err(path, e))?;
    dst.set_permissions(permissions)
        .map_err(|e| ingest_err(target, e))?;
    Ok(bytes)
}

fn hash_tree(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<()> {
    for path in sorted_entries(dir)? {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let meta = fs::symlink_metadata(&path).map_err(|e| ingest_err(&path, e))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(&path).map_err(|e| ingest_err(&path, e))?;
            hash_entry_header(hasher, relative, b"l");
            hasher.update(link.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_dir() {
            hash_entry_header(hasher, relative, b"d");
            hash_tree(root, &path, hasher)?;
        } else if file_type.is_file() {
            hash_entry_header(hasher, relative, b"f");
            let mut file = File::open(&path).map_err(|e| ingest_err(&path, e))?;
            io::copy(&mut file, hasher).map_err(|e| ingest_err(&path, e))?;
            hasher.update(b"\0");
        } else {
            return Err(PipelineError::UnsupportedFileType(path));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn create_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link, target)
}
