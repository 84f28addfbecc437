//! File path manager.
//!
//! Maps identities to paths under the persistence root and provides the
//! small set of filesystem primitives the handles and recovery need.
//!
//! The root directory is validated lazily: the first primitive that touches
//! the disk creates it (or reports which segment of the path is missing) and
//! the successful outcome is cached for the lifetime of the manager.

use crate::error::{PersistError, Result};
use crate::persistence::identity::KeyIdentity;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Extension of every record file.
pub const RECORD_EXTENSION: &str = "aof";

/// Owns the persistence root and the naming scheme.
#[derive(Debug)]
pub struct FileManager {
    root: PathBuf,
    prefix: String,
    validated: OnceCell<()>,
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            root: root.into(),
            prefix: escape_prefix(prefix),
            validated: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for an identity: `<prefix><sha256 hex of key bytes>.aof`.
    pub fn file_name(&self, identity: &KeyIdentity) -> String {
        let digest = Sha256::digest(identity.bytes());
        format!("{}{:x}.{}", self.prefix, digest, RECORD_EXTENSION)
    }

    /// File name and full path for an identity.
    pub fn path_for(&self, identity: &KeyIdentity) -> (String, PathBuf) {
        let name = self.file_name(identity);
        let path = self.root.join(&name);
        (name, path)
    }

    /// Makes sure the root directory exists, creating it on first use.
    pub fn ensure_root(&self) -> Result<()> {
        self.validated
            .get_or_try_init(|| {
                fs::create_dir_all(&self.root).map_err(|source| {
                    PersistError::DirectoryUnavailable {
                        root: self.root.clone(),
                        missing: first_missing_segment(&self.root),
                        source,
                    }
                })?;
                debug!(root = %self.root.display(), "Persistence root ready");
                Ok::<(), PersistError>(())
            })
            .map(|_| ())
    }

    /// Creates an empty file at `path`, replacing whatever was there.
    pub fn touch(&self, path: &Path) -> Result<File> {
        self.ensure_root()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.delete(path)?;
        let file = OpenOptions::new().create_new(true).append(true).open(path)?;
        trace!(path = %path.display(), "Touched record file");
        Ok(file)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Deletes `path`. Returns `Ok(false)` if there was nothing to delete.
    pub fn delete(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends `content` followed by a newline.
    pub fn append_line(&self, content: &str, file: &mut File) -> Result<()> {
        file.write_all(content.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Raw file content. Decoding is left to the caller so that bad bytes
    /// can be reported against the record rather than as an io failure.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    /// Lists the files directly under the root with the given extension,
    /// sorted by path.
    pub fn list(&self, extension: &str) -> Result<Vec<PathBuf>> {
        self.ensure_root()?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(extension)
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Path separators would escape the root, so they are replaced.
fn escape_prefix(prefix: &str) -> String {
    prefix
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// The shallowest ancestor of `path` that does not exist.
fn first_missing_segment(path: &Path) -> PathBuf {
    let ancestors: Vec<&Path> = path.ancestors().collect();
    ancestors
        .into_iter()
        .rev()
        .find(|p| !p.as_os_str().is_empty() && !p.exists())
        .unwrap_or(path)
        .to_path_buf()
}
