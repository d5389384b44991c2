//! Storage backends for schema sources
//!
//! A backend stores the raw source text of each (name, version). Metadata is
//! rebuilt from the source when a registration is loaded back.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ExchangeError, Result};
use crate::version::SchemaVersion;

/// Uniform persist/load/delete contract over a store
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Store the source of (name, version), replacing any previous copy
    async fn persist(&self, name: &str, version: &SchemaVersion, content: &str) -> Result<()>;

    async fn load(&self, name: &str, version: &SchemaVersion) -> Result<Option<String>>;

    /// Returns whether something was deleted
    async fn delete(&self, name: &str, version: &SchemaVersion) -> Result<bool>;

    /// Every stored (name, version)
    async fn list(&self) -> Result<Vec<(String, SchemaVersion)>>;
}

/// Backend that keeps sources in process memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sources: RwLock<BTreeMap<(String, SchemaVersion), String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn persist(&self, name: &str, version: &SchemaVersion, content: &str) -> Result<()> {
        self.sources
            .write()
            .insert((name.to_string(), version.clone()), content.to_string());
        Ok(())
    }

    async fn load(&self, name: &str, version: &SchemaVersion) -> Result<Option<String>> {
        Ok(self.sources.read().get(&(name.to_string(), version.clone())).cloned())
    }

    async fn delete(&self, name: &str, version: &SchemaVersion) -> Result<bool> {
        Ok(self
            .sources
            .write()
            .remove(&(name.to_string(), version.clone()))
            .is_some())
    }

    async fn list(&self) -> Result<Vec<(String, SchemaVersion)>> {
        Ok(self.sources.read().keys().cloned().collect())
    }
}

/// Backend with one file per version: `<root>/<name>_<version>.<ext>`
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
    extension: String,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding (name, version)
    pub fn file_path(&self, name: &str, version: &SchemaVersion) -> PathBuf {
        self.root.join(format!("{}_{}.{}", name, version, self.extension))
    }

    /// Split a file name back into (name, version). Names may contain `_`; versions cannot.
    fn parse_file_name(&self, file_name: &str) -> Option<(String, SchemaVersion)> {
        let stem = file_name.strip_suffix(&format!(".{}", self.extension))?;
        let (name, version) = stem.rsplit_once('_')?;
        if name.is_empty() {
            return None;
        }
        let version = SchemaVersion::parse(version).ok()?;
        Some((name.to_string(), version))
    }
}

#[async_trait]
impl SchemaBackend for FilesystemBackend {
    async fn persist(&self, name: &str, version: &SchemaVersion, content: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.file_path(name, version);
        // write aside, then rename, so a cancelled persist never leaves a torn file
        let staging = path.with_extension(format!("{}.tmp", self.extension));
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!(path = %path.display(), "persisted schema source");
        Ok(())
    }

    async fn load(&self, name: &str, version: &SchemaVersion) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.file_path(name, version)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str, version: &SchemaVersion) -> Result<bool> {
        match tokio::fs::remove_file(self.file_path(name, version)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(String, SchemaVersion)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| ExchangeError::Backend(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            match self.parse_file_name(&file_name) {
                Some(key) => found.push(key),
                None => warn!(file = %file_name, "ignoring file that is not a schema source"),
            }
        }
        found.sort();
        Ok(found)
    }
}
