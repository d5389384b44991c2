//! Schema Registry
//!
//! Stores named, versioned schema sources, compiles them into type tables and
//! gates every new version on compatibility with the one before it.
//!
//! Registration order: validate, compile, check compatibility, persist, then
//! publish to the in-memory index and cache. Readers keep seeing the previous
//! state until the publish step, and an abandoned registration publishes
//! nothing.

pub mod backend;
pub mod cache;

use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::compatibility::{CompatibilityChecker, CompatibilityLevel, CompatibilityResult};
use crate::compiler::{self, SourceInfo};
use crate::config::{BackendKind, RegistryConfig};
use crate::error::{ExchangeError, Result};
use crate::schema::{CompiledSchema, SchemaMetadata, SchemaRegistration};
use crate::version::SchemaVersion;

pub use backend::{FilesystemBackend, MemoryBackend, SchemaBackend};
pub use cache::{CacheStats, CompiledSchemaCache};

fn name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("name pattern is valid"))
}

/// What `register` did
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub registration: Arc<SchemaRegistration>,
    /// False when identical content was already registered under this version
    pub created: bool,
    /// Result of the check against the preceding version, when one ran
    pub compatibility: Option<CompatibilityResult>,
    /// Set when a breaking version was accepted because rejection is disabled
    pub migration_required: bool,
}

type VersionIndex = HashMap<String, BTreeMap<SchemaVersion, Arc<SchemaRegistration>>>;

/// Versioned store of named schemas
pub struct SchemaRegistry {
    config: RegistryConfig,
    backend: Arc<dyn SchemaBackend>,
    clock: SharedClock,
    index: RwLock<VersionIndex>,
    cache: CompiledSchemaCache,
    // one registration or deletion at a time
    writer: tokio::sync::Mutex<()>,
}

impl SchemaRegistry {
    pub fn new(config: RegistryConfig, backend: Arc<dyn SchemaBackend>, clock: SharedClock) -> Self {
        let cache = CompiledSchemaCache::new(&config.cache, clock.clone());
        Self {
            config,
            backend,
            clock,
            index: RwLock::new(HashMap::new()),
            cache,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry over a fresh memory backend and the system clock
    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(config, Arc::new(MemoryBackend::new()), system_clock())
    }

    /// Registry with the backend named in `config`
    pub fn from_config(config: RegistryConfig) -> Result<Self> {
        let backend: Arc<dyn SchemaBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Filesystem => Arc::new(FilesystemBackend::new(&config.path, &config.extension)),
            BackendKind::Remote => {
                return Err(ExchangeError::Config(
                    "a remote backend must be passed to SchemaRegistry::new".to_string(),
                ))
            }
        };
        Ok(Self::new(config, backend, system_clock()))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `content` as `version` of schema `name`
    pub async fn register(&self, name: &str, content: &str, version: &str) -> Result<RegistrationOutcome> {
        self.register_tagged(name, content, version, Vec::new()).await
    }

    /// Register with descriptive tags stored in the metadata
    pub async fn register_tagged(
        &self,
        name: &str,
        content: &str,
        version: &str,
        tags: Vec<String>,
    ) -> Result<RegistrationOutcome> {
        validate_name(name)?;
        let version = SchemaVersion::parse(version)?;
        let info = compiler::inspect(content)?;

        let _writer = self.writer.lock().await;

        if let Some(existing) = self.registration(name, &version) {
            if existing.metadata.content_hash.verify(content) {
                debug!(name = %name, version = %version, "identical schema already registered");
                return Ok(RegistrationOutcome {
                    registration: existing,
                    created: false,
                    compatibility: None,
                    migration_required: false,
                });
            }
            warn!(name = %name, version = %version, "rejecting different content for an existing version");
            return Err(ExchangeError::AlreadyExists {
                name: name.to_string(),
                version: version.to_string(),
            });
        }

        let mut registration = self.build_registration(name, version.clone(), content, info);
        registration.metadata.tags = tags;
        let registration = Arc::new(registration);
        let compiled = Arc::new(self.compile(registration.clone())?);

        let (compatibility, migration_required) = self.gate(&compiled)?;

        self.persist(name, &version, content).await?;

        {
            let mut index = self.index.write();
            index
                .entry(name.to_string())
                .or_default()
                .insert(version.clone(), registration.clone());
            self.cache.insert(compiled);
        }

        info!(
            name = %name,
            version = %version,
            migration_required,
            "schema registered"
        );
        Ok(RegistrationOutcome {
            registration,
            created: true,
            compatibility,
            migration_required,
        })
    }

    /// Compatibility check of a new compiled version against its predecessor
    fn gate(&self, compiled: &CompiledSchema) -> Result<(Option<CompatibilityResult>, bool)> {
        if !self.config.check_compatibility || self.config.compatibility == CompatibilityLevel::None {
            return Ok((None, false));
        }
        let name = compiled.name();
        let Some(previous) = self.preceding_version(name, compiled.version()) else {
            return Ok((None, false));
        };
        let old = self.compiled(name, &previous)?;
        let result = CompatibilityChecker::new(self.config.compatibility).check(&old, compiled)?;

        for change in &result.changes {
            debug!(
                name = %name,
                path = %change.path,
                breaking = change.is_breaking,
                "{}",
                change.description
            );
        }

        if result.is_compatible {
            return Ok((Some(result), false));
        }
        let breaking = result.breaking_changes();
        if self.config.reject_breaking {
            warn!(
                name = %name,
                from = %previous,
                to = %compiled.version(),
                level = %self.config.compatibility,
                breaking = breaking.len(),
                "rejecting incompatible schema version"
            );
            return Err(ExchangeError::IncompatibleChange {
                name: name.to_string(),
                from: previous.to_string(),
                to: compiled.version().to_string(),
                level: self.config.compatibility.to_string(),
                breaking,
            });
        }
        warn!(
            name = %name,
            from = %previous,
            to = %compiled.version(),
            breaking = breaking.len(),
            "accepting breaking schema version, migration required"
        );
        if !compiled.version().is_major_bump_from(&previous) {
            warn!(
                name = %name,
                from = %previous,
                to = %compiled.version(),
                "breaking change without a major version bump"
            );
        }
        Ok((Some(result), true))
    }

    async fn persist(&self, name: &str, version: &SchemaVersion, content: &str) -> Result<()> {
        let write = self.backend.persist(name, version, content);
        match self.config.persist_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), write)
                .await
                .map_err(|_| ExchangeError::Timeout(format!("persisting {} {} took over {}ms", name, version, ms)))?,
            None => write.await,
        }
    }

    fn build_registration(&self, name: &str, version: SchemaVersion, content: &str, info: SourceInfo) -> SchemaRegistration {
        let mut metadata = SchemaMetadata::new(name, version, content, self.clock.utc());
        metadata.package = info.package;
        metadata.dependencies = info.dependencies;
        SchemaRegistration::new(metadata, content)
    }

    fn compile(&self, registration: Arc<SchemaRegistration>) -> Result<CompiledSchema> {
        compiler::compile(registration, &|dependency| self.dependency_document(dependency))
    }

    /// Compiled document of the latest version of a schema defining `dependency`
    fn dependency_document(&self, dependency: &str) -> Option<serde_json::Value> {
        let short = dependency.rsplit('.').next().unwrap_or(dependency);
        let (name, version) = {
            let index = self.index.read();
            [dependency, short]
                .into_iter()
                .find_map(|candidate| index.get_key_value(candidate))
                .and_then(|(name, versions)| versions.keys().next_back().map(|v| (name.clone(), v.clone())))?
        };
        self.compiled(&name, &version).ok().map(|c| c.document().clone())
    }

    fn registration(&self, name: &str, version: &SchemaVersion) -> Option<Arc<SchemaRegistration>> {
        self.index.read().get(name).and_then(|versions| versions.get(version)).cloned()
    }

    fn preceding_version(&self, name: &str, version: &SchemaVersion) -> Option<SchemaVersion> {
        self.index
            .read()
            .get(name)
            .and_then(|versions| versions.range(..version.clone()).next_back().map(|(v, _)| v.clone()))
    }

    /// Registration of `name` at `version`
    pub fn get_schema(&self, name: &str, version: &str) -> Result<Arc<SchemaRegistration>> {
        let parsed = SchemaVersion::parse(version)?;
        self.registration(name, &parsed).ok_or_else(|| ExchangeError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Compiled form of `name` at `version`, from the cache or compiled on demand
    pub fn compiled(&self, name: &str, version: &SchemaVersion) -> Result<Arc<CompiledSchema>> {
        if let Some(compiled) = self.cache.get(name, version) {
            return Ok(compiled);
        }
        let registration = self.registration(name, version).ok_or_else(|| ExchangeError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })?;
        let compiled = Arc::new(self.compile(registration.clone())?);
        self.cache_if_current(&registration, compiled.clone());
        Ok(compiled)
    }

    /// Cache `compiled` only while `registration` is still the indexed one.
    /// Holding the index lock keeps a concurrent delete from slipping between
    /// the check and the insert.
    fn cache_if_current(&self, registration: &Arc<SchemaRegistration>, compiled: Arc<CompiledSchema>) -> bool {
        let index = self.index.read();
        let current = index
            .get(registration.name())
            .and_then(|versions| versions.get(registration.version()))
            .is_some_and(|indexed| Arc::ptr_eq(indexed, registration));
        if current {
            self.cache.insert(compiled);
        } else {
            debug!(
                name = %registration.name(),
                version = %registration.version(),
                "registration changed while compiling, not caching"
            );
        }
        current
    }

    /// Highest version of `name` by semantic-version order
    pub fn get_latest_version(&self, name: &str) -> Option<SchemaVersion> {
        self.index
            .read()
            .get(name)
            .and_then(|versions| versions.keys().next_back().cloned())
    }

    /// Every version of `name`, ascending
    pub fn get_schema_versions(&self, name: &str) -> Vec<SchemaVersion> {
        self.index
            .read()
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all registered schemas, sorted
    pub fn list_schemas(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Check two registered versions under the configured level
    pub fn check_compatibility(&self, name: &str, old_version: &str, new_version: &str) -> Result<CompatibilityResult> {
        let old = self.compiled(name, &SchemaVersion::parse(old_version)?)?;
        let new = self.compiled(name, &SchemaVersion::parse(new_version)?)?;
        CompatibilityChecker::new(self.config.compatibility).check(&old, &new)
    }

    /// Delete one version, or every version of `name` when `version` is `None`.
    /// Returns the number of versions removed.
    pub async fn delete(&self, name: &str, version: Option<&str>) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let targets: Vec<SchemaVersion> = match version {
            Some(raw) => {
                let parsed = SchemaVersion::parse(raw)?;
                if self.registration(name, &parsed).is_none() && self.backend.load(name, &parsed).await?.is_none() {
                    return Err(ExchangeError::NotFound {
                        name: name.to_string(),
                        version: raw.to_string(),
                    });
                }
                vec![parsed]
            }
            None => {
                let mut all = self.get_schema_versions(name);
                for (stored, version) in self.backend.list().await? {
                    if stored == name && !all.contains(&version) {
                        all.push(version);
                    }
                }
                if all.is_empty() {
                    return Err(ExchangeError::NotFound {
                        name: name.to_string(),
                        version: "*".to_string(),
                    });
                }
                all
            }
        };

        for version in &targets {
            self.backend.delete(name, version).await?;
            {
                let mut index = self.index.write();
                if let Some(versions) = index.get_mut(name) {
                    versions.remove(version);
                    if versions.is_empty() {
                        index.remove(name);
                    }
                }
                self.cache.remove(name, version);
            }
        }
        if version.is_none() {
            let _index = self.index.write();
            self.cache.remove_all(name);
        }
        info!(name = %name, removed = targets.len(), "schema versions deleted");
        Ok(targets.len())
    }

    /// Registration of `name` at `version`, fetched from the backend when not indexed
    pub async fn load(&self, name: &str, version: &str) -> Result<Arc<SchemaRegistration>> {
        let parsed = SchemaVersion::parse(version)?;
        if let Some(registration) = self.registration(name, &parsed) {
            return Ok(registration);
        }
        let content = self.backend.load(name, &parsed).await?.ok_or_else(|| ExchangeError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })?;
        self.publish_loaded(name, parsed, &content)
    }

    /// Index everything the backend holds. Compilation happens on first use.
    pub async fn hydrate(&self) -> Result<usize> {
        let mut loaded = 0;
        for (name, version) in self.backend.list().await? {
            if self.registration(&name, &version).is_some() {
                continue;
            }
            let Some(content) = self.backend.load(&name, &version).await? else {
                continue;
            };
            match self.publish_loaded(&name, version.clone(), &content) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(name = %name, version = %version, error = %e, "skipping unreadable schema source"),
            }
        }
        info!(loaded, "registry hydrated from backend");
        Ok(loaded)
    }

    fn publish_loaded(&self, name: &str, version: SchemaVersion, content: &str) -> Result<Arc<SchemaRegistration>> {
        validate_name(name)?;
        let info = compiler::inspect(content)?;
        let registration = Arc::new(self.build_registration(name, version.clone(), content, info));
        self.index
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(version, registration.clone());
        Ok(registration)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(ExchangeError::validation("name", format!("invalid schema name '{}'", name)))
    }
}
