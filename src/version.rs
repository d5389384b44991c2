//! Schema versioning utilities

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{ExchangeError, Result};

/// Semantic-version pattern (major.minor.patch with optional pre-release and build)
const SEMVER_PATTERN: &str = r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$";

fn semver_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SEMVER_PATTERN).expect("semver pattern is valid"))
}

/// A schema version, totally ordered by numeric semantic-version comparison
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaVersion(Version);

impl SchemaVersion {
    /// Create from numeric components
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Create from a version string
    pub fn parse(version_str: &str) -> Result<Self> {
        // Strip leading 'v' if present
        let trimmed = version_str.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if !semver_regex().is_match(trimmed) {
            return Err(ExchangeError::InvalidVersion(version_str.to_string()));
        }
        Ok(Self(Version::parse(trimmed)?))
    }

    /// Whether a string is an acceptable version
    pub fn is_valid(version_str: &str) -> bool {
        Self::parse(version_str).is_ok()
    }

    /// The underlying semver version
    pub fn as_semver(&self) -> &Version {
        &self.0
    }

    /// Get the version string (e.g., "1.2.3")
    pub fn version_string(&self) -> String {
        self.0.to_string()
    }

    /// Check if this is a major version bump from another version
    pub fn is_major_bump_from(&self, other: &SchemaVersion) -> bool {
        self.0.major > other.0.major
    }
}

/// Compare two version strings numerically; `compare_versions("1.2.0", "1.10.0")` is `Less`
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(SchemaVersion::parse(a)?.cmp(&SchemaVersion::parse(b)?))
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SchemaVersion {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
