//! Job metadata carried alongside the archive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recognized metadata keys.
pub mod keys {
    /// Reverse-DNS package identifier, e.g. `io.gohugo.hugo`.
    pub const PACKAGE_IDENTIFIER: &str = "package_identifier";
    /// Package version string, e.g. `0.101.0`.
    pub const PACKAGE_VERSION: &str = "package_version";

    /// Every key a worker understands.
    pub const KNOWN: &[&str] = &[PACKAGE_IDENTIFIER, PACKAGE_VERSION];
}

/// Errors reading required metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata key '{0}' is required")]
    Missing(String),
}

/// Flat string-to-string mapping sent with a job and its reply.
///
/// This is the only channel for structured parameters. It must never carry
/// trust-sensitive configuration such as signing identities; workers take
/// those from their own environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobMetadata(BTreeMap<String, String>);

impl JobMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata describing the package to build.
    pub fn for_package(identifier: impl Into<String>, version: impl Into<String>) -> Self {
        let mut metadata = Self::new();
        metadata.insert(keys::PACKAGE_IDENTIFIER, identifier);
        metadata.insert(keys::PACKAGE_VERSION, version);
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a key that must be present and non-empty.
    pub fn require(&self, key: &str) -> Result<&str, MetadataError> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(MetadataError::Missing(key.to_string())),
        }
    }

    pub fn package_identifier(&self) -> Option<&str> {
        self.get(keys::PACKAGE_IDENTIFIER)
    }

    pub fn package_version(&self) -> Option<&str> {
        self.get(keys::PACKAGE_VERSION)
    }

    /// Keys outside the recognized vocabulary.
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(String::as_str)
            .filter(|k| !keys::KNOWN.contains(k))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for JobMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
