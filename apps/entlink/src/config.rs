//! # Runner Configuration
//!
//! `entlink.toml` selects the local site, the storage collaborator, and
//! optional engine limits. A missing file means defaults: in-memory storage
//! at site 1.
//!
//! ```toml
//! local_site = 1
//!
//! [storage]
//! backend = "redb"
//! path = "entlink.redb"
//!
//! [limits]
//! max_propagation_depth = 16
//! ```

use entlink_core::{
    EntityRegistry, LinkError, LinkResult, MemoryStorage, RedbStore, RegistryGateway, Services,
    SiteId, StorageBackend, Transactor, primitives::MAX_PROPAGATION_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum configuration or scenario file size (1 MB).
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Which storage collaborator backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_propagation_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub local_site: u32,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_site: 1,
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Read a small text file, refusing anything over `MAX_CONFIG_FILE_SIZE`.
pub fn read_bounded(path: &Path) -> LinkResult<String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| LinkError::Io(format!("Cannot read '{}': {}", path.display(), e)))?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(LinkError::Serialization(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|e| LinkError::Io(format!("Read '{}': {}", path.display(), e)))
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> LinkResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = read_bounded(path)?;
        let config = Self::parse(&text)?;
        tracing::info!(path = %path.display(), backend = ?config.storage.backend, "config loaded");
        Ok(config)
    }

    pub fn parse(text: &str) -> LinkResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| LinkError::Serialization(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> LinkResult<()> {
        if self.local_site == 0 {
            return Err(LinkError::Serialization(
                "local_site must be non-zero".to_string(),
            ));
        }
        if self.storage.backend == BackendKind::Redb && self.storage.path.is_none() {
            return Err(LinkError::Serialization(
                "storage.path is required for the redb backend".to_string(),
            ));
        }
        if let Some(depth) = self.limits.max_propagation_depth {
            if depth == 0 || depth > MAX_PROPAGATION_DEPTH {
                return Err(LinkError::Serialization(format!(
                    "max_propagation_depth must be within 1..={}",
                    MAX_PROPAGATION_DEPTH
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn site(&self) -> SiteId {
        SiteId(self.local_site)
    }

    /// Open the configured storage collaborator.
    pub fn storage_backend(&self) -> LinkResult<StorageBackend> {
        match (self.storage.backend, &self.storage.path) {
            (BackendKind::Redb, Some(path)) => {
                Ok(StorageBackend::Persistent(Arc::new(RedbStore::open(path)?)))
            }
            (BackendKind::Redb, None) => Err(LinkError::Serialization(
                "storage.path is required for the redb backend".to_string(),
            )),
            (BackendKind::Memory, _) => {
                Ok(StorageBackend::InMemory(Arc::new(MemoryStorage::new())))
            }
        }
    }

    /// Wire services over the configured storage and the given transactor.
    pub fn build_services(&self, transactor: Arc<dyn Transactor>) -> LinkResult<Services> {
        let backend = self.storage_backend()?;
        let registry: Arc<dyn RegistryGateway> = Arc::new(EntityRegistry::new());
        let services = Services::new(self.site(), registry, transactor, backend.gateway());
        Ok(match self.limits.max_propagation_depth {
            Some(depth) => services.with_propagation_depth(depth),
            None => services,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use entlink_core::InMemoryTransactor;
    use tempfile::tempdir;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = Config::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.site(), SiteId(1));
    }

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            r#"
            local_site = 3

            [storage]
            backend = "redb"
            path = "links.redb"

            [limits]
            max_propagation_depth = 8
            "#,
        )
        .expect("parse");
        assert_eq!(config.local_site, 3);
        assert_eq!(config.storage.backend, BackendKind::Redb);
        assert_eq!(config.limits.max_propagation_depth, Some(8));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::parse("local_site = 0").is_err());
        assert!(Config::parse("[storage]\nbackend = \"redb\"").is_err());
        assert!(Config::parse("[limits]\nmax_propagation_depth = 0").is_err());
        assert!(Config::parse("unknown = true").is_err());
    }

    #[test]
    fn builds_redb_services() {
        let dir = tempdir().expect("tempdir");
        let config = Config {
            local_site: 2,
            storage: StorageConfig {
                backend: BackendKind::Redb,
                path: Some(dir.path().join("links.redb")),
            },
            limits: LimitsConfig {
                max_propagation_depth: Some(4),
            },
        };
        let services = config
            .build_services(Arc::new(InMemoryTransactor::new()))
            .expect("services");
        assert_eq!(services.local_site(), SiteId(2));
        assert_eq!(services.max_propagation_depth(), 4);
    }
}
