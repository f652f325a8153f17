//! # Services
//!
//! The explicit bundle of shared collaborators every link is built with:
//! registry, transactor, storage, and the identity of the local site.
//! Nothing in the engine reaches for ambient global state.

use crate::distribution::Residence;
use crate::primitives;
use crate::registry::{EntityRegistry, RegistryGateway};
use crate::storage::{MemoryStorage, RedbStore, StorageGateway};
use crate::transaction::{InMemoryTransactor, Transactor};
use crate::types::{LinkId, SiteId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Choice of storage collaborator.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory(Arc<MemoryStorage>),
    Persistent(Arc<RedbStore>),
}

impl StorageBackend {
    #[must_use]
    pub fn gateway(&self) -> Arc<dyn StorageGateway> {
        match self {
            Self::InMemory(s) => Arc::clone(s) as Arc<dyn StorageGateway>,
            Self::Persistent(s) => Arc::clone(s) as Arc<dyn StorageGateway>,
        }
    }
}

pub struct Services {
    local_site: SiteId,
    registry: Arc<dyn RegistryGateway>,
    transactor: Arc<dyn Transactor>,
    storage: Arc<dyn StorageGateway>,
    next_link_id: AtomicU64,
    max_propagation_depth: usize,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("local_site", &self.local_site)
            .field("registered", &self.registry.len())
            .field("max_propagation_depth", &self.max_propagation_depth)
            .finish_non_exhaustive()
    }
}

impl Services {
    #[must_use]
    pub fn new(
        local_site: SiteId,
        registry: Arc<dyn RegistryGateway>,
        transactor: Arc<dyn Transactor>,
        storage: Arc<dyn StorageGateway>,
    ) -> Self {
        Self {
            local_site,
            registry,
            transactor,
            storage,
            next_link_id: AtomicU64::new(1),
            max_propagation_depth: primitives::MAX_PROPAGATION_DEPTH,
        }
    }

    /// Services wired to the in-memory reference collaborators.
    #[must_use]
    pub fn in_memory(local_site: SiteId) -> Self {
        Self::with_backend(
            local_site,
            &StorageBackend::InMemory(Arc::new(MemoryStorage::new())),
        )
    }

    /// In-memory registry and transactor over the chosen storage backend.
    #[must_use]
    pub fn with_backend(local_site: SiteId, backend: &StorageBackend) -> Self {
        Self::new(
            local_site,
            Arc::new(EntityRegistry::new()),
            Arc::new(InMemoryTransactor::new()),
            backend.gateway(),
        )
    }

    /// Tighten the propagation bound. Clamped to `1..=MAX_PROPAGATION_DEPTH`.
    #[must_use]
    pub fn with_propagation_depth(mut self, depth: usize) -> Self {
        self.max_propagation_depth = depth.clamp(1, primitives::MAX_PROPAGATION_DEPTH);
        self
    }

    #[must_use]
    pub fn local_site(&self) -> SiteId {
        self.local_site
    }

    #[must_use]
    pub fn is_local(&self, residence: Residence) -> bool {
        residence.site == self.local_site
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn RegistryGateway> {
        &self.registry
    }

    #[must_use]
    pub fn transactor(&self) -> &Arc<dyn Transactor> {
        &self.transactor
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    #[must_use]
    pub fn max_propagation_depth(&self) -> usize {
        self.max_propagation_depth
    }

    pub(crate) fn next_link_id(&self) -> LinkId {
        LinkId(self.next_link_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_by_site() {
        let services = Services::in_memory(SiteId(1));
        assert!(services.is_local(Residence::at(SiteId(1))));
        assert!(!services.is_local(Residence::at(SiteId(2))));
    }

    #[test]
    fn propagation_depth_is_clamped() {
        let services = Services::in_memory(SiteId(1)).with_propagation_depth(0);
        assert_eq!(services.max_propagation_depth(), 1);
        let services = Services::in_memory(SiteId(1)).with_propagation_depth(usize::MAX);
        assert_eq!(
            services.max_propagation_depth(),
            primitives::MAX_PROPAGATION_DEPTH
        );
    }

    #[test]
    fn link_ids_are_distinct() {
        let services = Services::in_memory(SiteId(1));
        assert_ne!(services.next_link_id(), services.next_link_id());
    }
}
