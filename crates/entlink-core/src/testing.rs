//! Shared fixtures for unit tests.

use crate::metadata::{EntityType, FieldFacet, TypeRef};
use crate::registry::EntityRegistry;
use crate::services::Services;
use crate::space::Space;
use crate::storage::MemoryStorage;
use crate::transaction::InMemoryTransactor;
use crate::types::{ContainerId, SiteId, TypeId, ValueKind};
use std::sync::Arc;

pub(crate) type Fixture = (
    Arc<Services>,
    Arc<InMemoryTransactor>,
    Arc<MemoryStorage>,
    Arc<EntityRegistry>,
);

/// Services local to site 1, with handles to every in-memory collaborator.
pub(crate) fn services() -> Fixture {
    services_with_depth(crate::primitives::MAX_PROPAGATION_DEPTH)
}

pub(crate) fn services_with_depth(depth: usize) -> Fixture {
    let tx = Arc::new(InMemoryTransactor::new());
    let storage = Arc::new(MemoryStorage::new());
    let registry = Arc::new(EntityRegistry::new());
    let svc = Services::new(
        SiteId(1),
        registry.clone(),
        tx.clone(),
        storage.clone(),
    )
    .with_propagation_depth(depth);
    (Arc::new(svc), tx, storage, registry)
}

/// Type 1, identified by an integer `id` field.
pub(crate) fn int_type() -> TypeRef {
    EntityType::new(TypeId(1), "Item")
        .with_primary(Arc::new(FieldFacet::new("id", ValueKind::Int)))
        .into_ref()
}

/// A site entity type.
pub(crate) fn site_type() -> TypeRef {
    EntityType::new(TypeId(100), "Site").as_site().into_ref()
}

pub(crate) fn space(id: u64, storage: bool) -> Arc<Space> {
    let space = Space::new(ContainerId(id), format!("space-{id}"));
    Arc::new(if storage { space.storage(true) } else { space })
}
