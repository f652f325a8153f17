//! # entlink-core
//!
//! The entity link engine: identity, residency and change fan-out for
//! entities spread across sites.
//!
//! Every entity is reached through an `EntityLink`. The link binds the
//! entity into one or more containers, keeps its key and onboard identity in
//! agreement, tracks which site holds the owning copy, and delivers change
//! notices to observers.
//!
//! ## Collaborators
//!
//! The engine owns none of the systems around it. Registry, transactions,
//! storage and type metadata are traits, injected through `Services`:
//! - `registry` → `RegistryGateway` (shortcut allocation, indexing)
//! - `transaction` → `Transactor` (all-or-nothing event commits)
//! - `storage` → `StorageGateway` (store, fetch, purge)
//! - `metadata` → `TypeDescriptor` / `IdentityFacet`
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies (pure Rust)
//! - No ambient global state: every shared service arrives through `Services`
//! - One mutual-exclusion scope per link; the registry synchronizes itself

// =============================================================================
// MODULES
// =============================================================================

pub mod attachment;
pub mod distribution;
pub mod events;
pub mod formats;
pub mod identity;
pub mod lifecycle;
pub mod link;
pub mod metadata;
pub mod persistence;
pub mod primitives;
pub mod registry;
pub mod services;
pub mod space;
pub mod storage;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod testing;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ContainerId, Entity, LinkError, LinkId, LinkResult, SerialId, Shortcut, SiteId, TypeId,
    UnsupportedOperation, Value, ValueKind, Version,
};

// =============================================================================
// RE-EXPORTS: Links
// =============================================================================

pub use attachment::{
    Attachment, AttachmentChain, AttachmentKind, AttachmentMask, EntityPool, ResourcePool,
};
pub use distribution::{DistributionRole, Residence};
pub use events::{EventSink, RecordingSink, SinkRef, StubSink};
pub use identity::IdentityStatus;
pub use lifecycle::{KernelState, LifecyclePhase, Transition};
pub use link::{ChainEntry, EntityLink, LinkFlags, SpaceLink};
pub use persistence::WriteGuard;
pub use space::Space;

// =============================================================================
// RE-EXPORTS: Collaborators
// =============================================================================

pub use metadata::{EntityType, FacetRef, FieldFacet, IdentityFacet, KeyFacet, TypeDescriptor, TypeRef};
pub use registry::{EntityRegistry, RegistryGateway, RegistryRecord};
pub use services::{Services, StorageBackend};
pub use storage::{MemoryStorage, RedbStore, StorageGateway, StorageTarget};
pub use transaction::{InMemoryTransactor, LinkEvent, Mutation, ScheduledEvent, Transactor};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{
    EncodedId, LinkReference, ReferenceHeader, reference_from_bytes, reference_to_bytes,
};
