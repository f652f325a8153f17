//! # Distribution State Machine
//!
//! Owner / replica / forwarder roles and the residency migration protocol.
//!
//! ```text
//!   Owner ──become_replica──▶ Replica
//!     │                         │
//!     └────become_forwarder─────┴──▶ Forwarder  (may no longer migrate)
//! ```
//!
//! Migrating a registered link to a remote residence first re-establishes
//! its registry invariants (shortcut + registry entry), then marks it a
//! replica, and only then stores a persistent entity at the new residence.
//! A remote persistent object is therefore never unindexed.

use crate::link::{EntityLink, LinkState};
use crate::primitives;
use crate::storage::StorageTarget;
use crate::types::{LinkError, LinkResult, Shortcut, SiteId, UnsupportedOperation};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// ROLE & RESIDENCE
// =============================================================================

/// Role of one local appearance of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DistributionRole {
    /// The authoritative copy.
    #[default]
    Owner,
    /// A secondary copy of an owner elsewhere.
    Replica,
    /// A pure redirect.
    Forwarder,
}

impl DistributionRole {
    /// Bits contributed to a reference decoration mask.
    #[must_use]
    pub const fn mask_bits(self) -> u32 {
        let bit = match self {
            Self::Owner => 0,
            Self::Replica => 1,
            Self::Forwarder => 2,
        };
        1 << (primitives::ROLE_MASK_SHIFT + bit)
    }

    /// Recover the role from a decoration mask.
    #[must_use]
    pub fn from_mask_bits(mask: u32) -> Option<Self> {
        [Self::Owner, Self::Replica, Self::Forwarder]
            .into_iter()
            .find(|r| mask & r.mask_bits() != 0)
    }
}

impl fmt::Display for DistributionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Owner => "owner",
            Self::Replica => "replica",
            Self::Forwarder => "forwarder",
        })
    }
}

/// The site presumed to hold an entity's owning copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Residence {
    pub site: SiteId,
}

impl Residence {
    #[must_use]
    pub const fn at(site: SiteId) -> Self {
        Self { site }
    }
}

impl fmt::Display for Residence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.site)
    }
}

// =============================================================================
// LINK OPERATIONS
// =============================================================================

impl EntityLink {
    #[must_use]
    pub fn role(&self) -> DistributionRole {
        self.state.lock().role
    }

    /// Unconditionally become a forwarder.
    pub fn become_forwarder(&self) {
        self.state.lock().role = DistributionRole::Forwarder;
        tracing::debug!(link = %self.id(), "became forwarder");
    }

    /// Become a replica of the primary at `residence`.
    ///
    /// Assumes a primary with this identity already exists there.
    pub fn become_replica(&self, residence: Residence) -> LinkResult<()> {
        {
            let mut state = self.state.lock();
            if state.role == DistributionRole::Owner {
                state.role = DistributionRole::Replica;
            }
        }
        self.migrate_residence(residence)
    }

    /// Move the entity's residence.
    ///
    /// Migrating to the current residence is a no-op. Forwarders cannot
    /// migrate; the attempt fails before any state changes.
    pub fn migrate_residence(&self, residence: Residence) -> LinkResult<()> {
        let store = {
            let mut state = self.state.lock();
            if state.residence == Some(residence) {
                return Ok(());
            }
            if state.role == DistributionRole::Forwarder {
                return Err(LinkError::Unsupported(
                    UnsupportedOperation::MigrateForwarder,
                ));
            }

            let previous = state.residence.replace(residence);
            tracing::debug!(
                link = %self.id(),
                from = ?previous,
                to = %residence,
                "residence migrated"
            );

            if !state.registered || self.services().is_local(residence) {
                None
            } else {
                if let Err(e) = self.register_locked(&mut state) {
                    state.residence = previous;
                    return Err(e);
                }
                state.role = DistributionRole::Replica;
                state
                    .kernel
                    .persistent
                    .then(|| self.reference_locked(&state))
            }
        };

        if let Some(reference) = store {
            tracing::debug!(link = %self.id(), site = %residence.site, "storing at new residence");
            self.services()
                .storage()
                .store(&reference, StorageTarget::at(residence.site))?;
        }
        Ok(())
    }

    /// The residence, resolved to the local site if unset.
    pub fn residence(&self) -> Residence {
        let mut state = self.state.lock();
        self.resolve_residence(&mut state)
    }

    fn resolve_residence(&self, state: &mut LinkState) -> Residence {
        *state
            .residence
            .get_or_insert_with(|| Residence::at(self.services().local_site()))
    }

    /// The site the entity resides at.
    pub fn site(&self) -> SiteId {
        self.residence().site
    }

    /// Whether the entity's owning copy is elsewhere.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.state.lock().is_remote(self.services())
    }

    // -------------------------------------------------------------------------
    // Registry invariants
    // -------------------------------------------------------------------------

    /// Assign a shortcut if needed and insert into the registry.
    ///
    /// Returns whether insertion ran: `false` while no residence is set.
    /// Sites are never given a shortcut.
    pub fn sync_invariants(&self) -> LinkResult<bool> {
        let mut state = self.state.lock();
        if state.residence.is_none() {
            return Ok(false);
        }
        self.register_locked(&mut state)?;
        Ok(true)
    }

    fn register_locked(&self, state: &mut LinkState) -> LinkResult<()> {
        let registry = self.services().registry();
        let fresh = state.shortcut.is_none() && !state.is_site();
        if fresh {
            state.shortcut = Some(registry.allocate_unique_shortcut());
        }
        let inserted = match registry.add(state.registry_record(self.id())) {
            Ok(inserted) => inserted,
            Err(e) => {
                if fresh {
                    state.shortcut = None;
                }
                return Err(e);
            }
        };
        state.registered = true;
        tracing::debug!(
            link = %self.id(),
            shortcut = ?state.shortcut,
            inserted,
            "registry invariants synchronized"
        );
        Ok(())
    }

    /// Resolve the residence and register.
    pub fn register(&self) -> LinkResult<bool> {
        let mut state = self.state.lock();
        self.resolve_residence(&mut state);
        self.register_locked(&mut state)?;
        Ok(true)
    }

    /// Remove the link from the registry. Returns whether it was registered.
    pub fn unregister(&self) -> bool {
        let mut state = self.state.lock();
        if !state.registered {
            return false;
        }
        self.services().registry().remove(self.id());
        state.registered = false;
        tracing::debug!(link = %self.id(), "unregistered");
        true
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    #[must_use]
    pub fn shortcut(&self) -> Option<Shortcut> {
        self.state.lock().shortcut
    }

    /// Assign a shortcut once. Later assignments are ignored.
    pub fn assign_shortcut(&self, shortcut: Shortcut) -> LinkResult<()> {
        let mut state = self.state.lock();
        if state.shortcut.is_some() {
            return Ok(());
        }
        state.shortcut = Some(shortcut);
        if state.registered {
            if let Err(e) = self.services().registry().add(state.registry_record(self.id())) {
                state.shortcut = None;
                return Err(e);
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecyclePhase;
    use crate::registry::{EntityRegistry, RegistryGateway, RegistryRecord};
    use crate::services::Services;
    use crate::storage::MemoryStorage;
    use crate::testing::{int_type, services, site_type};
    use crate::transaction::InMemoryTransactor;
    use crate::types::{ContainerId, LinkId, SerialId, Value};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SITE_A: SiteId = SiteId(1);
    const SITE_B: SiteId = SiteId(2);

    #[test]
    fn role_mask_roundtrip() {
        for role in [
            DistributionRole::Owner,
            DistributionRole::Replica,
            DistributionRole::Forwarder,
        ] {
            assert_eq!(DistributionRole::from_mask_bits(role.mask_bits()), Some(role));
        }
        assert_eq!(DistributionRole::from_mask_bits(0xFF), None);
    }

    #[test]
    fn residence_resolves_lazily_to_local() {
        let (svc, ..) = services();
        let link = EntityLink::new(svc, int_type());
        assert_eq!(link.residence(), Residence::at(SITE_A));
        assert!(!link.is_remote());
    }

    #[test]
    fn sync_invariants_waits_for_residence() {
        let (svc, ..) = services();
        let link = EntityLink::new(svc, int_type());
        assert!(!link.sync_invariants().expect("sync"));
        assert!(!link.is_registered());
        assert!(link.shortcut().is_none());

        link.residence();
        assert!(link.sync_invariants().expect("sync"));
        assert!(link.is_registered());
        assert!(link.shortcut().is_some());
    }

    #[test]
    fn sites_get_no_shortcut() {
        let (svc, ..) = services();
        let site = EntityLink::new(svc, site_type());
        site.register().expect("register");
        assert!(site.is_registered());
        assert!(site.shortcut().is_none());
    }

    #[test]
    fn shortcut_assigned_once() {
        let (svc, ..) = services();
        let link = EntityLink::new(svc, int_type());
        link.assign_shortcut(Shortcut(10)).expect("assign");
        link.assign_shortcut(Shortcut(11)).expect("ignored");
        link.register().expect("register");
        assert_eq!(link.shortcut(), Some(Shortcut(10)));
    }

    #[test]
    fn conflicting_shortcut_is_rolled_back() {
        let (svc, ..) = services();
        let a = EntityLink::new(Arc::clone(&svc), int_type());
        a.assign_shortcut(Shortcut(5)).expect("assign");
        a.register().expect("register");

        // registered sites hold no shortcut, so the assignment reaches the registry
        let site = EntityLink::new(svc, site_type());
        site.register().expect("register");
        let err = site.assign_shortcut(Shortcut(5)).expect_err("taken");
        assert!(matches!(err, LinkError::DuplicateShortcut { .. }));
        assert!(site.shortcut().is_none());
    }

    #[test]
    fn allocated_shortcut_avoids_assigned_one() {
        let (svc, ..) = services();
        let a = EntityLink::new(Arc::clone(&svc), int_type());
        a.assign_shortcut(Shortcut(1)).expect("assign");
        a.register().expect("register a");

        let b = EntityLink::new(Arc::clone(&svc), int_type());
        b.register().expect("register b");
        assert!(b.is_registered());
        assert_ne!(b.shortcut(), a.shortcut());
        assert_eq!(svc.registry().len(), 2);
    }

    /// Hands out `Shortcut(1)` once regardless of the index, then defers.
    struct StaleAllocator {
        inner: EntityRegistry,
        stale: AtomicBool,
    }

    impl RegistryGateway for StaleAllocator {
        fn add(&self, record: RegistryRecord) -> LinkResult<bool> {
            self.inner.add(record)
        }

        fn remove(&self, link: LinkId) -> Option<RegistryRecord> {
            self.inner.remove(link)
        }

        fn allocate_unique_shortcut(&self) -> Shortcut {
            if self.stale.swap(false, Ordering::SeqCst) {
                Shortcut(1)
            } else {
                self.inner.allocate_unique_shortcut()
            }
        }

        fn allocate_serial_id(&self) -> SerialId {
            self.inner.allocate_serial_id()
        }

        fn by_shortcut(&self, shortcut: Shortcut) -> Option<LinkId> {
            self.inner.by_shortcut(shortcut)
        }

        fn by_key(&self, container: Option<ContainerId>, key: &Value) -> Option<LinkId> {
            self.inner.by_key(container, key)
        }

        fn record(&self, link: LinkId) -> Option<RegistryRecord> {
            self.inner.record(link)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn failed_registration_releases_allocated_shortcut() {
        let registry = Arc::new(StaleAllocator {
            inner: EntityRegistry::new(),
            stale: AtomicBool::new(false),
        });
        let svc = Arc::new(Services::new(
            SITE_A,
            registry.clone(),
            Arc::new(InMemoryTransactor::new()),
            Arc::new(MemoryStorage::new()),
        ));

        let a = EntityLink::new(Arc::clone(&svc), int_type());
        a.assign_shortcut(Shortcut(1)).expect("assign");
        a.register().expect("register a");

        registry.stale.store(true, Ordering::SeqCst);
        let b = EntityLink::new(Arc::clone(&svc), int_type());
        let err = b.register().expect_err("collides");
        assert!(matches!(
            err,
            LinkError::DuplicateShortcut {
                shortcut: Shortcut(1),
                ..
            }
        ));
        assert!(b.shortcut().is_none());
        assert!(!b.is_registered());

        b.register().expect("retry");
        assert!(b.is_registered());
        assert_ne!(b.shortcut(), Some(Shortcut(1)));
        assert!(b.shortcut().is_some());
    }

    #[test]
    fn unregister_removes_from_registry() {
        let (svc, ..) = services();
        let link = EntityLink::new(Arc::clone(&svc), int_type());
        link.register().expect("register");
        assert_eq!(svc.registry().len(), 1);
        assert!(link.unregister());
        assert!(!link.unregister());
        assert!(svc.registry().is_empty());
    }

    #[test]
    fn migrate_to_same_residence_is_noop() {
        let (svc, _, storage, ..) = services();
        let link = EntityLink::new(Arc::clone(&svc), int_type());
        link.register().expect("register");
        let before = (link.role(), link.shortcut(), svc.registry().len());

        link.migrate_residence(Residence::at(SITE_A)).expect("noop");
        assert_eq!(before, (link.role(), link.shortcut(), svc.registry().len()));
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn forwarder_cannot_migrate() {
        let (svc, ..) = services();
        let link = EntityLink::new(svc, int_type());
        link.register().expect("register");
        link.become_forwarder();

        let err = link
            .migrate_residence(Residence::at(SITE_B))
            .expect_err("forwarder");
        assert!(matches!(
            err,
            LinkError::Unsupported(UnsupportedOperation::MigrateForwarder)
        ));
        assert_eq!(link.residence(), Residence::at(SITE_A));
        assert_eq!(link.role(), DistributionRole::Forwarder);
    }

    #[test]
    fn unregistered_migration_only_moves_residence() {
        let (svc, _, storage, ..) = services();
        let link = EntityLink::new(svc, int_type());
        link.update_kernel(|k| k.persistent = true);
        link.migrate_residence(Residence::at(SITE_B)).expect("migrate");

        assert_eq!(link.residence(), Residence::at(SITE_B));
        assert_eq!(link.role(), DistributionRole::Owner);
        assert!(!link.is_registered());
        assert!(storage.stores().is_empty());
    }

    #[test]
    fn local_migration_keeps_role() {
        let (svc, _, storage, ..) = services();
        let link = EntityLink::new(svc, int_type());
        link.migrate_residence(Residence::at(SITE_B)).expect("away");
        link.register().expect("register");
        link.migrate_residence(Residence::at(SITE_A)).expect("home");

        assert_eq!(link.role(), DistributionRole::Owner);
        assert!(storage.stores().is_empty());
    }

    #[test]
    fn become_replica_of_remote_transient_entity() {
        let (svc, _, storage, ..) = services();
        let link = EntityLink::new(Arc::clone(&svc), int_type());
        link.set_key(Value::Int(1)).expect("key");
        link.register().expect("register");

        link.become_replica(Residence::at(SITE_B)).expect("replica");
        assert_eq!(link.role(), DistributionRole::Replica);
        assert_eq!(link.residence(), Residence::at(SITE_B));
        assert!(link.shortcut().is_some());
        assert_eq!(
            svc.registry()
                .record(link.id())
                .and_then(|r| r.residence),
            Some(Residence::at(SITE_B))
        );
        assert!(storage.stores().is_empty());
    }

    #[test]
    fn become_replica_of_remote_persistent_entity_stores_once() {
        let (svc, _, storage, ..) = services();
        let link = EntityLink::new(svc, int_type());
        link.set_key(Value::Int(1)).expect("key");
        link.update_kernel(|k| {
            k.phase = LifecyclePhase::Wired;
            k.persistent = true;
        });
        link.register().expect("register");

        link.become_replica(Residence::at(SITE_B)).expect("replica");
        let stores = storage.stores();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].1, StorageTarget::at(SITE_B));
        assert_eq!(stores[0].0.role(), Some(DistributionRole::Replica));
    }
}
