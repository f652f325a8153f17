//! # Storage Module
//!
//! The storage collaborator contract and its two implementations.
//!
//! The engine treats storage as opaque and fallible: it stores a link's
//! reference against a target site, fetches the stored image back, and
//! purges authoritative copies. Purging a copy that is already gone reports
//! `LinkError::AlreadyPurged`, which callers may treat as benign.
//!
//! - `MemoryStorage`: in-memory, records every call for inspection
//! - `RedbStore`: disk-backed on redb

mod redb_store;

pub use redb_store::RedbStore;

use crate::formats::LinkReference;
use crate::types::{LinkError, LinkResult, SiteId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a store lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageTarget {
    pub site: SiteId,
}

impl StorageTarget {
    #[must_use]
    pub const fn at(site: SiteId) -> Self {
        Self { site }
    }
}

/// Storage collaborator contract.
pub trait StorageGateway: Send + Sync {
    fn store(&self, reference: &LinkReference, target: StorageTarget) -> LinkResult<()>;

    /// Fetch the stored image of `reference` from its residence site.
    fn fetch(&self, reference: &LinkReference) -> LinkResult<Option<LinkReference>>;

    /// Remove the authoritative copy at the reference's residence site.
    fn purge_primary(&self, reference: &LinkReference) -> LinkResult<()>;
}

/// Resolve the site a reference's image lives at.
fn residence_site(reference: &LinkReference) -> LinkResult<SiteId> {
    reference
        .site()
        .ok_or_else(|| LinkError::Io("reference has no residence".to_string()))
}

// =============================================================================
// IN-MEMORY STORAGE
// =============================================================================

/// One observed storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Store {
        reference: LinkReference,
        target: StorageTarget,
    },
    Fetch {
        reference: LinkReference,
    },
    Purge {
        reference: LinkReference,
    },
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    images: Mutex<BTreeMap<(SiteId, Vec<u8>), LinkReference>>,
    calls: Mutex<Vec<StorageCall>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StorageCall> {
        self.calls.lock().clone()
    }

    /// Only the store calls.
    #[must_use]
    pub fn stores(&self) -> Vec<(LinkReference, StorageTarget)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                StorageCall::Store { reference, target } => Some((reference.clone(), *target)),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.lock().len()
    }
}

impl StorageGateway for MemoryStorage {
    fn store(&self, reference: &LinkReference, target: StorageTarget) -> LinkResult<()> {
        let key = (target.site, reference.identity_key()?);
        self.images.lock().insert(key, reference.clone());
        self.calls.lock().push(StorageCall::Store {
            reference: reference.clone(),
            target,
        });
        Ok(())
    }

    fn fetch(&self, reference: &LinkReference) -> LinkResult<Option<LinkReference>> {
        self.calls.lock().push(StorageCall::Fetch {
            reference: reference.clone(),
        });
        let key = (residence_site(reference)?, reference.identity_key()?);
        Ok(self.images.lock().get(&key).cloned())
    }

    fn purge_primary(&self, reference: &LinkReference) -> LinkResult<()> {
        self.calls.lock().push(StorageCall::Purge {
            reference: reference.clone(),
        });
        let key = (residence_site(reference)?, reference.identity_key()?);
        match self.images.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(LinkError::AlreadyPurged(format!(
                "no image at {}",
                key.0
            ))),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Residence;
    use crate::formats::EncodedId;
    use crate::types::TypeId;

    fn reference(site: u32, id: i64) -> LinkReference {
        LinkReference::Entity {
            type_id: Some(TypeId(1)),
            residence: Some(Residence::at(SiteId(site))),
            decoration: 0,
            primary_id: EncodedId::Narrow(id as i32),
        }
    }

    #[test]
    fn store_then_fetch_from_residence() {
        let storage = MemoryStorage::new();
        storage
            .store(&reference(2, 1), StorageTarget::at(SiteId(2)))
            .expect("store");

        let fetched = storage.fetch(&reference(2, 1)).expect("fetch");
        assert_eq!(fetched, Some(reference(2, 1)));
        assert!(storage.fetch(&reference(3, 1)).expect("fetch").is_none());
        assert_eq!(storage.stores().len(), 1);
    }

    #[test]
    fn second_purge_is_already_purged() {
        let storage = MemoryStorage::new();
        storage
            .store(&reference(2, 1), StorageTarget::at(SiteId(2)))
            .expect("store");

        storage.purge_primary(&reference(2, 1)).expect("purge");
        let err = storage.purge_primary(&reference(2, 1)).expect_err("gone");
        assert!(err.is_benign());
        assert_eq!(storage.image_count(), 0);
        assert_eq!(storage.calls().len(), 3);
    }

    #[test]
    fn reference_without_residence_cannot_be_fetched() {
        let storage = MemoryStorage::new();
        let orphan = LinkReference::Entity {
            type_id: None,
            residence: None,
            decoration: 0,
            primary_id: EncodedId::Absent,
        };
        assert!(matches!(storage.fetch(&orphan), Err(LinkError::Io(_))));
    }
}
