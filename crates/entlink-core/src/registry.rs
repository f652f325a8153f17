//! # Registry Gateway
//!
//! The process-wide index of registered links, by shortcut and by key.
//!
//! Links never own the registry; they hand it the minimal addressing data of
//! a `RegistryRecord` and let it synchronize itself. The reference
//! implementation keeps every index behind one mutex so that insert, remove
//! and shortcut checks for the same identity are serialized.

use crate::distribution::Residence;
use crate::types::{ContainerId, LinkError, LinkId, LinkResult, SerialId, Shortcut, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Addressing data a link hands to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub link: LinkId,
    pub shortcut: Option<Shortcut>,
    pub container: Option<ContainerId>,
    pub key: Option<Value>,
    pub residence: Option<Residence>,
}

/// Global index contract.
///
/// Implementations must be safe under concurrent calls for distinct links
/// and must never hand out the same shortcut twice.
pub trait RegistryGateway: Send + Sync {
    /// Insert or refresh a record. Returns `true` when the link was not
    /// registered before.
    fn add(&self, record: RegistryRecord) -> LinkResult<bool>;

    fn remove(&self, link: LinkId) -> Option<RegistryRecord>;

    fn allocate_unique_shortcut(&self) -> Shortcut;

    fn allocate_serial_id(&self) -> SerialId;

    fn by_shortcut(&self, shortcut: Shortcut) -> Option<LinkId>;

    fn by_key(&self, container: Option<ContainerId>, key: &Value) -> Option<LinkId>;

    fn record(&self, link: LinkId) -> Option<RegistryRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct RegistryIndex {
    records: BTreeMap<LinkId, RegistryRecord>,
    shortcuts: BTreeMap<Shortcut, LinkId>,
    keys: BTreeMap<(Option<ContainerId>, Value), LinkId>,
    /// Last shortcut handed out by the allocator.
    last_shortcut: u32,
}

impl RegistryIndex {
    /// Next free shortcut after the last allocation, skipping zero and any
    /// value already indexed. Wraps around at `u32::MAX`.
    fn next_free_shortcut(&mut self) -> Shortcut {
        loop {
            self.last_shortcut = self.last_shortcut.wrapping_add(1);
            let candidate = Shortcut(self.last_shortcut);
            if candidate.0 != 0 && !self.shortcuts.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn unindex(&mut self, record: &RegistryRecord) {
        if let Some(s) = record.shortcut {
            self.shortcuts.remove(&s);
        }
        if let Some(k) = &record.key {
            let slot = (record.container, k.clone());
            if self.keys.get(&slot) == Some(&record.link) {
                self.keys.remove(&slot);
            }
        }
    }
}

/// In-process reference registry.
#[derive(Debug)]
pub struct EntityRegistry {
    index: Mutex<RegistryIndex>,
    next_serial: AtomicU64,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: Mutex::new(RegistryIndex::default()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Every registered record, ordered by link id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RegistryRecord> {
        self.index.lock().records.values().cloned().collect()
    }
}

impl RegistryGateway for EntityRegistry {
    fn add(&self, record: RegistryRecord) -> LinkResult<bool> {
        let mut index = self.index.lock();

        if let Some(s) = record.shortcut {
            if let Some(&holder) = index.shortcuts.get(&s) {
                if holder != record.link {
                    return Err(LinkError::DuplicateShortcut {
                        shortcut: s,
                        holder,
                    });
                }
            }
        }

        let previous = index.records.remove(&record.link);
        if let Some(prev) = &previous {
            index.unindex(prev);
        }

        if let Some(s) = record.shortcut {
            index.shortcuts.insert(s, record.link);
        }
        if let Some(k) = &record.key {
            index.keys.insert((record.container, k.clone()), record.link);
        }
        tracing::debug!(
            link = %record.link,
            shortcut = ?record.shortcut,
            refreshed = previous.is_some(),
            "registry add"
        );
        index.records.insert(record.link, record);
        Ok(previous.is_none())
    }

    fn remove(&self, link: LinkId) -> Option<RegistryRecord> {
        let mut index = self.index.lock();
        let record = index.records.remove(&link)?;
        index.unindex(&record);
        tracing::debug!(link = %link, "registry remove");
        Some(record)
    }

    fn allocate_unique_shortcut(&self) -> Shortcut {
        self.index.lock().next_free_shortcut()
    }

    fn allocate_serial_id(&self) -> SerialId {
        SerialId(self.next_serial.fetch_add(1, Ordering::Relaxed))
    }

    fn by_shortcut(&self, shortcut: Shortcut) -> Option<LinkId> {
        self.index.lock().shortcuts.get(&shortcut).copied()
    }

    fn by_key(&self, container: Option<ContainerId>, key: &Value) -> Option<LinkId> {
        self.index
            .lock()
            .keys
            .get(&(container, key.clone()))
            .copied()
    }

    fn record(&self, link: LinkId) -> Option<RegistryRecord> {
        self.index.lock().records.get(&link).cloned()
    }

    fn len(&self) -> usize {
        self.index.lock().records.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
