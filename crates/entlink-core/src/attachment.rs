//! # Attachment Chain
//!
//! Optional per-link side state ("decorations") kept off the hot path.
//!
//! Most links carry no attachments at all and a few carry one or two, so the
//! chain is a short intrusive singly linked list rather than a map. A bitmask
//! caches which variants are present so that negative lookups never walk the
//! list.
//!
//! ## Invariant
//!
//! For every variant `k`: `mask().contains(k.as_mask())` if and only if
//! `get(k).is_some()`. Every mutation goes through `attach`/`detach`, which
//! maintain both sides together.

use crate::events::EventChannelBinding;
use crate::primitives;
use crate::types::{Entity, SerialId, Version};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

// =============================================================================
// KINDS & MASK
// =============================================================================

/// Discriminant of an `Attachment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentKind {
    Pool,
    Version,
    SerialId,
    EventChannel,
    WriteLock,
}

bitflags::bitflags! {
    /// Presence cache for the attachment chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentMask: u8 {
        const POOL = 1 << 0;
        const VERSION = 1 << 1;
        const SERIAL_ID = 1 << 2;
        const EVENT_CHANNEL = 1 << 3;
        const WRITE_LOCK = 1 << 4;
    }
}

impl AttachmentKind {
    /// Every variant, in mask-bit order.
    pub const ALL: [Self; 5] = [
        Self::Pool,
        Self::Version,
        Self::SerialId,
        Self::EventChannel,
        Self::WriteLock,
    ];

    /// Returns the mask bit for this kind.
    pub const fn as_mask(self) -> AttachmentMask {
        match self {
            Self::Pool => AttachmentMask::POOL,
            Self::Version => AttachmentMask::VERSION,
            Self::SerialId => AttachmentMask::SERIAL_ID,
            Self::EventChannel => AttachmentMask::EVENT_CHANNEL,
            Self::WriteLock => AttachmentMask::WRITE_LOCK,
        }
    }
}

impl From<AttachmentKind> for AttachmentMask {
    fn from(kind: AttachmentKind) -> Self {
        kind.as_mask()
    }
}

// =============================================================================
// ATTACHMENT VARIANTS
// =============================================================================

/// A pool that recycles entity instances.
pub trait ResourcePool: Send + Sync {
    fn name(&self) -> &str;

    /// Take back an entity that is no longer in use.
    fn return_to_pool(&self, entity: Entity);
}

/// Simple free-list pool.
#[derive(Debug, Default)]
pub struct EntityPool {
    name: String,
    free: Mutex<Vec<Entity>>,
}

impl EntityPool {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a recycled entity, if any.
    pub fn take(&self) -> Option<Entity> {
        self.free.lock().pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourcePool for EntityPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn return_to_pool(&self, entity: Entity) {
        self.free.lock().push(entity);
    }
}

/// Binds a link to the pool that owns its entity.
#[derive(Clone)]
pub struct PoolBinding {
    pub pool: Arc<dyn ResourcePool>,
}

impl fmt::Debug for PoolBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBinding")
            .field("pool", &self.pool.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTag {
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialIdTag {
    pub id: SerialId,
}

/// Marks a link as mid-write. Re-entrant per holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLock {
    pub holder: ThreadId,
    pub depth: u32,
}

/// One piece of side state. Each value belongs to exactly one link.
#[derive(Debug)]
pub enum Attachment {
    Pool(PoolBinding),
    Version(VersionTag),
    SerialId(SerialIdTag),
    EventChannel(EventChannelBinding),
    WriteLock(WriteLock),
}

impl Attachment {
    pub const fn kind(&self) -> AttachmentKind {
        match self {
            Self::Pool(_) => AttachmentKind::Pool,
            Self::Version(_) => AttachmentKind::Version,
            Self::SerialId(_) => AttachmentKind::SerialId,
            Self::EventChannel(_) => AttachmentKind::EventChannel,
            Self::WriteLock(_) => AttachmentKind::WriteLock,
        }
    }
}

// =============================================================================
// CHAIN
// =============================================================================

#[derive(Debug)]
struct AttachmentNode {
    attachment: Attachment,
    next: Option<Box<AttachmentNode>>,
}

/// The attachment list of one link plus its presence mask.
#[derive(Debug, Default)]
pub struct AttachmentChain {
    head: Option<Box<AttachmentNode>>,
    mask: AttachmentMask,
}

impl AttachmentChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mask(&self) -> AttachmentMask {
        self.mask
    }

    /// O(1) presence test.
    #[must_use]
    pub fn contains(&self, kind: AttachmentKind) -> bool {
        self.mask.contains(kind.as_mask())
    }

    /// Returns the attachment of `kind`, checking the mask before walking.
    #[must_use]
    pub fn get(&self, kind: AttachmentKind) -> Option<&Attachment> {
        if !self.contains(kind) {
            return None;
        }
        self.iter().find(|a| a.kind() == kind)
    }

    pub fn get_mut(&mut self, kind: AttachmentKind) -> Option<&mut Attachment> {
        if !self.contains(kind) {
            return None;
        }
        let mut cursor = self.head.as_deref_mut();
        while let Some(node) = cursor {
            if node.attachment.kind() == kind {
                return Some(&mut node.attachment);
            }
            cursor = node.next.as_deref_mut();
        }
        None
    }

    /// Insert at the head, replacing any attachment of the same kind.
    ///
    /// Returns the replaced attachment.
    pub fn attach(&mut self, attachment: Attachment) -> Option<Attachment> {
        let kind = attachment.kind();
        let replaced = self.detach(kind);
        let next = self.head.take();
        self.head = Some(Box::new(AttachmentNode { attachment, next }));
        self.mask.insert(kind.as_mask());
        if self.mask.bits().count_ones() as usize > primitives::EXPECTED_ATTACHMENT_CHAIN_LEN {
            tracing::trace!(mask = ?self.mask, "attachment chain longer than usual");
        }
        replaced
    }

    /// Remove the attachment of `kind`, clearing its mask bit.
    pub fn detach(&mut self, kind: AttachmentKind) -> Option<Attachment> {
        if !self.contains(kind) {
            return None;
        }
        let mut cursor = &mut self.head;
        while cursor.as_ref().is_some_and(|n| n.attachment.kind() != kind) {
            cursor = &mut cursor.as_mut()?.next;
        }
        let mut node = cursor.take()?;
        *cursor = node.next.take();
        self.mask.remove(kind.as_mask());
        Some(node.attachment)
    }

    /// Drop every attachment.
    pub fn clear(&mut self) {
        // unlink iteratively so a long chain cannot recurse in Drop
        let mut cursor = self.head.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
        }
        self.mask = AttachmentMask::empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        std::iter::successors(self.head.as_deref(), |n| n.next.as_deref()).map(|n| &n.attachment)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeId;

    fn version(v: u64) -> Attachment {
        Attachment::Version(VersionTag {
            version: Version(v),
        })
    }

    fn serial(id: u64) -> Attachment {
        Attachment::SerialId(SerialIdTag { id: SerialId(id) })
    }

    fn mask_consistent(chain: &AttachmentChain) -> bool {
        AttachmentKind::ALL
            .iter()
            .all(|&k| chain.contains(k) == chain.iter().any(|a| a.kind() == k))
    }

    #[test]
    fn empty_chain_has_nothing() {
        let chain = AttachmentChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.mask(), AttachmentMask::empty());
        for kind in AttachmentKind::ALL {
            assert!(chain.get(kind).is_none());
        }
    }

    #[test]
    fn attach_sets_bit_and_inserts_at_head() {
        let mut chain = AttachmentChain::new();
        chain.attach(version(1));
        chain.attach(serial(9));

        assert!(chain.contains(AttachmentKind::Version));
        assert!(chain.contains(AttachmentKind::SerialId));
        let order: Vec<_> = chain.iter().map(Attachment::kind).collect();
        assert_eq!(order, vec![AttachmentKind::SerialId, AttachmentKind::Version]);
        assert!(mask_consistent(&chain));
    }

    #[test]
    fn attach_same_kind_replaces() {
        let mut chain = AttachmentChain::new();
        assert!(chain.attach(version(1)).is_none());
        let replaced = chain.attach(version(2));

        assert!(matches!(
            replaced,
            Some(Attachment::Version(VersionTag { version: Version(1) }))
        ));
        assert_eq!(chain.len(), 1);
        assert!(mask_consistent(&chain));
    }

    #[test]
    fn detach_middle_and_tail() {
        let mut chain = AttachmentChain::new();
        chain.attach(version(1));
        chain.attach(serial(2));
        chain.attach(Attachment::Pool(PoolBinding {
            pool: Arc::new(EntityPool::new("p")),
        }));

        // Version is at the tail
        assert!(chain.detach(AttachmentKind::Version).is_some());
        assert!(!chain.contains(AttachmentKind::Version));
        // SerialId is now at the tail, Pool at the head
        assert!(chain.detach(AttachmentKind::Pool).is_some());
        assert_eq!(chain.len(), 1);
        assert!(chain.detach(AttachmentKind::Pool).is_none());
        assert!(mask_consistent(&chain));
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut chain = AttachmentChain::new();
        chain.attach(version(1));
        chain.attach(serial(5));

        if let Some(Attachment::Version(tag)) = chain.get_mut(AttachmentKind::Version) {
            tag.version = Version(7);
        }
        assert!(matches!(
            chain.get(AttachmentKind::Version),
            Some(Attachment::Version(VersionTag { version: Version(7) }))
        ));
    }

    #[test]
    fn clear_resets_mask() {
        let mut chain = AttachmentChain::new();
        chain.attach(version(1));
        chain.attach(serial(5));
        chain.clear();
        assert!(chain.is_empty());
        assert_eq!(chain.mask(), AttachmentMask::empty());
    }

    #[test]
    fn pool_recycles_entities() {
        let pool = EntityPool::new("widgets");
        assert!(pool.is_empty());
        pool.return_to_pool(Entity::new(TypeId(1)));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.take().and_then(|e| e.type_id()), Some(TypeId(1)));
        assert_eq!(pool.name(), "widgets");
    }
}
