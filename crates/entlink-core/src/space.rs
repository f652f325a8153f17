//! # Spaces
//!
//! A space is a container entities are bound into. Links hold spaces by
//! shared reference only; a space never owns the links bound into it.
//!
//! A space is itself an entity, so it may have a meta link of its own. That
//! link is held weakly: contents-changed notices climb from a link to the
//! meta link of the next container up the chain.

use crate::link::EntityLink;
use crate::types::{ContainerId, LinkId, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct Space {
    id: ContainerId,
    name: String,
    storage: bool,
    persistent: AtomicBool,
    key_identity: Option<String>,
    meta: RwLock<Weak<EntityLink>>,
    alternate_ids: Mutex<BTreeMap<Value, LinkId>>,
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("persistent", &self.is_persistent())
            .field("key_identity", &self.key_identity)
            .finish_non_exhaustive()
    }
}

impl Space {
    #[must_use]
    pub fn new(id: ContainerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            storage: false,
            persistent: AtomicBool::new(false),
            key_identity: None,
            meta: RwLock::new(Weak::new()),
            alternate_ids: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mark the space as a storage container.
    #[must_use]
    pub fn storage(mut self, persistent: bool) -> Self {
        self.storage = true;
        self.persistent = AtomicBool::new(persistent);
        self
    }

    /// Name of the identity this space keys its members by.
    #[must_use]
    pub fn keyed_by(mut self, identity: impl Into<String>) -> Self {
        self.key_identity = Some(identity.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_storage(&self) -> bool {
        self.storage
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    #[must_use]
    pub fn key_identity(&self) -> Option<&str> {
        self.key_identity.as_deref()
    }

    /// Bind the link describing this space as an entity.
    pub fn bind_meta(&self, link: &Arc<EntityLink>) {
        *self.meta.write() = Arc::downgrade(link);
    }

    /// The space's own meta link, if bound and alive.
    #[must_use]
    pub fn meta(&self) -> Option<Arc<EntityLink>> {
        self.meta.read().upgrade()
    }

    /// Record an alternate identifier for a member link.
    pub fn put_alternate(&self, id: Value, link: LinkId) {
        self.alternate_ids.lock().insert(id, link);
    }

    #[must_use]
    pub fn alternate(&self, id: &Value) -> Option<LinkId> {
        self.alternate_ids.lock().get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_flags() {
        let plain = Space::new(ContainerId(1), "plain");
        assert!(!plain.is_storage());
        assert!(!plain.is_persistent());
        assert!(plain.key_identity().is_none());

        let stored = Space::new(ContainerId(2), "disk").storage(true).keyed_by("code");
        assert!(stored.is_storage());
        assert!(stored.is_persistent());
        assert_eq!(stored.key_identity(), Some("code"));
        assert_eq!(stored.name(), "disk");
    }

    #[test]
    fn persistence_toggles() {
        let space = Space::new(ContainerId(3), "s").storage(false);
        space.set_persistent(true);
        assert!(space.is_persistent());
    }

    #[test]
    fn alternates_are_indexed() {
        let space = Space::new(ContainerId(4), "s");
        space.put_alternate(Value::text("alias"), LinkId(9));
        assert_eq!(space.alternate(&Value::text("alias")), Some(LinkId(9)));
        assert_eq!(space.alternate(&Value::Int(1)), None);
    }

    #[test]
    fn meta_is_weak() {
        let space = Space::new(ContainerId(5), "s");
        assert!(space.meta().is_none());
    }
}
