//! # Entity Links
//!
//! An `EntityLink` is the identity and location node of one entity. Its head
//! binds the entity into its primary container; further bindings into other
//! containers hang off the head as an owned chain of `SpaceLink` nodes.
//!
//! ## Locking
//!
//! All mutable link state lives behind one per-link mutex. The chain is
//! owned by the head and only walked under the head's lock. Registry calls
//! are made under the link lock (the registry never calls back into links);
//! observers, storage, and the transactor are always invoked after it is
//! released.
//!
//! The rest of the link's behavior is split by concern across `identity`,
//! `distribution`, `persistence`, `events`, and `lifecycle`.

use crate::attachment::{
    Attachment, AttachmentChain, AttachmentKind, AttachmentMask, PoolBinding, ResourcePool,
    SerialIdTag, VersionTag,
};
use crate::distribution::{DistributionRole, Residence};
use crate::formats::{EncodedId, LinkReference, reference_to_bytes};
use crate::lifecycle::{KernelState, LifecyclePhase, Transition};
use crate::metadata::{FacetRef, TypeRef};
use crate::registry::RegistryRecord;
use crate::services::Services;
use crate::space::Space;
use crate::transaction::{LinkEvent, Mutation, ScheduledEvent};
use crate::types::{
    ContainerId, Entity, LinkError, LinkId, LinkResult, SerialId, Shortcut, UnsupportedOperation,
    Value, Version,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// CHAIN NODES
// =============================================================================

/// One (container, key) binding of an entity.
#[derive(Debug, Clone, Default)]
pub struct SpaceLink {
    pub(crate) key: Option<Value>,
    pub(crate) container: Option<Arc<Space>>,
    pub(crate) next: Option<Box<SpaceLink>>,
}

impl SpaceLink {
    #[must_use]
    pub fn new(container: Option<Arc<Space>>, key: Option<Value>) -> Self {
        Self {
            key,
            container,
            next: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    #[must_use]
    pub fn container(&self) -> Option<&Arc<Space>> {
        self.container.as_ref()
    }

    #[must_use]
    pub fn next(&self) -> Option<&SpaceLink> {
        self.next.as_deref()
    }

    /// This node and every node after it.
    pub fn iter(&self) -> impl Iterator<Item = &SpaceLink> {
        std::iter::successors(Some(self), |n| n.next.as_deref())
    }

    pub(crate) fn nth_mut(&mut self, n: usize) -> Option<&mut SpaceLink> {
        let mut node = self;
        for _ in 0..n {
            node = node.next.as_deref_mut()?;
        }
        Some(node)
    }

    /// Append a node at the tail.
    pub(crate) fn append(&mut self, link: SpaceLink) {
        let mut cursor = &mut self.next;
        while let Some(node) = cursor {
            cursor = &mut node.next;
        }
        *cursor = Some(Box::new(link));
    }
}

/// Snapshot of one chain node.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub container: Option<Arc<Space>>,
    pub key: Option<Value>,
}

impl ChainEntry {
    #[must_use]
    pub fn container_id(&self) -> Option<ContainerId> {
        self.container.as_ref().map(|s| s.id())
    }
}

impl From<&SpaceLink> for ChainEntry {
    fn from(node: &SpaceLink) -> Self {
        Self {
            container: node.container.clone(),
            key: node.key.clone(),
        }
    }
}

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Classification bits. They sit above the attachment bits in the
    /// reference decoration mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LinkFlags: u32 {
        const IN_USE = 1 << 8;
        const TEMPLATE = 1 << 9;
        const UNIQUIZING = 1 << 10;
        const STORAGE_PROXY = 1 << 11;
        const IN_LIFECYCLE_TRANSITION = 1 << 12;
    }
}

// =============================================================================
// LINK STATE
// =============================================================================

#[derive(Debug)]
pub(crate) struct LinkState {
    pub(crate) entity: Option<Entity>,
    pub(crate) entity_type: Option<TypeRef>,
    pub(crate) id_facet: Option<FacetRef>,
    pub(crate) head: SpaceLink,
    pub(crate) attachments: AttachmentChain,
    pub(crate) flags: LinkFlags,
    pub(crate) shortcut: Option<Shortcut>,
    pub(crate) residence: Option<Residence>,
    pub(crate) role: DistributionRole,
    pub(crate) registered: bool,
    pub(crate) kernel: KernelState,
}

impl LinkState {
    fn new(entity_type: Option<TypeRef>, entity: Option<Entity>, head: SpaceLink) -> Self {
        Self {
            entity,
            entity_type,
            id_facet: None,
            head,
            attachments: AttachmentChain::new(),
            flags: LinkFlags::empty(),
            shortcut: None,
            residence: None,
            role: DistributionRole::Owner,
            registered: false,
            kernel: KernelState::default(),
        }
    }

    pub(crate) fn registry_record(&self, link: LinkId) -> RegistryRecord {
        RegistryRecord {
            link,
            shortcut: self.shortcut,
            container: self.head.container.as_ref().map(|s| s.id()),
            key: self.head.key.clone(),
            residence: self.residence,
        }
    }

    pub(crate) fn is_remote(&self, services: &Services) -> bool {
        self.kernel.is_remote() || self.residence.is_some_and(|r| !services.is_local(r))
    }

    pub(crate) fn is_site(&self) -> bool {
        self.entity_type.as_ref().is_some_and(|t| t.is_site())
    }

    pub(crate) fn decoration_mask(&self) -> u32 {
        u32::from(self.attachments.mask().bits()) | self.flags.bits() | self.role.mask_bits()
    }
}

// =============================================================================
// ENTITY LINK
// =============================================================================

pub struct EntityLink {
    id: LinkId,
    services: Arc<Services>,
    pub(crate) state: Mutex<LinkState>,
}

impl fmt::Debug for EntityLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EntityLink")
            .field("id", &self.id)
            .field("key", &state.head.key)
            .field("shortcut", &state.shortcut)
            .field("role", &state.role)
            .field("residence", &state.residence)
            .field("registered", &state.registered)
            .finish_non_exhaustive()
    }
}

impl EntityLink {
    fn build(services: Arc<Services>, state: LinkState) -> Arc<Self> {
        Arc::new(Self {
            id: services.next_link_id(),
            services,
            state: Mutex::new(state),
        })
    }

    /// A link for a freshly instantiated entity of `ty`, bound nowhere yet.
    pub fn new(services: Arc<Services>, ty: TypeRef) -> Arc<Self> {
        let entity = ty.instantiate();
        Self::build(
            services,
            LinkState::new(Some(ty), Some(entity), SpaceLink::default()),
        )
    }

    /// A link for an existing entity instance.
    pub fn for_entity(services: Arc<Services>, ty: TypeRef, entity: Entity) -> Arc<Self> {
        Self::build(
            services,
            LinkState::new(Some(ty), Some(entity), SpaceLink::default()),
        )
    }

    /// A new entity of `ty` bound into `space`, optionally under `key`.
    ///
    /// A given key is pushed into the entity's own identity field.
    pub fn in_container(
        services: Arc<Services>,
        ty: TypeRef,
        space: &Arc<Space>,
        key: Option<Value>,
    ) -> LinkResult<Arc<Self>> {
        let entity = ty.instantiate();
        let has_key = key.is_some();
        let link = Self::build(
            services,
            LinkState::new(
                Some(ty),
                Some(entity),
                SpaceLink::new(Some(Arc::clone(space)), key),
            ),
        );
        if has_key {
            link.synchronize_identity()?;
        }
        Ok(link)
    }

    /// A lookup probe: a link known only by its shortcut, with no entity yet.
    pub fn probe(services: Arc<Services>, shortcut: Shortcut) -> Arc<Self> {
        let mut state = LinkState::new(None, None, SpaceLink::default());
        state.shortcut = Some(shortcut);
        Self::build(services, state)
    }

    /// Turn a probe into a full link once the remote reference resolves.
    ///
    /// Re-runs registry invariants, which now also index the entity.
    pub fn materialize(
        &self,
        ty: TypeRef,
        entity: Entity,
        residence: Option<Residence>,
    ) -> LinkResult<bool> {
        {
            let mut state = self.state.lock();
            state.entity_type = Some(ty);
            state.entity = Some(entity);
            if let Some(r) = residence {
                state.residence = Some(r);
                if !self.services.is_local(r) {
                    state.kernel.phase = LifecyclePhase::Remote;
                }
            }
        }
        tracing::debug!(link = %self.id, "probe materialized");
        self.sync_invariants()
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Whether the link is still an unmaterialized probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.state.lock().entity.is_none()
    }

    /// Snapshot of the entity.
    #[must_use]
    pub fn entity(&self) -> Option<Entity> {
        self.state.lock().entity.clone()
    }

    #[must_use]
    pub fn entity_type(&self) -> Option<TypeRef> {
        self.state.lock().entity_type.clone()
    }

    /// The head key as currently bound, without resolving it.
    #[must_use]
    pub fn key(&self) -> Option<Value> {
        self.state.lock().head.key.clone()
    }

    /// The primary container.
    #[must_use]
    pub fn container(&self) -> Option<Arc<Space>> {
        self.state.lock().head.container.clone()
    }

    // -------------------------------------------------------------------------
    // Chain
    // -------------------------------------------------------------------------

    /// Bind the entity into another container.
    ///
    /// The first binding fills the head; later ones append to the chain.
    pub fn bind_into(&self, space: &Arc<Space>, key: Option<Value>) -> LinkResult<()> {
        let mut state = self.state.lock();
        if state.head.container.is_none() {
            state.head.container = Some(Arc::clone(space));
            if key.is_some() {
                state.head.key = key;
            }
            if state.registered {
                let record = state.registry_record(self.id);
                self.services.registry().add(record)?;
            }
        } else {
            state
                .head
                .append(SpaceLink::new(Some(Arc::clone(space)), key));
        }
        Ok(())
    }

    /// Snapshot of every chain node, head first.
    #[must_use]
    pub fn chain(&self) -> Vec<ChainEntry> {
        self.state.lock().head.iter().map(ChainEntry::from).collect()
    }

    /// The chain node bound into `container`.
    #[must_use]
    pub fn link_from(&self, container: ContainerId) -> Option<ChainEntry> {
        let state = self.state.lock();
        state
            .head
            .iter()
            .find(|n| n.container.as_ref().is_some_and(|s| s.id() == container))
            .map(ChainEntry::from)
    }

    /// The first container on the chain matching `pred`.
    pub fn container_where(&self, pred: impl Fn(&Space) -> bool) -> Option<Arc<Space>> {
        let state = self.state.lock();
        state
            .head
            .iter()
            .filter_map(|n| n.container.as_ref())
            .find(|s| pred(s))
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Attachments
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn has_attachment(&self, kind: AttachmentKind) -> bool {
        self.state.lock().attachments.contains(kind)
    }

    #[must_use]
    pub fn attachment_mask(&self) -> AttachmentMask {
        self.state.lock().attachments.mask()
    }

    /// The pool owning the entity, if pooled.
    #[must_use]
    pub fn pool(&self) -> Option<Arc<dyn ResourcePool>> {
        match self.state.lock().attachments.get(AttachmentKind::Pool) {
            Some(Attachment::Pool(binding)) => Some(Arc::clone(&binding.pool)),
            _ => None,
        }
    }

    pub fn set_pool(&self, pool: Arc<dyn ResourcePool>) {
        self.state
            .lock()
            .attachments
            .attach(Attachment::Pool(PoolBinding { pool }));
    }

    /// Return the entity to its pool. Returns whether anything was returned.
    pub fn deallocate(&self) -> bool {
        let returned = {
            let mut state = self.state.lock();
            let pool = match state.attachments.get(AttachmentKind::Pool) {
                Some(Attachment::Pool(binding)) => Arc::clone(&binding.pool),
                _ => return false,
            };
            state.flags.remove(LinkFlags::IN_USE);
            state.entity.take().map(|e| (pool, e))
        };
        match returned {
            Some((pool, entity)) => {
                tracing::trace!(link = %self.id, pool = pool.name(), "entity returned to pool");
                pool.return_to_pool(entity);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn version(&self) -> Option<Version> {
        match self.state.lock().attachments.get(AttachmentKind::Version) {
            Some(Attachment::Version(tag)) => Some(tag.version),
            _ => None,
        }
    }

    /// Update the version tag in place, attaching one if absent.
    pub fn set_version(&self, version: Version) {
        let mut state = self.state.lock();
        match state.attachments.get_mut(AttachmentKind::Version) {
            Some(Attachment::Version(tag)) => tag.version = version,
            _ => {
                state
                    .attachments
                    .attach(Attachment::Version(VersionTag { version }));
            }
        }
    }

    #[must_use]
    pub fn serial_id(&self) -> Option<SerialId> {
        match self.state.lock().attachments.get(AttachmentKind::SerialId) {
            Some(Attachment::SerialId(tag)) => Some(tag.id),
            _ => None,
        }
    }

    /// Give the entity a serial key, reusing an existing serial tag.
    pub fn assign_serial_id(&self) -> LinkResult<SerialId> {
        let mut state = self.state.lock();
        let id = match state.attachments.get(AttachmentKind::SerialId) {
            Some(Attachment::SerialId(tag)) => tag.id,
            _ => {
                let id = self.services.registry().allocate_serial_id();
                state
                    .attachments
                    .attach(Attachment::SerialId(SerialIdTag { id }));
                id
            }
        };
        self.bind_key_locked(&mut state, Value::Serial(id))?;
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn flags(&self) -> LinkFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: LinkFlags, on: bool) {
        self.state.lock().flags.set(flags, on);
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.flags().contains(LinkFlags::IN_USE)
    }

    #[must_use]
    pub fn is_template(&self) -> bool {
        self.flags().contains(LinkFlags::TEMPLATE)
    }

    /// Sketched and not in the middle of a lifecycle transition.
    #[must_use]
    pub fn is_fully_sketched(&self) -> bool {
        let state = self.state.lock();
        state.kernel.is_sketched() && !state.flags.contains(LinkFlags::IN_LIFECYCLE_TRANSITION)
    }

    // -------------------------------------------------------------------------
    // Cloning
    // -------------------------------------------------------------------------

    /// Clone this link for a copy of the entity.
    ///
    /// The clone is unregistered, has no chain beyond its head, no shortcut,
    /// and no attachments. A serial identity is never inherited: if this
    /// link carries one, the clone is given a fresh serial id.
    pub fn clone_link(&self) -> LinkResult<Arc<Self>> {
        let (snapshot, had_serial) = {
            let state = self.state.lock();
            let snapshot = LinkState {
                entity: state.entity.clone(),
                entity_type: state.entity_type.clone(),
                id_facet: state.id_facet.clone(),
                head: SpaceLink::new(state.head.container.clone(), state.head.key.clone()),
                attachments: AttachmentChain::new(),
                flags: state.flags,
                shortcut: None,
                residence: state.residence,
                role: state.role,
                registered: false,
                kernel: state.kernel,
            };
            (snapshot, state.attachments.contains(AttachmentKind::SerialId))
        };

        let clone = Self::build(Arc::clone(&self.services), snapshot);
        if had_serial {
            clone.assign_serial_id()?;
        }
        tracing::debug!(source = %self.id, clone = %clone.id, "link cloned");
        Ok(clone)
    }

    // -------------------------------------------------------------------------
    // Deletion & purge
    // -------------------------------------------------------------------------

    /// Delete the entity from every container it is bound into.
    ///
    /// One `Deleted` event is enqueued per bound chain node, all in one
    /// mutation: into `scope` when joining an open one, otherwise in a new
    /// atomic run. Remote links fail with `DeleteRemotePrimary`.
    pub fn delete_in(&self, scope: Option<&mut Mutation>) -> LinkResult<()> {
        let events: Vec<ScheduledEvent> = {
            let state = self.state.lock();
            if state.is_remote(&self.services) {
                return Err(LinkError::Unsupported(
                    UnsupportedOperation::DeleteRemotePrimary,
                ));
            }
            if state.kernel.is_in_transition(Transition::Deleting) {
                return Ok(());
            }
            state
                .head
                .iter()
                .filter_map(|n| n.container.as_ref())
                .map(|s| ScheduledEvent::new(self.id, Some(s.id()), LinkEvent::Deleted))
                .collect()
        };

        tracing::debug!(link = %self.id, containers = events.len(), "delete cascade");
        match scope {
            Some(mutation) => {
                for event in events {
                    mutation.add_event(event);
                }
                Ok(())
            }
            None => self.services.transactor().run_atomically(&mut |m| {
                for event in &events {
                    m.add_event(event.clone());
                }
                Ok(())
            }),
        }
    }

    /// Purge the entity from the local cache.
    ///
    /// A remote entity's authoritative copy is purged first; finding it
    /// already gone is fine. The link is then unregistered and every
    /// observer disconnected.
    pub fn purge(&self) -> LinkResult<()> {
        let remote = {
            let state = self.state.lock();
            state
                .is_remote(&self.services)
                .then(|| self.reference_locked(&state))
        };
        if let Some(reference) = remote {
            match self.services.storage().purge_primary(&reference) {
                Ok(()) => {}
                Err(e) if e.is_benign() => {
                    tracing::warn!(link = %self.id, error = %e, "purge raced another actor");
                }
                Err(e) => return Err(e),
            }
        }
        self.unregister();
        self.disconnect_all();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Report an attribute change. Null-to-null and unchanged values are ignored.
    pub fn attribute_updated(
        &self,
        attribute: &str,
        old: Option<Value>,
        new: Option<Value>,
    ) -> LinkResult<()> {
        if old == new {
            return Ok(());
        }
        self.apply_event(LinkEvent::AttributeUpdated {
            attribute: attribute.to_string(),
            old,
            new,
        })
    }

    /// Apply an event to the entity.
    ///
    /// Registered links commit it atomically and deliver it once committed;
    /// unregistered links deliver it straight to their observers.
    pub fn apply_event(&self, event: LinkEvent) -> LinkResult<()> {
        let scheduled = {
            let state = self.state.lock();
            state.registered.then(|| {
                ScheduledEvent::new(
                    self.id,
                    state.head.container.as_ref().map(|s| s.id()),
                    event.clone(),
                )
            })
        };
        if let Some(scheduled) = scheduled {
            self.services.transactor().run_atomically(&mut |m| {
                m.add_event(scheduled.clone());
                Ok(())
            })?;
        }
        self.forward(&event);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reference encoding
    // -------------------------------------------------------------------------

    /// The link's reference form.
    #[must_use]
    pub fn reference(&self) -> LinkReference {
        let state = self.state.lock();
        self.reference_locked(&state)
    }

    pub(crate) fn reference_locked(&self, state: &LinkState) -> LinkReference {
        if state.is_site() {
            let site = state
                .residence
                .map_or(self.services.local_site(), |r| r.site);
            return LinkReference::Site(site);
        }

        let primary = state
            .entity_type
            .as_ref()
            .and_then(|t| t.primary_identity_facet())
            .filter(|f| !f.is_key_backed())
            .and_then(|f| state.entity.as_ref().and_then(|e| f.read(e)))
            .or_else(|| state.head.key.clone());

        LinkReference::Entity {
            type_id: state.entity_type.as_ref().map(|t| t.type_id()),
            residence: state.residence,
            decoration: state.decoration_mask(),
            primary_id: EncodedId::from_value(primary.as_ref()),
        }
    }

    /// Encode the reference form (header + payload).
    pub fn encode_reference(&self) -> LinkResult<Vec<u8>> {
        reference_to_bytes(&self.reference())
    }

    /// Decoration mask: attachment presence, flags, and role.
    #[must_use]
    pub fn decoration_mask(&self) -> u32 {
        self.state.lock().decoration_mask()
    }

    // -------------------------------------------------------------------------
    // Paths with no defined behavior yet
    // -------------------------------------------------------------------------

    pub fn compute_on_commit(&self, _selector: &str) -> LinkResult<()> {
        Err(LinkError::Unimplemented("compute_on_commit"))
    }

    pub fn matches_identity(&self, _other: &EntityLink) -> LinkResult<bool> {
        Err(LinkError::Unimplemented("matches_identity"))
    }

    pub fn replace_entity(&self, _entity: Entity, _ty: TypeRef) -> LinkResult<()> {
        Err(LinkError::Unimplemented("replace_entity"))
    }

    pub fn site_id(&self) -> LinkResult<Value> {
        Err(LinkError::Unimplemented("site_id"))
    }

    pub fn post_update(
        &self,
        _attribute: &str,
        _old: Option<Value>,
        _new: Option<Value>,
    ) -> LinkResult<Mutation> {
        Err(LinkError::Unimplemented("post_update"))
    }

    /// Import the closure rooted at the entity, `levels` deep (negative is
    /// unbounded). A local entity has nothing to import.
    pub fn replicate(&self, levels: i32) -> LinkResult<()> {
        if self.kernel().is_remote() {
            tracing::debug!(link = %self.id, levels, "replicate requested for remote entity");
            return Err(LinkError::Unimplemented("replicate"));
        }
        Ok(())
    }

    /// Store this primary on behalf of a remote proxy.
    pub fn store_primary(&self, _space: &Space) -> LinkResult<bool> {
        Err(LinkError::Unsupported(
            UnsupportedOperation::StoreRemotePrimary,
        ))
    }
}

// =============================================================================
// TESTS
// =============================================================================
