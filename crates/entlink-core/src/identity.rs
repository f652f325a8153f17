//! # Identity Resolver
//!
//! Keeps a link's offboard key and its entity's onboard identity field in
//! agreement.
//!
//! - `resolve_key` pulls: an unbound key is read from the entity's primary
//!   identity facet and bound.
//! - `synchronize_identity` pushes: a bound key is written into the entity,
//!   re-selecting the facet when the current one cannot hold the key.
//! - `set_identity` walks the chain looking for the node that carries a
//!   named identity, appending a new node when none does.
//!
//! Binding a key on a registered link reindexes it in the registry.

use crate::link::{EntityLink, LinkState, SpaceLink};
use crate::types::{LinkResult, Value};

/// Whether a chain node carries a named identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStatus {
    /// The node carries the identity.
    Has,
    /// The node does not carry it.
    Absent,
    /// The node's container is keyed by the identity but no key is bound yet.
    Pending,
}

impl SpaceLink {
    /// Identity status as reported by this node's container.
    #[must_use]
    pub fn identity_status(&self, identity: &str) -> IdentityStatus {
        let keyed = self
            .container
            .as_ref()
            .and_then(|s| s.key_identity())
            .is_some_and(|name| name == identity);
        match (keyed, self.key.is_some()) {
            (true, true) => IdentityStatus::Has,
            (true, false) => IdentityStatus::Pending,
            (false, _) => IdentityStatus::Absent,
        }
    }
}

impl LinkState {
    /// Whether the head's identity facet carries `identity`.
    fn head_carries(&self, identity: &str) -> bool {
        self.id_facet
            .clone()
            .or_else(|| {
                self.entity_type
                    .as_ref()
                    .and_then(|t| t.primary_identity_facet())
            })
            .is_some_and(|f| f.name() == identity)
    }
}

impl EntityLink {
    /// The head key, resolving it from the entity when unbound.
    pub fn resolve_key(&self) -> LinkResult<Option<Value>> {
        let mut state = self.state.lock();
        if let Some(key) = &state.head.key {
            return Ok(Some(key.clone()));
        }

        let candidate = state
            .entity_type
            .as_ref()
            .and_then(|t| t.primary_identity_facet())
            .filter(|f| !f.is_key_backed())
            .and_then(|f| state.entity.as_ref().and_then(|e| f.read(e)));

        match candidate {
            Some(key) => {
                self.bind_key_locked(&mut state, key.clone())?;
                tracing::trace!(link = %self.id(), key = %key, "key resolved from entity");
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Bind the head key.
    pub fn set_key(&self, key: Value) -> LinkResult<()> {
        let mut state = self.state.lock();
        self.bind_key_locked(&mut state, key)
    }

    pub(crate) fn bind_key_locked(&self, state: &mut LinkState, key: Value) -> LinkResult<()> {
        state.head.key = Some(key);
        if state.registered {
            let record = state.registry_record(self.id());
            self.services().registry().add(record)?;
        }
        Ok(())
    }

    /// Make the entity's onboard identity match the link's key.
    ///
    /// A no-op while no entity or type is bound. An unbound key is resolved
    /// from the entity instead.
    pub fn synchronize_identity(&self) -> LinkResult<()> {
        let unresolved = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (Some(ty), Some(entity)) = (state.entity_type.clone(), state.entity.as_mut())
            else {
                return Ok(());
            };

            match state.head.key.clone() {
                None => true,
                Some(key) => {
                    let facet = match &state.id_facet {
                        Some(f) => f.clone(),
                        None => ty.identity_facet_for(&key),
                    };

                    if !facet.is_key_backed() && facet.read(entity).as_ref() != Some(&key) {
                        if facet.can_hold(&key) {
                            facet.write(entity, key)?;
                            state.id_facet = Some(facet);
                        } else {
                            let rebound = ty.identity_facet_for(&key);
                            tracing::debug!(
                                link = %self.id(),
                                from = facet.name(),
                                to = rebound.name(),
                                "identity facet rebound for key"
                            );
                            if !rebound.is_key_backed() {
                                rebound.write(entity, key)?;
                            }
                            state.id_facet = Some(rebound);
                        }
                    } else {
                        state.id_facet = Some(facet);
                    }
                    false
                }
            }
        };

        if unresolved {
            self.resolve_key()?;
        }
        Ok(())
    }

    /// Set the identity named `identity` to `value`.
    ///
    /// Writes to the first chain node that has or is pending that identity.
    /// If no node does, a new node in the primary container is appended and
    /// bound to `value`. A `None` value is ignored.
    pub fn set_identity(&self, identity: &str, value: Option<Value>) -> LinkResult<()> {
        let Some(value) = value else {
            return Ok(());
        };

        let head_write = {
            let mut state = self.state.lock();
            let head_carries = state.head_carries(identity);
            let target = state.head.iter().enumerate().position(|(i, node)| {
                (i == 0 && head_carries)
                    || matches!(
                        node.identity_status(identity),
                        IdentityStatus::Has | IdentityStatus::Pending
                    )
            });

            match target {
                Some(0) => {
                    self.bind_key_locked(&mut state, value)?;
                    true
                }
                Some(n) => {
                    if let Some(node) = state.head.nth_mut(n) {
                        node.key = Some(value);
                    }
                    false
                }
                None => {
                    let container = state.head.container.clone();
                    tracing::debug!(link = %self.id(), identity, "appending link for identity");
                    state.head.append(SpaceLink::new(container, Some(value)));
                    false
                }
            }
        };

        if head_write {
            self.synchronize_identity()?;
        }
        Ok(())
    }

    /// Record an alternate identifier. Nulls are ignored.
    ///
    /// With no key bound yet the id becomes the key; otherwise it is indexed
    /// in the primary container.
    pub fn add_id(&self, id: Option<Value>) -> LinkResult<()> {
        let Some(id) = id else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if state.head.key.is_none() {
            return self.bind_key_locked(&mut state, id);
        }
        if let Some(space) = &state.head.container {
            space.put_alternate(id, self.id());
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
