//! # Type Metadata Contract
//!
//! The reflective type system lives outside the engine. Links only need two
//! things from it: the facet that reads and writes an entity's own identity
//! field, and the choice of facet appropriate for a given key.
//!
//! `EntityType` is a small table-driven implementation used by the CLI and
//! the tests.

use crate::types::{Entity, LinkError, LinkResult, TypeId, Value, ValueKind};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// IDENTITY FACETS
// =============================================================================

/// Accessor for one identity attribute of an entity.
pub trait IdentityFacet: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// A key-backed facet reads the link's key rather than the entity.
    fn is_key_backed(&self) -> bool {
        false
    }

    fn read(&self, entity: &Entity) -> Option<Value>;

    /// Whether the facet can represent `value`.
    fn can_hold(&self, value: &Value) -> bool;

    fn write(&self, entity: &mut Entity, value: Value) -> LinkResult<()>;
}

pub type FacetRef = Arc<dyn IdentityFacet>;

/// Identity stored in a named entity field of a fixed kind.
#[derive(Debug, Clone)]
pub struct FieldFacet {
    name: String,
    kind: ValueKind,
}

impl FieldFacet {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

impl IdentityFacet for FieldFacet {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, entity: &Entity) -> Option<Value> {
        entity.get(&self.name).cloned()
    }

    fn can_hold(&self, value: &Value) -> bool {
        value.kind() == self.kind
    }

    fn write(&self, entity: &mut Entity, value: Value) -> LinkResult<()> {
        if !self.can_hold(&value) {
            return Err(LinkError::FacetRejected {
                facet: self.name.clone(),
                kind: value.kind(),
            });
        }
        entity.set(self.name.clone(), value);
        Ok(())
    }
}

/// The meta-level facet: identity lives only in the link's key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFacet;

impl IdentityFacet for KeyFacet {
    fn name(&self) -> &str {
        "key"
    }

    fn is_key_backed(&self) -> bool {
        true
    }

    fn read(&self, _entity: &Entity) -> Option<Value> {
        None
    }

    fn can_hold(&self, _value: &Value) -> bool {
        true
    }

    fn write(&self, _entity: &mut Entity, _value: Value) -> LinkResult<()> {
        Ok(())
    }
}

// =============================================================================
// TYPE DESCRIPTORS
// =============================================================================

/// What the engine asks of an entity's type.
pub trait TypeDescriptor: Send + Sync + fmt::Debug {
    fn type_id(&self) -> TypeId;

    fn name(&self) -> &str;

    fn primary_identity_facet(&self) -> Option<FacetRef>;

    /// The facet best suited to hold `key`.
    fn identity_facet_for(&self, key: &Value) -> FacetRef;

    /// Look up an identity facet by name.
    fn facet(&self, name: &str) -> Option<FacetRef>;

    /// Sites are containers of the distributed space, never addressed by shortcut.
    fn is_site(&self) -> bool {
        false
    }

    fn instantiate(&self) -> Entity {
        Entity::new(self.type_id())
    }
}

pub type TypeRef = Arc<dyn TypeDescriptor>;

/// Table-driven type descriptor.
#[derive(Debug, Clone)]
pub struct EntityType {
    id: TypeId,
    name: String,
    facets: Vec<FacetRef>,
    primary: Option<usize>,
    site: bool,
}

impl EntityType {
    #[must_use]
    pub fn new(id: TypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            facets: Vec::new(),
            primary: None,
            site: false,
        }
    }

    /// Add a secondary identity facet.
    #[must_use]
    pub fn with_facet(mut self, facet: FacetRef) -> Self {
        self.facets.push(facet);
        self
    }

    /// Add the primary identity facet.
    #[must_use]
    pub fn with_primary(mut self, facet: FacetRef) -> Self {
        self.primary = Some(self.facets.len());
        self.facets.push(facet);
        self
    }

    #[must_use]
    pub fn as_site(mut self) -> Self {
        self.site = true;
        self
    }

    #[must_use]
    pub fn into_ref(self) -> TypeRef {
        Arc::new(self)
    }
}

impl TypeDescriptor for EntityType {
    fn type_id(&self) -> TypeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn primary_identity_facet(&self) -> Option<FacetRef> {
        self.primary.and_then(|i| self.facets.get(i)).cloned()
    }

    fn identity_facet_for(&self, key: &Value) -> FacetRef {
        let primary = self.primary_identity_facet();
        primary
            .into_iter()
            .chain(self.facets.iter().cloned())
            .find(|f| !f.is_key_backed() && f.can_hold(key))
            .unwrap_or_else(|| Arc::new(KeyFacet))
    }

    fn facet(&self, name: &str) -> Option<FacetRef> {
        self.facets.iter().find(|f| f.name() == name).cloned()
    }

    fn is_site(&self) -> bool {
        self.site
    }
}

// =============================================================================
// TESTS
// =============================================================================
