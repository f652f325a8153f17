//! # Core Type Definitions
//!
//! This module contains the plain data types shared by every engine module:
//! - Identifiers (`SiteId`, `ContainerId`, `TypeId`, `LinkId`, `Shortcut`, `SerialId`)
//! - Identity values (`Value`, `ValueKind`)
//! - The domain object itself (`Entity`)
//! - Error types (`LinkError`, `UnsupportedOperation`)
//!
//! ## Ordering
//!
//! All identifiers implement `Ord` so registry and storage indexes can use
//! `BTreeMap` and iterate deterministically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Network location (site/host) that may hold the owning copy of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

/// Identifier of a container ("space") an entity can be bound into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

/// Identifier of an entity type, as exposed by the type collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Process-local handle of one `EntityLink`.
///
/// Used by the registry and by scheduled events to name a link without
/// holding a reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u64);

/// Process-wide unique integer handle for fast remote addressing.
///
/// Zero is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Shortcut(pub u32);

/// Serial identity drawn from the registry's serial allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerialId(pub u64);

/// Monotonic entity version carried by a `VersionTag` attachment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub u64);

impl Version {
    /// The next version, saturating at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

macro_rules! impl_display {
    ($($ty:ident => $prefix:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )*
    };
}

impl_display! {
    SiteId => "site:",
    ContainerId => "space:",
    TypeId => "type:",
    LinkId => "link:",
    Shortcut => "#",
    SerialId => "serial:",
    Version => "v",
}

// =============================================================================
// IDENTITY VALUES
// =============================================================================

/// An identifier or attribute value.
///
/// Absence ("null") is modelled with `Option<Value>` at the API boundary,
/// never as a variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Text(String),
    Serial(SerialId),
}

/// Discriminant of a `Value`, used by identity facets to declare what they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Text,
    Serial,
}

impl Value {
    /// Build a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Text(_) => ValueKind::Text,
            Self::Serial(_) => ValueKind::Serial,
        }
    }

    /// The value as a narrow integer, if it is integral and fits in 32 bits.
    #[must_use]
    pub fn as_narrow(&self) -> Option<i32> {
        match self {
            Self::Int(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Serial(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<SerialId> for Value {
    fn from(s: SerialId) -> Self {
        Self::Serial(s)
    }
}

// =============================================================================
// ENTITY
// =============================================================================

/// A domain object instance owning its own attribute values.
///
/// The engine only reads and writes identity attributes through facets; the
/// rest of the attribute map is opaque to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entity {
    type_id: Option<TypeId>,
    fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Create an empty instance of the given type.
    #[must_use]
    pub fn new(type_id: TypeId) -> Self {
        Self {
            type_id: Some(type_id),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(name.into(), value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Operations that are policy gaps rather than transient faults.
///
/// They fail immediately and must not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedOperation {
    DeleteRemotePrimary,
    MigrateForwarder,
    StoreRemotePrimary,
}

impl fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::DeleteRemotePrimary => "deletion of remote primaries",
            Self::MigrateForwarder => "migration of forwarders",
            Self::StoreRemotePrimary => "storing a remote primary",
        };
        f.write_str(what)
    }
}

/// Errors raised by the link engine and its collaborators.
///
/// - Unsupported and unimplemented paths are fatal for the calling operation
/// - `AlreadyPurged` is the one benign race; `purge` swallows it
/// - Nothing here is retried by the engine
#[derive(Debug, Error)]
pub enum LinkError {
    /// A documented policy gap.
    #[error("{0} not supported")]
    Unsupported(UnsupportedOperation),

    /// A path that exists in the model but has no defined behavior yet.
    #[error("not yet implemented: {0}")]
    Unimplemented(&'static str),

    /// The authoritative copy was already removed by another actor.
    #[error("authoritative copy already purged: {0}")]
    AlreadyPurged(String),

    /// An identity facet refused the value it was asked to hold.
    #[error("identity facet '{facet}' cannot hold {kind:?}")]
    FacetRejected { facet: String, kind: ValueKind },

    /// The registry already maps this shortcut to another link.
    #[error("shortcut {shortcut} already registered to {holder}")]
    DuplicateShortcut { shortcut: Shortcut, holder: LinkId },

    /// The transaction collaborator refused to commit.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred in a storage collaborator.
    #[error("I/O error: {0}")]
    Io(String),
}

impl LinkError {
    /// Whether the error is a benign race that callers may swallow.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyPurged(_))
    }

    /// Whether the error marks a policy gap or an unimplemented path.
    #[must_use]
    pub fn is_fatal_policy(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::Unimplemented(_))
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

// =============================================================================
// TESTS
// =============================================================================
