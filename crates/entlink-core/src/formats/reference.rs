//! # Reference Format
//!
//! The compact identity form of a link, used whenever an entity crosses a
//! remote boundary.
//!
//! Format: Header (5 bytes) + postcard-serialized `LinkReference`.
//! - 4 bytes: Magic ("ELNK")
//! - 1 byte: Version
//!
//! An entity reference carries its type, residence, decoration mask, and
//! primary identifier. The identifier is narrowed to an `i32` whenever it
//! is an integer that fits; anything else falls back to the generic value
//! encoding. A site reference carries only the site id.
//!
//! Size and header are validated before any payload is decoded.

use crate::distribution::{DistributionRole, Residence};
use crate::primitives;
use crate::types::{LinkError, LinkResult, SiteId, TypeId, Value};
use serde::{Deserialize, Serialize};

// =============================================================================
// REFERENCE MODEL
// =============================================================================

/// Primary identifier as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodedId {
    Narrow(i32),
    Generic(Value),
    Absent,
}

impl EncodedId {
    /// Encode an identifier, narrowing small integers.
    #[must_use]
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => Self::Absent,
            Some(v) => v
                .as_narrow()
                .map_or_else(|| Self::Generic(v.clone()), Self::Narrow),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Self::Narrow(n) => Some(Value::Int(i64::from(*n))),
            Self::Generic(v) => Some(v.clone()),
            Self::Absent => None,
        }
    }
}

/// The externally observable identity of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkReference {
    /// Sites are addressed by their own id only.
    Site(SiteId),
    Entity {
        type_id: Option<TypeId>,
        residence: Option<Residence>,
        decoration: u32,
        primary_id: EncodedId,
    },
}

#[derive(Serialize)]
enum IdentityKey<'a> {
    Site(SiteId),
    Entity(Option<TypeId>, &'a EncodedId),
}

impl LinkReference {
    /// The site this reference resolves to, if known.
    #[must_use]
    pub fn site(&self) -> Option<SiteId> {
        match self {
            Self::Site(s) => Some(*s),
            Self::Entity { residence, .. } => residence.map(|r| r.site),
        }
    }

    /// Distribution role recorded in the decoration mask.
    #[must_use]
    pub fn role(&self) -> Option<DistributionRole> {
        match self {
            Self::Site(_) => None,
            Self::Entity { decoration, .. } => DistributionRole::from_mask_bits(*decoration),
        }
    }

    /// Residence-independent identity bytes, used as a storage key.
    ///
    /// Two references to the same entity yield the same key regardless of
    /// where it currently resides or how it is decorated.
    pub fn identity_key(&self) -> LinkResult<Vec<u8>> {
        let key = match self {
            Self::Site(s) => IdentityKey::Site(*s),
            Self::Entity {
                type_id,
                primary_id,
                ..
            } => IdentityKey::Entity(*type_id, primary_id),
        };
        postcard::to_stdvec(&key).map_err(|e| LinkError::Serialization(e.to_string()))
    }
}

// =============================================================================
// HEADER
// =============================================================================

/// The reference header precedes every encoded reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl ReferenceHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> LinkResult<()> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(LinkError::Serialization("Invalid magic bytes".to_string()));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(LinkError::Serialization(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; primitives::HEADER_LEN] {
        let mut bytes = [0u8; primitives::HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> LinkResult<Self> {
        match bytes {
            [m0, m1, m2, m3, version, ..] => Ok(Self {
                magic: [*m0, *m1, *m2, *m3],
                version: *version,
            }),
            _ => Err(LinkError::Serialization("Header too short".to_string())),
        }
    }
}

impl Default for ReferenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a reference (header + payload).
pub fn reference_to_bytes(reference: &LinkReference) -> LinkResult<Vec<u8>> {
    let payload =
        postcard::to_stdvec(reference).map_err(|e| LinkError::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(primitives::HEADER_LEN + payload.len());
    out.extend_from_slice(&ReferenceHeader::new().to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a reference, validating size and header first.
pub fn reference_from_bytes(bytes: &[u8]) -> LinkResult<LinkReference> {
    if bytes.len() < primitives::HEADER_LEN {
        return Err(LinkError::Serialization(format!(
            "Data too short: minimum {} bytes required",
            primitives::HEADER_LEN
        )));
    }
    let payload_len = bytes.len() - primitives::HEADER_LEN;
    if payload_len > primitives::MAX_REFERENCE_PAYLOAD_SIZE {
        return Err(LinkError::Serialization(format!(
            "Payload size {} bytes exceeds maximum allowed {} bytes",
            payload_len,
            primitives::MAX_REFERENCE_PAYLOAD_SIZE
        )));
    }

    ReferenceHeader::from_bytes(bytes)?.validate()?;

    let payload = bytes.get(primitives::HEADER_LEN..).unwrap_or_default();
    postcard::from_bytes(payload).map_err(|e| {
        LinkError::Serialization(format!("Failed to decode link reference: {e}"))
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_ref(id: Option<Value>) -> LinkReference {
        LinkReference::Entity {
            type_id: Some(TypeId(4)),
            residence: Some(Residence::at(SiteId(2))),
            decoration: DistributionRole::Replica.mask_bits() | 0b101,
            primary_id: EncodedId::from_value(id.as_ref()),
        }
    }

    #[test]
    fn small_integers_are_narrowed() {
        assert_eq!(
            EncodedId::from_value(Some(&Value::Int(7))),
            EncodedId::Narrow(7)
        );
        assert_eq!(
            EncodedId::from_value(Some(&Value::Int(i64::MAX))),
            EncodedId::Generic(Value::Int(i64::MAX))
        );
        assert_eq!(
            EncodedId::from_value(Some(&Value::text("k"))),
            EncodedId::Generic(Value::text("k"))
        );
        assert_eq!(EncodedId::from_value(None), EncodedId::Absent);
    }

    #[test]
    fn narrowing_is_lossless() {
        let id = EncodedId::from_value(Some(&Value::Int(-12)));
        assert_eq!(id.to_value(), Some(Value::Int(-12)));
    }

    #[test]
    fn encoded_reference_starts_with_header() {
        let bytes = reference_to_bytes(&entity_ref(Some(Value::Int(1)))).expect("encode");
        assert_eq!(&bytes[0..4], primitives::MAGIC_BYTES);
        assert_eq!(bytes[4], primitives::FORMAT_VERSION);
    }

    #[test]
    fn decode_restores_reference() {
        let reference = entity_ref(Some(Value::text("alpha")));
        let bytes = reference_to_bytes(&reference).expect("encode");
        let decoded = reference_from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, reference);
        assert_eq!(decoded.role(), Some(DistributionRole::Replica));
        assert_eq!(decoded.site(), Some(SiteId(2)));
    }

    #[test]
    fn site_reference_carries_only_site() {
        let bytes = reference_to_bytes(&LinkReference::Site(SiteId(9))).expect("encode");
        let decoded = reference_from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, LinkReference::Site(SiteId(9)));
        assert_eq!(decoded.role(), None);
    }

    #[test]
    fn narrow_encoding_is_smaller() {
        let narrow = reference_to_bytes(&entity_ref(Some(Value::Int(1)))).expect("encode");
        let wide = reference_to_bytes(&entity_ref(Some(Value::Int(i64::MAX)))).expect("encode");
        assert!(narrow.len() < wide.len());
    }

    #[test]
    fn rejects_short_data() {
        let err = reference_from_bytes(b"ELN").expect_err("too short");
        assert!(matches!(err, LinkError::Serialization(_)));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = reference_to_bytes(&LinkReference::Site(SiteId(1))).expect("encode");
        bytes[0] = b'X';
        assert!(reference_from_bytes(&bytes).is_err());

        let mut bytes = reference_to_bytes(&LinkReference::Site(SiteId(1))).expect("encode");
        bytes[4] = primitives::FORMAT_VERSION + 1;
        assert!(reference_from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut bytes = ReferenceHeader::new().to_bytes().to_vec();
        bytes.resize(primitives::HEADER_LEN + primitives::MAX_REFERENCE_PAYLOAD_SIZE + 1, 0);
        let err = reference_from_bytes(&bytes).expect_err("oversized");
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn identity_key_ignores_residence_and_decoration() {
        let a = entity_ref(Some(Value::Int(5)));
        let b = LinkReference::Entity {
            type_id: Some(TypeId(4)),
            residence: Some(Residence::at(SiteId(8))),
            decoration: 0,
            primary_id: EncodedId::Narrow(5),
        };
        assert_eq!(
            a.identity_key().expect("key"),
            b.identity_key().expect("key")
        );
        assert_ne!(
            a.identity_key().expect("key"),
            LinkReference::Site(SiteId(5)).identity_key().expect("key")
        );
    }
}
