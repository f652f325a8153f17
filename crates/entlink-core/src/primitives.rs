//! # Engine Primitives
//!
//! Hardcoded constants for the entlink engine.
//!
//! These values are compiled into the binary and are immutable at runtime.
//! Collaborators may tighten some of them (see `Services`), never loosen them.

/// Magic bytes for the link reference format header.
///
/// - Reference = Magic Bytes ("ELNK") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"ELNK";

/// Current reference format version.
///
/// Increment this when making breaking changes to the reference encoding.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the reference header (magic + version).
pub const HEADER_LEN: usize = 5;

/// Maximum accepted payload for an encoded reference.
///
/// References are small (type, residence, mask, id). Anything larger is
/// rejected before deserialization.
pub const MAX_REFERENCE_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum number of container hops a contents-changed notice may climb.
///
/// Containment chains are expected to be shallow; a deeper walk means the
/// containment graph has a cycle the links cannot see.
pub const MAX_PROPAGATION_DEPTH: usize = 64;

/// Attachment chains longer than this are unusual.
///
/// Not enforced; used by diagnostics only.
pub const EXPECTED_ATTACHMENT_CHAIN_LEN: usize = 3;

/// Bit offset of the distribution role inside a reference decoration mask.
///
/// Bits 0..8 carry attachment presence, bits 8..16 carry link flags.
pub const ROLE_MASK_SHIFT: u32 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"ELNK");
        assert_eq!(HEADER_LEN, MAGIC_BYTES.len() + 1);
    }

    #[test]
    fn role_bits_clear_of_flag_bits() {
        assert!(ROLE_MASK_SHIFT >= 16);
    }
}
