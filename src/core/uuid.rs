//! Self-authored extension box UUIDs
//!
//! Extension boxes written by this engine carry a version-5 (name-based)
//! UUID derived deterministically from their 4-character owner tag in the
//! engine's own namespace. Because the derivation is a pure function of
//! the tag, matching by 4-byte tag and by full 16-byte UUID always agree
//! for self-authored boxes. Distinct tags colliding to one UUID is
//! theoretically possible and deliberately not handled.

use uuid::Uuid;

use crate::core::atom::UuidKind;

/// The engine's name-based namespace.
fn engine_namespace() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"atomkit.dev")
}

/// Derive the content-addressed UUID a self-authored box with this owner
/// tag would carry.
pub fn uuid_for_tag(tag: &[u8; 4]) -> [u8; 16] {
    Uuid::new_v5(&engine_namespace(), tag).into_bytes()
}

/// The version nibble of a raw UUID.
pub fn uuid_version(bytes: &[u8; 16]) -> u8 {
    bytes[6] >> 4
}

/// Classify a full UUID read from the file against the tag found at the
/// owner-tag offset.
pub fn classify_uuid(bytes: &[u8; 16], owner_tag: &[u8; 4]) -> UuidKind {
    if uuid_version(bytes) == 5 {
        if *bytes == uuid_for_tag(owner_tag) {
            UuidKind::AppNamespaceV5
        } else {
            UuidKind::NamespaceV5
        }
    } else {
        UuidKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_derivation_is_deterministic() {
        assert_eq!(uuid_for_tag(b"tdtg"), uuid_for_tag(b"tdtg"));
        assert_ne!(uuid_for_tag(b"tdtg"), uuid_for_tag(b"\xA9url"));
    }

    #[test]
    fn test_version_nibble() {
        assert_eq!(uuid_version(&uuid_for_tag(b"tdtg")), 5);
    }

    #[test]
    fn test_classification() {
        let own = uuid_for_tag(b"tdtg");
        assert_eq!(classify_uuid(&own, b"tdtg"), UuidKind::AppNamespaceV5);
        // same uuid, wrong owner tag: a foreign v5 namespace
        assert_eq!(classify_uuid(&own, b"abcd"), UuidKind::NamespaceV5);
        let random = [0x42u8; 16];
        assert_eq!(classify_uuid(&random, b"tdtg"), UuidKind::Other);
    }
}
