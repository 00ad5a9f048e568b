//! The atom record and its classification types
//!
//! An [`Atom`] is one box instance of an ISO-base-media file. Atoms live
//! in an arena owned by [`AtomStore`](crate::core::store::AtomStore) and
//! are linked into document order purely through successor indices.

use std::fmt;

/// Index of an atom inside the store's arena.
pub type AtomId = usize;

/// Reserved language value meaning "match any language" during lookups.
pub const ANY_LANGUAGE: u16 = 0x05D9;

/// Whether a box may contain children, carry data, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralKind {
    /// Container holding only child boxes
    Parent,
    /// Container holding child boxes, written header-only from memory
    SimpleParent,
    /// Acts as both parent and child (e.g. `meta`, `stsd`)
    Hybrid,
    /// Carries data, never children
    Leaf,
    /// Not in the catalog
    Unknown,
}

impl StructuralKind {
    /// True if boxes of this kind may geometrically contain other boxes.
    pub fn can_contain(self) -> bool {
        matches!(
            self,
            StructuralKind::Parent | StructuralKind::SimpleParent | StructuralKind::Hybrid
        )
    }
}

/// Discriminant of [`Framing`], used for catalog lookups and path
/// resolution equality tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Plain bytes after the 8-byte header
    Simple,
    /// 1-byte version + 3-byte flags after the header
    Versioned,
    /// `uuid` extension box
    ExtendedUuid,
    /// Versioned with an embedded 16-bit packed language field
    PackedLanguage,
    /// Accepts any framing during comparisons
    Unknown,
}

/// Which UUID convention produced an extension box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    /// Plain 4-character name embedded in the UUID slot
    Deprecated,
    /// A name-based (v5) UUID from a foreign namespace
    NamespaceV5,
    /// A v5 UUID in this engine's own namespace; full semantics available
    AppNamespaceV5,
    /// Any other UUID
    Other,
}

/// How an atom's body is framed. Only the variants that need a field
/// carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Plain bytes
    Simple,
    /// 1-byte version + 3-byte flags
    Versioned { version_flags: u32 },
    /// `uuid` extension box; `owner_tag` is present for the deprecated
    /// form and for self-authored boxes
    ExtendedUuid {
        kind: UuidKind,
        owner_tag: Option<[u8; 4]>,
        version_flags: u32,
    },
    /// Versioned with a 16-bit packed language
    PackedLanguage { version_flags: u32, language: u16 },
    /// Unclassified
    Unknown,
}

impl Framing {
    /// The discriminant of this framing.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Framing::Simple => PayloadKind::Simple,
            Framing::Versioned { .. } => PayloadKind::Versioned,
            Framing::ExtendedUuid { .. } => PayloadKind::ExtendedUuid,
            Framing::PackedLanguage { .. } => PayloadKind::PackedLanguage,
            Framing::Unknown => PayloadKind::Unknown,
        }
    }

    /// Version/flags for framings that carry them, 0 otherwise.
    pub fn version_flags(&self) -> u32 {
        match self {
            Framing::Versioned { version_flags }
            | Framing::ExtendedUuid { version_flags, .. }
            | Framing::PackedLanguage { version_flags, .. } => *version_flags,
            _ => 0,
        }
    }

    /// The packed language, present only on [`Framing::PackedLanguage`].
    pub fn language(&self) -> Option<u16> {
        match self {
            Framing::PackedLanguage { language, .. } => Some(*language),
            _ => None,
        }
    }

    /// Build a bare framing for a payload kind (sparse atom creation).
    pub fn bare(kind: PayloadKind, language: u16) -> Framing {
        match kind {
            PayloadKind::Simple => Framing::Simple,
            PayloadKind::Versioned => Framing::Versioned { version_flags: 0 },
            PayloadKind::ExtendedUuid => Framing::ExtendedUuid {
                kind: UuidKind::AppNamespaceV5,
                owner_tag: None,
                version_flags: 0,
            },
            PayloadKind::PackedLanguage => Framing::PackedLanguage {
                version_flags: 0,
                language,
            },
            PayloadKind::Unknown => Framing::Unknown,
        }
    }
}

/// An atom's name: a 4-byte tag, or the 16-byte UUID of an extension box.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomName {
    Fourcc([u8; 4]),
    Uuid([u8; 16]),
}

impl AtomName {
    /// The 4-byte tag, if this is not a full-UUID name.
    pub fn tag(&self) -> Option<&[u8; 4]> {
        match self {
            AtomName::Fourcc(tag) => Some(tag),
            AtomName::Uuid(_) => None,
        }
    }

    /// Test the name against a 4-byte tag.
    pub fn is(&self, tag: &[u8; 4]) -> bool {
        matches!(self, AtomName::Fourcc(t) if t == tag)
    }

    /// True after elimination tombstoned this atom.
    pub fn is_zeroed(&self) -> bool {
        matches!(self, AtomName::Fourcc([0, 0, 0, 0]))
    }

    /// Printable rendering; non-ASCII bytes become '.'.
    pub fn display(&self) -> String {
        match self {
            AtomName::Fourcc(tag) => tag
                .iter()
                .map(|&b| {
                    if (0x20..0x7F).contains(&b) || b == 0xA9 {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
            AtomName::Uuid(bytes) => {
                let mut out = String::from("uuid=");
                for (i, b) in bytes.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        out.push('-');
                    }
                    out.push_str(&format!("{b:02x}"));
                }
                out
            }
        }
    }
}

impl fmt::Debug for AtomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// One box instance.
///
/// `successor` is how the tree is actually linked: a pure navigation
/// relation over the store's arena, visiting atoms in document order.
#[derive(Debug, Clone)]
pub struct Atom {
    /// Byte offset of the box header in the source file
    pub start: u32,
    /// The 32-bit length field as read (0 = extends to EOF, 1 = extended)
    pub declared_len: u32,
    /// 64-bit length, populated only when `declared_len == 1`
    pub extended_len: u64,
    /// 4-byte tag or 16-byte UUID
    pub name: AtomName,
    /// Container vs. leaf vs. hybrid
    pub structure: StructuralKind,
    /// Body framing; per-variant fields
    pub framing: Framing,
    /// 1-based nesting level (1 = top level)
    pub depth: u8,
    /// Owned body bytes, present once read into memory or newly built
    pub payload: Option<Vec<u8>>,
    /// Next atom in pre-order traversal, `None` at the chain's end
    pub successor: Option<AtomId>,
    /// `name` payload of an iTunes `----`/`mean`/`name` triple
    pub reverse_dns_tag: Option<String>,
    /// 4cc of the first child of a sample-description box
    pub codec_hint: u32,
}

impl Atom {
    /// The number of bytes this atom occupies on disk, resolving the
    /// 0 = to-EOF and 1 = extended-length conventions.
    pub fn physical_len(&self, file_size: u64) -> u64 {
        match self.declared_len {
            0 => file_size.saturating_sub(self.start as u64),
            1 => self.extended_len,
            n => n as u64,
        }
    }

    /// Header bytes consumed before the payload buffer for this framing:
    /// 8 for simple atoms, 12 for versioned/packed-language, 32 for the
    /// self-authored uuid layout (header + uuid + owner tag + flags).
    pub fn payload_header_len(&self) -> u32 {
        match self.framing {
            Framing::Simple | Framing::Unknown => 8,
            Framing::Versioned { .. } | Framing::PackedLanguage { .. } => 12,
            Framing::ExtendedUuid { .. } => 32,
        }
    }

    /// Replace the payload buffer and recompute the declared length.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.declared_len = self.payload_header_len() + payload.len() as u32;
        self.payload = Some(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_name_display() {
        assert_eq!(AtomName::Fourcc(*b"moov").display(), "moov");
        assert!(AtomName::Fourcc([0; 4]).is_zeroed());
        let uuid = AtomName::Uuid([0xAB; 16]);
        assert!(uuid.display().starts_with("uuid=abababab-abab"));
    }

    #[test]
    fn test_framing_fields() {
        let f = Framing::PackedLanguage {
            version_flags: 0,
            language: 0x15C7,
        };
        assert_eq!(f.kind(), PayloadKind::PackedLanguage);
        assert_eq!(f.language(), Some(0x15C7));
        assert_eq!(Framing::Simple.language(), None);
    }

    #[test]
    fn test_physical_len() {
        let mut atom = Atom {
            start: 100,
            declared_len: 0,
            extended_len: 0,
            name: AtomName::Fourcc(*b"mdat"),
            structure: StructuralKind::Leaf,
            framing: Framing::Simple,
            depth: 1,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        };
        assert_eq!(atom.physical_len(1000), 900);
        atom.declared_len = 1;
        atom.extended_len = 5_000_000_000;
        assert_eq!(atom.physical_len(1000), 5_000_000_000);
        atom.declared_len = 64;
        assert_eq!(atom.physical_len(1000), 64);
    }

    #[test]
    fn test_set_payload_updates_length() {
        let mut atom = Atom {
            start: 0,
            declared_len: 8,
            extended_len: 0,
            name: AtomName::Fourcc(*b"data"),
            structure: StructuralKind::Leaf,
            framing: Framing::Versioned { version_flags: 1 },
            depth: 6,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        };
        atom.set_payload(vec![0, 0, 0, 0, b'h', b'i']);
        assert_eq!(atom.declared_len, 18);
    }
}
