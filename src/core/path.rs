//! Hierarchical atom path resolution
//!
//! Atoms are addressed by dotted paths:
//!
//! - `moov.udta.meta.ilst.cprt.data` — ordinary child lookup
//! - `moov.trak[2].mdia.minf` — the n-th (1-based) same-named sibling
//! - `moov.udta.meta.uuid=tdtg` — a uuid extension box by its owner tag
//! - `moov.udta.meta.uuid=ba45fcaa-7ef5-5201-8a63-78886495ab1f`
//! - `moov.udta.meta.ilst.----.name:[iTunNORM]` — reverse-DNS lookup
//!
//! Matching proceeds depth-by-depth against a lightweight surrogate
//! description; missing trailing segments can be created sparsely, with
//! kinds inferred from the catalog.

use crate::core::atom::{
    Atom, AtomId, AtomName, Framing, PayloadKind, StructuralKind, UuidKind, ANY_LANGUAGE,
};
use crate::core::catalog;
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::AtomStore;
use crate::core::uuid::uuid_for_tag;

/// Reference to a uuid extension atom within a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidRef {
    /// The deprecated/self-authored convention: addressed by owner tag
    Tag([u8; 4]),
    /// A full 16-byte UUID
    Full([u8; 16]),
}

/// One dot-separated path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: [u8; 4],
    pub index: Option<usize>,
    pub reverse_dns: Option<String>,
    pub uuid: Option<UuidRef>,
}

/// Interpret a path segment as a 4-byte tag. The iTunes `©` convention
/// arrives as two UTF-8 bytes and folds to the on-disk 0xA9.
fn segment_fourcc(text: &str) -> Option<[u8; 4]> {
    let bytes = text.as_bytes();
    if bytes.len() == 4 {
        return Some([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    if bytes.len() == 5 && text.starts_with('\u{A9}') {
        return Some([0xA9, bytes[2], bytes[3], bytes[4]]);
    }
    None
}

fn parse_token(token: &str) -> EngineResult<Segment> {
    let bad = || EngineError::BadPath(token.to_string());

    if let Some(rest) = token.strip_prefix("uuid=") {
        if let Some(tag) = segment_fourcc(rest) {
            return Ok(Segment {
                name: tag,
                index: None,
                reverse_dns: None,
                uuid: Some(UuidRef::Tag(tag)),
            });
        }
        if let Ok(parsed) = uuid::Uuid::parse_str(rest) {
            return Ok(Segment {
                name: *b"uuid",
                index: None,
                reverse_dns: None,
                uuid: Some(UuidRef::Full(parsed.into_bytes())),
            });
        }
        return Err(bad());
    }

    if let Some(open) = token.find(":[") {
        if !token.ends_with(']') {
            return Err(bad());
        }
        let name = segment_fourcc(&token[..open]).ok_or_else(|| bad())?;
        let text = &token[open + 2..token.len() - 1];
        return Ok(Segment {
            name,
            index: None,
            reverse_dns: Some(text.to_string()),
            uuid: None,
        });
    }

    if let Some(open) = token.find('[') {
        if !token.ends_with(']') {
            return Err(bad());
        }
        let name = segment_fourcc(&token[..open]).ok_or_else(|| bad())?;
        let index: usize = token[open + 1..token.len() - 1]
            .parse()
            .map_err(|_| bad())?;
        if index == 0 {
            return Err(bad());
        }
        return Ok(Segment {
            name,
            index: Some(index),
            reverse_dns: None,
            uuid: None,
        });
    }

    Ok(Segment {
        name: segment_fourcc(token).ok_or_else(|| bad())?,
        index: None,
        reverse_dns: None,
        uuid: None,
    })
}

/// Split a path into segments. `.` separates components except inside
/// brackets, so reverse-DNS descriptors may contain dots.
pub fn parse_path(path: &str) -> EngineResult<Vec<Segment>> {
    if path.is_empty() {
        return Err(EngineError::BadPath("empty path".to_string()));
    }
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for ch in path.chars() {
        match ch {
            '[' => {
                in_brackets = true;
                current.push(ch);
            }
            ']' => {
                in_brackets = false;
                current.push(ch);
            }
            '.' if !in_brackets => {
                tokens.push(std::mem::take(&mut current));
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    tokens.push(current);
    tokens.iter().map(|t| parse_token(t)).collect()
}

/// Test one atom against a surrogate segment description: name equality
/// (4 or 16 bytes depending on match mode), exact depth, payload-kind
/// equality (Unknown accepts any), language for packed-language atoms,
/// and exact reverse-DNS text.
fn compare(
    store: &AtomStore,
    segment: &Segment,
    surrogate_kind: PayloadKind,
    language: u16,
    depth: u8,
    id: AtomId,
    match_full_uuids: bool,
) -> bool {
    let atom = store.atom(id);
    if atom.depth != depth {
        return false;
    }

    if let Some(uuid_ref) = segment.uuid {
        if atom.framing.kind() != PayloadKind::ExtendedUuid {
            return false;
        }
        return match uuid_ref {
            UuidRef::Tag(tag) => match &atom.framing {
                Framing::ExtendedUuid {
                    owner_tag: Some(owner),
                    ..
                } if *owner == tag => true,
                // self-authored uuids are a pure function of the tag, so
                // 4-byte and 16-byte matching agree
                _ if match_full_uuids => {
                    matches!(atom.name, AtomName::Uuid(bytes) if bytes == uuid_for_tag(&tag))
                }
                _ => false,
            },
            UuidRef::Full(wanted) => {
                matches!(atom.name, AtomName::Uuid(bytes) if bytes == wanted)
            }
        };
    }

    if !atom.name.is(&segment.name) {
        return false;
    }
    if surrogate_kind != PayloadKind::Unknown && atom.framing.kind() != surrogate_kind {
        return false;
    }
    if surrogate_kind == PayloadKind::PackedLanguage {
        let atom_language = atom.framing.language().unwrap_or(0);
        if language != ANY_LANGUAGE && language != atom_language {
            return false;
        }
    }
    if let Some(wanted) = &segment.reverse_dns {
        return atom.reverse_dns_tag.as_deref() == Some(wanted.as_str());
    }
    true
}

fn create_sparse(
    store: &mut AtomStore,
    segment: &Segment,
    surrogate_kind: PayloadKind,
    language: u16,
    depth: u8,
    parent: AtomId,
    preceding: AtomId,
) -> AtomId {
    let (name, framing, structure) = if let Some(uuid_ref) = segment.uuid {
        let (bytes, owner) = match uuid_ref {
            UuidRef::Tag(tag) => (uuid_for_tag(&tag), Some(tag)),
            UuidRef::Full(bytes) => (bytes, None),
        };
        (
            AtomName::Uuid(bytes),
            Framing::ExtendedUuid {
                kind: UuidKind::AppNamespaceV5,
                owner_tag: owner,
                version_flags: 0,
            },
            StructuralKind::Leaf,
        )
    } else {
        let parent_name = store.atom(parent).name.tag().copied();
        let candidate_path = format!(
            "{}.{}",
            store.full_path(parent),
            AtomName::Fourcc(segment.name).display()
        );
        let def = catalog::classify(&segment.name, parent_name.as_ref(), Some(&candidate_path));
        let payload_kind = if surrogate_kind == PayloadKind::Unknown {
            def.payload
        } else {
            surrogate_kind
        };
        (
            AtomName::Fourcc(segment.name),
            Framing::bare(payload_kind, language),
            def.structure,
        )
    };

    let atom = Atom {
        start: 0,
        declared_len: 8,
        extended_len: 0,
        name,
        structure,
        framing,
        depth,
        payload: None,
        successor: store.atom(preceding).successor,
        reverse_dns_tag: segment.reverse_dns.clone(),
        codec_hint: 0,
    };
    let id = store.push_detached(atom);
    store.atom_mut(preceding).successor = Some(id);
    id
}

/// Resolve a dotted path, optionally creating the missing tail.
///
/// Returns `None` when `create_missing` is false and any segment is
/// absent, when an explicitly indexed sibling does not exist, or when the
/// path cannot be parsed. The file-type box is never matched.
pub fn find_atom(
    store: &mut AtomStore,
    path: &str,
    create_missing: bool,
    kind: PayloadKind,
    language: u16,
    match_full_uuids: bool,
) -> Option<AtomId> {
    let segments = parse_path(path).ok()?;
    if store.is_empty() {
        return None;
    }

    let mut found: Option<AtomId> = None;
    let mut present_depth: u8 = 1;
    let mut last_parent: Option<AtomId> = None;
    let mut search_from = store.atom(0).successor;

    for (position, segment) in segments.iter().enumerate() {
        let terminal = position + 1 == segments.len();
        let desired_index = segment.index.unwrap_or(1);

        let surrogate_kind = if segment.uuid.is_some() {
            PayloadKind::ExtendedUuid
        } else if segment.reverse_dns.is_some() {
            kind
        } else if terminal {
            if kind == PayloadKind::Unknown {
                let parent_name = last_parent.and_then(|p| store.atom(p).name.tag().copied());
                let candidate_path = match last_parent {
                    Some(p) => format!(
                        "{}.{}",
                        store.full_path(p),
                        AtomName::Fourcc(segment.name).display()
                    ),
                    None => AtomName::Fourcc(segment.name).display(),
                };
                catalog::classify(&segment.name, parent_name.as_ref(), Some(&candidate_path))
                    .payload
            } else {
                kind
            }
        } else {
            PayloadKind::Unknown
        };

        let mut matched = 0usize;
        let mut satisfied = false;
        let mut iter = search_from;
        let mut guard = 0;
        while let Some(cur) = iter {
            guard += 1;
            if guard > store.len() {
                break;
            }
            if store.atom(cur).depth == present_depth || segment.reverse_dns.is_some() {
                if compare(
                    store,
                    segment,
                    surrogate_kind,
                    language,
                    present_depth,
                    cur,
                    match_full_uuids,
                ) {
                    matched += 1;
                    if terminal {
                        found = Some(cur);
                    } else {
                        last_parent = Some(cur);
                    }
                    if matched == desired_index {
                        search_from = store.atom(cur).successor;
                        satisfied = true;
                        break;
                    }
                }
            }
            // leaving the candidate subtree ends this level's search
            if store.atom(cur).depth < present_depth && segment.reverse_dns.is_none() {
                break;
            }
            iter = store.atom(cur).successor;
        }

        if !satisfied {
            if !create_missing {
                return None;
            }
            if segment.index.is_some() && matched > 0 {
                // an explicitly indexed sibling beyond what exists
                return None;
            }
            let parent = last_parent?;
            let preceding = if surrogate_kind == PayloadKind::PackedLanguage {
                store.last_like_named_child(parent, &segment.name)
            } else {
                store.last_descendant(parent)
            };
            let new_id = create_sparse(
                store,
                segment,
                surrogate_kind,
                language,
                present_depth,
                parent,
                preceding,
            );
            found = Some(new_id);
            last_parent = Some(new_id);
            search_from = Some(new_id);
        }

        present_depth += 1;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn leaf(tag: &[u8; 4], depth: u8, framing: Framing) -> Atom {
        Atom {
            start: 0,
            declared_len: 16,
            extended_len: 0,
            name: AtomName::Fourcc(*tag),
            structure: StructuralKind::Leaf,
            framing,
            depth,
            payload: None,
            successor: None,
            reverse_dns_tag: None,
            codec_hint: 0,
        }
    }

    fn parent(tag: &[u8; 4], depth: u8) -> Atom {
        Atom {
            structure: StructuralKind::Parent,
            ..leaf(tag, depth, Framing::Simple)
        }
    }

    fn base_store() -> AtomStore {
        let mut store = AtomStore::new(4096);
        store.push_scanned(leaf(b"ftyp", 1, Framing::Simple));
        store.push_scanned(parent(b"moov", 1));
        store
    }

    #[test]
    fn test_parse_plain_and_index() {
        let segs = parse_path("moov.trak[2].mdia").unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].name, *b"moov");
        assert_eq!(segs[1].index, Some(2));
        assert_eq!(segs[2].name, *b"mdia");
    }

    #[test]
    fn test_parse_reverse_dns_with_dots() {
        let segs = parse_path("moov.udta.meta.ilst.----.name:[com.apple.iTunes;foo]").unwrap();
        let last = segs.last().unwrap();
        assert_eq!(last.name, *b"name");
        assert_eq!(last.reverse_dns.as_deref(), Some("com.apple.iTunes;foo"));
    }

    #[test]
    fn test_parse_uuid_forms() {
        let segs = parse_path("moov.udta.meta.uuid=tdtg").unwrap();
        assert_eq!(segs.last().unwrap().uuid, Some(UuidRef::Tag(*b"tdtg")));
        let segs = parse_path("moov.uuid=ba45fcaa-7ef5-5201-8a63-78886495ab1f").unwrap();
        assert!(matches!(
            segs.last().unwrap().uuid,
            Some(UuidRef::Full(_))
        ));
    }

    #[test]
    fn test_parse_copyright_convention() {
        let segs = parse_path("moov.udta.meta.ilst.\u{A9}nam.data").unwrap();
        assert_eq!(segs[4].name, [0xA9, b'n', b'a', b'm']);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_path("").is_err());
        assert!(parse_path("toolong4cc").is_err());
        assert!(parse_path("moov.trak[zero]").is_err());
        assert!(parse_path("moov.trak[0]").is_err());
    }

    #[test]
    fn test_find_existing() {
        let mut store = base_store();
        store.push_scanned(leaf(b"mvhd", 2, Framing::Versioned { version_flags: 0 }));
        let id = find_atom(
            &mut store,
            "moov.mvhd",
            false,
            PayloadKind::Versioned,
            0,
            false,
        );
        assert_eq!(id, Some(2));
    }

    #[test]
    fn test_find_missing_without_create() {
        let mut store = base_store();
        let id = find_atom(
            &mut store,
            "moov.udta",
            false,
            PayloadKind::Simple,
            0,
            false,
        );
        assert_eq!(id, None);
    }

    #[test]
    fn test_indexed_sibling_resolution() {
        let mut store = base_store();
        let first = store.push_scanned(parent(b"trak", 2));
        store.push_scanned(leaf(b"tkhd", 3, Framing::Versioned { version_flags: 0 }));
        let second = store.push_scanned(parent(b"trak", 2));
        store.push_scanned(leaf(b"tkhd", 3, Framing::Versioned { version_flags: 0 }));
        let third = store.push_scanned(parent(b"trak", 2));
        store.push_scanned(leaf(b"tkhd", 3, Framing::Versioned { version_flags: 0 }));

        let kind = PayloadKind::Simple;
        assert_eq!(
            find_atom(&mut store, "moov.trak", false, kind, 0, false),
            Some(first)
        );
        assert_eq!(
            find_atom(&mut store, "moov.trak[2]", false, kind, 0, false),
            Some(second)
        );
        assert_eq!(
            find_atom(&mut store, "moov.trak[3]", false, kind, 0, false),
            Some(third)
        );
        assert_eq!(
            find_atom(&mut store, "moov.trak[4]", false, kind, 0, false),
            None
        );
    }

    #[test]
    fn test_language_matching() {
        let mut store = base_store();
        store.push_scanned(parent(b"udta", 2));
        let eng = store.push_scanned(leaf(
            b"titl",
            3,
            Framing::PackedLanguage {
                version_flags: 0,
                language: 0x15C7,
            },
        ));
        let deu = store.push_scanned(leaf(
            b"titl",
            3,
            Framing::PackedLanguage {
                version_flags: 0,
                language: 0x11A5,
            },
        ));
        let kind = PayloadKind::PackedLanguage;
        assert_eq!(
            find_atom(&mut store, "moov.udta.titl", false, kind, 0x11A5, false),
            Some(deu)
        );
        assert_eq!(
            find_atom(&mut store, "moov.udta.titl", false, kind, ANY_LANGUAGE, false),
            Some(eng)
        );
        assert_eq!(
            find_atom(&mut store, "moov.udta.titl", false, kind, 0x1111, false),
            None
        );
    }

    #[test]
    fn test_create_missing_chain() {
        let mut store = base_store();
        let data = find_atom(
            &mut store,
            "moov.udta.meta.ilst.\u{A9}nam.data",
            true,
            PayloadKind::Versioned,
            0,
            false,
        )
        .unwrap();
        assert_eq!(store.atom(data).depth, 6);
        assert_eq!(store.atom(data).framing.kind(), PayloadKind::Versioned);
        // the interim chain was inferred from the catalog
        let meta = find_atom(
            &mut store,
            "moov.udta.meta",
            false,
            PayloadKind::Unknown,
            0,
            false,
        )
        .unwrap();
        assert_eq!(store.atom(meta).structure, StructuralKind::Hybrid);
        assert_eq!(store.full_path(data), "moov.udta.meta.ilst.\u{A9}nam.data");
    }

    #[test]
    fn test_reverse_dns_lookup() {
        let mut store = base_store();
        store.push_scanned(parent(b"udta", 2));
        store.push_scanned(parent(b"meta", 3));
        store.push_scanned(parent(b"ilst", 4));
        store.push_scanned(parent(b"----", 5));
        store.push_scanned(leaf(b"mean", 6, Framing::Versioned { version_flags: 0 }));
        let mut name_atom = leaf(b"name", 6, Framing::Versioned { version_flags: 0 });
        name_atom.reverse_dns_tag = Some("iTunNORM".to_string());
        let name_id = store.push_scanned(name_atom);

        let hit = find_atom(
            &mut store,
            "moov.udta.meta.ilst.----.name:[iTunNORM]",
            false,
            PayloadKind::Versioned,
            0,
            false,
        );
        assert_eq!(hit, Some(name_id));
        let miss = find_atom(
            &mut store,
            "moov.udta.meta.ilst.----.name:[iTunSMPB]",
            false,
            PayloadKind::Versioned,
            0,
            false,
        );
        assert_eq!(miss, None);
    }

    #[test]
    fn test_uuid_tag_matching() {
        let mut store = base_store();
        store.push_scanned(parent(b"udta", 2));
        store.push_scanned(parent(b"meta", 3));
        let mut ext = leaf(b"uuid", 4, Framing::Simple);
        ext.name = AtomName::Uuid(uuid_for_tag(b"tdtg"));
        ext.framing = Framing::ExtendedUuid {
            kind: UuidKind::AppNamespaceV5,
            owner_tag: Some(*b"tdtg"),
            version_flags: 1,
        };
        let ext_id = store.push_scanned(ext);

        let by_tag = find_atom(
            &mut store,
            "moov.udta.meta.uuid=tdtg",
            false,
            PayloadKind::ExtendedUuid,
            0,
            false,
        );
        assert_eq!(by_tag, Some(ext_id));

        // matching by full uuid agrees with matching by tag
        let by_full = find_atom(
            &mut store,
            "moov.udta.meta.uuid=tdtg",
            false,
            PayloadKind::ExtendedUuid,
            0,
            true,
        );
        assert_eq!(by_full, Some(ext_id));
    }
}
