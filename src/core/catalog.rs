//! The known-atom catalog
//!
//! A static table mapping a 4-character box name plus its allowed parents
//! to a structural classification (container vs. leaf vs. hybrid) and a
//! payload classification (plain / versioned / uuid / packed-language).
//! Unrecognized names classify as Unknown/Unknown, which is a valid,
//! non-fatal result: the scanner still records such atoms for tree-shape
//! purposes.

use crate::core::atom::{PayloadKind, StructuralKind};

/// One allowed containment of a known atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Directly at file level
    FileLevel,
    /// Under the named container
    Tag([u8; 4]),
}

/// Where a known atom may appear.
#[derive(Debug, Clone, Copy)]
pub enum Containment {
    /// Any container, any level (padding atoms)
    AnyLevel,
    /// Only under the listed parents
    Under(&'static [Parent]),
}

/// A catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct AtomDef {
    pub name: [u8; 4],
    pub containment: Containment,
    pub structure: StructuralKind,
    pub payload: PayloadKind,
}

use Containment::{AnyLevel, Under};
use Parent::{FileLevel, Tag};
use PayloadKind as P;
use StructuralKind as S;

const fn def(
    name: &[u8; 4],
    containment: Containment,
    structure: StructuralKind,
    payload: PayloadKind,
) -> AtomDef {
    AtomDef {
        name: *name,
        containment,
        structure,
        payload,
    }
}

/// Classification for anything the catalog does not know.
static UNKNOWN: AtomDef = def(b"\0\0\0\0", AnyLevel, S::Unknown, P::Unknown);

/// Any box found directly under `ilst` is an iTunes-style metadata parent.
static ITUNES_PARENT: AtomDef = def(b"\0gen", AnyLevel, S::Parent, P::Simple);

/// A `data` box whose resolved path begins with the iTunes metadata prefix.
static ITUNES_DATA: AtomDef = def(b"data", AnyLevel, S::Leaf, P::Versioned);

/// `esds` under any sample-description codec entry.
static ESDS: AtomDef = def(b"esds", AnyLevel, S::Leaf, P::Versioned);

static KNOWN_ATOMS: &[AtomDef] = &[
    def(b"ftyp", Under(const { &[FileLevel] }), S::Leaf, P::Simple),
    def(b"moov", Under(const { &[FileLevel] }), S::Parent, P::Simple),
    def(b"mdat", Under(const { &[FileLevel] }), S::Leaf, P::Simple),
    def(b"moof", Under(const { &[FileLevel] }), S::Parent, P::Simple),
    def(b"mfra", Under(const { &[FileLevel] }), S::Parent, P::Simple),
    def(b"free", AnyLevel, S::Leaf, P::Simple),
    def(b"skip", AnyLevel, S::Leaf, P::Simple),
    def(b"wide", AnyLevel, S::Leaf, P::Simple),
    def(b"uuid", AnyLevel, S::Leaf, P::ExtendedUuid),
    def(b"mvhd", Under(const { &[Tag(*b"moov")] }), S::Leaf, P::Versioned),
    def(b"iods", Under(const { &[Tag(*b"moov")] }), S::Leaf, P::Versioned),
    def(b"trak", Under(const { &[Tag(*b"moov")] }), S::Parent, P::Simple),
    def(b"tkhd", Under(const { &[Tag(*b"trak")] }), S::Leaf, P::Versioned),
    def(b"tref", Under(const { &[Tag(*b"trak")] }), S::Parent, P::Simple),
    def(b"edts", Under(const { &[Tag(*b"trak")] }), S::Parent, P::Simple),
    def(b"elst", Under(const { &[Tag(*b"edts")] }), S::Leaf, P::Versioned),
    def(b"mdia", Under(const { &[Tag(*b"trak")] }), S::Parent, P::Simple),
    def(b"mdhd", Under(const { &[Tag(*b"mdia")] }), S::Leaf, P::Versioned),
    def(
        b"hdlr",
        Under(const { &[Tag(*b"mdia"), Tag(*b"meta"), Tag(*b"minf")] }),
        S::Leaf,
        P::Versioned,
    ),
    def(b"minf", Under(const { &[Tag(*b"mdia")] }), S::Parent, P::Simple),
    def(b"vmhd", Under(const { &[Tag(*b"minf")] }), S::Leaf, P::Versioned),
    def(b"smhd", Under(const { &[Tag(*b"minf")] }), S::Leaf, P::Versioned),
    def(b"hmhd", Under(const { &[Tag(*b"minf")] }), S::Leaf, P::Versioned),
    def(b"nmhd", Under(const { &[Tag(*b"minf")] }), S::Leaf, P::Versioned),
    def(b"gmhd", Under(const { &[Tag(*b"minf")] }), S::Parent, P::Simple),
    def(b"gmin", Under(const { &[Tag(*b"gmhd")] }), S::Leaf, P::Versioned),
    def(
        b"dinf",
        Under(const { &[Tag(*b"minf"), Tag(*b"meta")] }),
        S::Parent,
        P::Simple,
    ),
    def(b"dref", Under(const { &[Tag(*b"dinf")] }), S::Leaf, P::Versioned),
    def(b"url ", Under(const { &[Tag(*b"dref")] }), S::Leaf, P::Versioned),
    def(b"urn ", Under(const { &[Tag(*b"dref")] }), S::Leaf, P::Versioned),
    def(b"stbl", Under(const { &[Tag(*b"minf")] }), S::Parent, P::Simple),
    def(b"stts", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"ctts", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stsd", Under(const { &[Tag(*b"stbl")] }), S::Hybrid, P::Versioned),
    def(b"stsz", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stz2", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stsc", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stco", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"co64", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stss", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stsh", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"stdp", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(b"sdtp", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(
        b"sbgp",
        Under(const { &[Tag(*b"stbl"), Tag(*b"traf")] }),
        S::Leaf,
        P::Versioned,
    ),
    def(b"sgpd", Under(const { &[Tag(*b"stbl")] }), S::Leaf, P::Versioned),
    def(
        b"sinf",
        Under(const { &[Tag(*b"ipro"), Tag(*b"drms"), Tag(*b"drmi")] }),
        S::Parent,
        P::Simple,
    ),
    def(b"frma", Under(const { &[Tag(*b"sinf")] }), S::Leaf, P::Simple),
    def(b"schm", Under(const { &[Tag(*b"sinf")] }), S::Leaf, P::Versioned),
    def(
        b"schi",
        Under(const { &[Tag(*b"sinf"), Tag(*b"srpp")] }),
        S::Hybrid,
        P::Simple,
    ),
    // sample-description codec entries: fixed data prefix, then children
    def(b"mp4a", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"mp4v", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"mp4s", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"alac", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"avc1", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"drms", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"drmi", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"samr", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"sawb", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"sawp", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"sevc", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"sqcp", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"ssmv", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"tx3g", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"jpeg", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"s263", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"srtp", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"rtp ", Under(const { &[Tag(*b"stsd")] }), S::Hybrid, P::Simple),
    def(b"mfhd", Under(const { &[Tag(*b"moof")] }), S::Leaf, P::Versioned),
    def(b"traf", Under(const { &[Tag(*b"moof")] }), S::Parent, P::Simple),
    def(b"tfhd", Under(const { &[Tag(*b"traf")] }), S::Leaf, P::Versioned),
    def(b"trun", Under(const { &[Tag(*b"traf")] }), S::Leaf, P::Versioned),
    def(b"tfra", Under(const { &[Tag(*b"mfra")] }), S::Leaf, P::Versioned),
    def(b"mfro", Under(const { &[Tag(*b"mfra")] }), S::Leaf, P::Versioned),
    def(
        b"udta",
        Under(const { &[Tag(*b"moov"), Tag(*b"trak")] }),
        S::Parent,
        P::Simple,
    ),
    def(
        b"meta",
        Under(const { &[Tag(*b"udta"), Tag(*b"moov"), Tag(*b"trak"), FileLevel] }),
        S::Hybrid,
        P::Versioned,
    ),
    def(b"ilst", Under(const { &[Tag(*b"meta")] }), S::Parent, P::Simple),
    def(b"mean", Under(const { &[Tag(*b"----")] }), S::Leaf, P::Versioned),
    def(
        b"name",
        Under(const { &[Tag(*b"----"), Tag(*b"udta")] }),
        S::Leaf,
        P::Versioned,
    ),
    // 3GP user-data assets; yrrc is the one legacy box without a language
    def(b"titl", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"dscp", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"cprt", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"perf", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"auth", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"gnre", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"albm", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"kywd", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"loci", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"rtng", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"clsf", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::PackedLanguage),
    def(b"yrrc", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::Versioned),
    def(b"chpl", Under(const { &[Tag(*b"udta")] }), S::Leaf, P::Versioned),
];

/// The iTunes metadata prefix every generic `data` atom resolves under.
pub const ITUNES_METADATA_PREFIX: &str = "moov.udta.meta.ilst.";

/// The sample-description prefix every `esds` atom resolves under.
const STSD_PREFIX: &str = "moov.trak.mdia.minf.stbl.stsd.";

/// The Unknown/Unknown classification.
pub fn unknown_def() -> &'static AtomDef {
    &UNKNOWN
}

/// Classify a box name under its parent.
///
/// `parent` is `None` at file level. `full_path` is the would-be resolved
/// path of the box itself; it is only consulted for the `data` and `esds`
/// exceptions and callers may pass `None` for other names.
pub fn classify(
    name: &[u8; 4],
    parent: Option<&[u8; 4]>,
    full_path: Option<&str>,
) -> &'static AtomDef {
    // anything directly under 'ilst' is an iTunes-style metadata parent
    if parent == Some(b"ilst") && name != b"uuid" {
        return &ITUNES_PARENT;
    }

    if name == b"data" {
        if let Some(path) = full_path {
            if path.starts_with(ITUNES_METADATA_PREFIX) {
                return &ITUNES_DATA;
            }
        }
        return &UNKNOWN;
    }

    // any codec entry may carry 'esds'; not all do
    if name == b"esds" {
        if let Some(path) = full_path {
            if path.starts_with(STSD_PREFIX) {
                return &ESDS;
            }
        }
        return &UNKNOWN;
    }

    for known in KNOWN_ATOMS {
        if &known.name != name {
            continue;
        }
        let matched = match known.containment {
            AnyLevel => true,
            Under(parents) => parents.iter().any(|p| match p {
                FileLevel => parent.is_none(),
                Tag(tag) => parent == Some(tag),
            }),
        };
        if matched {
            return known;
        }
    }
    &UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_lookup() {
        let d = classify(b"moov", None, None);
        assert_eq!(d.structure, S::Parent);
        let d = classify(b"stco", Some(b"stbl"), None);
        assert_eq!(d.payload, P::Versioned);
    }

    #[test]
    fn test_parent_mismatch_is_unknown() {
        let d = classify(b"stco", Some(b"moov"), None);
        assert_eq!(d.structure, S::Unknown);
        assert_eq!(d.payload, P::Unknown);
    }

    #[test]
    fn test_any_level() {
        assert_eq!(classify(b"free", Some(b"udta"), None).structure, S::Leaf);
        assert_eq!(classify(b"free", None, None).structure, S::Leaf);
    }

    #[test]
    fn test_ilst_children_are_metadata_parents() {
        let d = classify(b"\xA9nam", Some(b"ilst"), None);
        assert_eq!(d.structure, S::Parent);
        let d = classify(b"covr", Some(b"ilst"), None);
        assert_eq!(d.structure, S::Parent);
    }

    #[test]
    fn test_itunes_data_by_path() {
        let d = classify(
            b"data",
            Some(b"\xA9nam"),
            Some("moov.udta.meta.ilst.\u{A9}nam.data"),
        );
        assert_eq!(d.payload, P::Versioned);
        assert_eq!(d.structure, S::Leaf);
        let d = classify(b"data", Some(b"xyz "), Some("moov.xyz .data"));
        assert_eq!(d.structure, S::Unknown);
    }

    #[test]
    fn test_esds_by_path() {
        let d = classify(
            b"esds",
            Some(b"mp4a"),
            Some("moov.trak.mdia.minf.stbl.stsd.mp4a.esds"),
        );
        assert_eq!(d.payload, P::Versioned);
    }

    #[test]
    fn test_3gp_assets() {
        assert_eq!(
            classify(b"titl", Some(b"udta"), None).payload,
            P::PackedLanguage
        );
        // yrrc never carries a language
        assert_eq!(classify(b"yrrc", Some(b"udta"), None).payload, P::Versioned);
    }

    #[test]
    fn test_hybrids() {
        assert_eq!(classify(b"meta", Some(b"udta"), None).structure, S::Hybrid);
        assert_eq!(classify(b"stsd", Some(b"stbl"), None).structure, S::Hybrid);
        assert_eq!(classify(b"schi", Some(b"sinf"), None).structure, S::Hybrid);
    }
}
