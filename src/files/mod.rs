//! File-facing side of the engine
//!
//! Scanning raw bytes into the atom store, planning the write strategy,
//! patching chunk-offset tables, and serializing back to disk.

pub mod layout;
pub mod offsets;
pub mod scanner;
pub mod session;
pub mod writer;

pub use layout::{Dynamics, PaddingPrefs, WritePlan};
pub use offsets::OffsetState;
pub use scanner::{load_payload, scan, ScanOptions};
pub use session::Mp4File;
