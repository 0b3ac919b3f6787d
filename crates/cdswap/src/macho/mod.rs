//! Mach-O container handling: slice selection, signature lookup and layout patching

pub mod parser;
pub mod writer;

pub use parser::{extract_preferred_slice, ArchPreference, MachOFile};
pub use writer::{replace_code_signature, reserve_signature_space};
