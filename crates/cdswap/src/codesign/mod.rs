//! Code signature structures: SuperBlob codec, blob graph edits,
//! CodeDirectory patching and hash recomputation

pub mod code_directory;
pub mod constants;
pub mod graph;
pub mod hashes;
pub mod superblob;

pub use code_directory::{set_team_identifier, CodeDirectoryBuilder, CodeDirectoryHeader};
pub use graph::{AlternatePolicy, CANONICAL_ORDER};
pub use hashes::{recompute_code_hashes, refresh_special_slots};
pub use superblob::{extract_blobs, BlobRecord, SlotType, SuperBlob};
