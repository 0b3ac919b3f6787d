//! Code signature CodeDirectory swapping for Mach-O binaries.
//!
//! Replaces the primary CodeDirectory of an embedded code signature with a
//! reference identity, keeps the binary's own CodeDirectory as the alternate
//! with a rewritten team identifier, refreshes its hashes and re-signs the
//! result.
//!
//! The entry point is the [`CdSwap`] builder; the lower level pieces live in
//! [`codesign`] (SuperBlob codec and CodeDirectory patching), [`macho`]
//! (slice selection and load command layout) and [`crypto`] (signing).

pub mod builder;
pub mod codesign;
pub mod crypto;
pub mod error;
pub mod macho;

pub use builder::{CdSwap, DEFAULT_SIGNATURE_RESERVATION, DEFAULT_TEAM_ID};
pub use codesign::{AlternatePolicy, BlobRecord, SlotType, SuperBlob};
pub use crypto::SignatureProvider;
#[cfg(feature = "openssl-backend")]
pub use crypto::{CmsSigner, SigningAssets};
pub use error::Error;
pub use macho::ArchPreference;

pub type Result<T> = std::result::Result<T, Error>;
