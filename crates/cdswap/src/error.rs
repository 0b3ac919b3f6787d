//! Error types for cdswap operations.
//!
//! This module defines the [`enum@Error`] enum covering every way a
//! transformation pass can fail. All of them are fatal to the current run:
//! the pipeline never commits a partially patched signature.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use crate::codesign::SlotType;
use thiserror::Error;

/// Error type for cdswap operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
///
/// # Examples
///
/// ```no_run
/// use cdswap::{CdSwap, Error};
///
/// let result = CdSwap::new()
///     .template_code_directory_file("appstore.cd")
///     .and_then(|swap| swap.patch_file("input", "output"));
/// match result {
///     Ok(()) => println!("Patched"),
///     Err(Error::MissingSlot(slot)) => eprintln!("Signature lacks {slot}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Occurs when reading the input container, writing the temporary
    /// slice, or persisting the output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unsupported Mach-O container.
    ///
    /// The input is not a Mach-O/FAT file, has no LC_CODE_SIGNATURE, or its
    /// load commands point outside the file.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// Malformed SuperBlob: bad magic or an index entry outside the buffer.
    #[error("Malformed SuperBlob: {0}")]
    Format(String),

    /// A slot required by the transformation is absent.
    #[error("Missing {0} slot")]
    MissingSlot(SlotType),

    /// A CodeDirectory is internally inconsistent.
    ///
    /// Raised for zero identifier offsets, order-violating offsets, and hash
    /// tables whose size no longer matches the header.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// A blob graph edit referenced a record that is not in the sequence.
    #[error("Blob graph error: {0}")]
    Logic(String),

    /// Signature generation failed or produced an unusable blob.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Invalid or malformed certificate or private key.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Invalid builder configuration.
    ///
    /// A configuration value is invalid or conflicting options were specified.
    #[error("Configuration error: {0}")]
    Config(String),
}
