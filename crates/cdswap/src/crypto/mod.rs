//! Signature generation: the provider seam and the OpenSSL CMS backend

#[cfg(feature = "openssl-backend")]
pub mod assets;
#[cfg(feature = "openssl-backend")]
pub mod cms;

#[cfg(feature = "openssl-backend")]
pub use assets::SigningAssets;
#[cfg(feature = "openssl-backend")]
pub use cms::CmsSigner;

use crate::Result;

/// Produces the CMS signature stored in the signature slot.
///
/// Implementations receive the final primary CodeDirectory and return the
/// DER-encoded detached signature over it; the pipeline wraps the result in
/// a blob wrapper.
pub trait SignatureProvider {
    fn sign(&self, code_directory: &[u8]) -> Result<Vec<u8>>;
}

impl<F> SignatureProvider for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>>,
{
    fn sign(&self, code_directory: &[u8]) -> Result<Vec<u8>> {
        self(code_directory)
    }
}
