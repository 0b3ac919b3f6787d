//! CMS signing of CodeDirectories through OpenSSL

use super::assets::SigningAssets;
use super::SignatureProvider;
use crate::{Error, Result};
use openssl::cms::{CMSOptions, CmsContentInfo};

/// Produces detached DER-encoded CMS SignedData over a CodeDirectory.
pub struct CmsSigner {
    assets: SigningAssets,
}

impl CmsSigner {
    pub fn new(assets: SigningAssets) -> Self {
        Self { assets }
    }

    pub fn assets(&self) -> &SigningAssets {
        &self.assets
    }
}

impl SignatureProvider for CmsSigner {
    fn sign(&self, code_directory: &[u8]) -> Result<Vec<u8>> {
        let chain = self.assets.chain_stack()?;
        let flags = CMSOptions::DETACHED | CMSOptions::BINARY | CMSOptions::NOSMIMECAP;

        let cms = CmsContentInfo::sign(
            Some(&*self.assets.certificate),
            Some(&*self.assets.private_key),
            Some(&*chain),
            Some(code_directory),
            flags,
        )
        .map_err(|e| Error::Signing(format!("Failed to build CMS signature: {}", e)))?;

        cms.to_der()
            .map_err(|e| Error::Signing(format!("Failed to encode CMS signature: {}", e)))
    }
}
