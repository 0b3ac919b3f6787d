//! CdSwap builder API
//!
//! Configures and runs the CodeDirectory swap over a Mach-O binary:
//! the signature's primary CodeDirectory is replaced by a reference
//! identity, the original CodeDirectory is kept as the alternate with its
//! team identifier rewritten, hashes are refreshed and the SuperBlob is
//! re-signed.

use crate::codesign::code_directory::{compute_cdhash_sha256, CodeDirectoryHeader};
use crate::codesign::constants::*;
use crate::codesign::superblob::{build_placeholder_signature_blob, build_signature_blob};
use crate::codesign::{
    extract_blobs, recompute_code_hashes, refresh_special_slots, set_team_identifier,
    AlternatePolicy, SlotType, SuperBlob,
};
use crate::crypto::SignatureProvider;
use crate::macho::writer::align_to;
use crate::macho::{
    extract_preferred_slice, replace_code_signature, reserve_signature_space, ArchPreference,
    MachOFile,
};
use crate::{Error, Result};
use secrecy::SecretString;
use std::fs;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Team identifier written into the alternate CodeDirectory by default.
pub const DEFAULT_TEAM_ID: &str = "T8ALTGMVXN";

/// Size of the default signature placeholder blob.
pub const DEFAULT_SIGNATURE_RESERVATION: usize = 16 * 1024;

/// CodeDirectory swap tool with builder pattern API.
///
/// # Example
///
/// ```ignore
/// use cdswap::CdSwap;
///
/// CdSwap::new()
///     .template_code_directory_file("appstore.cd")?
///     .certificate("ca.pem")
///     .private_key("ca.key")
///     .patch_file("input", "output")?;
/// ```
#[derive(Clone)]
pub struct CdSwap {
    team_id: String,
    template_code_directory: Option<Vec<u8>>,
    template_signature: Option<Vec<u8>>,
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    pkcs12: Option<PathBuf>,
    password: Option<SecretString>,
    signer: Option<Arc<dyn SignatureProvider + Send + Sync>>,
    alternate_policy: AlternatePolicy,
    arch: ArchPreference,
}

impl CdSwap {
    /// Create a new CdSwap builder.
    pub fn new() -> Self {
        Self {
            team_id: DEFAULT_TEAM_ID.to_string(),
            template_code_directory: None,
            template_signature: None,
            certificate: None,
            private_key: None,
            pkcs12: None,
            password: None,
            signer: None,
            alternate_policy: AlternatePolicy::default(),
            arch: ArchPreference::default(),
        }
    }

    /// Set the team identifier written into the alternate CodeDirectory.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = team_id.into();
        self
    }

    /// Set the CodeDirectory installed in the primary slot.
    pub fn template_code_directory(mut self, blob: Vec<u8>) -> Self {
        self.template_code_directory = Some(blob);
        self
    }

    /// Load the primary-slot CodeDirectory from a file.
    pub fn template_code_directory_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let blob = fs::read(path)?;
        Ok(self.template_code_directory(blob))
    }

    /// Set the placeholder signature blob that reserves signature space.
    ///
    /// Defaults to a zero-filled blob wrapper of
    /// [`DEFAULT_SIGNATURE_RESERVATION`] bytes.
    pub fn template_signature(mut self, blob: Vec<u8>) -> Self {
        self.template_signature = Some(blob);
        self
    }

    /// Load the placeholder signature blob from a file.
    pub fn template_signature_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let blob = fs::read(path)?;
        Ok(self.template_signature(blob))
    }

    /// Set certificate file path (PEM or DER format).
    ///
    /// Use together with `private_key()` for PEM-based signing.
    /// Alternatively, use `pkcs12()` for PKCS#12 files that contain both.
    pub fn certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.certificate = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set private key file path (PEM or DER format).
    pub fn private_key(mut self, path: impl AsRef<Path>) -> Self {
        self.private_key = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set PKCS#12 file path (.p12 format).
    ///
    /// Use `password()` to set the decryption password.
    pub fn pkcs12(mut self, path: impl AsRef<Path>) -> Self {
        self.pkcs12 = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set password for private key or PKCS#12 file.
    ///
    /// The password is stored securely and will be zeroized when dropped.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Use a custom signature provider instead of file-based credentials.
    pub fn signer(mut self, signer: impl SignatureProvider + Send + Sync + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Choose which CodeDirectory survives when an alternate slot exists.
    pub fn alternate_policy(mut self, policy: AlternatePolicy) -> Self {
        self.alternate_policy = policy;
        self
    }

    /// Choose the slice taken from FAT inputs.
    pub fn arch(mut self, arch: ArchPreference) -> Self {
        self.arch = arch;
        self
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if:
    /// - No template CodeDirectory is set, or it is not a CodeDirectory
    /// - The team identifier is empty or contains NUL
    /// - Both PKCS#12 and PEM credentials are specified
    /// - Only one of certificate/private_key is specified (need both)
    /// - File credentials are combined with a custom signer
    pub fn validate(&self) -> Result<()> {
        let template = self
            .template_code_directory
            .as_ref()
            .ok_or_else(|| Error::Config("No template CodeDirectory configured".into()))?;
        CodeDirectoryHeader::parse(template)
            .map_err(|e| Error::Config(format!("Template CodeDirectory is invalid: {}", e)))?;

        if self.team_id.is_empty() || self.team_id.contains('\0') {
            return Err(Error::Config(format!("Invalid team identifier {:?}", self.team_id)));
        }

        let has_p12 = self.pkcs12.is_some();
        let has_pem = self.certificate.is_some() || self.private_key.is_some();

        if has_p12 && has_pem {
            return Err(Error::Config(
                "Cannot specify both PKCS#12 and PEM certificate/key".into(),
            ));
        }

        if has_pem && (self.certificate.is_none() || self.private_key.is_none()) {
            return Err(Error::Config(
                "Both certificate and private key must be specified".into(),
            ));
        }

        if self.signer.is_some() && (has_p12 || has_pem) {
            return Err(Error::Config(
                "Cannot combine a custom signer with certificate files".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the configured signature provider, if any.
    #[cfg(feature = "openssl-backend")]
    fn signature_provider(&self) -> Result<Option<Arc<dyn SignatureProvider + Send + Sync>>> {
        use crate::crypto::{CmsSigner, SigningAssets};

        if let Some(ref signer) = self.signer {
            return Ok(Some(Arc::clone(signer)));
        }

        let assets = if let Some(ref p12) = self.pkcs12 {
            SigningAssets::from_p12(p12, self.password.as_ref())?
        } else if let (Some(cert), Some(key)) = (&self.certificate, &self.private_key) {
            SigningAssets::from_pem(cert, key, self.password.as_ref())?
        } else {
            return Ok(None);
        };

        if let Some(ref team) = assets.team_id {
            tracing::debug!(team = %team, "loaded signing certificate");
        }
        Ok(Some(Arc::new(CmsSigner::new(assets))))
    }

    #[cfg(not(feature = "openssl-backend"))]
    fn signature_provider(&self) -> Result<Option<Arc<dyn SignatureProvider + Send + Sync>>> {
        if self.pkcs12.is_some() || self.certificate.is_some() {
            return Err(Error::Config(
                "Certificate files require the openssl-backend feature".into(),
            ));
        }
        Ok(self.signer.clone())
    }

    fn placeholder_signature(&self) -> Vec<u8> {
        self.template_signature
            .clone()
            .unwrap_or_else(|| build_placeholder_signature_blob(DEFAULT_SIGNATURE_RESERVATION))
    }

    /// Patch a Mach-O (thin or FAT) held in memory.
    ///
    /// FAT inputs are reduced to the preferred slice; the result is always a
    /// single-architecture binary.
    pub fn patch_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let slice = extract_preferred_slice(data, self.arch)?;
        self.patch_slice(slice)
    }

    /// Run the transformation over a thin Mach-O.
    fn patch_slice(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.validate()?;
        let provider = self.signature_provider()?;
        let template = self
            .template_code_directory
            .clone()
            .ok_or_else(|| Error::Config("No template CodeDirectory configured".into()))?;
        let placeholder = self.placeholder_signature();

        let macho = MachOFile::parse(data)?;
        let location = macho.code_signature();
        let mut superblob = SuperBlob::decode(macho.signature_bytes())?;
        tracing::info!(blobs = superblob.len(), "decoded code signature");

        tracing::info!("installing template CodeDirectory");
        superblob.relocate_primary_code_directory(template, self.alternate_policy)?;

        superblob.require(SlotType::Requirements)?;
        superblob.require(SlotType::Entitlements)?;
        if superblob.find(SlotType::DerEntitlements).is_none() {
            tracing::debug!("no DER entitlements blob");
        }

        tracing::info!("adding placeholder signature blob");
        let placeholder_len = placeholder.len();
        superblob.replace_or_push(SlotType::Signature, placeholder);

        tracing::info!(team = %self.team_id, "updating team identifier");
        let alternate = superblob.require_mut(SlotType::AlternateCodeDirectories)?;
        set_team_identifier(&mut alternate.content, &self.team_id)?;

        superblob.canonicalize()?;
        superblob.fixup_lengths();

        let unsigned_len = superblob.encoded_len();
        let reserved = u32::try_from(align_to(unsigned_len, 16))
            .map_err(|_| Error::Format("SuperBlob exceeds 4 GiB".into()))?;
        tracing::debug!(unsigned_len, reserved, "reserving signature space");

        tracing::info!("updating load commands");
        let mut data = reserve_signature_space(macho, reserved)?;

        tracing::info!("updating code slot hashes");
        let special_blobs: Vec<(i32, Vec<u8>)> = [
            (CSSLOT_SPECIAL_REQUIREMENTS, SlotType::Requirements),
            (CSSLOT_SPECIAL_ENTITLEMENTS, SlotType::Entitlements),
            (CSSLOT_SPECIAL_DER_ENTITLEMENTS, SlotType::DerEntitlements),
        ]
        .into_iter()
        .filter_map(|(index, slot)| superblob.find(slot).map(|r| (index, r.content.clone())))
        .collect();
        let special_refs: Vec<(i32, &[u8])> =
            special_blobs.iter().map(|(i, b)| (*i, b.as_slice())).collect();

        let alternate = superblob.require_mut(SlotType::AlternateCodeDirectories)?;
        recompute_code_hashes(&data, &mut alternate.content)?;
        let refreshed = refresh_special_slots(&mut alternate.content, &special_refs)?;
        tracing::debug!(refreshed, "refreshed special slots");

        superblob.fixup_lengths();

        match provider {
            Some(provider) => {
                tracing::info!("signing code signature");
                let primary = &superblob.require(SlotType::CodeDirectory)?.content;
                tracing::debug!(
                    cdhash = %hex::encode(&compute_cdhash_sha256(primary)[..20]),
                    "primary CodeDirectory"
                );
                let signature = build_signature_blob(&provider.sign(primary)?);
                if signature.len() > placeholder_len {
                    return Err(Error::Signing(format!(
                        "signature of {} bytes exceeds placeholder of {} bytes",
                        signature.len(),
                        placeholder_len
                    )));
                }
                superblob.replace_or_push(SlotType::Signature, signature);
            }
            None => {
                tracing::warn!("no signing credentials configured, keeping placeholder signature");
            }
        }

        let encoded = superblob.encode()?;
        replace_code_signature(&mut data, location.dataoff, reserved, &encoded)?;
        tracing::info!(size = encoded.len(), "wrote code signature");

        Ok(data)
    }

    /// Patch the Mach-O at `input` and write the result to `output`.
    ///
    /// The selected slice is staged in a temporary file next to `output`
    /// and only persisted over it once the whole transformation succeeded.
    /// The output is made executable (0755) on Unix.
    pub fn patch_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        let input = input.as_ref();
        let output = output.as_ref();
        self.validate()?;

        let data = fs::read(input)?;
        let slice = extract_preferred_slice(&data, self.arch)?;
        drop(data);

        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(&slice)?;
        tracing::debug!(path = %staged.path().display(), size = slice.len(), "staged slice");

        let patched = self.patch_slice(slice)?;

        let file = staged.as_file_mut();
        file.rewind()?;
        file.set_len(0)?;
        file.write_all(&patched)?;
        file.sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o755))?;
        }

        staged.persist(output).map_err(|e| Error::Io(e.error))?;
        tracing::info!(output = %output.display(), "patched binary written");
        Ok(())
    }

    /// Patch the Mach-O at `path` in place.
    pub fn patch_in_place(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.patch_file(path, path)
    }

    /// Dump the blobs of `input`'s current code signature into `dir`.
    pub fn extract_blobs(&self, input: impl AsRef<Path>, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let data = fs::read(input.as_ref())?;
        let macho = MachOFile::parse(extract_preferred_slice(&data, self.arch)?)?;
        let superblob = SuperBlob::decode(macho.signature_bytes())?;
        extract_blobs(&superblob, dir)
    }
}

impl Default for CdSwap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::CodeDirectoryBuilder;
    use secrecy::ExposeSecret;

    fn template() -> Vec<u8> {
        CodeDirectoryBuilder::new("com.example.store", vec![0u8; 4096])
            .team_id("STORETEAM")
            .build(CS_HASHTYPE_SHA256)
            .unwrap()
    }

    #[test]
    fn test_cdswap_builder_default() {
        let swap = CdSwap::default();
        assert_eq!(swap.team_id, DEFAULT_TEAM_ID);
        assert!(swap.template_code_directory.is_none());
        assert!(swap.certificate.is_none());
        assert!(swap.pkcs12.is_none());
        assert!(swap.password.is_none());
        assert_eq!(swap.alternate_policy, AlternatePolicy::KeepAlternate);
        assert_eq!(swap.arch, ArchPreference::Arm64);
    }

    #[test]
    fn test_cdswap_builder_chain() {
        let swap = CdSwap::new()
            .certificate("/path/to/cert.pem")
            .private_key("/path/to/key.pem")
            .password("secret")
            .team_id("ABCDE12345")
            .alternate_policy(AlternatePolicy::ReplaceAlternate);

        assert_eq!(swap.certificate, Some(PathBuf::from("/path/to/cert.pem")));
        assert_eq!(swap.private_key, Some(PathBuf::from("/path/to/key.pem")));
        assert_eq!(swap.password.as_ref().unwrap().expose_secret(), "secret");
        assert_eq!(swap.team_id, "ABCDE12345");
        assert_eq!(swap.alternate_policy, AlternatePolicy::ReplaceAlternate);
    }

    #[test]
    fn test_validate_requires_template() {
        let result = CdSwap::new().validate();
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("template")));
    }

    #[test]
    fn test_validate_rejects_bad_template() {
        let result = CdSwap::new().template_code_directory(vec![0u8; 64]).validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_team_id() {
        let swap = CdSwap::new().template_code_directory(template());
        assert!(matches!(swap.clone().team_id("").validate(), Err(Error::Config(_))));
        assert!(matches!(swap.team_id("A\0B").validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_both_p12_and_pem() {
        let swap = CdSwap::new()
            .template_code_directory(template())
            .pkcs12("/path/to/cert.p12")
            .certificate("/path/to/cert.pem");

        let result = swap.validate();
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("Cannot specify both")));
    }

    #[test]
    fn test_validate_missing_private_key() {
        let swap = CdSwap::new()
            .template_code_directory(template())
            .certificate("/path/to/cert.pem");

        let result = swap.validate();
        assert!(
            matches!(result, Err(Error::Config(msg)) if msg.contains("Both certificate and private key"))
        );
    }

    #[test]
    fn test_validate_signer_with_files() {
        let swap = CdSwap::new()
            .template_code_directory(template())
            .pkcs12("/path/to/cert.p12")
            .signer(|_: &[u8]| -> Result<Vec<u8>> { Ok(vec![0x30, 0x00]) });

        assert!(matches!(swap.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_ok_without_credentials() {
        CdSwap::new().template_code_directory(template()).validate().unwrap();
    }

    #[test]
    fn test_default_placeholder_size() {
        let swap = CdSwap::new();
        let placeholder = swap.placeholder_signature();
        assert_eq!(placeholder.len(), DEFAULT_SIGNATURE_RESERVATION);
        assert_eq!(&placeholder[..4], &CSMAGIC_BLOBWRAPPER.to_be_bytes());
    }

    #[test]
    fn test_patch_bytes_rejects_non_macho() {
        let swap = CdSwap::new().template_code_directory(template());
        assert!(matches!(swap.patch_bytes(&[0u8; 64]), Err(Error::MachO(_))));
    }
}
