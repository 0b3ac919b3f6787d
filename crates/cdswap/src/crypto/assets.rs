//! Certificate and private key loading

use crate::{Error, Result};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::path::Path;

/// Signing assets: certificate, private key and any intermediate certificates
pub struct SigningAssets {
    /// X.509 certificate
    pub certificate: X509,
    /// Private key
    pub private_key: PKey<Private>,
    /// Intermediate certificates embedded alongside the signer
    pub chain: Vec<X509>,
    /// Team ID extracted from certificate
    pub team_id: Option<String>,
}

impl SigningAssets {
    /// Load from separate certificate and private key files
    ///
    /// The certificate file may hold a PEM chain; every certificate after the
    /// first is kept as an intermediate. The password, if provided, is handled
    /// via SecretString and zeroized when dropped.
    pub fn from_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        key_password: Option<&SecretString>,
    ) -> Result<Self> {
        let cert_data = fs::read(cert_path)?;
        let key_data = fs::read(key_path)?;
        Self::from_pem_bytes(&cert_data, &key_data, key_password)
    }

    /// Load from in-memory PEM (or DER) certificate and key data
    pub fn from_pem_bytes(
        cert_data: &[u8],
        key_data: &[u8],
        key_password: Option<&SecretString>,
    ) -> Result<Self> {
        let mut certs = X509::stack_from_pem(cert_data)
            .ok()
            .filter(|certs| !certs.is_empty())
            .map(Ok)
            .unwrap_or_else(|| X509::from_der(cert_data).map(|c| vec![c]))
            .map_err(|e| Error::Certificate(format!("Failed to load certificate: {}", e)))?;
        let certificate = certs.remove(0);

        let private_key = if let Some(pass) = key_password {
            PKey::private_key_from_pem_passphrase(key_data, pass.expose_secret().as_bytes())
        } else {
            PKey::private_key_from_pem(key_data).or_else(|_| PKey::private_key_from_der(key_data))
        }
        .map_err(|e| Error::Certificate(format!("Failed to load private key: {}", e)))?;

        Self::validate_key_pair(&certificate, &private_key)?;

        Ok(Self {
            team_id: Self::extract_team_id(&certificate),
            certificate,
            private_key,
            chain: certs,
        })
    }

    /// Load from PKCS#12 (.p12) file
    ///
    /// Defaults to an empty password if none is provided.
    pub fn from_p12(p12_path: impl AsRef<Path>, password: Option<&SecretString>) -> Result<Self> {
        let p12_data = fs::read(p12_path)?;

        let pkcs12 = Pkcs12::from_der(&p12_data)
            .map_err(|e| Error::Certificate(format!("Invalid PKCS#12: {}", e)))?;

        let pass = password.map(|s| s.expose_secret().as_str()).unwrap_or("");
        let parsed = pkcs12
            .parse2(pass)
            .map_err(|e| Error::Certificate(format!("Failed to parse PKCS#12: {}", e)))?;

        let certificate = parsed
            .cert
            .ok_or_else(|| Error::Certificate("No certificate in PKCS#12".into()))?;

        let private_key = parsed
            .pkey
            .ok_or_else(|| Error::Certificate("No private key in PKCS#12".into()))?;

        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Self::validate_key_pair(&certificate, &private_key)?;

        Ok(Self {
            team_id: Self::extract_team_id(&certificate),
            certificate,
            private_key,
            chain,
        })
    }

    /// Intermediate certificates as an OpenSSL stack
    pub(crate) fn chain_stack(&self) -> Result<Stack<X509>> {
        let mut stack =
            Stack::new().map_err(|e| Error::Certificate(format!("Failed to build chain: {}", e)))?;
        for cert in &self.chain {
            stack
                .push(cert.clone())
                .map_err(|e| Error::Certificate(format!("Failed to build chain: {}", e)))?;
        }
        Ok(stack)
    }

    /// Extract team ID from certificate subject
    fn extract_team_id(cert: &X509) -> Option<String> {
        let subject = cert.subject_name();

        // Look for OU (Organizational Unit) which contains team ID
        for entry in subject.entries() {
            let nid = entry.object().nid();
            if nid == openssl::nid::Nid::ORGANIZATIONALUNITNAME {
                if let Ok(data) = entry.data().as_utf8() {
                    return Some(data.to_string());
                }
            }
        }
        None
    }

    /// Validate that the private key matches the certificate's public key
    fn validate_key_pair(cert: &X509, private_key: &PKey<Private>) -> Result<()> {
        let cert_public_key = cert.public_key().map_err(|e| {
            Error::Certificate(format!("Failed to extract public key from certificate: {}", e))
        })?;

        if !private_key.public_eq(&cert_public_key) {
            return Err(Error::Certificate(
                "Private key does not match certificate public key".into(),
            ));
        }

        Ok(())
    }
}
