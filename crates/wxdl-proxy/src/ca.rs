//! Root CA for TLS interception.
//!
//! The CA is generated once and reused across runs; the user installs
//! `wxdl-ca.crt` into the browser or system trust store.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "wxdl-ca.crt";
const CA_KEY_FILENAME: &str = "wxdl-ca.key";
const CA_COMMON_NAME: &str = "wxdl Root CA";

/// Leaf certificates cached by the authority.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Owns the on-disk root CA.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Uses `<data dir>/ca` from the platform project directories.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "wxdl", "wxdl")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating it first if either file is missing.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a fresh self-signed root and writes both PEM files.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Builds the signing authority from the PEM files.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_live_under_ca_dir() {
        let manager = CaManager::new("/tmp/wxdl-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/wxdl-ca/wxdl-ca.crt"));
        assert_eq!(manager.key_path(), PathBuf::from("/tmp/wxdl-ca/wxdl-ca.key"));
    }

    #[test]
    fn ensure_generates_once_then_loads() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());

        assert!(manager.ensure_ca().is_ok());
        assert!(manager.ca_exists());
        let first = fs::read_to_string(manager.cert_path()).unwrap();
        assert!(first.contains("BEGIN CERTIFICATE"));

        assert!(manager.ensure_ca().is_ok());
        let second = fs::read_to_string(manager.cert_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_key_is_a_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        manager.generate_ca().unwrap();
        fs::write(manager.key_path(), "not a key").unwrap();

        assert!(matches!(
            manager.load_authority(),
            Err(CaManagerError::Parse(_))
        ));
    }
}
