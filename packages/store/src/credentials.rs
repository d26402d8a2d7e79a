//! # Credential manager for WebDAV connections
//!
//! Keeps one credential set per installation, encrypted at rest with
//! AES-256-GCM under a key derived with Argon2id from a passphrase and a
//! constant salt. Each write uses a fresh random 96-bit nonce; the record is
//! stored hex-encoded in a fixed-name file next to the other local state.
//!
//! The default passphrase is an application constant, so the default scheme
//! is obfuscation rather than secrecy: anyone with the binary and the file
//! can recover the credentials. [`CredentialManager::with_passphrase`] is
//! the seam for a user-supplied or platform-keystore-backed secret; the
//! default stays constant so the credential UX does not change.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Fixed record file name; one credential set per installation.
const CREDENTIAL_FILE: &str = "webdav-credentials.json";
const DEFAULT_PASSPHRASE: &str = "meterbook-webdav-v1";
const KEY_SALT: &[u8] = b"meterbook-salt-v1";
const NONCE_LEN: usize = 12;

/// The WebDAV connection settings persisted by the manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebdavCredentials {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub file_path: String,
}

/// On-disk shape: hex-encoded nonce and ciphertext.
#[derive(Serialize, Deserialize)]
struct SealedRecord {
    nonce: String,
    data: String,
}

pub struct CredentialManager {
    record_path: PathBuf,
    passphrase: String,
}

impl CredentialManager {
    /// A manager storing its record under `state_dir`, sealed with the
    /// built-in application passphrase.
    pub fn new(state_dir: &Path) -> Self {
        Self::with_passphrase(state_dir, DEFAULT_PASSPHRASE)
    }

    /// Seal the record with a caller-supplied passphrase instead of the
    /// application constant.
    pub fn with_passphrase(state_dir: &Path, passphrase: &str) -> Self {
        Self {
            record_path: state_dir.join(CREDENTIAL_FILE),
            passphrase: passphrase.to_string(),
        }
    }

    fn derive_key(&self) -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| StorageError::Credential(format!("key derivation failed: {e}")))?;
        Ok(key)
    }

    fn seal(&self, credentials: &WebdavCredentials) -> Result<SealedRecord> {
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StorageError::Credential(format!("cipher setup failed: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| StorageError::Credential(format!("serialize failed: {e}")))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| StorageError::Credential("encryption failed".into()))?;

        Ok(SealedRecord {
            nonce: hex::encode(nonce_bytes),
            data: hex::encode(ciphertext),
        })
    }

    fn unseal(&self, record: &SealedRecord) -> Result<WebdavCredentials> {
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StorageError::Credential(format!("cipher setup failed: {e}")))?;

        let nonce_bytes = hex::decode(&record.nonce)
            .map_err(|_| StorageError::Credential("credential record is corrupt".into()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(StorageError::Credential(
                "credential record is corrupt".into(),
            ));
        }
        let ciphertext = hex::decode(&record.data)
            .map_err(|_| StorageError::Credential("credential record is corrupt".into()))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| StorageError::Credential("decryption failed".into()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|_| StorageError::Credential("credential record is corrupt".into()))
    }

    /// Encrypt and persist a credential set, replacing any previous one.
    pub fn store(&self, credentials: &WebdavCredentials) -> Result<()> {
        if credentials.server_url.is_empty()
            || credentials.username.is_empty()
            || credentials.password.is_empty()
        {
            return Err(StorageError::Credential("incomplete credentials".into()));
        }

        let record = self.seal(credentials)?;
        if let Some(parent) = self.record_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&record)
            .map_err(|e| StorageError::Credential(format!("serialize failed: {e}")))?;
        std::fs::write(&self.record_path, text)?;
        Ok(())
    }

    /// Decrypt the stored credential set, or `None` when nothing is stored.
    pub fn retrieve(&self) -> Result<Option<WebdavCredentials>> {
        let text = match std::fs::read_to_string(&self.record_path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SealedRecord = serde_json::from_str(&text)
            .map_err(|_| StorageError::Credential("credential record is corrupt".into()))?;
        self.unseal(&record).map(Some)
    }

    pub fn exists(&self) -> bool {
        self.record_path.exists()
    }

    /// Apply a partial update to the stored set.
    pub fn update(&self, apply: impl FnOnce(&mut WebdavCredentials)) -> Result<()> {
        let mut credentials = self
            .retrieve()?
            .ok_or_else(|| StorageError::Credential("no stored credentials".into()))?;
        apply(&mut credentials);
        self.store(&credentials)
    }

    /// Remove the stored record, if any.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.record_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
