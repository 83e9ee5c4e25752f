//! Symmetric encryption for per-service credentials.
//!
//! Tokens are url-safe base64 of `nonce(12) || ciphertext+tag` under AES-256-GCM.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::VaultError;
use crate::models::{CredentialBundle, EncryptedCredentials};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Builds a vault from the configured key string. The key is padded with
    /// zero bytes or truncated to 32 bytes.
    pub fn new(key: &str) -> Result<Self, VaultError> {
        if key.is_empty() {
            return Err(VaultError::MissingKey);
        }
        let mut bytes = [0u8; 32];
        let raw = key.as_bytes();
        let n = raw.len().min(32);
        bytes[..n].copy_from_slice(&raw[..n]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes));
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Aead)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ct);
        Ok(URL_SAFE.encode(blob))
    }

    /// An empty token decrypts to an empty string.
    pub fn decrypt(&self, token: &str) -> Result<String, VaultError> {
        if token.is_empty() {
            return Ok(String::new());
        }
        let blob = URL_SAFE.decode(token.as_bytes())?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Truncated);
        }
        let (nonce, ct) = blob.split_at(NONCE_LEN);
        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| VaultError::Aead)?;
        Ok(String::from_utf8(pt)?)
    }

    /// Decrypts a stored credential set. Undecodable header JSON yields no headers.
    pub fn open(&self, sealed: &EncryptedCredentials) -> Result<CredentialBundle, VaultError> {
        let basic_user = self.decrypt(&sealed.basic_user)?;
        let basic_pass = self.decrypt(&sealed.basic_pass)?;
        let headers_json = self.decrypt(&sealed.headers)?;
        let headers = if headers_json.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str::<BTreeMap<String, String>>(&headers_json).unwrap_or_else(|e| {
                warn!(error = %e, "ignoring undecodable credential headers");
                BTreeMap::new()
            })
        };
        Ok(CredentialBundle { basic_user, basic_pass, headers })
    }

    pub fn seal(&self, bundle: &CredentialBundle) -> Result<EncryptedCredentials, VaultError> {
        let seal_opt = |s: &str| -> Result<String, VaultError> {
            if s.is_empty() { Ok(String::new()) } else { self.encrypt(s) }
        };
        let headers = if bundle.headers.is_empty() {
            String::new()
        } else {
            let json = serde_json::to_string(&bundle.headers).unwrap_or_default();
            self.encrypt(&json)?
        };
        Ok(EncryptedCredentials {
            basic_user: seal_opt(&bundle.basic_user)?,
            basic_pass: seal_opt(&bundle.basic_pass)?,
            headers,
        })
    }
}
