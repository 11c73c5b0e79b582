// Secret store
//
// Encrypts credentials at rest with AES-256-GCM under a key derived from the
// process master key. Encrypted values carry an "encrypted:" prefix so
// cleartext configuration keeps working.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Prefix marking a value as encrypted at rest.
pub const ENCRYPTED_PREFIX: &str = "encrypted:";

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SALT: &[u8] = b"scry-dashboard-salt-v1";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("invalid API key: {0}")]
    InvalidKey(String),
}

/// Process-wide encryption service for short credential strings.
pub struct SecretStore {
    cipher: Aes256Gcm,
    // Encryption memo: nonces make output nondeterministic, so identical
    // plaintexts reuse their first ciphertext within the process.
    memo: DashMap<String, String>,
    dev_key: bool,
}

impl SecretStore {
    /// Build the store from the `MASTER_KEY` environment variable, falling
    /// back to a hostname-derived development key with a warning.
    pub fn from_env() -> Self {
        match std::env::var("MASTER_KEY") {
            Ok(key) if !key.is_empty() => {
                if key.len() < 32 {
                    warn!(
                        target: "secrets",
                        length = key.len(),
                        "MASTER_KEY is shorter than the recommended 32 characters"
                    );
                }
                Self::with_master_key(&key, false)
            }
            _ => {
                warn!(
                    target: "secrets",
                    "MASTER_KEY not set, deriving a development-only key from the hostname"
                );
                let host =
                    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
                Self::with_master_key(&format!("scry-dev-key-{host}"), true)
            }
        }
    }

    /// Build the store from an explicit master key.
    pub fn with_master_key(master_key: &str, dev_key: bool) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(master_key.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS, &mut key);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is always 32 bytes");
        Self {
            cipher,
            memo: DashMap::new(),
            dev_key,
        }
    }

    /// Whether the store runs on the insecure development fallback key.
    pub fn is_dev_key(&self) -> bool {
        self.dev_key
    }

    /// Encrypt a plaintext, returning base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        if let Some(cached) = self.memo.get(plaintext) {
            return Ok(cached.clone());
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + sealed.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&sealed);
        let encoded = BASE64.encode(combined);

        self.memo.insert(plaintext.to_string(), encoded.clone());
        Ok(encoded)
    }

    /// Decrypt a base64(nonce || ciphertext) value.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let data = BASE64
            .decode(ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)?;
        if data.len() < NONCE_LEN {
            return Err(SecretError::DecryptionFailed);
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptionFailed)
    }

    /// Encrypt a value unless it already carries the `encrypted:` prefix.
    pub fn encrypt_if_needed(&self, value: &str) -> Result<String, SecretError> {
        if value.is_empty() || value.starts_with(ENCRYPTED_PREFIX) {
            return Ok(value.to_string());
        }
        Ok(format!("{ENCRYPTED_PREFIX}{}", self.encrypt(value)?))
    }

    /// Decrypt a value if it carries the `encrypted:` prefix, otherwise pass
    /// it through unchanged for cleartext configuration compatibility.
    pub fn decrypt_if_needed(&self, value: &str) -> Result<String, SecretError> {
        match value.strip_prefix(ENCRYPTED_PREFIX) {
            Some(ciphertext) => self.decrypt(ciphertext),
            None => Ok(value.to_string()),
        }
    }
}

/// Validate that an API key is plausible before it reaches an upstream.
pub fn validate_api_key(key: &str, expected_prefix: &str) -> Result<(), SecretError> {
    if key.is_empty() {
        return Err(SecretError::InvalidKey("key is empty".to_string()));
    }
    if key.len() < 20 {
        return Err(SecretError::InvalidKey(
            "key is too short (minimum 20 characters)".to_string(),
        ));
    }
    if !expected_prefix.is_empty() && !key.starts_with(expected_prefix) {
        return Err(SecretError::InvalidKey(format!(
            "key must start with '{expected_prefix}'"
        )));
    }
    Ok(())
}

/// Shorten a credential to a loggable form.
pub fn sanitize_for_logs(key: &str) -> String {
    if key.is_empty() {
        return "<empty>".to_string();
    }
    if key.len() <= 12 {
        return "***".to_string();
    }
    format!("{}...{}", &key[..8], &key[key.len() - 4..])
}

/// Credential wrapper that masks itself in logs and serialized output.
///
/// `Display` and `Debug` show at most a short prefix/suffix; serialization
/// always yields `"***"`. The real value is only reachable via [`expose`].
///
/// [`expose`]: SecretString::expose
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Explicitly unmask the wrapped value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 8 {
            write!(f, "***")
        } else {
            write!(f, "{}...{}", &self.0[..4], &self.0[self.0.len() - 4..])
        }
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({self})")
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::with_master_key("0123456789abcdef0123456789abcdef", false)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let store = store();
        let sealed = store.encrypt("sk_test_ABCDEFGHIJKLMNOPQRSTUVWX").unwrap();
        assert_ne!(sealed, "sk_test_ABCDEFGHIJKLMNOPQRSTUVWX");
        let opened = store.decrypt(&sealed).unwrap();
        assert_eq!(opened, "sk_test_ABCDEFGHIJKLMNOPQRSTUVWX");
    }

    #[test]
    fn encrypt_if_needed_is_idempotent() {
        let store = store();
        let once = store.encrypt_if_needed("cleartext-credential-value").unwrap();
        assert!(once.starts_with(ENCRYPTED_PREFIX));
        let twice = store.encrypt_if_needed(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(
            store.decrypt_if_needed(&twice).unwrap(),
            "cleartext-credential-value"
        );
    }

    #[test]
    fn decrypt_if_needed_passes_cleartext_through() {
        let store = store();
        assert_eq!(store.decrypt_if_needed("plain").unwrap(), "plain");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let a = SecretStore::with_master_key("first-master-key-first-master-key", false);
        let b = SecretStore::with_master_key("other-master-key-other-master-key", false);
        let sealed = a.encrypt("super secret").unwrap();
        assert!(matches!(
            b.decrypt(&sealed),
            Err(SecretError::DecryptionFailed)
        ));
    }

    #[test]
    fn garbage_ciphertext_fails_decryption() {
        let store = store();
        assert!(matches!(
            store.decrypt("not base64 at all!"),
            Err(SecretError::DecryptionFailed)
        ));
        assert!(matches!(
            store.decrypt("aGVsbG8="),
            Err(SecretError::DecryptionFailed)
        ));
    }

    #[test]
    fn secret_string_masks_display_and_json() {
        let secret = SecretString::new("sk_test_ABCDEFGHIJKLMNOPQRSTUVWX");
        assert_eq!(secret.to_string(), "sk_t...UVWX");
        assert_eq!(format!("{secret:?}"), "SecretString(sk_t...UVWX)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"***\"");
        assert_eq!(SecretString::new("short").to_string(), "***");
    }

    #[test]
    fn api_key_validation() {
        assert!(validate_api_key("sk_live_ABCDEFGHIJKLMNOP", "sk_").is_ok());
        assert!(validate_api_key("", "sk_").is_err());
        assert!(validate_api_key("sk_short", "sk_").is_err());
        assert!(validate_api_key("pk_live_ABCDEFGHIJKLMNOP", "sk_").is_err());
    }
}
