//! Decryption capability consumed by projections that store secrets in clear.

use serde::{Deserialize, Serialize};

/// Encrypted value as it appears in event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoValue {
    pub algorithm: String,
    pub key_id: String,
    pub crypted: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("value encrypted with {found}, decrypter handles {expected}")]
    AlgorithmMismatch { expected: String, found: String },
    #[error("unknown key {0}")]
    UnknownKey(String),
    #[error("decryption failed: {0}")]
    Failed(String),
    #[error("decrypted value is not UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

/// A symmetric algorithm with access to its keys.
pub trait EncryptionAlgorithm: Send + Sync {
    /// Identifier stored in [`CryptoValue::algorithm`].
    fn algorithm(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`DecryptError`] if the key is unknown or the data corrupt.
    fn decrypt(&self, crypted: &[u8], key_id: &str) -> Result<Vec<u8>, DecryptError>;
}

/// Decrypt `value` with `alg`, refusing values of another algorithm.
///
/// # Errors
///
/// Returns [`DecryptError::AlgorithmMismatch`] or whatever `alg` reports.
pub fn decrypt(value: &CryptoValue, alg: &dyn EncryptionAlgorithm) -> Result<Vec<u8>, DecryptError> {
    if value.algorithm != alg.algorithm() {
        return Err(DecryptError::AlgorithmMismatch {
            expected: alg.algorithm().to_owned(),
            found: value.algorithm.clone(),
        });
    }
    alg.decrypt(&value.crypted, &value.key_id)
}

/// [`decrypt`] into a string.
///
/// # Errors
///
/// As [`decrypt`], plus [`DecryptError::NotUtf8`].
pub fn decrypt_string(value: &CryptoValue, alg: &dyn EncryptionAlgorithm) -> Result<String, DecryptError> {
    Ok(String::from_utf8(decrypt(value, alg)?)?)
}
