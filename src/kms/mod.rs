//! Decryption backends
//!
//! The webhook talks to the key management system through the narrow
//! [`DecryptionBackend`] trait. The production implementation is
//! [`JweDecrypter`], which unwraps the content encryption key through a
//! [`KeyUnwrapper`] (Cloud KMS asymmetric decrypt, see [`google`]) and
//! decrypts the payload locally.
//!
//! Every backend error is fatal to the admission request. Retries, if any,
//! belong inside the backend client.

pub mod google;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::envelope::{decrypt_content, ContentEncryption, Envelope, JoseHeader};

pub use google::{CloudKmsClient, CloudKmsConfig};

/// Key management algorithms a KMS asymmetric decryption key can serve.
pub const SUPPORTED_KEY_ALGORITHMS: &[&str] = &["RSA-OAEP-256", "RSA-OAEP"];

/// Failures reported by a decryption backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached or returned a transient error
    #[error("decryption backend unavailable: {0}")]
    Unavailable(String),

    /// The envelope cannot be decrypted as presented
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// The key referenced by the envelope does not exist
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The webhook identity may not use the key
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Turns an envelope into plaintext.
#[async_trait]
pub trait DecryptionBackend: Send + Sync {
    /// Decrypt one envelope. Header hints are available via `envelope.header()`.
    async fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, BackendError>;
}

/// Unwraps a JWE content encryption key.
#[async_trait]
pub trait KeyUnwrapper: Send + Sync {
    async fn unwrap_key(
        &self,
        encrypted_key: &[u8],
        header: &JoseHeader,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError>;
}

/// Hybrid JWE decryption: remote key unwrap, local content decryption.
pub struct JweDecrypter<U> {
    unwrapper: U,
}

impl<U: KeyUnwrapper> JweDecrypter<U> {
    pub fn new(unwrapper: U) -> Self {
        Self { unwrapper }
    }
}

#[async_trait]
impl<U: KeyUnwrapper> DecryptionBackend for JweDecrypter<U> {
    async fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
        let header = envelope.header();

        if !SUPPORTED_KEY_ALGORITHMS.contains(&header.alg.as_str()) {
            return Err(BackendError::InvalidCiphertext(format!(
                "unsupported key management algorithm '{}'",
                header.alg
            )));
        }
        if ContentEncryption::from_name(&header.enc).is_none() {
            return Err(BackendError::InvalidCiphertext(format!(
                "unsupported content encryption algorithm '{}'",
                header.enc
            )));
        }
        if let Some(zip) = &header.zip {
            return Err(BackendError::InvalidCiphertext(format!(
                "compressed payloads are not supported (zip={zip})"
            )));
        }

        let cek = self
            .unwrapper
            .unwrap_key(envelope.encrypted_key(), header)
            .await?;
        debug!(alg = %header.alg, enc = %header.enc, "Unwrapped content encryption key");

        decrypt_content(
            &header.enc,
            &cek,
            envelope.iv(),
            envelope.ciphertext(),
            envelope.tag(),
            &envelope.additional_authenticated_data(),
        )
        .map_err(|e| BackendError::InvalidCiphertext(e.to_string()))
    }
}
