//! Content decryption for JWE payloads (RFC 7518 §5)

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use thiserror::Error;

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ContentError {
    #[error("unsupported content encryption algorithm '{0}'")]
    Unsupported(String),

    #[error("content encryption key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("initialization vector must be {expected} bytes, got {actual}")]
    IvLength { expected: usize, actual: usize },

    #[error("authentication tag mismatch")]
    Authentication,

    #[error("invalid padding")]
    Padding,
}

/// Supported `enc` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncryption {
    A128CbcHs256,
    A192CbcHs384,
    A256CbcHs512,
    A128Gcm,
    A256Gcm,
}

impl ContentEncryption {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "A128CBC-HS256" => Some(Self::A128CbcHs256),
            "A192CBC-HS384" => Some(Self::A192CbcHs384),
            "A256CBC-HS512" => Some(Self::A256CbcHs512),
            "A128GCM" => Some(Self::A128Gcm),
            "A256GCM" => Some(Self::A256Gcm),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::A128CbcHs256 => "A128CBC-HS256",
            Self::A192CbcHs384 => "A192CBC-HS384",
            Self::A256CbcHs512 => "A256CBC-HS512",
            Self::A128Gcm => "A128GCM",
            Self::A256Gcm => "A256GCM",
        }
    }

    /// Length of the content encryption key in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Self::A128CbcHs256 => 32,
            Self::A192CbcHs384 => 48,
            Self::A256CbcHs512 => 64,
            Self::A128Gcm => 16,
            Self::A256Gcm => 32,
        }
    }
}

/// Decrypt and authenticate a JWE payload with an already unwrapped CEK.
pub fn decrypt_content(
    enc: &str,
    cek: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ContentError> {
    let alg = ContentEncryption::from_name(enc)
        .ok_or_else(|| ContentError::Unsupported(enc.to_string()))?;
    if cek.len() != alg.key_len() {
        return Err(ContentError::KeyLength {
            expected: alg.key_len(),
            actual: cek.len(),
        });
    }

    match alg {
        ContentEncryption::A128CbcHs256 => {
            cbc_hmac::<cbc::Decryptor<Aes128>, Hmac<Sha256>>(cek, iv, ciphertext, tag, aad)
        }
        ContentEncryption::A192CbcHs384 => {
            cbc_hmac::<cbc::Decryptor<Aes192>, Hmac<Sha384>>(cek, iv, ciphertext, tag, aad)
        }
        ContentEncryption::A256CbcHs512 => {
            cbc_hmac::<cbc::Decryptor<Aes256>, Hmac<Sha512>>(cek, iv, ciphertext, tag, aad)
        }
        ContentEncryption::A128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(cek).map_err(|_| ContentError::KeyLength {
                expected: 16,
                actual: cek.len(),
            })?;
            gcm(&cipher, iv, ciphertext, tag, aad)
        }
        ContentEncryption::A256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(cek).map_err(|_| ContentError::KeyLength {
                expected: 32,
                actual: cek.len(),
            })?;
            gcm(&cipher, iv, ciphertext, tag, aad)
        }
    }
}

/// AES_CBC_HMAC_SHA2: the first half of the CEK is the MAC key, the second
/// half the AES key, and the tag is the left half of the HMAC output.
fn cbc_hmac<C, M>(
    cek: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ContentError>
where
    C: BlockDecryptMut + KeyIvInit,
    M: Mac + KeyInit,
{
    if iv.len() != CBC_IV_LEN {
        return Err(ContentError::IvLength {
            expected: CBC_IV_LEN,
            actual: iv.len(),
        });
    }
    let (mac_key, enc_key) = cek.split_at(cek.len() / 2);
    if tag.len() != mac_key.len() {
        return Err(ContentError::Authentication);
    }

    let aad_bits = (aad.len() as u64).wrapping_mul(8).to_be_bytes();
    let mut mac = <M as Mac>::new_from_slice(mac_key).map_err(|_| ContentError::KeyLength {
        expected: cek.len(),
        actual: cek.len(),
    })?;
    mac.update(aad);
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(&aad_bits);
    mac.verify_truncated_left(tag)
        .map_err(|_| ContentError::Authentication)?;

    C::new_from_slices(enc_key, iv)
        .map_err(|_| ContentError::KeyLength {
            expected: cek.len(),
            actual: cek.len(),
        })?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ContentError::Padding)
}

fn gcm<A: Aead>(
    cipher: &A,
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ContentError> {
    if iv.len() != GCM_IV_LEN {
        return Err(ContentError::IvLength {
            expected: GCM_IV_LEN,
            actual: iv.len(),
        });
    }
    if tag.len() != GCM_TAG_LEN {
        return Err(ContentError::Authentication);
    }

    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| ContentError::Authentication)
}
