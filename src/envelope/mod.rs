//! JWE envelope parsing and detection
//!
//! Secret values written by the sealing tooling are JSON Web Encryption
//! objects (RFC 7516). Both serializations are accepted:
//!
//! - JSON, flattened (`protected`, `encrypted_key`, `iv`, `ciphertext`, `tag`)
//!   or general with exactly one entry in `recipients`
//! - compact, five base64url segments separated by `.`
//!
//! [`is_envelope`] is the detector used by the mutation engine. It never
//! fails: anything that is not a structurally valid envelope is plain data.

pub mod content;

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose},
    Engine,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use content::{decrypt_content, ContentError, ContentEncryption};

/// base64url without padding, tolerating padded input the way go-jose does.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    general_purpose::NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Reasons a value is not a usable envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("envelope is not valid UTF-8")]
    NotUtf8,

    #[error("invalid JSON serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compact serialization must have 5 parts, found {0}")]
    MalformedCompact(usize),

    #[error("missing required member '{0}'")]
    MissingField(&'static str),

    #[error("member '{field}' is not valid base64url: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid protected header: {0}")]
    Header(String),

    #[error("header parameter '{0}' appears more than once")]
    DuplicateHeader(String),

    #[error("expected exactly one recipient, found {0}")]
    Recipients(usize),
}

/// The merged JOSE header of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct JoseHeader {
    /// Key management algorithm, e.g. `RSA-OAEP-256`
    pub alg: String,
    /// Content encryption algorithm, e.g. `A128CBC-HS256`
    pub enc: String,
    /// Key identifier, if the sealer recorded one
    pub kid: Option<String>,
    /// Compression algorithm; only its absence is supported
    pub zip: Option<String>,
    /// Every parameter as received, protected and unprotected
    pub params: Map<String, Value>,
}

impl JoseHeader {
    fn from_params(params: Map<String, Value>) -> Result<Self, EnvelopeError> {
        let string_param = |name: &str| -> Result<Option<String>, EnvelopeError> {
            match params.get(name) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(EnvelopeError::Header(format!(
                    "parameter '{name}' must be a string"
                ))),
            }
        };

        let alg = string_param("alg")?.ok_or(EnvelopeError::MissingField("alg"))?;
        let enc = string_param("enc")?.ok_or(EnvelopeError::MissingField("enc"))?;
        let kid = string_param("kid")?;
        let zip = string_param("zip")?;

        Ok(Self {
            alg,
            enc,
            kid,
            zip,
            params,
        })
    }
}

/// A parsed JWE.
#[derive(Clone, Debug)]
pub struct Envelope {
    header: JoseHeader,
    protected: String,
    encrypted_key: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
    aad: Option<String>,
}

#[derive(Deserialize)]
struct JsonSerialization {
    protected: Option<String>,
    unprotected: Option<Map<String, Value>>,
    header: Option<Map<String, Value>>,
    encrypted_key: Option<String>,
    recipients: Option<Vec<JsonRecipient>>,
    iv: Option<String>,
    ciphertext: Option<String>,
    tag: Option<String>,
    aad: Option<String>,
}

#[derive(Deserialize)]
struct JsonRecipient {
    header: Option<Map<String, Value>>,
    encrypted_key: Option<String>,
}

impl Envelope {
    /// Parse either serialization.
    pub fn parse(value: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(value).map_err(|_| EnvelopeError::NotUtf8)?;
        let text = text.trim();
        if text.starts_with('{') {
            Self::parse_json(text)
        } else {
            Self::parse_compact(text)
        }
    }

    fn parse_compact(text: &str) -> Result<Self, EnvelopeError> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() != 5 {
            return Err(EnvelopeError::MalformedCompact(parts.len()));
        }

        let params = decode_protected(parts[0])?;
        Ok(Self {
            header: JoseHeader::from_params(params)?,
            protected: parts[0].to_string(),
            encrypted_key: decode_required("encrypted_key", parts[1])?,
            iv: decode_required("iv", parts[2])?,
            ciphertext: decode("ciphertext", parts[3])?,
            tag: decode_required("tag", parts[4])?,
            aad: None,
        })
    }

    fn parse_json(text: &str) -> Result<Self, EnvelopeError> {
        let raw: JsonSerialization = serde_json::from_str(text)?;

        let (recipient_header, encrypted_key) = match raw.recipients {
            Some(recipients) => {
                if raw.header.is_some() || raw.encrypted_key.is_some() {
                    return Err(EnvelopeError::Header(
                        "'recipients' cannot be combined with flattened members".to_string(),
                    ));
                }
                let count = recipients.len();
                let mut iter = recipients.into_iter();
                match (iter.next(), count) {
                    (Some(only), 1) => (only.header, only.encrypted_key),
                    _ => return Err(EnvelopeError::Recipients(count)),
                }
            }
            None => (raw.header, raw.encrypted_key),
        };

        let protected = raw.protected.unwrap_or_default();
        let mut params = if protected.is_empty() {
            Map::new()
        } else {
            decode_protected(&protected)?
        };
        for extra in [raw.unprotected, recipient_header].into_iter().flatten() {
            merge_params(&mut params, extra)?;
        }

        let encrypted_key = encrypted_key.ok_or(EnvelopeError::MissingField("encrypted_key"))?;
        let iv = raw.iv.ok_or(EnvelopeError::MissingField("iv"))?;
        let ciphertext = raw.ciphertext.ok_or(EnvelopeError::MissingField("ciphertext"))?;
        let tag = raw.tag.ok_or(EnvelopeError::MissingField("tag"))?;
        if let Some(aad) = &raw.aad {
            decode("aad", aad)?;
        }

        Ok(Self {
            header: JoseHeader::from_params(params)?,
            protected,
            encrypted_key: decode_required("encrypted_key", &encrypted_key)?,
            iv: decode_required("iv", &iv)?,
            ciphertext: decode("ciphertext", &ciphertext)?,
            tag: decode_required("tag", &tag)?,
            aad: raw.aad,
        })
    }

    pub fn header(&self) -> &JoseHeader {
        &self.header
    }

    /// The wrapped content encryption key.
    pub fn encrypted_key(&self) -> &[u8] {
        &self.encrypted_key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    /// Additional authenticated data as defined in RFC 7516 §5.1 step 14.
    pub fn additional_authenticated_data(&self) -> Vec<u8> {
        let mut aad = self.protected.as_bytes().to_vec();
        if let Some(extra) = &self.aad {
            aad.push(b'.');
            aad.extend_from_slice(extra.as_bytes());
        }
        aad
    }
}

/// Returns true when `value` is a structurally valid JWE.
pub fn is_envelope(value: &[u8]) -> bool {
    Envelope::parse(value).is_ok()
}

fn decode(field: &'static str, input: &str) -> Result<Vec<u8>, EnvelopeError> {
    BASE64_URL
        .decode(input)
        .map_err(|source| EnvelopeError::Base64 { field, source })
}

fn decode_required(field: &'static str, input: &str) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = decode(field, input)?;
    if bytes.is_empty() {
        return Err(EnvelopeError::MissingField(field));
    }
    Ok(bytes)
}

fn decode_protected(input: &str) -> Result<Map<String, Value>, EnvelopeError> {
    let bytes = decode("protected", input)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EnvelopeError::Header("not a JSON object".to_string())),
        Err(e) => Err(EnvelopeError::Header(e.to_string())),
    }
}

fn merge_params(
    into: &mut Map<String, Value>,
    from: Map<String, Value>,
) -> Result<(), EnvelopeError> {
    for (name, value) in from {
        if into.contains_key(&name) {
            return Err(EnvelopeError::DuplicateHeader(name));
        }
        into.insert(name, value);
    }
    Ok(())
}
