//! Google Cloud KMS key unwrapper
//!
//! Unwraps JWE content encryption keys with the Cloud KMS
//! `asymmetricDecrypt` REST method. The key version is fixed at startup;
//! envelopes are expected to have been sealed with its public key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{BackendError, KeyUnwrapper};
use crate::envelope::JoseHeader;

pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";

const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
/// Refresh cached tokens this long before they expire.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);
/// Upper bound on how long a metadata token is trusted, whatever it claims.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Location of the Cloud KMS key version and how to reach it.
#[derive(Clone, Debug)]
pub struct CloudKmsConfig {
    pub project: String,
    pub location: String,
    pub key_ring: String,
    pub key_name: String,
    pub key_version: u32,
    /// Base URL of the Cloud KMS REST API
    pub endpoint: String,
    /// Base URL of the GCE metadata server, used when no static token is set
    pub metadata_endpoint: String,
    /// Static OAuth2 access token, mostly for local development
    pub access_token: Option<String>,
    /// Per-call timeout
    pub timeout: Duration,
}

impl CloudKmsConfig {
    /// Full resource name of the configured key version.
    pub fn key_version_name(&self) -> String {
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}/cryptoKeyVersions/{}",
            self.project, self.location, self.key_ring, self.key_name, self.key_version
        )
    }
}

#[derive(Serialize)]
struct AsymmetricDecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct AsymmetricDecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize, Default)]
struct GoogleErrorBody {
    #[serde(default)]
    error: GoogleError,
}

#[derive(Deserialize, Default)]
struct GoogleError {
    #[serde(default)]
    message: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Cloud KMS REST client.
pub struct CloudKmsClient {
    config: CloudKmsConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl CloudKmsClient {
    pub fn new(config: CloudKmsConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to create kms client: {e}")))?;

        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CloudKmsConfig {
        &self.config
    }

    /// Decrypt `ciphertext` with the configured asymmetric key version.
    pub async fn asymmetric_decrypt(
        &self,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        let name = self.config.key_version_name();
        let url = format!(
            "{}/v1/{}:asymmetricDecrypt",
            self.config.endpoint.trim_end_matches('/'),
            name
        );
        let token = self.access_token().await?;
        let encoded = STANDARD.encode(ciphertext);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&AsymmetricDecryptRequest {
                ciphertext: &encoded,
            })
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to decrypt ciphertext: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: GoogleErrorBody = response.json().await.unwrap_or_default();
            return Err(map_status(status, &name, body.error.message));
        }

        let body: AsymmetricDecryptResponse = response.json().await.map_err(|e| {
            BackendError::Unavailable(format!("malformed asymmetricDecrypt response: {e}"))
        })?;
        let plaintext = STANDARD.decode(body.plaintext.as_bytes()).map_err(|e| {
            BackendError::Unavailable(format!("malformed asymmetricDecrypt plaintext: {e}"))
        })?;

        Ok(Zeroizing::new(plaintext))
    }

    async fn access_token(&self) -> Result<String, BackendError> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_SLACK < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}{}",
            self.config.metadata_endpoint.trim_end_matches('/'),
            TOKEN_PATH
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("metadata server unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(BackendError::PermissionDenied(format!(
                "metadata server returned {} for the default service account token",
                response.status()
            )));
        }

        let token: MetadataToken = response.json().await.map_err(|e| {
            BackendError::Unavailable(format!("malformed metadata token response: {e}"))
        })?;
        debug!(expires_in = token.expires_in, "Fetched access token from metadata server");

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now()
                + Duration::from_secs(token.expires_in).min(MAX_TOKEN_LIFETIME),
        });
        Ok(value)
    }
}

#[async_trait]
impl KeyUnwrapper for CloudKmsClient {
    async fn unwrap_key(
        &self,
        encrypted_key: &[u8],
        header: &JoseHeader,
    ) -> Result<Zeroizing<Vec<u8>>, BackendError> {
        if let Some(kid) = &header.kid {
            if !self.config.key_version_name().starts_with(kid.as_str()) {
                warn!(
                    kid = %kid,
                    key = %self.config.key_version_name(),
                    "Envelope kid does not name the configured key, attempting decrypt anyway"
                );
            }
        }
        self.asymmetric_decrypt(encrypted_key).await
    }
}

fn map_status(status: StatusCode, key: &str, message: String) -> BackendError {
    let detail = if message.is_empty() {
        format!("{key}: HTTP {status}")
    } else {
        format!("{key}: {message}")
    };
    match status {
        StatusCode::BAD_REQUEST => BackendError::InvalidCiphertext(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::PermissionDenied(detail),
        StatusCode::NOT_FOUND => BackendError::KeyNotFound(detail),
        _ => BackendError::Unavailable(detail),
    }
}
