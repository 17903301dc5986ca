//! Webhook Module
//!
//! Mutating admission webhook for `v1/Secret`. Data values that hold a JWE
//! envelope are decrypted through a [`DecryptionBackend`](crate::kms::DecryptionBackend)
//! and the API server receives a JSON Patch replacing them with plaintext.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use secrets_decryption_webhook::kms::{CloudKmsClient, JweDecrypter};
//! use secrets_decryption_webhook::webhook::{serve, WebhookConfig};
//!
//! let backend = Arc::new(JweDecrypter::new(CloudKmsClient::new(kms_config)?));
//! serve(WebhookConfig::default(), backend).await?;
//! ```

pub mod metrics;
pub mod mutation;
pub mod patch;
pub mod resource;
pub mod review;
pub mod server;

pub use mutation::{FieldAction, FieldOutcome, Mutation, MutationEngine};
pub use patch::create_patch;
pub use resource::{extract_secret, TargetResource};
pub use review::{
    decode_review, encode_review, ObjectSource, Operation, ReviewRequest, ReviewResponse,
    ReviewVersion,
};
pub use server::{router, serve, TlsConfig, WebhookConfig, WebhookState};
