//! Secrets decryption webhook
//!
//! A Kubernetes mutating admission webhook that finds JWE envelopes in
//! `Secret` data, decrypts them through a KMS and patches the plaintext into
//! the object before it is persisted.

pub mod envelope;
pub mod error;
pub mod kms;
pub mod telemetry;
pub mod webhook;

pub use crate::error::{Error, Result};
