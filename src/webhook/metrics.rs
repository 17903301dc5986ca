//! Prometheus metrics for the secrets decryption webhook
//!
//! # Exported metrics
//! - `secrets_webhook_admission_requests_total` (counter): reviews labeled by outcome
//!   (`allowed`, `denied`, `error`).
//! - `secrets_webhook_admission_duration_seconds` (histogram): end to end review latency.
//! - `secrets_webhook_decrypt_total` (counter): backend decrypt calls labeled by result.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::kms::BackendError;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecryptLabels {
    pub result: String,
}

/// Counter tracking admission reviews by outcome
pub static ADMISSION_REQUESTS_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking review duration (seconds)
pub static ADMISSION_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 1ms .. ~16s across 15 buckets.
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
});

/// Counter tracking decrypt calls by result
pub static DECRYPT_TOTAL: Lazy<Family<DecryptLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "secrets_webhook_admission_requests",
        "Total number of admission reviews handled",
        ADMISSION_REQUESTS_TOTAL.clone(),
    );
    registry.register(
        "secrets_webhook_admission_duration_seconds",
        "Duration of admission reviews in seconds",
        ADMISSION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "secrets_webhook_decrypt",
        "Total number of decrypt calls made to the backend",
        DECRYPT_TOTAL.clone(),
    );

    registry
});

pub fn record_admission_outcome(outcome: &str) {
    ADMISSION_REQUESTS_TOTAL
        .get_or_create(&OutcomeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn observe_admission_duration(seconds: f64) {
    ADMISSION_DURATION_SECONDS.observe(seconds);
}

pub fn record_decrypt(result: Result<(), &BackendError>) {
    let result = match result {
        Ok(()) => "success",
        Err(BackendError::Unavailable(_)) => "unavailable",
        Err(BackendError::InvalidCiphertext(_)) => "invalid_ciphertext",
        Err(BackendError::KeyNotFound(_)) => "key_not_found",
        Err(BackendError::PermissionDenied(_)) => "permission_denied",
    };
    DECRYPT_TOTAL
        .get_or_create(&DecryptLabels {
            result: result.to_string(),
        })
        .inc();
}

/// Render the registry in the OpenMetrics text format.
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
