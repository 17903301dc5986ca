//! Decryption of enveloped Secret data
//!
//! The engine walks `data` in key order, decrypts every value that is a JWE
//! envelope and leaves everything else alone. Decrypt calls for one Secret run
//! concurrently up to `max_in_flight`. The first failure aborts the pass and
//! drops the remaining calls, so a Secret is either fully decrypted or not
//! admitted at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::{debug, instrument};

use super::metrics;
use super::resource::TargetResource;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::kms::DecryptionBackend;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldAction {
    Decrypted,
    Skipped,
}

/// What happened to one data key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldOutcome {
    pub key: String,
    pub action: FieldAction,
}

/// Result of a mutation pass.
#[derive(Clone, Debug)]
pub struct Mutation {
    /// Copy of the input Secret with decrypted values in place
    pub secret: Secret,
    pub outcomes: Vec<FieldOutcome>,
    /// Only the entries that changed
    pub replaced: BTreeMap<String, ByteString>,
}

impl Mutation {
    pub fn decrypted_keys(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.action == FieldAction::Decrypted)
            .map(|o| o.key.as_str())
    }

    pub fn is_noop(&self) -> bool {
        self.replaced.is_empty()
    }
}

/// Replaces enveloped Secret values with their plaintext.
#[derive(Clone)]
pub struct MutationEngine {
    backend: Arc<dyn DecryptionBackend>,
    max_in_flight: usize,
}

impl MutationEngine {
    pub fn new(backend: Arc<dyn DecryptionBackend>) -> Self {
        Self {
            backend,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Bound on concurrent decrypt calls per Secret. Zero is treated as one.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    #[instrument(skip(self, target), fields(max_in_flight = self.max_in_flight))]
    pub async fn mutate(&self, target: &TargetResource) -> Result<Mutation> {
        let original = target.secret();

        let mut outcomes = Vec::new();
        let mut pending = Vec::new();
        for (key, value) in original.data.iter().flatten() {
            match Envelope::parse(&value.0) {
                Ok(envelope) => pending.push((key.clone(), envelope)),
                Err(reason) => {
                    debug!(key = %key, %reason, "Leaving non-envelope value untouched");
                    outcomes.push(FieldOutcome {
                        key: key.clone(),
                        action: FieldAction::Skipped,
                    });
                }
            }
        }

        let backend = &self.backend;
        let replaced: BTreeMap<String, ByteString> = stream::iter(pending)
            .map(|(key, envelope)| async move {
                let result = backend.decrypt(&envelope).await;
                metrics::record_decrypt(result.as_ref().map(|_| ()));
                match result {
                    Ok(plaintext) => {
                        debug!(key = %key, "Decrypted data key");
                        Ok((key, ByteString(plaintext)))
                    }
                    Err(source) => Err(Error::Decryption { key, source }),
                }
            })
            .buffer_unordered(self.max_in_flight)
            .try_collect()
            .await?;

        outcomes.extend(replaced.keys().map(|key| FieldOutcome {
            key: key.clone(),
            action: FieldAction::Decrypted,
        }));
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut secret = original.clone();
        if !replaced.is_empty() {
            let data = secret.data.get_or_insert_with(BTreeMap::new);
            for (key, value) in &replaced {
                data.insert(key.clone(), value.clone());
            }
        }

        Ok(Mutation {
            secret,
            outcomes,
            replaced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::BackendError;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Envelope whose ciphertext member is the plaintext, for testing only.
    fn envelope_for(plaintext: &str) -> Vec<u8> {
        [
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RSA-OAEP-256","enc":"A256GCM"}"#),
            URL_SAFE_NO_PAD.encode("cek"),
            URL_SAFE_NO_PAD.encode("iv"),
            URL_SAFE_NO_PAD.encode(plaintext),
            URL_SAFE_NO_PAD.encode("tag"),
        ]
        .join(".")
        .into_bytes()
    }

    #[derive(Default)]
    struct EchoBackend {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl DecryptionBackend for EchoBackend {
        async fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let plaintext = envelope.ciphertext().to_vec();
            if Some(plaintext.as_slice()) == self.fail_on.map(str::as_bytes) {
                return Err(BackendError::PermissionDenied("denied".to_string()));
            }
            Ok(plaintext)
        }
    }

    fn target(data: &[(&str, Vec<u8>)]) -> TargetResource {
        let mut secret = Secret::default();
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.clone())))
                .collect(),
        );
        TargetResource::from_secret(secret).unwrap()
    }

    #[tokio::test]
    async fn test_decrypts_only_envelopes() {
        let backend = Arc::new(EchoBackend::default());
        let engine = MutationEngine::new(backend.clone());
        let target = target(&[
            ("password", envelope_for("P@ssword01")),
            ("plain", b"already plaintext".to_vec()),
            ("username", envelope_for("dev-user")),
        ]);

        let mutation = engine.mutate(&target).await.unwrap();
        let data = mutation.secret.data.as_ref().unwrap();
        assert_eq!(data["password"].0, b"P@ssword01");
        assert_eq!(data["username"].0, b"dev-user");
        assert_eq!(data["plain"].0, b"already plaintext");
        assert_eq!(
            mutation.decrypted_keys().collect::<Vec<_>>(),
            vec!["password", "username"]
        );
        assert_eq!(mutation.outcomes[1].action, FieldAction::Skipped);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        // input is never mutated
        assert_eq!(
            target.secret().data.as_ref().unwrap()["password"].0,
            envelope_for("P@ssword01")
        );
    }

    #[tokio::test]
    async fn test_no_envelopes_is_noop() {
        let backend = Arc::new(EchoBackend::default());
        let engine = MutationEngine::new(backend.clone());

        let mutation = engine
            .mutate(&target(&[("a", b"b".to_vec())]))
            .await
            .unwrap();
        assert!(mutation.is_noop());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let mutation = engine
            .mutate(&TargetResource::from_secret(Secret::default()).unwrap())
            .await
            .unwrap();
        assert!(mutation.is_noop());
        assert!(mutation.secret.data.is_none());
    }

    #[tokio::test]
    async fn test_failure_aborts_whole_pass() {
        let backend = Arc::new(EchoBackend {
            fail_on: Some("b"),
            ..Default::default()
        });
        let engine = MutationEngine::new(backend);

        let err = engine
            .mutate(&target(&[
                ("a", envelope_for("a")),
                ("b", envelope_for("b")),
                ("c", envelope_for("c")),
            ]))
            .await
            .unwrap_err();
        match err {
            Error::Decryption { key, source } => {
                assert_eq!(key, "b");
                assert!(matches!(source, BackendError::PermissionDenied(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_respects_max_in_flight() {
        let backend = Arc::new(EchoBackend::default());
        let engine = MutationEngine::new(backend.clone()).with_max_in_flight(2);
        let data: Vec<(String, Vec<u8>)> = (0..10)
            .map(|i| (format!("key-{i}"), envelope_for(&format!("value-{i}"))))
            .collect();
        let data: Vec<(&str, Vec<u8>)> = data.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let mutation = engine.mutate(&target(&data)).await.unwrap();
        assert_eq!(mutation.replaced.len(), 10);
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_max_in_flight_is_one() {
        let engine = MutationEngine::new(Arc::new(EchoBackend::default())).with_max_in_flight(0);
        assert_eq!(engine.max_in_flight(), 1);
    }
}
