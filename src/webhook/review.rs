//! AdmissionReview wire codec
//!
//! Decoding is deliberately lenient about everything except what the
//! webhook needs: the review must be an `AdmissionReview` of a known
//! `admission.k8s.io` version and must carry a `request`. The embedded
//! object is kept as raw bytes until the resource extractor looks at it.
//! Responses are always encoded in the version the request arrived in.

use k8s_openapi::api::core::v1::Secret;
use kube::core::admission::PatchType;
use kube::core::{GroupVersionKind, GroupVersionResource, Status};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};

pub const ADMISSION_API_VERSION_V1: &str = "admission.k8s.io/v1";
pub const ADMISSION_API_VERSION_V1BETA1: &str = "admission.k8s.io/v1beta1";
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Schema version of an `AdmissionReview`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewVersion {
    V1,
    V1Beta1,
}

impl ReviewVersion {
    pub fn api_version(&self) -> &'static str {
        match self {
            ReviewVersion::V1 => ADMISSION_API_VERSION_V1,
            ReviewVersion::V1Beta1 => ADMISSION_API_VERSION_V1BETA1,
        }
    }

    fn from_api_version(api_version: Option<&str>) -> Result<Self> {
        match api_version.unwrap_or_default() {
            "" | ADMISSION_API_VERSION_V1 => Ok(ReviewVersion::V1),
            ADMISSION_API_VERSION_V1BETA1 => Ok(ReviewVersion::V1Beta1),
            other => Err(Error::Decode(format!(
                "no kind \"{ADMISSION_REVIEW_KIND}\" is registered for version \"{other}\""
            ))),
        }
    }
}

/// Admission operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
    #[default]
    #[serde(other)]
    Unknown,
}

/// The object carried by a review, either still encoded or already typed.
#[derive(Clone, Debug)]
pub enum ObjectSource {
    Raw(Vec<u8>),
    Typed(Box<Secret>),
}

/// The parts of an admission request the webhook acts on.
#[derive(Clone, Debug)]
pub struct ReviewRequest {
    pub uid: String,
    pub kind: Option<GroupVersionKind>,
    pub resource: Option<GroupVersionResource>,
    pub sub_resource: Option<String>,
    pub operation: Operation,
    pub namespace: Option<String>,
    pub name: String,
    pub object: ObjectSource,
    pub old_object: Option<ObjectSource>,
    pub dry_run: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReview {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    request: Option<WireRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    kind: Option<GroupVersionKind>,
    #[serde(default)]
    resource: Option<GroupVersionResource>,
    #[serde(default)]
    sub_resource: Option<String>,
    #[serde(default)]
    operation: Operation,
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    object: Option<Box<RawValue>>,
    #[serde(default)]
    old_object: Option<Box<RawValue>>,
    #[serde(default)]
    dry_run: Option<bool>,
}

impl From<WireRequest> for ReviewRequest {
    fn from(wire: WireRequest) -> Self {
        let raw = |value: Box<RawValue>| ObjectSource::Raw(value.get().as_bytes().to_vec());
        ReviewRequest {
            uid: wire.uid,
            kind: wire.kind,
            resource: wire.resource,
            sub_resource: wire.sub_resource.filter(|s| !s.is_empty()),
            operation: wire.operation,
            namespace: wire.namespace.filter(|ns| !ns.is_empty()),
            name: wire.name,
            object: wire.object.map(raw).unwrap_or(ObjectSource::Raw(Vec::new())),
            old_object: wire.old_object.map(raw),
            dry_run: wire.dry_run.unwrap_or(false),
        }
    }
}

/// Decode an HTTP body into a review request and the schema version it used.
pub fn decode_review(
    body: &[u8],
    content_type: Option<&str>,
) -> Result<(ReviewRequest, ReviewVersion)> {
    let content_type = content_type.unwrap_or_default();
    if content_type != JSON_CONTENT_TYPE {
        return Err(Error::UnsupportedMediaType(content_type.to_string()));
    }

    let wire = if body.iter().all(u8::is_ascii_whitespace) {
        WireReview {
            api_version: None,
            kind: None,
            request: None,
        }
    } else {
        serde_json::from_slice::<WireReview>(body).map_err(|e| Error::Decode(e.to_string()))?
    };

    if let Some(kind) = wire.kind.as_deref().filter(|k| !k.is_empty()) {
        if kind != ADMISSION_REVIEW_KIND {
            return Err(Error::Decode(format!(
                "unexpected kind \"{kind}\", expect \"{ADMISSION_REVIEW_KIND}\""
            )));
        }
    }
    let version = ReviewVersion::from_api_version(wire.api_version.as_deref())?;
    let request = wire.request.ok_or(Error::MissingRequest)?;

    Ok((request.into(), version))
}

/// Webhook verdict for one request.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_patch")]
    pub patch: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
}

impl ReviewResponse {
    /// Admit the object, asking the API server to apply `patch`.
    pub fn allowed(uid: impl Into<String>, patch: &json_patch::Patch) -> Result<Self> {
        Ok(Self {
            uid: uid.into(),
            allowed: true,
            status: None,
            patch: Some(serde_json::to_vec(patch)?),
            patch_type: Some(PatchType::JsonPatch),
        })
    }

    /// Reject the object with the error's message and reason.
    pub fn denied(uid: impl Into<String>, err: &Error) -> Self {
        let mut status = Status::failure(&err.to_string(), err.reason());
        status.code = err.status_code();
        Self {
            uid: uid.into(),
            allowed: false,
            status: Some(status),
            patch: None,
            patch_type: None,
        }
    }

    /// Metrics label for this verdict.
    pub fn outcome(&self) -> &'static str {
        if self.allowed {
            "allowed"
        } else {
            "denied"
        }
    }

    /// The patch operations carried by an allowed response.
    pub fn json_patch(&self) -> Result<Option<json_patch::Patch>> {
        self.patch
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
            .map_err(Error::from)
    }
}

/// An encoded `AdmissionReview` carrying only a response.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: ReviewResponse,
}

/// Serialize `response` as an `AdmissionReview` of the given version.
pub fn encode_review(response: ReviewResponse, version: ReviewVersion) -> Result<Vec<u8>> {
    let review = AdmissionReviewResponse {
        api_version: version.api_version().to_string(),
        kind: ADMISSION_REVIEW_KIND.to_string(),
        response,
    };
    Ok(serde_json::to_vec(&review)?)
}

// The API server expects `patch` as a base64 string.
mod base64_patch {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
