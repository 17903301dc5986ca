//! Extraction of the Secret under review

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde_json::{Map, Value};

use super::review::{ObjectSource, ReviewRequest};
use crate::error::{Error, Result};

const SECRET_API_VERSION: &str = "v1";
const SECRET_KIND: &str = "Secret";

/// A Secret together with the document it was read from.
///
/// The document is what the patch is computed against, so members this crate
/// does not model survive mutation untouched.
#[derive(Clone, Debug)]
pub struct TargetResource {
    secret: Secret,
    document: Value,
}

impl TargetResource {
    pub fn from_secret(secret: Secret) -> Result<Self> {
        let document = serde_json::to_value(&secret)?;
        Ok(Self { secret, document })
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The document with the given `data` entries replaced by their new values.
    pub fn render(&self, replaced: &BTreeMap<String, ByteString>) -> Result<Value> {
        let mut document = self.document.clone();
        if replaced.is_empty() {
            return Ok(document);
        }

        let Value::Object(root) = &mut document else {
            return Err(Error::Deserialization(
                "secret document is not an object".to_string(),
            ));
        };
        let data = root
            .entry("data")
            .or_insert_with(|| Value::Object(Map::new()));
        if !data.is_object() {
            *data = Value::Object(Map::new());
        }
        if let Value::Object(data) = data {
            for (key, value) in replaced {
                data.insert(key.clone(), serde_json::to_value(value)?);
            }
        }
        Ok(document)
    }
}

/// Pull the v1 Secret out of an admission request.
pub fn extract_secret(request: &ReviewRequest) -> Result<TargetResource> {
    match &request.object {
        ObjectSource::Typed(secret) => TargetResource::from_secret(secret.as_ref().clone()),
        ObjectSource::Raw(raw) => decode_raw(raw),
    }
}

fn decode_raw(raw: &[u8]) -> Result<TargetResource> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Err(kind_missing(&text));
    }

    let document: Value = serde_json::from_slice(raw).map_err(|e| {
        Error::Deserialization(format!(
            "couldn't get version/kind; json parse error: {e}"
        ))
    })?;
    let Value::Object(members) = &document else {
        return Err(Error::Deserialization(
            "couldn't get version/kind; json parse error: expected a JSON object".to_string(),
        ));
    };

    let kind = string_member(members, "kind").ok_or_else(|| kind_missing(&text))?;
    let api_version = string_member(members, "apiVersion").ok_or_else(|| {
        Error::Deserialization(format!("Object 'apiVersion' is missing in '{text}'"))
    })?;
    if api_version != SECRET_API_VERSION || kind != SECRET_KIND {
        return Err(Error::UnexpectedType(format!("{api_version}, Kind={kind}")));
    }

    let secret: Secret = serde_json::from_value(document.clone())
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(TargetResource { secret, document })
}

fn string_member<'a>(members: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    members
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn kind_missing(text: &str) -> Error {
    Error::Deserialization(format!("Object 'Kind' is missing in '{text}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::review::Operation;
    use serde_json::json;

    fn request(object: ObjectSource) -> ReviewRequest {
        ReviewRequest {
            uid: "uid".to_string(),
            kind: None,
            resource: None,
            sub_resource: None,
            operation: Operation::Create,
            namespace: Some("default".to_string()),
            name: "db".to_string(),
            object,
            old_object: None,
            dry_run: false,
        }
    }

    fn raw(value: Value) -> ObjectSource {
        ObjectSource::Raw(serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_extracts_raw_secret() {
        let target = extract_secret(&request(raw(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "db", "creationTimestamp": null},
            "type": "Opaque",
            "data": {"username": "ZGV2LXVzZXI="}
        }))))
        .unwrap();

        let data = target.secret().data.as_ref().unwrap();
        assert_eq!(data["username"].0, b"dev-user");
        assert_eq!(target.document()["metadata"]["creationTimestamp"], Value::Null);
    }

    #[test]
    fn test_typed_secret_is_used_directly() {
        let mut secret = Secret::default();
        secret.data = Some(BTreeMap::from([(
            "k".to_string(),
            ByteString(b"v".to_vec()),
        )]));

        let target =
            extract_secret(&request(ObjectSource::Typed(Box::new(secret.clone())))).unwrap();
        assert_eq!(target.secret(), &secret);
        assert_eq!(target.document()["kind"], "Secret");
        assert_eq!(target.document()["data"]["k"], "dg==");
    }

    #[test]
    fn test_empty_object_is_missing_kind() {
        let err = extract_secret(&request(ObjectSource::Raw(Vec::new()))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "request object is not materialized and decoding the raw object failed: Object 'Kind' is missing in ''"
        );
    }

    #[test]
    fn test_object_without_kind() {
        let body = br#"{"apiVersion":"v1","data":{}}"#.to_vec();
        let err = extract_secret(&request(ObjectSource::Raw(body))).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"request object is not materialized and decoding the raw object failed: Object 'Kind' is missing in '{"apiVersion":"v1","data":{}}'"#
        );
    }

    #[test]
    fn test_object_without_api_version() {
        let body = br#"{"kind":"Secret"}"#.to_vec();
        let err = extract_secret(&request(ObjectSource::Raw(body))).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"request object is not materialized and decoding the raw object failed: Object 'apiVersion' is missing in '{"kind":"Secret"}'"#
        );
    }

    #[test]
    fn test_rejects_other_kinds() {
        let err = extract_secret(&request(raw(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "data": {"a": "b"}
        }))))
        .unwrap_err();
        assert!(matches!(err, Error::UnexpectedType(_)));
        assert_eq!(
            err.to_string(),
            "admission review does not contain a v1 Secret, got v1, Kind=ConfigMap"
        );
    }

    #[test]
    fn test_rejects_schema_mismatch() {
        let err = extract_secret(&request(raw(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "data": {"a": 42}
        }))))
        .unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[test]
    fn test_render_only_touches_replaced_keys() {
        let target = extract_secret(&request(raw(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "db", "creationTimestamp": null},
            "data": {"a": "YQ==", "b": "Yg=="},
            "x-unknown": true
        }))))
        .unwrap();

        let replaced = BTreeMap::from([("b".to_string(), ByteString(b"plain".to_vec()))]);
        let rendered = target.render(&replaced).unwrap();
        assert_eq!(rendered["data"]["a"], "YQ==");
        assert_eq!(rendered["data"]["b"], "cGxhaW4=");
        assert_eq!(rendered["x-unknown"], true);
        assert_eq!(rendered["metadata"]["creationTimestamp"], Value::Null);
    }
}
