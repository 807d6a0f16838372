//! Wire models for the batch API.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone as _, Utc};
use serde::{Deserialize, Serialize};

/// The operation requested from a batch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Request download URLs for the listed objects.
    Download,
}

/// A batch request body.
///
/// Optional fields are omitted from the serialized body entirely when
/// absent; the protocol does not accept `null` placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// The requested operation.
    pub operation: Operation,
    /// Transfer adapters the client understands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    /// The ref the objects belong to.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<BatchRef>,
    /// The objects being requested.
    pub objects: Vec<RequestObject>,
    /// Digest algorithm of the listed oids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

/// A ref name carried in a batch request.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRef {
    /// Fully-qualified ref name.
    pub name: String,
}

/// One requested object.
#[derive(Debug, Clone, Serialize)]
pub struct RequestObject {
    /// Content digest, without the algorithm prefix.
    pub oid: String,
    /// Declared object size in bytes.
    pub size: u64,
}

fn default_transfer() -> String {
    "basic".to_owned()
}

fn default_hash_algo() -> String {
    "sha256".to_owned()
}

/// A batch response body.
#[derive(Debug, Deserialize)]
pub struct BatchResponse {
    /// Negotiated transfer adapter. Servers may omit it.
    #[serde(default = "default_transfer")]
    pub transfer: String,
    /// Digest algorithm of the returned oids. Servers may omit it.
    #[serde(default = "default_hash_algo")]
    pub hash_algo: String,
    /// Per-object results.
    pub objects: Vec<ResponseObject>,
}

/// One object's result within a batch response.
#[derive(Debug, Deserialize)]
pub struct ResponseObject {
    /// Content digest, matching a requested oid.
    pub oid: String,
    /// Object size as reported by the server.
    #[serde(default)]
    pub size: Option<u64>,
    /// Per-object error; mutually exclusive with `actions`.
    #[serde(default)]
    pub error: Option<ObjectError>,
    /// Available transfer actions.
    #[serde(default)]
    pub actions: Option<Actions>,
}

/// Per-object error from a batch response.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectError {
    /// Status-taxonomy code for this object.
    #[serde(default)]
    pub code: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Transfer actions offered for one object.
#[derive(Debug, Deserialize)]
pub struct Actions {
    /// The download action, when the object is retrievable.
    #[serde(default)]
    pub download: Option<DownloadAction>,
}

/// A time-limited download grant.
#[derive(Debug, Deserialize)]
pub struct DownloadAction {
    /// URL to fetch the object's bytes from.
    pub href: String,
    /// Extra headers to send with the download request.
    #[serde(default)]
    pub header: HashMap<String, String>,
    /// When the grant expires. Absent means it never does.
    #[serde(default)]
    pub expires_at: Option<ExpiresAt>,
}

/// Grant expiry as sent by servers: an RFC 3339 string or epoch seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpiresAt {
    /// RFC 3339 timestamp.
    Timestamp(String),
    /// Seconds since the UNIX epoch.
    Epoch(i64),
}

impl ExpiresAt {
    /// Parse into a UTC instant. Unparseable values yield `None`.
    #[must_use]
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Self::Epoch(secs) => Utc.timestamp_opt(*secs, 0).single(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_absent_optional_fields() {
        let request = BatchRequest {
            operation: Operation::Download,
            transfers: None,
            reference: None,
            objects: vec![RequestObject {
                oid: "deadbeef".to_owned(),
                size: 42,
            }],
            hash_algo: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "operation": "download",
                "objects": [{"oid": "deadbeef", "size": 42}],
            })
        );
    }

    #[test]
    fn request_serializes_ref_under_protocol_name() {
        let request = BatchRequest {
            operation: Operation::Download,
            transfers: Some(vec!["basic".to_owned()]),
            reference: Some(BatchRef {
                name: "refs/heads/main".to_owned(),
            }),
            objects: Vec::new(),
            hash_algo: Some("sha256".to_owned()),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["ref"]["name"], "refs/heads/main");
        assert_eq!(json["transfers"][0], "basic");
        assert_eq!(json["hash_algo"], "sha256");
    }

    #[test]
    fn response_defaults_transfer_and_hash_algo() {
        let response: BatchResponse =
            serde_json::from_str(r#"{"objects": []}"#).unwrap();
        assert_eq!(response.transfer, "basic");
        assert_eq!(response.hash_algo, "sha256");
    }

    #[test]
    fn response_object_with_error_parses() {
        let response: BatchResponse = serde_json::from_str(
            r#"{"objects": [{"oid": "abc", "error": {"code": 404, "message": "not found"}}]}"#,
        )
        .unwrap();
        let object = &response.objects[0];
        let error = object.error.as_ref().unwrap();
        assert_eq!(error.code, Some(404));
        assert_eq!(error.message, "not found");
        assert!(object.actions.is_none());
    }

    #[test]
    fn expires_at_accepts_both_encodings() {
        let iso: ExpiresAt =
            serde_json::from_str(r#""2030-01-02T03:04:05Z""#).unwrap();
        let epoch: ExpiresAt = serde_json::from_str("1893553445").unwrap();

        let iso_utc = iso.to_utc().unwrap();
        let epoch_utc = epoch.to_utc().unwrap();
        assert_eq!(iso_utc.timestamp(), 1893553445);
        assert_eq!(iso_utc, epoch_utc);
    }

    #[test]
    fn unparseable_expiry_yields_none() {
        assert!(ExpiresAt::Timestamp("soon".to_owned()).to_utc().is_none());
    }
}
