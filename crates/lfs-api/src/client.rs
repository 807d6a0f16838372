//! Batch endpoint client.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::backends::ReqwestClient;
use crate::error::{BatchError, BatchStatus, TransferError};
use crate::http_client::{HttpClient, HttpRequest};
use crate::models::{BatchRequest, BatchResponse};

/// Media type of batch request and response bodies.
pub const MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// Client for one or more batch endpoints.
///
/// Generic over the HTTP backend so tests can script the exchange.
pub struct LfsClient<C: HttpClient> {
    http: C,
}

impl LfsClient<ReqwestClient> {
    /// Create a client backed by [`reqwest`] with the given deadline.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: ReqwestClient::new(timeout),
        }
    }
}

impl<C: HttpClient> LfsClient<C> {
    /// Create a client over an existing HTTP backend.
    pub fn with_client(http: C) -> Self {
        Self { http }
    }

    /// Issue one batch exchange against `endpoint`.
    ///
    /// A non-success status maps to [`BatchError::Status`] with the
    /// taxonomy meaning attached. A success body must carry an
    /// `objects` array; a top-level `message` is an error even on 2xx.
    pub async fn batch(
        &self,
        endpoint: &str,
        request: &BatchRequest,
        authorization: Option<&str>,
    ) -> Result<BatchResponse, BatchError> {
        let body = serde_json::to_vec(request)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(MEDIA_TYPE));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE));
        if let Some(auth) = authorization {
            let value = HeaderValue::try_from(auth)
                .map_err(|_| BatchError::Protocol("authorization header not sendable".to_owned()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let response = self
            .http
            .send(HttpRequest {
                method: Method::POST,
                url: endpoint.to_owned(),
                headers,
                body: Some(Bytes::from(body)),
            })
            .await?;

        if !response.status.is_success() {
            return Err(BatchError::Status {
                status: response.status.as_u16(),
                meaning: BatchStatus::from_status(response.status),
                message: extract_message(&response.body),
            });
        }

        let value: serde_json::Value = serde_json::from_slice(&response.body)?;
        if let Some(message) = value.get("message").and_then(serde_json::Value::as_str) {
            return Err(BatchError::Server(message.to_owned()));
        }
        if !value.get("objects").is_some_and(serde_json::Value::is_array) {
            return Err(BatchError::Protocol(
                "response is missing the objects array".to_owned(),
            ));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Ranged download of `len` bytes at `offset` from a granted URL.
    ///
    /// Servers that ignore the range header and answer 200 with the
    /// whole object get the requested window sliced out client-side.
    pub async fn get_range(
        &self,
        href: &str,
        extra_headers: &HashMap<String, String>,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, TransferError> {
        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut headers = HeaderMap::new();
        for (name, value) in extra_headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| TransferError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| TransferError::InvalidHeader(value.clone()))?;
            headers.insert(name, value);
        }
        let end = offset + u64::from(len) - 1;
        let range = HeaderValue::try_from(format!("bytes={offset}-{end}"))
            .map_err(|_| TransferError::InvalidHeader("range".to_owned()))?;
        headers.insert(RANGE, range);

        let response = self
            .http
            .send(HttpRequest {
                method: Method::GET,
                url: href.to_owned(),
                headers,
                body: None,
            })
            .await?;

        match response.status {
            StatusCode::PARTIAL_CONTENT => Ok(response.body),
            StatusCode::OK => {
                let body = response.body;
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= body.len() {
                    return Ok(Bytes::new());
                }
                let end = (start + len as usize).min(body.len());
                Ok(body.slice(start..end))
            }
            status => Err(TransferError::Status(status.as_u16())),
        }
    }
}

/// Pull a top-level `message` out of an error body, if there is one.
fn extract_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpClientError;
    use crate::http_client::HttpResponse;
    use crate::models::{Operation, RequestObject};
    use std::sync::Mutex;

    /// Backend that answers every request with a canned response and
    /// records what it was asked to send.
    struct CannedHttp {
        status: StatusCode,
        body: &'static str,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl CannedHttp {
        fn new(status: StatusCode, body: &'static str) -> Self {
            Self {
                status,
                body,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for &CannedHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }
    }

    fn download_request() -> BatchRequest {
        BatchRequest {
            operation: Operation::Download,
            transfers: None,
            reference: None,
            objects: vec![RequestObject {
                oid: "deadbeef".to_owned(),
                size: 42,
            }],
            hash_algo: None,
        }
    }

    #[tokio::test]
    async fn batch_sends_media_type_and_authorization() {
        let http = CannedHttp::new(StatusCode::OK, r#"{"objects": []}"#);
        let client = LfsClient::with_client(&http);

        client
            .batch("https://example.com/batch", &download_request(), Some("Basic dXNlcjpwdw=="))
            .await
            .unwrap();

        let requests = http.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[ACCEPT], MEDIA_TYPE);
        assert_eq!(request.headers[CONTENT_TYPE], MEDIA_TYPE);
        assert_eq!(request.headers[AUTHORIZATION], "Basic dXNlcjpwdw==");
    }

    #[tokio::test]
    async fn batch_maps_status_to_taxonomy() {
        let http = CannedHttp::new(
            StatusCode::UNAUTHORIZED,
            r#"{"message": "auth required"}"#,
        );
        let client = LfsClient::with_client(&http);

        let err = client
            .batch("https://example.com/batch", &download_request(), None)
            .await
            .unwrap_err();

        match err {
            BatchError::Status {
                status,
                meaning,
                message,
            } => {
                assert_eq!(status, 401);
                assert_eq!(meaning, BatchStatus::CredentialsRequired);
                assert_eq!(message.as_deref(), Some("auth required"));
            }
            other => panic!("expected Status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn batch_treats_top_level_message_as_error() {
        let http = CannedHttp::new(
            StatusCode::OK,
            r#"{"message": "temporarily out of service", "objects": []}"#,
        );
        let client = LfsClient::with_client(&http);

        let err = client
            .batch("https://example.com/batch", &download_request(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Server(m) if m == "temporarily out of service"));
    }

    #[tokio::test]
    async fn batch_rejects_missing_objects_array() {
        let http = CannedHttp::new(StatusCode::OK, r#"{"transfer": "basic"}"#);
        let client = LfsClient::with_client(&http);

        let err = client
            .batch("https://example.com/batch", &download_request(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Protocol(_)));
    }

    #[tokio::test]
    async fn get_range_sends_byte_range_header() {
        let http = CannedHttp::new(StatusCode::PARTIAL_CONTENT, "cdef");
        let client = LfsClient::with_client(&http);

        let body = client
            .get_range("https://cdn.example.com/x", &HashMap::new(), 2, 4)
            .await
            .unwrap();
        assert_eq!(&body[..], b"cdef");

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].headers[RANGE], "bytes=2-5");
    }

    #[tokio::test]
    async fn get_range_slices_full_body_responses() {
        let http = CannedHttp::new(StatusCode::OK, "abcdefgh");
        let client = LfsClient::with_client(&http);

        let body = client
            .get_range("https://cdn.example.com/x", &HashMap::new(), 2, 4)
            .await
            .unwrap();
        assert_eq!(&body[..], b"cdef");
    }
}
