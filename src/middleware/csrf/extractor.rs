//! Client token extractors.
//!
//! Form and JSON extractors read the whole body and put it back on the request, so
//! downstream handlers still see it. A missing field yields an empty string, which
//! never verifies.

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderName, Request};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::spec::DEFAULT_TOKEN_KEY;
use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::Violations;

/// Largest body an extractor buffers
pub const MAX_BODY_SIZE: usize = 4 << 20;

/// Where the client token is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TokenSource {
    #[default]
    Header,
    Form,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractorSpec {
    pub token_source: TokenSource,
    /// Header name, form field or JSONPath expression
    pub source_key: String,
}

impl Default for ExtractorSpec {
    fn default() -> Self {
        Self {
            token_source: TokenSource::Header,
            source_key: DEFAULT_TOKEN_KEY.to_string(),
        }
    }
}

impl ExtractorSpec {
    pub fn validate(&self, field: &str, violations: &mut Violations) {
        let key_field = format!("{}.sourceKey", field);
        match self.token_source {
            TokenSource::Header => violations.check(
                HeaderName::from_bytes(self.source_key.as_bytes()).is_ok(),
                &key_field,
                format!("`{}` is not a header name", self.source_key),
            ),
            TokenSource::Form => violations.check(!self.source_key.is_empty(), &key_field, "must not be empty"),
            TokenSource::Json => violations.check(
                jsonpath_lib::select(&Value::Null, &json_path(&self.source_key)).is_ok(),
                &key_field,
                format!("`{}` is not a JSONPath expression", self.source_key),
            ),
        }
    }
}

fn json_path(key: &str) -> String {
    if key.starts_with('$') {
        key.to_string()
    } else {
        format!("$.{}", key)
    }
}

/// Reads the client-supplied token from a request
#[derive(Debug, Clone)]
pub enum Extractor {
    Header(HeaderName),
    Form(String),
    Json(String),
}

impl Extractor {
    pub fn new(spec: &ExtractorSpec) -> GatewayResult<Self> {
        match spec.token_source {
            TokenSource::Header => HeaderName::from_bytes(spec.source_key.as_bytes())
                .map(Extractor::Header)
                .map_err(|e| {
                    GatewayError::new(ErrorKind::Unsupported, "csrf", format!("invalid header `{}`", spec.source_key))
                        .wrap(e)
                }),
            TokenSource::Form => Ok(Extractor::Form(spec.source_key.clone())),
            TokenSource::Json => Ok(Extractor::Json(json_path(&spec.source_key))),
        }
    }

    /// Extract the token, or an empty string when the request does not carry one
    pub async fn extract(&self, request: &mut Request<Body>) -> GatewayResult<String> {
        match self {
            Extractor::Header(name) => Ok(request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()),
            Extractor::Form(field) => {
                if !has_content_type(request, "application/x-www-form-urlencoded") {
                    return Ok(String::new());
                }
                let body = buffer_body(request).await?;
                Ok(url::form_urlencoded::parse(&body)
                    .find(|(key, _)| key == field)
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default())
            }
            Extractor::Json(path) => {
                if !has_content_type(request, "application/json") {
                    return Ok(String::new());
                }
                let body = buffer_body(request).await?;
                let document: Value = match serde_json::from_slice(&body) {
                    Ok(document) => document,
                    Err(_) => return Ok(String::new()),
                };
                let found = jsonpath_lib::select(&document, path)
                    .map_err(|e| GatewayError::pattern("csrf", format!("{:?}", e)))?
                    .first()
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(found)
            }
        }
    }
}

fn has_content_type(request: &Request<Body>, expected: &str) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Read the body and reinstall it on the request
async fn buffer_body(request: &mut Request<Body>) -> GatewayResult<Bytes> {
    let body = std::mem::replace(request.body_mut(), Body::empty());
    let bytes = to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| GatewayError::io("csrf", "failed to read request body").wrap(e))?;
    *request.body_mut() = Body::from(bytes.clone());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content_type: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_form_extractor_restores_body() {
        let extractor = Extractor::Form("__csrfToken".to_string());
        let mut req = request("application/x-www-form-urlencoded; charset=utf-8", "a=1&__csrfToken=abc%21");

        assert_eq!(extractor.extract(&mut req).await.unwrap(), "abc!");

        let body = to_bytes(req.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"a=1&__csrfToken=abc%21");
    }

    #[tokio::test]
    async fn test_json_extractor() {
        let extractor = Extractor::new(&ExtractorSpec {
            token_source: TokenSource::Json,
            source_key: "meta.token".to_string(),
        })
        .unwrap();
        let mut req = request("application/json", r#"{"meta":{"token":"t0k"}}"#);
        assert_eq!(extractor.extract(&mut req).await.unwrap(), "t0k");

        let mut req = request("application/json", r#"{"meta":{}}"#);
        assert_eq!(extractor.extract(&mut req).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_wrong_content_type_yields_empty() {
        let extractor = Extractor::Form("__csrfToken".to_string());
        let mut req = request("text/plain", "__csrfToken=abc");
        assert_eq!(extractor.extract(&mut req).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_header_extractor() {
        let extractor = Extractor::new(&ExtractorSpec::default()).unwrap();
        let mut req = Request::builder()
            .header("__csrfToken", "xyz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extractor.extract(&mut req).await.unwrap(), "xyz");
    }
}
