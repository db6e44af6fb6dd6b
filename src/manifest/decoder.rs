//! # Manifest Decoder
//!
//! Turns raw documents into canonical typed manifests:
//!
//! 1. Bytes (JSON or YAML) first go through `${VAR}` / `${VAR:-default}` environment
//!    substitution, then are parsed into an untyped message.
//! 2. The untyped message is deep-merged onto the kind's default manifest, so
//!    defaults survive fields the document leaves unset.
//! 3. The merged message is deserialized into the kind's typed manifest.
//!
//! References are passed through untouched: they are identities, not documents.
//!
//! ## Rust Concepts Used
//!
//! - `serde_json::Value` as the untyped message shared by JSON and YAML input
//! - `regex::bytes` so substitution works before the bytes are known to be UTF-8
//! - Generic decoding over any `Serialize + DeserializeOwned` spec type

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::path::Path;
use std::str::FromStr;

use super::{Manifest, Reference, ResourceId, TypeMeta};
use crate::core::error::{ErrorKind, GatewayError, GatewayResult};

/// Content format tags accepted by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// JSON bytes
    Json,
    /// YAML bytes
    Yaml,
    /// An in-memory message
    Message,
    /// A typed reference
    Reference,
}

impl Format {
    /// Pick a format from a file extension
    pub fn from_path(path: &Path) -> GatewayResult<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(GatewayError::new(
                ErrorKind::FormatUnsupported,
                "decoder",
                format!("cannot infer format of `{}`", path.display()),
            )),
        }
    }
}

impl FromStr for Format {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "message" | "protomessage" => Ok(Self::Message),
            "reference" => Ok(Self::Reference),
            other => Err(GatewayError::new(
                ErrorKind::FormatUnsupported,
                "decoder",
                format!("format `{}` is not supported", other),
            )),
        }
    }
}

/// Request content, tagged by its shape
#[derive(Debug, Clone, Default)]
pub enum Content {
    #[default]
    Empty,
    Json(Bytes),
    Yaml(Bytes),
    Message(Value),
    Reference(Reference),
}

impl Content {
    /// Build message content from a typed manifest
    pub fn manifest<S: Serialize>(manifest: &Manifest<S>) -> GatewayResult<Self> {
        Ok(Self::Message(manifest.to_value()?))
    }

    fn shape(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Json(_) => "json bytes",
            Self::Yaml(_) => "yaml bytes",
            Self::Message(_) => "message",
            Self::Reference(_) => "reference",
        }
    }

    /// Peek at the `apiVersion` and `kind` of the content without decoding it fully
    pub fn type_meta(&self) -> GatewayResult<TypeMeta> {
        match self {
            Self::Json(bytes) => Ok(serde_json::from_slice(&substitute_env(bytes))?),
            Self::Yaml(bytes) => Ok(serde_yaml::from_slice(&substitute_env(bytes))?),
            Self::Message(value) => Ok(TypeMeta::deserialize(value)?),
            Self::Reference(reference) => Ok(TypeMeta {
                api_version: reference.api_version.clone(),
                kind: reference.kind.clone(),
            }),
            Self::Empty => Err(GatewayError::nil("decoder", "content is empty")),
        }
    }
}

/// Result of decoding: either a full manifest or a bare reference
#[derive(Debug, Clone)]
pub enum Decoded<S> {
    Manifest(Manifest<S>),
    Reference(Reference),
}

impl<S> Decoded<S> {
    pub fn id(&self) -> ResourceId {
        match self {
            Self::Manifest(manifest) => manifest.id(),
            Self::Reference(reference) => reference.id(),
        }
    }
}

// literal pattern; compiling it cannot fail
static ENV_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex"));

/// Substitute `${VAR}` and `${VAR:-default}` using the process environment
pub fn substitute_env(input: &[u8]) -> Cow<'_, [u8]> {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Substitute placeholders using a custom lookup; unset variables without a
/// default become the empty string
pub fn substitute_env_with<F>(input: &[u8], lookup: F) -> Cow<'_, [u8]>
where
    F: Fn(&str) -> Option<String>,
{
    ENV_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = String::from_utf8_lossy(&caps[1]);
        match lookup(&name) {
            Some(value) => value.into_bytes(),
            None => caps.get(2).map(|m| m.as_bytes().to_vec()).unwrap_or_default(),
        }
    })
}

/// Deep-merge `overlay` onto `base`
///
/// Objects merge key by key, `null` leaves the base untouched, everything else
/// (scalars and arrays) replaces the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

fn merge_onto<S>(default: &Manifest<S>, overlay: Value) -> GatewayResult<Decoded<S>>
where
    S: Serialize + DeserializeOwned + Default,
{
    let mut merged = default.to_value()?;
    merge(&mut merged, overlay);
    Ok(Decoded::Manifest(Manifest::from_value(merged)?))
}

/// Decode content into a canonical typed manifest or a reference
pub fn decode<S>(format: Format, content: Content, default: &Manifest<S>) -> GatewayResult<Decoded<S>>
where
    S: Serialize + DeserializeOwned + Default,
{
    match (format, content) {
        (Format::Json, Content::Json(bytes)) => {
            let value: Value = serde_json::from_slice(&substitute_env(&bytes))?;
            merge_onto(default, value)
        }
        (Format::Yaml, Content::Yaml(bytes)) => {
            let value: Value = serde_yaml::from_slice(&substitute_env(&bytes))?;
            merge_onto(default, value)
        }
        (Format::Message, Content::Message(value)) => merge_onto(default, value),
        (Format::Reference, Content::Reference(reference)) => Ok(Decoded::Reference(reference)),
        (format, content) => Err(GatewayError::new(
            ErrorKind::Assertion,
            "decoder",
            format!("{:?} format cannot carry {} content", format, content.shape()),
        )),
    }
}

/// Split a file into its documents after environment substitution
///
/// YAML files may hold several `---` separated documents; JSON files hold a
/// single object or an array of objects. Empty documents are skipped.
pub fn split_documents(format: Format, input: &[u8]) -> GatewayResult<Vec<Value>> {
    let input = substitute_env(input);
    let documents = match format {
        Format::Json => match serde_json::from_slice::<Value>(&input)? {
            Value::Array(items) => items,
            single => vec![single],
        },
        Format::Yaml => {
            let mut documents = Vec::new();
            for document in serde_yaml::Deserializer::from_slice(&input) {
                documents.push(Value::deserialize(document)?);
            }
            documents
        }
        other => {
            return Err(GatewayError::new(
                ErrorKind::FormatUnsupported,
                "decoder",
                format!("{:?} is not a file format", other),
            ))
        }
    };
    Ok(documents.into_iter().filter(|doc| !doc.is_null()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct ServerSpec {
        addr: String,
        read_timeout: String,
        handlers: Vec<String>,
    }

    impl Default for ServerSpec {
        fn default() -> Self {
            Self {
                addr: ":8080".to_string(),
                read_timeout: "30s".to_string(),
                handlers: Vec::new(),
            }
        }
    }

    fn default_manifest() -> Manifest<ServerSpec> {
        Manifest::new("core/v1", "HTTPServer")
    }

    fn unwrap_manifest(decoded: Decoded<ServerSpec>) -> Manifest<ServerSpec> {
        match decoded {
            Decoded::Manifest(manifest) => manifest,
            Decoded::Reference(_) => panic!("expected manifest"),
        }
    }

    #[test]
    fn test_env_substitution() {
        let lookup = |name: &str| (name == "PORT").then(|| "9090".to_string());
        let out = substitute_env_with(b"addr: :${PORT} host: ${HOST:-localhost} x: ${MISSING}", lookup);
        assert_eq!(&*out, b"addr: :9090 host: localhost x: ".as_slice());
    }

    #[test]
    fn test_merge_keeps_defaults() {
        let mut base = json!({"a": 1, "b": {"c": 2, "d": [1, 2]}, "e": "x"});
        merge(&mut base, json!({"b": {"c": 3, "d": [9]}, "e": null, "f": true}));
        assert_eq!(base, json!({"a": 1, "b": {"c": 3, "d": [9]}, "e": "x", "f": true}));
    }

    #[test]
    fn test_decode_json_merges_default() {
        let bytes = Bytes::from_static(br#"{"apiVersion":"core/v1","kind":"HTTPServer","spec":{"addr":":9000"}}"#);
        let manifest = unwrap_manifest(decode(Format::Json, Content::Json(bytes), &default_manifest()).unwrap());
        assert_eq!(manifest.spec.addr, ":9000");
        assert_eq!(manifest.spec.read_timeout, "30s");
    }

    #[test]
    fn test_decode_without_spec_keeps_default_spec() {
        let bytes = Bytes::from_static(b"apiVersion: core/v1\nkind: HTTPServer\nmetadata:\n  name: bare\n");
        let manifest = unwrap_manifest(decode(Format::Yaml, Content::Yaml(bytes), &default_manifest()).unwrap());
        assert_eq!(manifest.metadata.name, "bare");
        assert_eq!(manifest.spec, ServerSpec::default());
    }

    #[test]
    fn test_decode_yaml() {
        let bytes = Bytes::from_static(b"apiVersion: core/v1\nkind: HTTPServer\nmetadata:\n  name: edge\nspec:\n  handlers: [a, b]\n");
        let manifest = unwrap_manifest(decode(Format::Yaml, Content::Yaml(bytes), &default_manifest()).unwrap());
        assert_eq!(manifest.metadata.name, "edge");
        assert_eq!(manifest.spec.handlers, vec!["a", "b"]);
        assert_eq!(manifest.spec.addr, ":8080");
    }

    #[test]
    fn test_decode_reference_is_passthrough() {
        let reference = Reference::new("core/v1", "HTTPServer", "", "edge");
        let decoded = decode(Format::Reference, Content::Reference(reference.clone()), &default_manifest()).unwrap();
        assert_eq!(decoded.id().to_string(), "core/v1/HTTPServer/default/edge");
    }

    #[test]
    fn test_decode_mismatched_content_is_assertion() {
        let err = decode(Format::Json, Content::Message(json!({})), &default_manifest()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Assertion);
    }

    #[test]
    fn test_unknown_format_tag() {
        let err = "toml".parse::<Format>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::FormatUnsupported);
        assert_eq!("YAML".parse::<Format>().unwrap(), Format::Yaml);
    }

    #[test]
    fn test_split_yaml_documents() {
        let docs = split_documents(Format::Yaml, b"kind: A\n---\nkind: B\n---\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "B");
    }

    #[test]
    fn test_type_meta_peek() {
        let content = Content::Yaml(Bytes::from_static(b"apiVersion: app/v1\nkind: CSRFMiddleware\n"));
        let meta = content.type_meta().unwrap();
        assert_eq!(meta.key(), "app/v1/CSRFMiddleware");
    }
}
