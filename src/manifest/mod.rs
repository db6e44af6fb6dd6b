//! # Manifest Data Model
//!
//! A manifest is a typed declarative document of the shape
//! `{apiVersion, kind, metadata: {namespace, name, logger?}, spec: <kind-specific>}`.
//! Its canonical identity is `apiVersion/kind/namespace/name`, with absent
//! namespace and name defaulting to `"default"`.
//!
//! A [`Reference`] carries the same four identity fields without a spec and is the
//! typed pointer resources use to wire each other together through the registry.

pub mod decoder;
pub mod validate;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

pub use decoder::{decode, substitute_env, Content, Format};
pub use validate::Violations;

/// Namespace and name used when a manifest leaves them empty
pub const DEFAULT_NAME: &str = "default";

/// Namespace and name that select a kind's template on render requests
pub const TEMPLATE_NAME: &str = "template";

// literal patterns; compiling them cannot fail
static TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z]+/[0-9A-Za-z]+$").expect("valid regex"));
static KIND_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z]+$").expect("valid regex"));
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z\-\.]*$").expect("valid regex"));

/// Resource metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
    /// Name of a logger target used by the materialized object
    #[serde(skip_serializing_if = "String::is_empty")]
    pub logger: String,
}

/// Type information shared by manifests and references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

impl TypeMeta {
    /// Registry routing key for this type (`apiVersion/kind`)
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

/// A typed manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest<S> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: S,
}

impl<S: Default> Manifest<S> {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata: Metadata::default(),
            spec: S::default(),
        }
    }
}

impl<S> Manifest<S> {
    pub fn with_name(mut self, namespace: &str, name: &str) -> Self {
        self.metadata.namespace = namespace.to_string();
        self.metadata.name = name.to_string();
        self
    }

    pub fn with_spec(mut self, spec: S) -> Self {
        self.spec = spec;
        self
    }

    /// Canonical identity of this manifest
    pub fn id(&self) -> ResourceId {
        ResourceId::new(
            &self.api_version,
            &self.kind,
            &self.metadata.namespace,
            &self.metadata.name,
        )
    }

    /// Weak reference pointing at this manifest
    pub fn reference(&self) -> Reference {
        Reference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }
}

impl<S: Serialize> Manifest<S> {
    /// Convert into the untyped message form used by the decoder
    pub fn to_value(&self) -> crate::GatewayResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| {
            crate::GatewayError::new(crate::ErrorKind::Marshal, "manifest", e.to_string()).wrap(e)
        })
    }
}

impl<S: DeserializeOwned + Default> Manifest<S> {
    pub fn from_value(value: serde_json::Value) -> crate::GatewayResult<Self> {
        serde_json::from_value(value).map_err(|e| {
            crate::GatewayError::new(crate::ErrorKind::Unmarshal, "manifest", e.to_string()).wrap(e)
        })
    }
}

/// Weak handle to another resource, resolved through the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Reference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Reference {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.api_version, &self.kind, &self.namespace, &self.name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Canonical identity `apiVersion/kind/namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    /// Build an identity, defaulting empty namespace and name to `"default"`
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let or_default = |s: &str| if s.is_empty() { DEFAULT_NAME.to_string() } else { s.to_string() };
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: or_default(namespace),
            name: or_default(name),
        }
    }

    /// Parse an identity key of the form `group/version/kind[/namespace[/name]]`
    pub fn parse(key: &str) -> crate::GatewayResult<Self> {
        let parts: Vec<&str> = key.trim_matches('/').split('/').collect();
        if parts.len() < 3 || parts.len() > 5 {
            return Err(crate::GatewayError::new(
                crate::ErrorKind::Unsupported,
                "manifest",
                format!("`{}` is not a resource identity", key),
            ));
        }
        let api_version = format!("{}/{}", parts[0], parts[1]);
        let namespace = parts.get(3).copied().unwrap_or_default();
        let name = parts.get(4).copied().unwrap_or_default();
        Ok(Self::new(&api_version, parts[2], namespace, name))
    }

    /// True when the identity selects a kind's template
    pub fn is_template(&self) -> bool {
        self.namespace == TEMPLATE_NAME && self.name == TEMPLATE_NAME
    }

    pub fn type_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.api_version, self.kind, self.namespace, self.name)
    }
}

/// Check the identity fields of a manifest against the naming patterns
pub fn validate_identity(
    api_version: &str,
    kind: &str,
    metadata: &Metadata,
    violations: &mut Violations,
) {
    violations.check(
        TYPE_PATTERN.is_match(api_version),
        "apiVersion",
        format!("`{}` does not match {}", api_version, TYPE_PATTERN.as_str()),
    );
    violations.check(
        KIND_PATTERN.is_match(kind),
        "kind",
        format!("`{}` does not match {}", kind, KIND_PATTERN.as_str()),
    );
    violations.check(
        NAME_PATTERN.is_match(&metadata.namespace),
        "metadata.namespace",
        format!("`{}` does not match {}", metadata.namespace, NAME_PATTERN.as_str()),
    );
    violations.check(
        NAME_PATTERN.is_match(&metadata.name),
        "metadata.name",
        format!("`{}` does not match {}", metadata.name, NAME_PATTERN.as_str()),
    );
}

/// Check a reference's identity fields, used for references embedded in specs
pub fn validate_reference(field: &str, reference: &Reference, violations: &mut Violations) {
    violations.check(
        TYPE_PATTERN.is_match(&reference.api_version),
        &format!("{}.apiVersion", field),
        format!("`{}` does not match {}", reference.api_version, TYPE_PATTERN.as_str()),
    );
    violations.check(
        KIND_PATTERN.is_match(&reference.kind),
        &format!("{}.kind", field),
        format!("`{}` does not match {}", reference.kind, KIND_PATTERN.as_str()),
    );
    violations.check(
        NAME_PATTERN.is_match(&reference.namespace) && NAME_PATTERN.is_match(&reference.name),
        &format!("{}.name", field),
        format!("`{}/{}` is not a valid namespace/name", reference.namespace, reference.name),
    );
}
