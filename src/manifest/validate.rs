//! Validation helpers.
//!
//! Descriptors collect field violations into [`Violations`] and turn them into a
//! single `proto-validate` error whose detail is the offending manifest rendered
//! with line numbers, so operators can find the field in their document.

use serde::Serialize;

use crate::core::error::{ErrorKind, GatewayError, GatewayResult};

/// Ordered list of `(field, reason)` violations
#[derive(Debug, Default, Clone)]
pub struct Violations {
    items: Vec<(String, String)>,
}

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation unless `ok` holds
    pub fn check<R: Into<String>>(&mut self, ok: bool, field: &str, reason: R) {
        if !ok {
            self.push(field, reason);
        }
    }

    pub fn push<R: Into<String>>(&mut self, field: &str, reason: R) {
        self.items.push((field.to_string(), reason.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.items.iter()
    }

    /// Turn collected violations into a `proto-validate` error carrying the
    /// rendered manifest as detail
    pub fn finish<T: Serialize>(self, manifest: &T) -> GatewayResult<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        let reasons = self
            .items
            .iter()
            .map(|(field, reason)| format!("{}: {}", field, reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(GatewayError::new(ErrorKind::ProtoValidate, "manifest", reasons)
            .with_detail(render_with_line_numbers(manifest)))
    }
}

/// Render a value as pretty JSON prefixed with line numbers
pub fn render_with_line_numbers<T: Serialize>(value: &T) -> String {
    let rendered = match serde_json::to_string_pretty(value) {
        Ok(text) => text,
        Err(e) => return format!("<unrenderable manifest: {}>", e),
    };
    rendered
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_violations_pass() {
        assert!(Violations::new().finish(&json!({})).is_ok());
    }

    #[test]
    fn test_violations_render_detail() {
        let mut violations = Violations::new();
        violations.check(false, "spec.seedSize", "must be between 1 and 128");
        violations.check(true, "spec.hashAlg", "never recorded");
        assert_eq!(violations.len(), 1);

        let err = violations.finish(&json!({"spec": {"seedSize": 0}})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtoValidate);
        assert!(err.description.contains("spec.seedSize"));
        assert!(err.detail.starts_with("   1 | {"));
        assert!(err.detail.contains("\"seedSize\": 0"));
    }
}
