//! Manifest spec of `app/v1/CSRFMiddleware`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use axum::http::{HeaderName, Method};
use serde::{Deserialize, Serialize};

use super::extractor::ExtractorSpec;
use super::token::HashAlg;
use crate::manifest::{validate_reference, Reference, Violations};
use crate::middleware::session::CookieAttributes;

/// Cookie, form field, header and session key used when none is configured
pub const DEFAULT_TOKEN_KEY: &str = "__csrfToken";

/// Header checked by the default custom-header strategy
pub const DEFAULT_HEADER_NAME: &str = "X-Requested-With";

pub const DEFAULT_SEED_SIZE: usize = 20;

pub const MAX_SEED_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomHeaderSpec {
    pub header_name: String,
    /// Values matching this regex are accepted without token verification
    pub allowed_pattern: String,
}

impl Default for CustomHeaderSpec {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            allowed_pattern: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DoubleSubmitSpec {
    pub cookie_name: String,
    pub source: ExtractorSpec,
    pub cookie: CookieAttributes,
}

impl Default for DoubleSubmitSpec {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_TOKEN_KEY.to_string(),
            source: ExtractorSpec::default(),
            // scripts echo the cookie back in a header
            cookie: CookieAttributes {
                http_only: false,
                same_site: "Strict".to_string(),
                ..CookieAttributes::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SynchronizerSpec {
    pub source: ExtractorSpec,
}

/// Exactly one protection strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategySpec {
    CustomRequestHeader(CustomHeaderSpec),
    DoubleSubmitCookies(DoubleSubmitSpec),
    SynchronizerToken(SynchronizerSpec),
}

impl StrategySpec {
    /// Strategy installed when none is selected: any non-empty `X-Requested-With`
    pub fn fallback() -> Self {
        Self::CustomRequestHeader(CustomHeaderSpec {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            allowed_pattern: "^.+$".to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CsrfSpec {
    pub strategy: Option<StrategySpec>,
    /// Methods that require a token
    pub protected_methods: Vec<String>,
    /// Path regexes that require a token; empty protects every path
    pub protected_patterns: Vec<String>,
    /// Patterns served by the token issue endpoint
    pub patterns: Vec<String>,
    /// Base64 HMAC secret; a host-derived secret is used when empty
    pub secret: String,
    pub seed_size: usize,
    pub hash_alg: HashAlg,
    /// Header carrying the verified token to upstreams
    pub proxy_header_name: String,
    /// Mint a new token on every issue request
    pub issue_new: bool,
    pub error_handler: Option<Reference>,
}

impl CsrfSpec {
    pub fn fill_defaults(&mut self) {
        if self.strategy.is_none() {
            self.strategy = Some(StrategySpec::fallback());
        }
        if self.protected_methods.is_empty() {
            self.protected_methods = ["POST", "PUT", "PATCH", "DELETE"]
                .into_iter()
                .map(String::from)
                .collect();
        }
        if self.seed_size == 0 {
            self.seed_size = DEFAULT_SEED_SIZE;
        }
    }

    pub fn validate(&self, violations: &mut Violations) {
        violations.check(
            (1..=MAX_SEED_SIZE).contains(&self.seed_size),
            "spec.seedSize",
            format!("must be between 1 and {}", MAX_SEED_SIZE),
        );
        violations.check(
            self.secret.is_empty() || BASE64.decode(&self.secret).is_ok(),
            "spec.secret",
            "must be base64 encoded",
        );
        for (i, method) in self.protected_methods.iter().enumerate() {
            violations.check(
                Method::from_bytes(method.as_bytes()).is_ok(),
                &format!("spec.protectedMethods[{}]", i),
                format!("`{}` is not an HTTP method", method),
            );
        }
        violations.check(
            self.proxy_header_name.is_empty()
                || HeaderName::from_bytes(self.proxy_header_name.as_bytes()).is_ok(),
            "spec.proxyHeaderName",
            format!("`{}` is not a header name", self.proxy_header_name),
        );
        if let Some(handler) = &self.error_handler {
            validate_reference("spec.errorHandler", handler, violations);
        }
        match &self.strategy {
            Some(StrategySpec::CustomRequestHeader(custom)) => violations.check(
                HeaderName::from_bytes(custom.header_name.as_bytes()).is_ok(),
                "spec.strategy.customRequestHeader.headerName",
                format!("`{}` is not a header name", custom.header_name),
            ),
            Some(StrategySpec::DoubleSubmitCookies(double)) => {
                violations.check(
                    !double.cookie_name.is_empty(),
                    "spec.strategy.doubleSubmitCookies.cookieName",
                    "must not be empty",
                );
                double.source.validate("spec.strategy.doubleSubmitCookies.source", violations);
                double.cookie.validate("spec.strategy.doubleSubmitCookies.cookie", violations);
            }
            Some(StrategySpec::SynchronizerToken(sync)) => {
                sync.source.validate("spec.strategy.synchronizerToken.source", violations)
            }
            None => violations.push("spec.strategy", "a strategy is required"),
        }
    }
}
