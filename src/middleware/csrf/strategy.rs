//! CSRF protection strategies.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Request};
use regex::Regex;
use std::sync::Arc;

use super::extractor::Extractor;
use super::spec::{StrategySpec, DEFAULT_TOKEN_KEY};
use super::token::TokenIssuer;
use crate::core::error::{ErrorKind, GatewayError, GatewayResult, HttpError};
use crate::middleware::session::{read_cookie, CookieAttributes, Session, SessionHandle};

/// Session key holding the synchronizer token
pub const SESSION_TOKEN_KEY: &str = DEFAULT_TOKEN_KEY;

fn invalid(description: &str) -> HttpError {
    HttpError::forbidden(GatewayError::new(ErrorKind::InvalidToken, "csrf", description))
}

fn require_session(session: Option<Arc<dyn Session>>) -> Result<Arc<dyn Session>, HttpError> {
    session.ok_or_else(|| {
        HttpError::internal(GatewayError::new(
            ErrorKind::SessionNotFound,
            "csrf",
            "no session on the request",
        ))
    })
}

#[derive(Debug, Clone)]
pub enum Strategy {
    CustomHeader {
        header: HeaderName,
        allowed: Option<Regex>,
    },
    DoubleSubmit {
        cookie_name: String,
        extractor: Extractor,
        cookie: CookieAttributes,
    },
    Synchronizer {
        extractor: Extractor,
    },
}

impl Strategy {
    pub fn new(spec: &StrategySpec) -> GatewayResult<Self> {
        let header_name = |name: &str| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                GatewayError::new(ErrorKind::Unsupported, "csrf", format!("invalid header `{}`", name)).wrap(e)
            })
        };
        match spec {
            StrategySpec::CustomRequestHeader(custom) => {
                let allowed = if custom.allowed_pattern.is_empty() {
                    None
                } else {
                    Some(Regex::new(&custom.allowed_pattern).map_err(|e| {
                        GatewayError::pattern("csrf", format!("allowedPattern `{}`", custom.allowed_pattern)).wrap(e)
                    })?)
                };
                Ok(Self::CustomHeader {
                    header: header_name(&custom.header_name)?,
                    allowed,
                })
            }
            StrategySpec::DoubleSubmitCookies(double) => Ok(Self::DoubleSubmit {
                cookie_name: double.cookie_name.clone(),
                extractor: Extractor::new(&double.source)?,
                cookie: double.cookie.clone(),
            }),
            StrategySpec::SynchronizerToken(sync) => Ok(Self::Synchronizer {
                extractor: Extractor::new(&sync.source)?,
            }),
        }
    }

    /// Verify the request and return its token
    pub async fn get(&self, request: &mut Request<Body>, issuer: &TokenIssuer) -> Result<String, HttpError> {
        match self {
            Self::CustomHeader { header, allowed } => {
                let value = request
                    .headers()
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if value.is_empty() {
                    return Err(invalid("custom header is missing"));
                }
                if allowed.as_ref().is_some_and(|pattern| pattern.is_match(&value)) {
                    return Ok(value);
                }
                if issuer.verify(&value) {
                    Ok(value)
                } else {
                    Err(invalid("custom header carries no valid token"))
                }
            }
            Self::DoubleSubmit {
                cookie_name,
                extractor,
                ..
            } => {
                let cookie = read_cookie(request.headers(), cookie_name).unwrap_or_default();
                if cookie.is_empty() {
                    return Err(invalid("token cookie is missing"));
                }
                let client = extractor
                    .extract(request)
                    .await
                    .map_err(HttpError::forbidden)?;
                if client != cookie || !issuer.verify(&client) {
                    return Err(invalid("submitted token does not match cookie"));
                }
                Ok(cookie)
            }
            Self::Synchronizer { extractor } => {
                let session = require_session(SessionHandle::from_request(request))?;
                let server = session.get(SESSION_TOKEN_KEY).await.unwrap_or_default();
                let client = extractor
                    .extract(request)
                    .await
                    .map_err(HttpError::forbidden)?;
                if server.is_empty() || client != server || !issuer.verify(&client) {
                    return Err(invalid("submitted token does not match session"));
                }
                Ok(client)
            }
        }
    }

    /// The still-valid token the client already holds, if any
    ///
    /// Takes the request headers and session rather than the request so the
    /// returned future stays `Send`.
    pub async fn current(
        &self,
        headers: &HeaderMap,
        session: Option<Arc<dyn Session>>,
        issuer: &TokenIssuer,
    ) -> Option<String> {
        let token = match self {
            Self::CustomHeader { header, .. } => headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            Self::DoubleSubmit { cookie_name, .. } => read_cookie(headers, cookie_name),
            Self::Synchronizer { .. } => match session {
                Some(session) => session.get(SESSION_TOKEN_KEY).await,
                None => None,
            },
        }?;
        issuer.verify(&token).then_some(token)
    }

    /// Hand the token to the client side of the strategy
    pub async fn set(
        &self,
        session: Option<Arc<dyn Session>>,
        response_headers: &mut HeaderMap,
        token: &str,
    ) -> Result<(), HttpError> {
        match self {
            Self::CustomHeader { .. } => Ok(()),
            Self::DoubleSubmit {
                cookie_name, cookie, ..
            } => {
                let value = cookie.render(cookie_name, token).ok_or_else(|| {
                    HttpError::internal(GatewayError::new(
                        ErrorKind::TokenMint,
                        "csrf",
                        "token cookie is not a valid header value",
                    ))
                })?;
                response_headers.append(header::SET_COOKIE, value);
                Ok(())
            }
            Self::Synchronizer { .. } => require_session(session)?
                .set(SESSION_TOKEN_KEY, token.to_string())
                .await
                .map_err(HttpError::internal),
        }
    }
}
