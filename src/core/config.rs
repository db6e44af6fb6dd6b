//! # Configuration Module
//!
//! Process-level settings for the gateway binary: logging, registry debug level,
//! the entrypoint to run, the shutdown grace period and the manifest files to load.
//! Everything else is declared in resource manifests.
//!
//! Values come from defaults, then `GATEWAY_*` environment variables, then CLI
//! flags, and are validated once at the end.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

/// Identity run when none is configured
pub const DEFAULT_ENTRYPOINT: &str = "core/v1/Entrypoint/default/default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(GatewayError::config(format!("unknown log format `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// `EnvFilter` directive, e.g. `info` or `resource_gateway=debug`
    pub log_level: String,
    pub log_format: LogFormat,
    /// Registry verbosity: 1 logs manifests at create time, 2 every request
    pub debug_level: u8,
    pub entrypoint: String,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub manifests: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            debug_level: 0,
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            shutdown_timeout: Duration::from_secs(30),
            manifests: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied and validated
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` environment variables
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.log_format = format.parse()?;
        }

        if let Some(debug) = lookup("GATEWAY_DEBUG") {
            self.debug_level = debug
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_DEBUG: {}", e)))?;
        }

        if let Some(entrypoint) = lookup("GATEWAY_ENTRYPOINT") {
            self.entrypoint = entrypoint;
        }

        if let Some(timeout) = lookup("GATEWAY_SHUTDOWN_TIMEOUT") {
            self.shutdown_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SHUTDOWN_TIMEOUT: {}", e)))?;
        }

        if let Some(manifests) = lookup("GATEWAY_MANIFESTS") {
            self.manifests = manifests
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        Ok(())
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.debug_level > 3 {
            errors.push(format!("debug level must be between 0 and 3, got {}", self.debug_level));
        }

        if self.log_level.trim().is_empty() {
            errors.push("log level cannot be empty".to_string());
        }

        if crate::manifest::ResourceId::parse(&self.entrypoint).is_err() {
            errors.push(format!("entrypoint `{}` is not a resource identity", self.entrypoint));
        }

        if self.shutdown_timeout.is_zero() {
            errors.push("shutdown timeout must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )))
        }
    }
}
