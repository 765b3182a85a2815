//! Runner configuration.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//!
//! ```toml
//! timeout_ms = 10_000
//! max_heap_size = 134_217_728
//! max_messages = 5_000
//! check_syntax = true
//! registry_url = "https://registry.npmjs.org"
//! allowed_origins = ["https://unpkg.com"]
//!
//! [[resolvers]]
//! name = "jsdelivr"
//! template = "https://cdn.jsdelivr.net/npm/{package}/+esm"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, RunnerError};
use crate::resolver::{default_endpoints, CdnEndpoint};

/// Configuration for the runner and its sandboxes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// CDN endpoints, tried in order for every import.
    pub resolvers: Vec<CdnEndpoint>,
    /// Wall-clock limit for one run in milliseconds (None = unlimited).
    pub timeout_ms: Option<u64>,
    /// Maximum V8 heap size in bytes (None = V8 default).
    pub max_heap_size: Option<usize>,
    /// Maximum number of log/error messages accepted per run.
    pub max_messages: usize,
    /// Compile the rewritten program before starting a sandbox.
    pub check_syntax: bool,
    /// Extra origins the module loader may fetch from, besides the resolvers'.
    pub allowed_origins: Vec<String>,
    /// NPM registry used to seed starter code from READMEs.
    pub registry_url: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            resolvers: default_endpoints(),
            timeout_ms: Some(30_000),              // 30 seconds
            max_heap_size: Some(64 * 1024 * 1024), // 64MB
            max_messages: 10_000,
            check_syntax: true,
            allowed_origins: vec![],
            registry_url: String::from("https://registry.npmjs.org"),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| RunnerError::ConfigIo {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RunnerError::ConfigParse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RunnerError::InvalidConfig { reason };

        if self.resolvers.is_empty() {
            return Err(invalid("at least one resolver is required".to_string()));
        }
        for endpoint in &self.resolvers {
            endpoint.validate().map_err(invalid)?;
        }
        if self.max_messages == 0 {
            return Err(invalid("max_messages must be greater than zero".to_string()));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms must be greater than zero".to_string()));
        }
        for origin in &self.allowed_origins {
            Url::parse(origin)
                .map_err(|e| invalid(format!("allowed origin '{}' is not a URL: {}", origin, e)))?;
        }
        Url::parse(&self.registry_url).map_err(|e| {
            invalid(format!(
                "registry_url '{}' is not a URL: {}",
                self.registry_url, e
            ))
        })?;
        Ok(())
    }

    /// Origins the module loader may fetch from.
    pub fn module_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .resolvers
            .iter()
            .filter_map(|endpoint| endpoint.origin().ok())
            .collect();
        for origin in &self.allowed_origins {
            if let Ok(url) = Url::parse(origin) {
                origins.push(url.origin().ascii_serialization());
            }
        }
        origins.sort();
        origins.dedup();
        origins
    }
}
