use crate::models::ValidationPolicy;
use crate::services::fetch::FetchTimeouts;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Settings consumed by the resolution engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Allowed file extensions with leading dot; empty accepts any (default: empty)
    pub allowed_extensions: Vec<String>,

    /// Read timeout for remote fetches in milliseconds (default: 5000)
    pub timeout_millis: u64,

    /// Connect timeout in milliseconds (default: same as `timeout_millis`)
    pub connect_timeout_millis: Option<u64>,

    /// Cap on a whole body download in milliseconds (default: none, only the
    /// per-chunk read timeout applies)
    pub transfer_timeout_millis: Option<u64>,

    /// Turn failed references into inactive outputs instead of failing (default: false)
    pub disable_output_if_missing: bool,

    /// Store fetched files under the persist directory (default: false)
    pub persist_locally: bool,

    /// Also delete persisted files on reset/dispose (default: false)
    pub release_persisted_on_reset: bool,

    /// Root for persisted files (default: `<workflow dir>/.uploads`)
    pub persist_dir: Option<PathBuf>,

    /// Root for anonymous temp files (default: system temp dir)
    pub temp_dir: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: Vec::new(),
            timeout_millis: 5000,
            connect_timeout_millis: None,
            transfer_timeout_millis: None,
            disable_output_if_missing: false,
            persist_locally: false,
            release_persisted_on_reset: false,
            persist_dir: None,
            temp_dir: None,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_extensions),

            timeout_millis: env::var("TIMEOUT_MILLIS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.timeout_millis),

            connect_timeout_millis: env::var("CONNECT_TIMEOUT_MILLIS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(default.connect_timeout_millis),

            transfer_timeout_millis: env::var("TRANSFER_TIMEOUT_MILLIS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(default.transfer_timeout_millis),

            disable_output_if_missing: env::var("DISABLE_OUTPUT_IF_MISSING")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.disable_output_if_missing),

            persist_locally: env::var("PERSIST_LOCALLY")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.persist_locally),

            release_persisted_on_reset: env::var("RELEASE_PERSISTED_ON_RESET")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.release_persisted_on_reset),

            persist_dir: env::var("PERSIST_DIR").ok().map(PathBuf::from),

            temp_dir: env::var("TEMP_DIR").ok().map(PathBuf::from),
        }
    }

    /// Create config for development (short timeouts, lenient outputs)
    pub fn development() -> Self {
        Self {
            timeout_millis: 1000,
            connect_timeout_millis: Some(500),
            disable_output_if_missing: true,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> ValidationPolicy {
        ValidationPolicy::from_extensions(&self.allowed_extensions)
    }

    pub fn timeouts(&self) -> FetchTimeouts {
        let timeouts = FetchTimeouts::new(
            self.connect_timeout_millis.unwrap_or(self.timeout_millis),
            self.timeout_millis,
        );
        match self.transfer_timeout_millis {
            Some(ms) => timeouts.with_transfer_limit(ms),
            None => timeouts,
        }
    }
}
