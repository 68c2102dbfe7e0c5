use crate::error::RunnerError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// nats-server release used when no version is requested
pub const DEFAULT_NATS_VERSION: &str = "2.10.22";

/// Base URL of the published nats-server release archives
pub const DEFAULT_DOWNLOAD_BASE_URL: &str = "https://github.com/nats-io/nats-server/releases/download";

/// Options for a disposable nats-server instance
///
/// Every field is optional. Ports left unset are allocated from the OS,
/// directories left unset are derived from well-known locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option), default)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerOptions {
    /// Client port, allocated when unset
    pub port: Option<i32>,

    /// HTTP monitoring port, allocated when unset
    pub monitoring_port: Option<i32>,

    /// Enable JetStream persistence, stored in the data directory
    pub jetstream: bool,

    /// Pass `-D` to the server
    pub debug: bool,

    /// Pass `-V` to the server
    pub trace: bool,

    /// Arguments appended verbatim after the generated ones
    #[builder(setter(custom))]
    pub extra_args: Vec<String>,

    /// Extra environment for the server process
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,

    /// How long to wait for the server to accept a client connection
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Release version, with or without the leading `v`
    pub version: Option<String>,

    /// Directory holding a pre-installed executable; disables downloads
    pub binary_directory: Option<PathBuf>,

    /// Root of the version-keyed executable cache
    pub cache_root: Option<PathBuf>,

    /// Caller-owned data directory; never swept or deleted
    pub data_directory: Option<PathBuf>,

    /// Parent directory of automatically created data directories
    pub temp_root: Option<PathBuf>,

    /// Idle time after which abandoned automatic data directories are removed.
    ///
    /// A directory is idle while nothing is created in or removed from it.
    /// Other runners sharing `temp_root` may delete the directory of a live
    /// instance that stays idle this long, so keep it above the lifetime of
    /// any handle that does not write there (for example without JetStream).
    #[serde(default = "default_data_directory_retention_secs")]
    pub data_directory_retention_secs: u64,

    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            port: None,
            monitoring_port: None,
            jetstream: false,
            debug: false,
            trace: false,
            extra_args: Vec::new(),
            env: HashMap::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
            version: None,
            binary_directory: None,
            cache_root: None,
            data_directory: None,
            temp_root: None,
            data_directory_retention_secs: default_data_directory_retention_secs(),
            download_base_url: default_download_base_url(),
        }
    }
}

impl RunnerOptions {
    pub fn builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }

    /// Validate the options; nothing is allocated before this passes
    pub fn validate(&self) -> Result<(), RunnerError> {
        if let Some(port) = self.port {
            validate_port("port", port)?;
        }
        if let Some(port) = self.monitoring_port {
            validate_port("monitoring_port", port)?;
        }
        if let (Some(port), Some(monitoring_port)) = (self.port, self.monitoring_port) {
            if port == monitoring_port {
                return Err(RunnerError::configuration(format!(
                    "port and monitoring_port must differ, both are {port}"
                )));
            }
        }

        if self.connection_timeout_ms == 0 {
            return Err(RunnerError::configuration(
                "connection_timeout_ms must be greater than 0",
            ));
        }

        if let Some(version) = &self.version {
            let trimmed = version.trim();
            if trimmed.is_empty() || trimmed == "v" {
                return Err(RunnerError::configuration("version must not be empty"));
            }
            if trimmed.contains(['/', '\\']) || trimmed.contains("..") {
                return Err(RunnerError::configuration(format!(
                    "version '{version}' must not contain path separators"
                )));
            }
        }

        if self.download_base_url.trim().is_empty() {
            return Err(RunnerError::configuration(
                "download_base_url must not be empty",
            ));
        }

        Ok(())
    }

    /// Requested version, or the default one
    pub fn effective_version(&self) -> &str {
        self.version
            .as_deref()
            .map(str::trim)
            .unwrap_or(DEFAULT_NATS_VERSION)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn data_directory_retention(&self) -> Duration {
        Duration::from_secs(self.data_directory_retention_secs)
    }
}

impl RunnerOptionsBuilder {
    pub fn extra_args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.extra_args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

fn validate_port(name: &str, port: i32) -> Result<(), RunnerError> {
    if port <= 0 || port > i32::from(u16::MAX) {
        return Err(RunnerError::configuration(format!(
            "{name} must be between 1 and 65535, got {port}"
        )));
    }
    Ok(())
}

// Default value functions for serde
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_data_directory_retention_secs() -> u64 {
    3_600
}
fn default_download_base_url() -> String {
    DEFAULT_DOWNLOAD_BASE_URL.to_string()
}
