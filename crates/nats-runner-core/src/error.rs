use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to the caller that requested a runner
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Binary '{binary}' not found in {}", directory.display())]
    BinaryNotFound { directory: PathBuf, binary: String },

    #[error("nats-server version '{version}' not found at {url}")]
    VersionNotFound { version: String, url: String },

    #[error("Failed to acquire nats-server binary: {0}")]
    AcquisitionFailed(String),

    #[error("Archive {url} does not contain '{binary}'")]
    PackageMalformed { url: String, binary: String },

    #[error("Failed to start {} after {attempts} attempt(s): {source}", program.display())]
    ProcessStartFailed {
        program: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("nats-server exited before becoming ready (exit code: {}): {output}", display_code(code))]
    UnexpectedExit { code: Option<i32>, output: String },

    #[error("nats-server did not accept connections within connection_timeout_ms={timeout_ms}")]
    ReadinessTimeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

impl RunnerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        RunnerError::ConfigurationError(message.into())
    }

    pub fn acquisition(message: impl Into<String>) -> Self {
        RunnerError::AcquisitionFailed(message.into())
    }

    /// Whether the error was produced while acquiring the executable
    pub fn is_acquisition_error(&self) -> bool {
        matches!(
            self,
            RunnerError::BinaryNotFound { .. }
                | RunnerError::VersionNotFound { .. }
                | RunnerError::AcquisitionFailed(_)
                | RunnerError::PackageMalformed { .. }
        )
    }

    /// Whether the error was produced after the process had been launched
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            RunnerError::UnexpectedExit { .. } | RunnerError::ReadinessTimeout { .. }
        )
    }
}
