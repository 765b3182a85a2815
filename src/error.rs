//! Error types for npm-runner.
//!
//! Only host-side failures are represented here. Anything that goes wrong
//! inside a sandbox (package resolution, user exceptions, timeouts) is turned
//! into channel messages instead of Rust errors.

use std::io;

use thiserror::Error;

/// Host-side errors.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Configuration values failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// A configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A configuration file was not valid TOML for [`crate::RunnerConfig`].
    #[error("Failed to parse config file: {message}")]
    ConfigParse {
        /// Parser message.
        message: String,
    },

    /// The sandbox thread could not be started.
    #[error("Failed to spawn sandbox thread: {0}")]
    Spawn(#[source] io::Error),

    /// The package registry could not be reached or answered garbage.
    #[error("Registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    /// A URL built from configuration did not parse.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error while reading user input.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RunnerError::InvalidConfig {
            reason: "no resolvers".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid configuration: no resolvers");

        let err = RunnerError::ConfigParse {
            message: "expected `=`".to_string(),
        };
        assert!(err.to_string().contains("expected `=`"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: RunnerError = io_err.into();
        assert!(matches!(err, RunnerError::Io(_)));
    }
}
