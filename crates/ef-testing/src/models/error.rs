use std::{fmt::Debug, path::PathBuf};

use ef_fixtures::FixtureError;

/// Error type based off <https://github.com/paradigmxyz/reth/blob/main/testing/ef-tests/src/result.rs>
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// An IO error occurred
    #[error("An error occurred interacting with the file system at {path}: {error}")]
    Io {
        /// The path to the file or directory
        path: PathBuf,
        /// The specific error
        error: String,
    },
    /// The fixture file could not be deserialized
    #[error("An error occurred deserializing the fixture at {path}: {error}")]
    CouldNotDeserialize {
        /// The path to the file
        path: PathBuf,
        /// The specific error
        error: String,
    },
    /// The fixture could not be loaded or is malformed
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    /// The client answered with a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        /// The error code
        code: i64,
        /// The error message
        message: String,
    },
    /// The transport to the client failed
    #[error("Transport error: {0}")]
    Transport(String),
    /// An external tool exited unsuccessfully
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailure {
        /// The tool that was run
        tool: String,
        /// The exit status
        status: String,
        /// The captured standard error
        stderr: String,
    },
    /// Skipped test
    #[error("test skipped")]
    Skipped,
    /// Other
    #[error("{0}")]
    Other(String),
}

impl From<eyre::Error> for RunnerError {
    fn from(err: eyre::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<regex::Error> for RunnerError {
    fn from(err: regex::Error) -> Self {
        Self::Other(err.to_string())
    }
}
