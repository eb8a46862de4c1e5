use std::path::PathBuf;

/// Errors raised while loading or interpreting fixtures.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
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
    /// An error occurred while decoding RLP.
    #[error("An error occurred deserializing RLP: {0}")]
    RlpDecodeError(#[from] alloy_rlp::Error),
    /// An exception string is not part of the taxonomy.
    #[error("Unknown exception {0}")]
    UnknownException(String),
    /// An exception mapper rule could not be compiled.
    #[error("Invalid exception mapper rule for client {client}: {error}")]
    InvalidMapperRule {
        /// The client the rule belongs to
        client: String,
        /// The specific error
        error: String,
    },
    /// The fixture breaks one of its own construction rules.
    #[error("Malformed fixture: {0}")]
    Construction(String),
}

impl From<regex::Error> for FixtureError {
    fn from(err: regex::Error) -> Self {
        Self::InvalidMapperRule {
            client: String::from("unknown"),
            error: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for FixtureError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::CouldNotDeserialize {
            path: PathBuf::from("<yaml>"),
            error: err.to_string(),
        }
    }
}
