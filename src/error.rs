//! Error types for the resource lifecycle controller

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The rendered manifest could not be written to disk
    #[error("failed to write manifest file {path}: {source}")]
    ManifestWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The external client could not be started
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the output of a running client failed
    #[error("failed reading output of '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The execution was cancelled while waiting on the external client
    #[error("interrupted while {0}")]
    Interrupted(String),

    /// The external client exited with a non-zero status
    #[error("'{command}' failed with exit code {exit_code}. kubectl output is: {output}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// The client's creation output could not be decoded
    #[error("could not parse kubectl output: {0}")]
    Parse(String),

    /// Creation succeeded but reported no resources
    #[error("no kubernetes resources were created; cannot stream logs")]
    NoResourcesCreated,

    /// Resources were created but none of them produces logs
    #[error("none of the {0} created resources is log-streamable")]
    NoStreamableResource(usize),

    /// A bounded retry/poll loop gave up
    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    /// A generic info option has an invalid value
    #[error("invalid option {key}: {message}")]
    InvalidOption { key: String, message: String },

    /// Configuration or variables file error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an interruption error describing what was being waited on
    pub fn interrupted(during: impl Into<String>) -> Self {
        Self::Interrupted(during.into())
    }

    /// Create a parse error with the given message
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid option error
    pub fn invalid_option(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from a cancelled wait
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
