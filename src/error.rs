//! Error types for the docent runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::result;
use thiserror::Error;

/// A specialized Result type for docent runtime operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for docent runtime operations.
///
/// Every variant maps onto one [`ErrorKind`], which is what a host bridge
/// forwards to its UI layer alongside the boolean outcome.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Context creation error: {0}")]
    ContextCreation(String),

    #[error("Sampler init error: {0}")]
    SamplerInit(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Fixed prefix has not been cached; call prime_fixed_prefix first")]
    PrefixNotCached,

    #[error("Session is busy generating")]
    SessionBusy,

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoad,
    ContextCreation,
    SamplerInit,
    InvalidState,
    Tokenization,
    Decode,
    PrefixNotCached,
    SessionBusy,
    Sink,
    Config,
    Io,
}

impl Error {
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Error::ModelLoad(msg.into())
    }

    pub fn context_creation<S: Into<String>>(msg: S) -> Self {
        Error::ContextCreation(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Error::Decode(msg.into())
    }

    pub fn tokenization<S: Into<String>>(msg: S) -> Self {
        Error::Tokenization(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ModelLoad(_) => ErrorKind::ModelLoad,
            Error::ContextCreation(_) => ErrorKind::ContextCreation,
            Error::SamplerInit(_) => ErrorKind::SamplerInit,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Tokenization(_) => ErrorKind::Tokenization,
            Error::Decode(_) => ErrorKind::Decode,
            Error::PrefixNotCached => ErrorKind::PrefixNotCached,
            Error::SessionBusy => ErrorKind::SessionBusy,
            Error::Sink(_) => ErrorKind::Sink,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ModelLoad => "ModelLoadError",
            ErrorKind::ContextCreation => "ContextCreationError",
            ErrorKind::SamplerInit => "SamplerInitError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::Tokenization => "TokenizationError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::PrefixNotCached => "PrefixNotCachedError",
            ErrorKind::SessionBusy => "SessionBusyError",
            ErrorKind::Sink => "SinkError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
