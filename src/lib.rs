//! Docent runtime: on-device question answering about a single artwork.
//!
//! A [`DocentService`] loads a model, keeps one inference session with the
//! artwork description cached as a fixed prefix, and streams answers to
//! visitor questions token by token.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod runtime;
pub mod service;

// Re-export commonly used types
pub use config::DocentConfig;
pub use error::{Error, ErrorKind, Result};
pub use runtime::{ArtworkMetadata, FinishReason, GenerationOutcome, SessionStatus};
pub use service::DocentService;
