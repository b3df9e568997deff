//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - One-shot questions about an artwork
//! - Interactive chat sessions
//! - Configuration inspection

pub mod commands;
pub mod handlers;

pub use handlers::{handle_ask, handle_chat, handle_config};
