//! Runtime abstraction layer between the session manager and an inference engine
//!
//! The execution engine (tokenizer, decode, weights) is consumed through the
//! three traits below. Everything stateful about a conversation lives in
//! [`InferenceSession`]; backends only answer "tokenize", "decode" and
//! "what are the logits now".

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

pub mod generator;
pub mod model;
pub mod reference;
pub mod sampler;
pub mod session;
pub mod streaming;
pub mod telemetry;
pub mod template;

pub use generator::{FinishReason, GenerationOutcome, GenerationRequest, StopSequenceMatcher, StreamingGenerator};
pub use model::ModelHandle;
pub use reference::{BigramModel, ModelSpec, ReferenceLoader};
pub use sampler::{SamplerChain, SamplerStage};
pub use session::{InferenceSession, PrefixCacheState, SessionStatus};
pub use streaming::{ChannelSink, CollectingSink, StreamEvent, TokenSink};
pub use telemetry::{GenerationStats, Stopwatch, TelemetryRecorder, TelemetrySnapshot};
pub use template::{format_fixed_prefix, format_user_turn, ArtworkMetadata};

/// Vocabulary index produced by a tokenizer.
pub type TokenId = u32;

/// Tokenization rules for the two kinds of prompt text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Start of the context: begin-of-sequence marker added, special markers parsed.
    Prefix,
    /// Appended after cached tokens: no begin-of-sequence marker.
    Continuation,
}

/// Model information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_length: usize,
    pub vocab_size: usize,
    pub architecture: String,
}

/// Parameters an execution context is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub max_context_tokens: usize,
    pub max_batch_tokens: usize,
    pub decode_threads: usize,
    pub memory_budget_bytes: Option<u64>,
}

/// A loaded model: vocabulary plus weights.
///
/// Implementations must be immutable once loaded; every piece of mutable
/// decoding state lives in a [`ContextBackend`].
pub trait ModelBackend: Send + Sync {
    /// Static information about the model
    fn info(&self) -> &ModelInfo;

    /// Convert text to tokens
    fn tokenize(&self, text: &str, mode: EncodeMode) -> Result<Vec<TokenId>>;

    /// Convert a single token back to its text fragment
    fn token_to_piece(&self, token: TokenId) -> Result<String>;

    /// End-of-generation or end-of-sequence marker
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    fn vocab_size(&self) -> usize;

    /// Allocate a fresh execution context
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn ContextBackend>>;
}

/// Mutable working memory of one model evaluation stream.
pub trait ContextBackend: Send {
    /// Evaluate `tokens` at positions `start_pos..start_pos + tokens.len()`.
    ///
    /// `start_pos` must equal [`ContextBackend::position`] and the batch must
    /// fit in the configured batch capacity.
    fn decode(&mut self, tokens: &[TokenId], start_pos: usize) -> Result<()>;

    /// Logits for the next token after the last decoded position
    fn logits(&self) -> &[f32];

    /// Drop every position at or after `pos`
    fn truncate(&mut self, pos: usize);

    /// Number of positions currently held
    fn position(&self) -> usize;

    /// Maximum number of positions
    fn capacity(&self) -> usize;

    /// Maximum tokens per decode call
    fn batch_capacity(&self) -> usize;
}

/// Loads model files into backends.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn ModelBackend>>;
}
