//! Shared constants for the docent runtime
//!
//! Centralizes defaults and chat markers so the config layer, the prompt
//! formatter and the generator agree on them.

/// Size limits and capacities
pub mod limits {
    /// Largest model file accepted by default (4GB, a typical phone budget)
    pub const MAX_MODEL_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

    /// Default context window in tokens
    pub const DEFAULT_CONTEXT_TOKENS: usize = 2048;

    /// Default batch capacity in tokens
    pub const DEFAULT_BATCH_TOKENS: usize = 512;

    /// Default upper bound on generated tokens per call
    pub const DEFAULT_MAX_TOKENS: usize = 512;

    /// Default trailing-text window for stop sequence matching
    pub const DEFAULT_LOOKBACK_CHARS: usize = 32;
}

/// Sampling defaults
pub mod sampling {
    pub const DEFAULT_MIN_P: f32 = 0.05;
    pub const DEFAULT_MIN_KEEP: usize = 1;
    pub const DEFAULT_TEMPERATURE: f32 = 0.8;
    pub const DEFAULT_SEED: u64 = 1234;
}

/// ChatML role markers
pub mod chatml {
    pub const IM_START: &str = "<|im_start|>";
    pub const IM_END: &str = "<|im_end|>";
}
