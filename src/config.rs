//! Configuration management for the docent runtime.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/docent/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (`DOCENT_<SECTION>__<KEY>`)
//! 5. Command-line arguments
//!
//! # Environment Variables
//!
//! - `DOCENT_MODEL__PATH` - Model file to load at startup
//! - `DOCENT_SESSION__MAX_CONTEXT_TOKENS` - Context window in tokens
//! - `DOCENT_SESSION__DECODE_THREADS` - Decode worker count (0 = all CPUs)
//! - `DOCENT_SAMPLING__SEED` - Sampler seed

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{limits, sampling};
use crate::error::Result;
use crate::runtime::template::default_stop_sequences;
use crate::runtime::ContextParams;

/// Command-line overrides shared by every subcommand
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, env = "DOCENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model file path
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Context window in tokens
    #[arg(long)]
    pub max_context_tokens: Option<usize>,

    /// Batch capacity in tokens
    #[arg(long)]
    pub max_batch_tokens: Option<usize>,

    /// Decode worker threads (0 = one per CPU)
    #[arg(long)]
    pub decode_threads: Option<usize>,

    /// Sampler seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum tokens generated per answer
    #[arg(long)]
    pub max_tokens: Option<usize>,
}

/// Full runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocentConfig {
    pub model: ModelConfig,
    pub session: SessionConfig,
    pub sampling: SamplingConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

/// Model loading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model to load at startup
    pub path: Option<PathBuf>,
    /// Largest model file accepted
    pub max_model_bytes: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_model_bytes: limits::MAX_MODEL_FILE_SIZE,
        }
    }
}

/// Execution context sizing, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_context_tokens: usize,
    pub max_batch_tokens: usize,
    /// Decode worker count, 0 resolves to the number of CPUs
    pub decode_threads: usize,
    /// Upper bound on context working memory
    pub memory_budget_bytes: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: limits::DEFAULT_CONTEXT_TOKENS,
            max_batch_tokens: limits::DEFAULT_BATCH_TOKENS,
            decode_threads: 0,
            memory_budget_bytes: None,
        }
    }
}

impl SessionConfig {
    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            max_context_tokens: self.max_context_tokens,
            max_batch_tokens: self.max_batch_tokens,
            decode_threads: if self.decode_threads == 0 {
                num_cpus::get()
            } else {
                self.decode_threads
            },
            memory_budget_bytes: self.memory_budget_bytes,
        }
    }
}

/// Sampler chain parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub min_p: f32,
    pub min_keep: usize,
    pub temperature: f32,
    /// Fixed seed for reproducible output; `None` picks one per session
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_p: sampling::DEFAULT_MIN_P,
            min_keep: sampling::DEFAULT_MIN_KEEP,
            temperature: sampling::DEFAULT_TEMPERATURE,
            seed: Some(sampling::DEFAULT_SEED),
        }
    }
}

/// Generation loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub stop_sequences: Vec<String>,
    /// Trailing characters kept for stop sequence matching
    pub lookback_chars: usize,
    /// Keep previous turns in the context instead of rewinding to the prefix
    pub retain_turns: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: limits::DEFAULT_MAX_TOKENS,
            stop_sequences: default_stop_sequences(),
            lookback_chars: limits::DEFAULT_LOOKBACK_CHARS,
            retain_turns: false,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Write logs into daily files in this directory instead of stderr
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "docent_core=info".to_string(),
            directory: None,
        }
    }
}

impl DocentConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/docent/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("DOCENT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("generation.stop_sequences"),
        );

        let mut config: DocentConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args);
        Ok(config)
    }

    fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(path) = &args.model {
            self.model.path = Some(path.clone());
        }
        if let Some(n) = args.max_context_tokens {
            self.session.max_context_tokens = n;
        }
        if let Some(n) = args.max_batch_tokens {
            self.session.max_batch_tokens = n;
        }
        if let Some(n) = args.decode_threads {
            self.session.decode_threads = n;
        }
        if let Some(seed) = args.seed {
            self.sampling.seed = Some(seed);
        }
        if let Some(t) = args.temperature {
            self.sampling.temperature = t;
        }
        if let Some(n) = args.max_tokens {
            self.generation.max_tokens = n;
        }
    }
}
