//! Inference session lifecycle and prefix cache
//!
//! A session owns exactly one execution context and one sampler chain. Both
//! live inside [`LiveState`], together with the prefix cache bookkeeping, so
//! the three are created and dropped as a unit:
//!
//! ```text
//! Uninitialized --init--> Ready --generate--> Generating --(any exit)--> Ready
//!       ^                   |
//!       +------close--------+
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sampler::SamplerChain;
use super::{ContextBackend, EncodeMode, ModelHandle, TokenId};
use crate::config::{SamplingConfig, SessionConfig};
use crate::error::{Error, Result};

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Ready,
    Generating,
}

/// How much of the fixed prefix sits in the live context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixCacheState {
    pub token_count: usize,
    pub valid: bool,
}

struct LiveState {
    model: ModelHandle,
    config: SessionConfig,
    context: Box<dyn ContextBackend>,
    sampler: SamplerChain,
    prefix: PrefixCacheState,
    generating: bool,
}

/// Owner of one execution context and one sampler chain.
#[derive(Default)]
pub struct InferenceSession {
    live: Option<LiveState>,
}

impl InferenceSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the execution context and sampler chain.
    ///
    /// A no-op while already live against the same model. If the session is
    /// live against a different model handle it is rebuilt, which drops the
    /// prefix cache. On failure the session is left `Uninitialized`.
    pub fn init(&mut self, model: &ModelHandle, config: &SessionConfig, sampling: &SamplingConfig) -> Result<()> {
        if let Some(live) = &self.live {
            if live.model == *model {
                debug!("Session already initialized, ignoring init");
                return Ok(());
            }
            info!(
                "Model changed ({} -> {}), rebuilding session",
                live.model.info().name,
                model.info().name
            );
            self.close();
        }

        let params = config.context_params();
        let context = model.backend().new_context(&params)?;
        let sampler = SamplerChain::from_config(sampling)?;

        info!(
            "Session initialized: n_ctx={}, n_batch={}, threads={}, seed={}",
            params.max_context_tokens,
            params.max_batch_tokens,
            params.decode_threads,
            sampler.seed()
        );

        self.live = Some(LiveState {
            model: model.clone(),
            config: config.clone(),
            context,
            sampler,
            prefix: PrefixCacheState::default(),
            generating: false,
        });
        Ok(())
    }

    /// Release the context and sampler. Safe to call in any state.
    pub fn close(&mut self) {
        if self.live.take().is_some() {
            info!("Session closed");
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &self.live {
            None => SessionStatus::Uninitialized,
            Some(live) if live.generating => SessionStatus::Generating,
            Some(_) => SessionStatus::Ready,
        }
    }

    pub fn prefix_cache(&self) -> PrefixCacheState {
        self.live.as_ref().map(|l| l.prefix).unwrap_or_default()
    }

    /// Current context position, `None` when uninitialized.
    pub fn context_position(&self) -> Option<usize> {
        self.live.as_ref().map(|l| l.context.position())
    }

    pub fn model(&self) -> Option<&ModelHandle> {
        self.live.as_ref().map(|l| &l.model)
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.live.as_ref().map(|l| &l.config)
    }

    fn ready_mut(&mut self) -> Result<&mut LiveState> {
        match self.live.as_mut() {
            None => Err(Error::invalid_state("session is not initialized")),
            Some(live) if live.generating => Err(Error::SessionBusy),
            Some(live) => Ok(live),
        }
    }

    /// Evaluate the fixed prefix once and remember how many tokens it holds.
    ///
    /// Idempotent while the cache is valid: a second call never re-decodes,
    /// because that would push the prefix a second time.
    pub fn prime_fixed_prefix(&mut self, text: &str) -> Result<PrefixCacheState> {
        let live = self.ready_mut()?;
        if live.prefix.valid {
            debug!("Prefix cache hit ({} tokens)", live.prefix.token_count);
            return Ok(live.prefix);
        }

        let tokens = live.model.backend().tokenize(text, EncodeMode::Prefix)?;
        if tokens.is_empty() {
            return Err(Error::tokenization("fixed prefix produced no tokens"));
        }

        live.context.truncate(0);
        if let Err(e) = decode_batched(live.context.as_mut(), &tokens, 0) {
            warn!("Failed to decode fixed prefix: {}", e);
            live.context.truncate(0);
            return Err(e);
        }

        live.prefix = PrefixCacheState {
            token_count: tokens.len(),
            valid: true,
        };
        info!("Fixed prefix cached: {} tokens", tokens.len());
        Ok(live.prefix)
    }

    /// Forget the cached prefix so a different one can be primed.
    pub fn invalidate_prefix(&mut self) -> Result<()> {
        let live = self.ready_mut()?;
        if live.prefix.valid {
            debug!("Prefix cache invalidated");
        }
        live.prefix = PrefixCacheState::default();
        Ok(())
    }

    /// Borrow the live state for one turn.
    ///
    /// The caller flips `TurnParts::generating` once the user turn is
    /// evaluated; the guard restores `Ready` when dropped.
    pub(crate) fn begin_turn(&mut self) -> Result<TurnGuard<'_>> {
        let live = self.ready_mut()?;
        if !live.prefix.valid {
            return Err(Error::PrefixNotCached);
        }
        Ok(TurnGuard { live })
    }
}

/// Borrowed session internals for the duration of one generation.
pub(crate) struct TurnGuard<'a> {
    live: &'a mut LiveState,
}

pub(crate) struct TurnParts<'a> {
    pub model: &'a ModelHandle,
    pub context: &'a mut dyn ContextBackend,
    pub sampler: &'a mut SamplerChain,
    pub prefix: PrefixCacheState,
    pub generating: &'a mut bool,
}

impl TurnGuard<'_> {
    pub fn parts(&mut self) -> TurnParts<'_> {
        let live = &mut *self.live;
        TurnParts {
            model: &live.model,
            context: live.context.as_mut(),
            sampler: &mut live.sampler,
            prefix: live.prefix,
            generating: &mut live.generating,
        }
    }

    /// Drop the prefix cache after the context was left in an unknown state.
    pub fn invalidate_prefix(&mut self) {
        self.live.prefix = PrefixCacheState::default();
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.live.generating = false;
    }
}

/// Decode `tokens` starting at `start`, split to the context's batch capacity.
pub(crate) fn decode_batched(context: &mut dyn ContextBackend, tokens: &[TokenId], start: usize) -> Result<()> {
    let batch = context.batch_capacity().max(1);
    let mut pos = start;
    for chunk in tokens.chunks(batch) {
        context.decode(chunk, pos)?;
        debug!("Decoded batch of {} tokens at position {}", chunk.len(), pos);
        pos += chunk.len();
    }
    Ok(())
}
