//! Streaming token generation over a primed session
//!
//! Each call appends one user turn after the cached fixed prefix, then
//! samples tokens one at a time until the model ends its turn, a stop
//! sequence shows up in the trailing text, the token budget runs out, the
//! context fills up or the caller cancels.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::{decode_batched, InferenceSession};
use super::streaming::TokenSink;
use super::telemetry::{GenerationStats, Stopwatch};
use super::template::format_user_turn;
use super::EncodeMode;
use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// One user question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub user_text: String,
}

impl GenerationRequest {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
        }
    }
}

/// Reason why generation finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    /// A configured stop sequence appeared in the output
    StopSequence(String),
    MaxTokens,
    /// No room left in the execution context
    ContextFull,
    Cancelled,
}

/// Result of a completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
}

/// Detects stop sequences across fragment boundaries.
///
/// Only the last `window` characters of output are retained. Matching runs on
/// the retained window plus the newest fragment, so a sequence split over
/// several fragments is still found as soon as its last character arrives.
#[derive(Debug, Clone)]
pub struct StopSequenceMatcher {
    stops: Vec<String>,
    window: usize,
    buffer: String,
}

impl StopSequenceMatcher {
    pub fn new(stops: &[String], lookback_chars: usize) -> Self {
        let stops: Vec<String> = stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        let longest = stops.iter().map(|s| s.chars().count()).max().unwrap_or(0);
        Self {
            stops,
            window: lookback_chars.max(longest),
            buffer: String::new(),
        }
    }

    /// Append a fragment and report the first stop sequence now present.
    pub fn push(&mut self, fragment: &str) -> Option<&str> {
        self.buffer.push_str(fragment);
        let hit = self.stops.iter().position(|s| self.buffer.contains(s.as_str()));

        let len = self.buffer.chars().count();
        if len > self.window {
            if let Some((cut, _)) = self.buffer.char_indices().nth(len - self.window) {
                self.buffer.drain(..cut);
            }
        }

        hit.map(|i| self.stops[i].as_str())
    }

    /// Retained trailing text
    pub fn tail(&self) -> &str {
        &self.buffer
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

/// Drives the token loop for one session.
#[derive(Debug, Clone)]
pub struct StreamingGenerator {
    config: GenerationConfig,
}

impl StreamingGenerator {
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Answer one user turn, streaming every fragment into `sink`.
    ///
    /// Requires a `Ready` session with a valid prefix cache. The session is
    /// back in `Ready` on every return path.
    pub fn generate(
        &self,
        session: &mut InferenceSession,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
        cancel: Option<&CancellationToken>,
    ) -> Result<GenerationOutcome> {
        let mut watch = Stopwatch::start();
        let mut turn = session.begin_turn()?;
        let parts = turn.parts();
        let backend = parts.model.backend();
        let context = parts.context;
        let sampler = parts.sampler;
        let generating = parts.generating;

        if !self.config.retain_turns {
            context.truncate(parts.prefix.token_count);
        }

        let prompt = format_user_turn(&request.user_text);
        let tokens = backend.tokenize(&prompt, EncodeMode::Continuation)?;
        if tokens.is_empty() {
            return Err(Error::tokenization("user turn produced no tokens"));
        }

        let start = context.position();
        if let Err(e) = decode_batched(context, &tokens, start) {
            warn!("Failed to decode user turn at position {}: {}", start, e);
            turn.invalidate_prefix();
            return Err(e);
        }
        watch.prefill_done(tokens.len());
        debug!("User turn decoded: {} tokens, context at {}", tokens.len(), context.position());

        sampler.reset();
        *generating = true;
        let mut matcher = StopSequenceMatcher::new(&self.config.stop_sequences, self.config.lookback_chars);
        let mut text = String::new();
        let mut generated = 0usize;

        // the token that closed the turn, if the model produced one
        let (finish_reason, terminal) = loop {
            if generated >= self.config.max_tokens {
                break (FinishReason::MaxTokens, None);
            }
            if cancel.is_some_and(|c| c.is_cancelled()) {
                break (FinishReason::Cancelled, None);
            }

            let token = sampler.sample(context.logits())?;
            if backend.is_end_of_generation(token) {
                break (FinishReason::EndOfGeneration, Some(token));
            }

            let piece = backend.token_to_piece(token)?;
            generated += 1;
            text.push_str(&piece);
            let stop = matcher.push(&piece).map(str::to_string);

            sink.on_token(&piece).map_err(|e| Error::Sink(e.to_string()))?;

            if let Some(stop) = stop {
                break (FinishReason::StopSequence(stop), Some(token));
            }

            let pos = context.position();
            if pos >= context.capacity() {
                break (FinishReason::ContextFull, None);
            }
            context.decode(&[token], pos)?;
        };

        // retained history must hold the closing token too
        if self.config.retain_turns {
            if let Some(token) = terminal {
                let pos = context.position();
                if pos < context.capacity() {
                    context.decode(&[token], pos)?;
                } else {
                    debug!("No room to retain the closing token at position {}", pos);
                }
            }
        }

        drop(turn);
        sink.on_complete(&finish_reason);
        debug!("Generation finished: {:?} after {} tokens", finish_reason, generated);

        Ok(GenerationOutcome {
            text,
            tokens_generated: generated,
            finish_reason,
            stats: watch.finish(generated),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingConfig, SessionConfig};
    use crate::error::ErrorKind;
    use crate::runtime::reference::{BigramModel, ModelSpec};
    use crate::runtime::streaming::CollectingSink;
    use crate::runtime::{ModelHandle, SessionStatus};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn stops(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matcher_sees_across_fragments() {
        let mut matcher = StopSequenceMatcher::new(&stops(&["STOP"]), 4);
        assert_eq!(matcher.push("ab"), None);
        assert_eq!(matcher.push("ST"), None);
        assert_eq!(matcher.push("OP"), Some("STOP"));
    }

    #[test]
    fn test_matcher_finds_sequence_inside_long_fragment() {
        let mut matcher = StopSequenceMatcher::new(&stops(&["STOP"]), 4);
        matcher.push("xxST");
        assert_eq!(matcher.push("OPand more text"), Some("STOP"));
    }

    #[test]
    fn test_matcher_window_is_bounded() {
        let mut matcher = StopSequenceMatcher::new(&stops(&["<|im_end|>"]), 4);
        assert_eq!(matcher.window(), 10);
        for _ in 0..100 {
            matcher.push("héllo ");
        }
        assert_eq!(matcher.tail().chars().count(), 10);
    }

    #[test]
    fn test_matcher_ignores_empty_stop() {
        let mut matcher = StopSequenceMatcher::new(&stops(&[""]), 8);
        assert_eq!(matcher.push("anything"), None);
    }

    /// "assistant" continues with a fixed script ending in an end-of-generation piece.
    fn scripted_session(script: &[&str], config: GenerationConfig) -> (StreamingGenerator, InferenceSession) {
        let mut spec = ModelSpec::default();
        spec.pieces.push("assistant".into());
        let mut previous = "assistant".to_string();
        for piece in script {
            if !spec.pieces.iter().any(|p| p == piece) {
                spec.pieces.push(piece.to_string());
            }
            spec.transitions
                .insert(previous.clone(), HashMap::from([(piece.to_string(), 1.0)]));
            previous = piece.to_string();
        }
        spec.transitions
            .insert(previous, HashMap::from([("<|im_end|>".to_string(), 1.0)]));

        let backend = Arc::new(BigramModel::from_spec(spec).unwrap());
        let handle = ModelHandle::from_backend("script.json", backend);
        let mut session = InferenceSession::new();
        let session_config = SessionConfig {
            max_context_tokens: 512,
            max_batch_tokens: 64,
            decode_threads: 1,
            memory_budget_bytes: None,
        };
        session.init(&handle, &session_config, &SamplingConfig::default()).unwrap();
        session.prime_fixed_prefix("<|im_start|>system\n<|im_end|>\n").unwrap();
        (StreamingGenerator::new(config), session)
    }

    #[test]
    fn test_generates_until_end_of_generation() {
        let (generator, mut session) = scripted_session(&["Hello", " there"], GenerationConfig::default());
        let mut sink = CollectingSink::new();
        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("hi"), &mut sink, None)
            .unwrap();

        assert_eq!(outcome.text, "Hello there");
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(sink.fragments, vec!["Hello", " there"]);
        assert_eq!(sink.finish_reason, Some(FinishReason::EndOfGeneration));
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[test]
    fn test_stops_after_emitting_stop_sequence() {
        let config = GenerationConfig {
            stop_sequences: stops(&["STOP"]),
            ..GenerationConfig::default()
        };
        let (generator, mut session) = scripted_session(&["ab", "ST", "OP", "cd"], config);
        let mut sink = CollectingSink::new();
        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, None)
            .unwrap();

        assert_eq!(sink.fragments, vec!["ab", "ST", "OP"]);
        assert_eq!(outcome.finish_reason, FinishReason::StopSequence("STOP".into()));
    }

    #[test]
    fn test_max_tokens_bound() {
        let config = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::default()
        };
        let (generator, mut session) = scripted_session(&["a", "b", "c", "d"], config);
        let mut sink = CollectingSink::new();
        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, None)
            .unwrap();
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_sink_error_aborts_and_keeps_session_ready() {
        let (generator, mut session) = scripted_session(&["one", "two"], GenerationConfig::default());
        let mut calls = 0;
        let mut sink = |_: &str| -> anyhow::Result<()> {
            calls += 1;
            anyhow::bail!("host went away")
        };
        let err = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, None)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Sink);
        assert_eq!(calls, 1);
        assert_eq!(session.status(), SessionStatus::Ready);
        assert!(session.prefix_cache().valid);
    }

    #[test]
    fn test_cancelled_before_first_token() {
        let (generator, mut session) = scripted_session(&["never"], GenerationConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = CollectingSink::new();
        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, Some(&cancel))
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Cancelled);
        assert!(sink.fragments.is_empty());
    }

    #[test]
    fn test_requires_cached_prefix() {
        let (generator, mut session) = scripted_session(&["x"], GenerationConfig::default());
        session.invalidate_prefix().unwrap();
        let err = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut CollectingSink::new(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrefixNotCached);
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[test]
    fn test_turns_rewind_to_prefix() {
        let (generator, mut session) = scripted_session(&["ok"], GenerationConfig::default());
        let prefix = session.prefix_cache().token_count;
        let mut sink = CollectingSink::new();
        generator
            .generate(&mut session, &GenerationRequest::new("first"), &mut sink, None)
            .unwrap();
        let after_first = session.context_position().unwrap();
        generator
            .generate(&mut session, &GenerationRequest::new("first"), &mut sink, None)
            .unwrap();

        assert!(after_first > prefix);
        assert_eq!(session.context_position(), Some(after_first));
    }

    #[test]
    fn test_retained_turns_accumulate() {
        let config = GenerationConfig {
            retain_turns: true,
            ..GenerationConfig::default()
        };
        let (generator, mut session) = scripted_session(&["ok"], config);
        let mut sink = CollectingSink::new();
        generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, None)
            .unwrap();
        let after_first = session.context_position().unwrap();
        generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut sink, None)
            .unwrap();
        assert!(session.context_position().unwrap() > after_first);
    }

    fn user_turn_len(session: &InferenceSession, question: &str) -> usize {
        session
            .model()
            .unwrap()
            .backend()
            .tokenize(&format_user_turn(question), EncodeMode::Continuation)
            .unwrap()
            .len()
    }

    #[test]
    fn test_retained_turn_keeps_closing_token() {
        let config = GenerationConfig {
            retain_turns: true,
            ..GenerationConfig::default()
        };
        let (generator, mut session) = scripted_session(&["ok"], config);
        let prefix = session.prefix_cache().token_count;
        let user = user_turn_len(&session, "q");

        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut CollectingSink::new(), None)
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(session.context_position(), Some(prefix + user + outcome.tokens_generated + 1));
    }

    #[test]
    fn test_retained_turn_keeps_stop_token() {
        let config = GenerationConfig {
            retain_turns: true,
            stop_sequences: stops(&["STOP"]),
            ..GenerationConfig::default()
        };
        let (generator, mut session) = scripted_session(&["ab", "STOP", "cd"], config);
        let prefix = session.prefix_cache().token_count;
        let user = user_turn_len(&session, "q");

        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut CollectingSink::new(), None)
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::StopSequence("STOP".into()));
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(session.context_position(), Some(prefix + user + 2));
    }

    #[test]
    fn test_rewound_turn_skips_closing_token() {
        let (generator, mut session) = scripted_session(&["ok"], GenerationConfig::default());
        let prefix = session.prefix_cache().token_count;
        let user = user_turn_len(&session, "q");

        let outcome = generator
            .generate(&mut session, &GenerationRequest::new("q"), &mut CollectingSink::new(), None)
            .unwrap();
        assert_eq!(session.context_position(), Some(prefix + user + outcome.tokens_generated));
    }
}
