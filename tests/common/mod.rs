//! Common test utilities for the docent runtime

#![allow(dead_code)]

use docent_core::{
    config::DocentConfig,
    runtime::{
        ArtworkMetadata, BigramModel, ContextBackend, ContextParams, EncodeMode, ModelBackend,
        ModelInfo, ModelLoader, ModelSpec, TokenId,
    },
    Error, Result,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Fixed prefix used by tests that drive a session directly
pub const SHORT_PREFIX: &str = "<|im_start|>system\n<|im_end|>\n";

/// Model whose reply to any question is `script`, followed by `<|im_end|>`.
pub fn scripted_spec(script: &[&str]) -> ModelSpec {
    let mut spec = ModelSpec {
        name: "scripted".to_string(),
        context_length: 1024,
        ..ModelSpec::default()
    };
    spec.pieces.push("assistant".to_string());

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
    spec
}

/// Model with several plausible continuations at every step.
pub fn branching_spec() -> ModelSpec {
    let mut spec = ModelSpec {
        name: "branching".to_string(),
        context_length: 1024,
        ..ModelSpec::default()
    };
    let words = ["assistant", " red", " blue", " gold", " and", "."];
    spec.pieces.extend(words.iter().map(|w| w.to_string()));

    let colours = HashMap::from([
        (" red".to_string(), 1.0),
        (" blue".to_string(), 0.9),
        (" gold".to_string(), 0.8),
    ]);
    spec.transitions.insert("assistant".into(), colours.clone());
    for colour in [" red", " blue", " gold"] {
        spec.transitions.insert(
            colour.into(),
            HashMap::from([(" and".to_string(), 1.0), (".".to_string(), 0.9)]),
        );
    }
    spec.transitions.insert(" and".into(), colours);
    spec.transitions
        .insert(".".into(), HashMap::from([("<|im_end|>".to_string(), 1.0)]));
    spec
}

/// Model that repeats one piece forever.
pub fn looping_spec() -> ModelSpec {
    let mut spec = scripted_spec(&["la"]);
    spec.transitions
        .insert("la".into(), HashMap::from([("la".to_string(), 1.0)]));
    spec
}

pub fn write_spec(spec: &ModelSpec) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("create model file");
    let json = serde_json::to_string(spec).expect("serialize model");
    file.write_all(json.as_bytes()).expect("write model file");
    file
}

/// Small context so tests exercise batching and capacity limits.
pub fn test_config() -> DocentConfig {
    let mut config = DocentConfig::default();
    config.session.max_context_tokens = 256;
    config.session.max_batch_tokens = 32;
    config.session.decode_threads = 1;
    config
}

pub fn artwork() -> ArtworkMetadata {
    ArtworkMetadata {
        title: "The Harvesters".into(),
        author: "Pieter Bruegel the Elder".into(),
        kind: "Painting".into(),
        technique: "Oil on wood".into(),
        date: "1565".into(),
        ..ArtworkMetadata::default()
    }
}

/// Backend wrapper whose `fail_at`-th decode call (1-based, counted across
/// all contexts) fails. `fail_at = 0` never fails a decode.
pub struct FlakyModel {
    inner: BigramModel,
    fail_at: u64,
    calls: Arc<AtomicU64>,
    bad_piece: Option<String>,
    piece_failed: AtomicBool,
}

impl FlakyModel {
    pub fn new(spec: ModelSpec, fail_at: u64) -> Self {
        Self {
            inner: BigramModel::from_spec(spec).expect("valid spec"),
            fail_at,
            calls: Arc::new(AtomicU64::new(0)),
            bad_piece: None,
            piece_failed: AtomicBool::new(false),
        }
    }

    /// Fail the first conversion of `piece` back to text.
    pub fn fail_piece_once(mut self, piece: &str) -> Self {
        self.bad_piece = Some(piece.to_string());
        self
    }

    pub fn decode_attempts(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelBackend for FlakyModel {
    fn info(&self) -> &ModelInfo {
        self.inner.info()
    }

    fn tokenize(&self, text: &str, mode: EncodeMode) -> Result<Vec<TokenId>> {
        self.inner.tokenize(text, mode)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        let piece = self.inner.token_to_piece(token)?;
        if self.bad_piece.as_deref() == Some(piece.as_str()) && !self.piece_failed.swap(true, Ordering::SeqCst) {
            return Err(Error::tokenization("injected piece failure"));
        }
        Ok(piece)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.inner.is_end_of_generation(token)
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn ContextBackend>> {
        Ok(Box::new(FlakyContext {
            inner: self.inner.new_context(params)?,
            fail_at: self.fail_at,
            calls: self.calls.clone(),
        }))
    }
}

struct FlakyContext {
    inner: Box<dyn ContextBackend>,
    fail_at: u64,
    calls: Arc<AtomicU64>,
}

impl ContextBackend for FlakyContext {
    fn decode(&mut self, tokens: &[TokenId], start_pos: usize) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(Error::decode("injected decode failure"));
        }
        self.inner.decode(tokens, start_pos)
    }

    fn logits(&self) -> &[f32] {
        self.inner.logits()
    }

    fn truncate(&mut self, pos: usize) {
        self.inner.truncate(pos)
    }

    fn position(&self) -> usize {
        self.inner.position()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn batch_capacity(&self) -> usize {
        self.inner.batch_capacity()
    }
}

/// Loader that hands out a prebuilt backend for any path.
pub struct StaticLoader(pub Arc<dyn ModelBackend>);

impl ModelLoader for StaticLoader {
    fn load(&self, _path: &Path) -> Result<Arc<dyn ModelBackend>> {
        Ok(self.0.clone())
    }
}
