//! Reference backend: a bigram language model stored as JSON
//!
//! Small enough to write by hand, real enough to exercise the whole session
//! lifecycle: greedy longest-match tokenization with byte fallback, positional
//! context bookkeeping with fixed capacities, and next-token logits that
//! depend on the previously decoded token.
//!
//! Token ids `0..256` are raw bytes; vocabulary pieces start at 256.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{ContextBackend, ContextParams, EncodeMode, ModelBackend, ModelInfo, ModelLoader, TokenId};
use crate::constants::limits;
use crate::error::{Error, Result};

const BYTE_TOKENS: usize = 256;

/// On-disk description of a bigram model.
///
/// `transitions` maps a piece to the logits of the pieces allowed to follow
/// it. A single ASCII character that is not itself a piece names its byte
/// token. Tokens without a row always continue with the first
/// end-of-generation piece.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub name: String,
    pub context_length: usize,
    /// Working memory per context position, checked against the session's memory budget
    pub bytes_per_token: u64,
    pub pieces: Vec<String>,
    pub bos: Option<String>,
    pub end_of_generation: Vec<String>,
    pub transitions: HashMap<String, HashMap<String, f32>>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            context_length: limits::DEFAULT_CONTEXT_TOKENS,
            bytes_per_token: 0,
            pieces: vec![
                "<|im_start|>".to_string(),
                "<|im_end|>".to_string(),
                "<|endoftext|>".to_string(),
            ],
            bos: None,
            end_of_generation: vec!["<|im_end|>".to_string(), "<|endoftext|>".to_string()],
            transitions: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct BigramWeights {
    pieces: Vec<String>,
    /// Piece indices keyed by first byte, longest first
    by_first_byte: HashMap<u8, Vec<usize>>,
    bos: Option<TokenId>,
    end_of_generation: Vec<TokenId>,
    rows: HashMap<TokenId, Vec<(TokenId, f32)>>,
    bytes_per_token: u64,
    vocab_size: usize,
}

impl BigramWeights {
    fn resolve(&self, text: &str) -> Option<TokenId> {
        if let Some(idx) = self.pieces.iter().position(|p| p == text) {
            return Some((BYTE_TOKENS + idx) as TokenId);
        }
        match text.as_bytes() {
            [b] if b.is_ascii() => Some(*b as TokenId),
            _ => None,
        }
    }

    fn next_logits(&self, previous: TokenId) -> Vec<f32> {
        let mut logits = vec![f32::NEG_INFINITY; self.vocab_size];
        match self.rows.get(&previous) {
            Some(row) => {
                for &(token, logit) in row {
                    logits[token as usize] = logit;
                }
            }
            None => {
                if let Some(&eog) = self.end_of_generation.first() {
                    logits[eog as usize] = 0.0;
                }
            }
        }
        logits
    }
}

/// Bigram model backend.
#[derive(Debug)]
pub struct BigramModel {
    info: ModelInfo,
    weights: Arc<BigramWeights>,
    decode_calls: Arc<AtomicU64>,
}

impl BigramModel {
    /// Build a model from its description, validating every referenced piece.
    pub fn from_spec(spec: ModelSpec) -> Result<Self> {
        if spec.context_length == 0 {
            return Err(Error::model_load("context_length must be positive"));
        }
        let vocab_size = BYTE_TOKENS + spec.pieces.len();

        let mut by_first_byte: HashMap<u8, Vec<usize>> = HashMap::new();
        for (idx, piece) in spec.pieces.iter().enumerate() {
            let first = *piece
                .as_bytes()
                .first()
                .ok_or_else(|| Error::model_load(format!("piece {} is empty", idx)))?;
            by_first_byte.entry(first).or_default().push(idx);
        }
        for candidates in by_first_byte.values_mut() {
            candidates.sort_by(|a, b| spec.pieces[*b].len().cmp(&spec.pieces[*a].len()));
        }

        let mut weights = BigramWeights {
            pieces: spec.pieces.clone(),
            by_first_byte,
            bos: None,
            end_of_generation: Vec::new(),
            rows: HashMap::new(),
            bytes_per_token: spec.bytes_per_token,
            vocab_size,
        };

        let lookup = |weights: &BigramWeights, text: &str| {
            weights
                .resolve(text)
                .ok_or_else(|| Error::model_load(format!("unknown piece {:?}", text)))
        };

        weights.bos = match spec.bos.as_deref() {
            Some(text) => Some(lookup(&weights, text)?),
            None => None,
        };
        let mut eog = Vec::with_capacity(spec.end_of_generation.len());
        for text in &spec.end_of_generation {
            eog.push(lookup(&weights, text)?);
        }
        if eog.is_empty() {
            return Err(Error::model_load("model defines no end-of-generation piece"));
        }
        weights.end_of_generation = eog;

        let mut rows = HashMap::with_capacity(spec.transitions.len());
        for (from, row) in &spec.transitions {
            let from_id = lookup(&weights, from)?;
            let mut entries = Vec::with_capacity(row.len());
            for (to, logit) in row {
                if logit.is_nan() {
                    return Err(Error::model_load(format!("NaN logit for {:?} -> {:?}", from, to)));
                }
                entries.push((lookup(&weights, to)?, *logit));
            }
            entries.sort_by_key(|(token, _)| *token);
            rows.insert(from_id, entries);
        }
        weights.rows = rows;

        Ok(Self {
            info: ModelInfo {
                name: spec.name,
                context_length: spec.context_length,
                vocab_size,
                architecture: "bigram".to_string(),
            },
            weights: Arc::new(weights),
            decode_calls: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of successful decode calls across every context of this model.
    pub fn decode_calls(&self) -> u64 {
        self.decode_calls.load(Ordering::Relaxed)
    }
}

impl ModelBackend for BigramModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn tokenize(&self, text: &str, mode: EncodeMode) -> Result<Vec<TokenId>> {
        let w = &self.weights;
        let bytes = text.as_bytes();
        let mut tokens = Vec::with_capacity(bytes.len() / 2 + 1);

        if mode == EncodeMode::Prefix {
            if let Some(bos) = w.bos {
                tokens.push(bos);
            }
        }

        let mut i = 0;
        while i < bytes.len() {
            let matched = w.by_first_byte.get(&bytes[i]).and_then(|candidates| {
                candidates
                    .iter()
                    .find(|&&idx| bytes[i..].starts_with(w.pieces[idx].as_bytes()))
            });
            match matched {
                Some(&idx) => {
                    tokens.push((BYTE_TOKENS + idx) as TokenId);
                    i += w.pieces[idx].len();
                }
                None => {
                    tokens.push(bytes[i] as TokenId);
                    i += 1;
                }
            }
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        let idx = token as usize;
        if idx < BYTE_TOKENS {
            let byte = [token as u8];
            return std::str::from_utf8(&byte)
                .map(str::to_string)
                .map_err(|_| Error::tokenization(format!("byte token 0x{:02x} is not valid UTF-8 on its own", idx)));
        }
        self.weights
            .pieces
            .get(idx - BYTE_TOKENS)
            .cloned()
            .ok_or_else(|| Error::tokenization(format!("token {} is outside the vocabulary", token)))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.weights.end_of_generation.contains(&token)
    }

    fn vocab_size(&self) -> usize {
        self.weights.vocab_size
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn ContextBackend>> {
        if params.max_context_tokens == 0 || params.max_batch_tokens == 0 {
            return Err(Error::context_creation("context and batch capacity must be positive"));
        }
        if params.decode_threads == 0 {
            return Err(Error::context_creation("decode_threads must be positive"));
        }
        if params.max_context_tokens > self.info.context_length {
            return Err(Error::context_creation(format!(
                "requested {} context tokens but model was trained for {}",
                params.max_context_tokens, self.info.context_length
            )));
        }
        if let Some(budget) = params.memory_budget_bytes {
            let needed = self.weights.bytes_per_token.saturating_mul(params.max_context_tokens as u64);
            if needed > budget {
                return Err(Error::context_creation(format!(
                    "insufficient memory: context needs {} bytes, budget is {}",
                    needed, budget
                )));
            }
        }

        debug!(
            "Creating bigram context: n_ctx={}, n_batch={}, threads={}",
            params.max_context_tokens, params.max_batch_tokens, params.decode_threads
        );

        Ok(Box::new(BigramContext {
            weights: self.weights.clone(),
            decode_calls: self.decode_calls.clone(),
            tokens: Vec::with_capacity(params.max_context_tokens),
            logits: Vec::new(),
            capacity: params.max_context_tokens,
            batch_capacity: params.max_batch_tokens.min(params.max_context_tokens),
        }))
    }
}

struct BigramContext {
    weights: Arc<BigramWeights>,
    decode_calls: Arc<AtomicU64>,
    tokens: Vec<TokenId>,
    logits: Vec<f32>,
    capacity: usize,
    batch_capacity: usize,
}

impl BigramContext {
    fn refresh_logits(&mut self) {
        self.logits = match self.tokens.last() {
            Some(&last) => self.weights.next_logits(last),
            None => Vec::new(),
        };
    }
}

impl ContextBackend for BigramContext {
    fn decode(&mut self, tokens: &[TokenId], start_pos: usize) -> Result<()> {
        if tokens.is_empty() {
            return Err(Error::decode("empty batch"));
        }
        if start_pos != self.tokens.len() {
            return Err(Error::decode(format!(
                "batch starts at position {} but context holds {}",
                start_pos,
                self.tokens.len()
            )));
        }
        if tokens.len() > self.batch_capacity {
            return Err(Error::decode(format!(
                "batch of {} tokens exceeds batch capacity {}",
                tokens.len(),
                self.batch_capacity
            )));
        }
        if start_pos + tokens.len() > self.capacity {
            return Err(Error::decode(format!(
                "context full: {} + {} exceeds {}",
                start_pos,
                tokens.len(),
                self.capacity
            )));
        }
        if let Some(bad) = tokens.iter().find(|&&t| t as usize >= self.weights.vocab_size) {
            return Err(Error::decode(format!("token {} is outside the vocabulary", bad)));
        }

        self.tokens.extend_from_slice(tokens);
        self.refresh_logits();
        self.decode_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn truncate(&mut self, pos: usize) {
        if pos < self.tokens.len() {
            self.tokens.truncate(pos);
            self.refresh_logits();
        }
    }

    fn position(&self) -> usize {
        self.tokens.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }
}

/// Loads [`ModelSpec`] JSON files.
#[derive(Debug, Clone)]
pub struct ReferenceLoader {
    max_model_bytes: u64,
}

impl ReferenceLoader {
    pub fn new(max_model_bytes: u64) -> Self {
        Self { max_model_bytes }
    }
}

impl Default for ReferenceLoader {
    fn default() -> Self {
        Self::new(limits::MAX_MODEL_FILE_SIZE)
    }
}

impl ModelLoader for ReferenceLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn ModelBackend>> {
        let metadata = fs::metadata(path)
            .map_err(|e| Error::model_load(format!("cannot open {}: {}", path.display(), e)))?;
        if metadata.len() > self.max_model_bytes {
            return Err(Error::model_load(format!(
                "{} is {} bytes, exceeding the {} byte memory budget",
                path.display(),
                metadata.len(),
                self.max_model_bytes
            )));
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| Error::model_load(format!("cannot read {}: {}", path.display(), e)))?;
        let mut spec: ModelSpec = serde_json::from_str(&raw)
            .map_err(|e| Error::model_load(format!("malformed model file {}: {}", path.display(), e)))?;
        if spec.name.is_empty() {
            spec.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
        }

        Ok(Arc::new(BigramModel::from_spec(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    fn params(n_ctx: usize, n_batch: usize) -> ContextParams {
        ContextParams {
            max_context_tokens: n_ctx,
            max_batch_tokens: n_batch,
            decode_threads: 1,
            memory_budget_bytes: None,
        }
    }

    fn chain_spec() -> ModelSpec {
        let mut spec = ModelSpec::default();
        spec.pieces.extend(["hello".to_string(), " world".to_string()]);
        spec.transitions.insert("hello".into(), HashMap::from([(" world".into(), 3.0)]));
        spec.transitions.insert(" world".into(), HashMap::from([("<|im_end|>".into(), 1.0)]));
        spec
    }

    #[test]
    fn test_tokenize_prefers_longest_piece() {
        let model = BigramModel::from_spec(chain_spec()).unwrap();
        let tokens = model.tokenize("<|im_start|>hello world!", EncodeMode::Continuation).unwrap();
        let pieces: Vec<String> = tokens.iter().map(|t| model.token_to_piece(*t).unwrap()).collect();
        assert_eq!(pieces, vec!["<|im_start|>", "hello", " world", "!"]);
    }

    #[test]
    fn test_prefix_mode_adds_bos() {
        let mut spec = chain_spec();
        spec.pieces.push("<s>".into());
        spec.bos = Some("<s>".into());
        let model = BigramModel::from_spec(spec).unwrap();

        let prefix = model.tokenize("hello", EncodeMode::Prefix).unwrap();
        let cont = model.tokenize("hello", EncodeMode::Continuation).unwrap();
        assert_eq!(prefix.len(), cont.len() + 1);
        assert_eq!(model.token_to_piece(prefix[0]).unwrap(), "<s>");
    }

    #[test]
    fn test_lone_continuation_byte_is_not_text() {
        let model = BigramModel::from_spec(ModelSpec::default()).unwrap();
        let tokens = model.tokenize("é", EncodeMode::Continuation).unwrap();
        assert_eq!(tokens.len(), 2);
        let err = model.token_to_piece(tokens[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tokenization);
    }

    #[test]
    fn test_unknown_transition_piece_rejected() {
        let mut spec = ModelSpec::default();
        spec.transitions.insert("nope".into(), HashMap::new());
        let err = BigramModel::from_spec(spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelLoad);
    }

    #[test]
    fn test_context_positions_and_logits() {
        let model = BigramModel::from_spec(chain_spec()).unwrap();
        let mut ctx = model.new_context(&params(16, 4)).unwrap();
        let tokens = model.tokenize("hello", EncodeMode::Continuation).unwrap();

        ctx.decode(&tokens, 0).unwrap();
        assert_eq!(ctx.position(), 1);
        let world = model.tokenize(" world", EncodeMode::Continuation).unwrap()[0];
        let best = ctx
            .logits()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i as TokenId)
            .unwrap();
        assert_eq!(best, world);

        // wrong start position
        assert!(ctx.decode(&[world], 0).is_err());
        ctx.truncate(0);
        assert_eq!(ctx.position(), 0);
        assert!(ctx.logits().is_empty());
        assert_eq!(model.decode_calls(), 1);
    }

    #[test]
    fn test_context_limits() {
        let model = BigramModel::from_spec(chain_spec()).unwrap();
        let mut ctx = model.new_context(&params(4, 2)).unwrap();
        assert!(ctx.decode(&[1, 2, 3], 0).is_err());
        ctx.decode(&[1, 2], 0).unwrap();
        ctx.decode(&[3, 4], 2).unwrap();
        let err = ctx.decode(&[5], 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_context_creation_errors() {
        let mut spec = chain_spec();
        spec.context_length = 64;
        spec.bytes_per_token = 1024;
        let model = BigramModel::from_spec(spec).unwrap();

        assert!(model.new_context(&params(128, 8)).is_err());
        assert!(model.new_context(&params(0, 8)).is_err());

        let mut p = params(64, 8);
        p.memory_budget_bytes = Some(1024);
        let err = model.new_context(&p).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ContextCreation);
    }

    #[test]
    fn test_loader_errors() {
        let loader = ReferenceLoader::new(64);
        let missing = loader.load(Path::new("/definitely/not/here.json")).err().unwrap();
        assert_eq!(missing.kind(), ErrorKind::ModelLoad);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{{ not json").unwrap();
        assert!(loader.load(bad.path()).is_err());

        let mut big = tempfile::NamedTempFile::new().unwrap();
        write!(big, "{}", " ".repeat(128)).unwrap();
        let err = loader.load(big.path()).err().unwrap();
        assert!(err.to_string().contains("memory budget"));
    }

    #[test]
    fn test_loader_names_model_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny-docent.json");
        let mut spec = chain_spec();
        spec.name.clear();
        fs::write(&path, serde_json::to_string(&spec).unwrap()).unwrap();

        let model = ReferenceLoader::default().load(&path).unwrap();
        assert_eq!(model.info().name, "tiny-docent");
        assert_eq!(model.vocab_size(), 256 + 5);
    }
}
