//! Token sampler chain: min-p filter, temperature, seeded categorical draw

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::TokenId;
use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// One filtering step applied before the final draw.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    /// Drop tokens whose probability is below `p` times the top probability,
    /// keeping at least `min_keep`.
    MinP { p: f32, min_keep: usize },
    /// Divide logits by the temperature; zero collapses to the most likely token.
    Temperature(f32),
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: TokenId,
    logit: f32,
}

/// Ordered sampler pipeline with its random state.
///
/// The chain is stateful: the RNG advances with every draw. [`SamplerChain::reset`]
/// rewinds it to the configured seed, which is what makes two generations
/// over the same context produce the same tokens.
#[derive(Debug)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    seed: u64,
    rng: StdRng,
    candidates: Vec<Candidate>,
}

impl SamplerChain {
    /// Build the standard chain from configuration.
    pub fn from_config(config: &SamplingConfig) -> Result<Self> {
        let seed = config.seed.unwrap_or_else(rand::random);
        Self::new(
            vec![
                SamplerStage::MinP {
                    p: config.min_p,
                    min_keep: config.min_keep,
                },
                SamplerStage::Temperature(config.temperature),
            ],
            seed,
        )
    }

    pub fn new(stages: Vec<SamplerStage>, seed: u64) -> Result<Self> {
        for stage in &stages {
            match *stage {
                SamplerStage::MinP { p, min_keep } => {
                    if !(0.0..=1.0).contains(&p) {
                        return Err(Error::SamplerInit(format!("min_p must be within [0, 1], got {}", p)));
                    }
                    if min_keep == 0 {
                        return Err(Error::SamplerInit("min_keep must be at least 1".to_string()));
                    }
                }
                SamplerStage::Temperature(t) => {
                    if !t.is_finite() || t < 0.0 {
                        return Err(Error::SamplerInit(format!(
                            "temperature must be a non-negative number, got {}",
                            t
                        )));
                    }
                }
            }
        }

        Ok(Self {
            stages,
            seed,
            rng: StdRng::seed_from_u64(seed),
            candidates: Vec::new(),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Discard random state from previous draws.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.candidates.clear();
    }

    /// Pick the next token from a logit vector.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId> {
        self.candidates.clear();
        self.candidates.extend(
            logits
                .iter()
                .enumerate()
                .filter(|(_, l)| l.is_finite())
                .map(|(i, &logit)| Candidate {
                    id: i as TokenId,
                    logit,
                }),
        );
        if self.candidates.is_empty() {
            return Err(Error::decode("no finite logits to sample from"));
        }

        for stage in &self.stages {
            match *stage {
                SamplerStage::MinP { p, min_keep } => apply_min_p(&mut self.candidates, p, min_keep),
                SamplerStage::Temperature(t) => apply_temperature(&mut self.candidates, t),
            }
        }

        if self.candidates.len() == 1 {
            return Ok(self.candidates[0].id);
        }

        let max = max_logit(&self.candidates);
        let weights = self.candidates.iter().map(|c| ((c.logit - max) as f64).exp());
        let dist = WeightedIndex::new(weights).map_err(|e| Error::decode(format!("sampling failed: {}", e)))?;
        Ok(self.candidates[dist.sample(&mut self.rng)].id)
    }
}

fn max_logit(candidates: &[Candidate]) -> f32 {
    candidates.iter().map(|c| c.logit).fold(f32::NEG_INFINITY, f32::max)
}

fn apply_min_p(candidates: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    if p <= 0.0 || candidates.len() <= min_keep {
        return;
    }
    // p_i / p_max >= p  <=>  logit_i - logit_max >= ln(p)
    let threshold = max_logit(candidates) + p.ln();
    let kept = candidates.iter().filter(|c| c.logit >= threshold).count();
    if kept >= min_keep {
        candidates.retain(|c| c.logit >= threshold);
    } else {
        candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit).then(a.id.cmp(&b.id)));
        candidates.truncate(min_keep);
        candidates.sort_by_key(|c| c.id);
    }
}

fn apply_temperature(candidates: &mut Vec<Candidate>, t: f32) {
    if t <= 0.0 {
        let max = max_logit(candidates);
        if let Some(best) = candidates.iter().find(|c| c.logit == max).copied() {
            candidates.clear();
            candidates.push(best);
        }
        return;
    }
    for c in candidates.iter_mut() {
        c.logit /= t;
    }
}
