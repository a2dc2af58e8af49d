pub mod length;
pub mod normalize;

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::inference::{GenerationMode, ParaphraseModel};
use length::LengthBounds;
use normalize::clean_candidate;

/// Longest accepted input, counted in characters.
pub const MAX_TEXT_CHARS: usize = 500;

const PROMPT_PREFIX: &str = "parafrase: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParaphraseResult {
    Single(String),
    Candidates(Vec<String>),
}

pub fn within_limit(text: &str) -> bool {
    text.chars().count() <= MAX_TEXT_CHARS
}

pub fn build_prompt(text: &str) -> String {
    format!("{PROMPT_PREFIX}{text}")
}

/// Prompt -> tokens -> length bounds -> generation -> cleanup, for one mode.
#[derive(Clone)]
pub struct Paraphraser {
    model: Arc<dyn ParaphraseModel>,
    mode: GenerationMode,
    seed: Option<u64>,
}

impl Paraphraser {
    pub fn new(model: Arc<dyn ParaphraseModel>, mode: GenerationMode) -> Self {
        Self {
            model,
            mode,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    /// Blocks for the whole generation. Exactly one `generate` call is made.
    pub fn paraphrase(&self, text: &str) -> Result<ParaphraseResult> {
        let prompt = build_prompt(text);
        let tokens = self
            .model
            .encode(&prompt)
            .context("failed to encode prompt")?;

        let bounds = LengthBounds::for_input(tokens.len());
        let config = self
            .mode
            .config(bounds.min_length, bounds.max_length)
            .with_seed(self.seed);
        debug!(
            input_tokens = tokens.len(),
            min_length = config.min_length,
            max_length = config.max_length,
            mode = %self.mode,
            "generating paraphrase"
        );

        let sequences = self
            .model
            .generate(&tokens, &config)
            .context("paraphrase generation failed")?;

        let candidates = sequences
            .iter()
            .map(|seq| self.model.decode(seq).map(|raw| clean_candidate(&raw)))
            .collect::<Result<Vec<_>>>()
            .context("failed to decode paraphrase")?;

        Ok(match self.mode {
            GenerationMode::Beam => {
                ParaphraseResult::Single(candidates.into_iter().next().unwrap_or_default())
            }
            GenerationMode::Diverse => ParaphraseResult::Candidates(candidates),
        })
    }
}
