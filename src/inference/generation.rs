use anyhow::{bail, Result};
use std::{fmt, str::FromStr};

/// Which decoding profile the process serves. Chosen once at startup; it also
/// fixes the shape of the `result` field in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationMode {
    /// Beam search, one output, `result` is a string.
    Beam,
    /// Beam sampling, three independent candidates, `result` is a list.
    #[default]
    Diverse,
}

impl GenerationMode {
    /// Build the per-request config for this mode with the derived length bounds.
    pub fn config(self, min_length: usize, max_length: usize) -> GenerationConfig {
        let base = GenerationConfig {
            min_length,
            max_length,
            num_beams: 3,
            repetition_penalty: 1.5,
            length_penalty: 1.0,
            no_repeat_ngram_size: 2,
            use_cache: true,
            sampling_enabled: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 0.95,
            num_return_sequences: 1,
            seed: None,
        };

        match self {
            GenerationMode::Beam => base,
            GenerationMode::Diverse => GenerationConfig {
                num_beams: 2,
                sampling_enabled: true,
                num_return_sequences: 3,
                ..base
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Beam => "beam",
            GenerationMode::Diverse => "diverse",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beam" | "deterministic" => Ok(GenerationMode::Beam),
            "diverse" | "sample" | "sampling" => Ok(GenerationMode::Diverse),
            other => bail!("unknown generation mode '{other}' (expected 'beam' or 'diverse')"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Lower bound on decoder length, decoder start token included.
    pub min_length: usize,
    /// Upper bound on decoder length, decoder start token included.
    pub max_length: usize,
    pub num_beams: usize,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    /// 0 disables the ban.
    pub no_repeat_ngram_size: usize,
    pub use_cache: bool,
    pub sampling_enabled: bool,
    pub temperature: f32,
    /// 0 disables top-k filtering.
    pub top_k: usize,
    pub top_p: f32,
    pub num_return_sequences: usize,
    pub seed: Option<u64>,
}

impl GenerationConfig {
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            bail!("num_beams must be at least 1");
        }
        if self.num_return_sequences == 0 {
            bail!("num_return_sequences must be at least 1");
        }
        if !self.sampling_enabled && self.num_return_sequences > self.num_beams {
            bail!(
                "num_return_sequences ({}) cannot exceed num_beams ({}) without sampling",
                self.num_return_sequences,
                self.num_beams
            );
        }
        if self.repetition_penalty <= 0.0 || !self.repetition_penalty.is_finite() {
            bail!("repetition_penalty must be a positive number");
        }
        if self.sampling_enabled {
            if self.temperature <= 0.0 || !self.temperature.is_finite() {
                bail!("temperature must be a positive number");
            }
            if !(self.top_p > 0.0 && self.top_p <= 1.0) {
                bail!("top_p must be in (0, 1], got {}", self.top_p);
            }
        }
        Ok(())
    }
}
