pub mod device;
pub mod generation;
pub mod logits;
pub mod search;
pub mod t5;

use anyhow::Result;

pub use generation::{GenerationConfig, GenerationMode};
pub use t5::T5Service;

/// Tokenizer plus generation capability the paraphrase pipeline runs on.
///
/// Calls block for the duration of inference; the HTTP layer runs them on the
/// blocking pool.
pub trait ParaphraseModel: Send + Sync {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>>;

    /// Returns `config.num_return_sequences` token sequences.
    fn generate(&self, tokens: &[u32], config: &GenerationConfig) -> Result<Vec<Vec<u32>>>;

    /// Decodes with special tokens skipped.
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}
