use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5::{Config as T5Config, T5ForConditionalGeneration};
use hf_hub::{api::sync::Api, Repo, RepoType};
use ndarray::Array2;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::generation::GenerationConfig;
use super::search::{self, NextTokenScores, SpecialTokens};
use super::ParaphraseModel;
use crate::config::ModelSettings;

/// T5 encoder-decoder loaded once at startup. The weights sit behind a
/// single-slot lock because candle's forward passes need `&mut self`.
pub struct T5Service {
    model: Mutex<T5ForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    special: SpecialTokens,
}

struct SnapshotFiles {
    config: PathBuf,
    weights: PathBuf,
    tokenizer: PathBuf,
}

impl T5Service {
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let device = settings.device.build()?;
        info!(device = ?device, "loading paraphrase model");

        let files = match &settings.snapshot_dir {
            Some(dir) => {
                info!(snapshot = %dir.display(), "using local snapshot");
                resolve_local(dir, settings.tokenizer.as_deref())?
            }
            None => {
                info!(model = %settings.model_id, revision = %settings.revision, "fetching from hub");
                resolve_hub(&settings.model_id, &settings.revision, settings.tokenizer.as_deref())?
            }
        };

        let raw = fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let mut config: T5Config = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;
        // Beams are re-ranked every step, so the decoder recomputes the full prefix.
        config.use_cache = false;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
            anyhow!("Tokenizer load failed ({}): {e}", files.tokenizer.display())
        })?;
        tokenizer.with_padding(None);
        let _ = tokenizer.with_truncation(None);

        let vb = build_var_builder(&files.weights, DType::F32, &device)?;
        let model = T5ForConditionalGeneration::load(vb, &config)
            .with_context(|| format!("failed to build T5 from {}", files.weights.display()))?;

        let special = SpecialTokens {
            decoder_start: config.decoder_start_token_id.unwrap_or(config.pad_token_id) as u32,
            eos: config.eos_token_id as u32,
        };

        info!(
            weights = %files.weights.display(),
            vocab = config.vocab_size,
            layers = config.num_layers,
            "paraphrase model ready"
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            special,
        })
    }
}

impl ParaphraseModel for T5Service {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn generate(&self, tokens: &[u32], config: &GenerationConfig) -> Result<Vec<Vec<u32>>> {
        if tokens.is_empty() {
            bail!("cannot generate from an empty token sequence");
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned by an earlier panic"))?;

        model.clear_kv_cache();
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let encoder_output = model.encode(&input)?;

        let mut scorer = T5Scorer {
            model: &mut *model,
            encoder_output: &encoder_output,
            device: &self.device,
        };
        let sequences = search::generate(&mut scorer, self.special, config);
        model.clear_kv_cache();
        sequences
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))
    }
}

struct T5Scorer<'a> {
    model: &'a mut T5ForConditionalGeneration,
    encoder_output: &'a Tensor,
    device: &'a Device,
}

impl NextTokenScores for T5Scorer<'_> {
    fn next_token_logits(&mut self, prefixes: &[Vec<u32>]) -> Result<Array2<f32>> {
        let batch = prefixes.len();
        let seq_len = prefixes.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || seq_len == 0 {
            bail!("decoder step needs at least one non-empty prefix");
        }
        if prefixes.iter().any(|p| p.len() != seq_len) {
            bail!("decoder prefixes must share a length");
        }

        let decoder_ids = Tensor::from_vec(prefixes.concat(), (batch, seq_len), self.device)?;
        let encoder = self.encoder_output.repeat((batch, 1, 1))?;

        self.model.clear_kv_cache();
        let logits = self
            .model
            .decode(&decoder_ids, &encoder)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let vocab = logits.first().map(Vec::len).unwrap_or(0);
        debug!(batch, seq_len, vocab, "decoder step");
        Array2::from_shape_vec((batch, vocab), logits.concat())
            .map_err(|e| anyhow!("unexpected logits shape: {e}"))
    }
}

fn resolve_local(dir: &Path, tokenizer: Option<&Path>) -> Result<SnapshotFiles> {
    let config = dir.join("config.json");
    if !config.exists() {
        bail!("config.json not found under {}", dir.display());
    }

    let weights = ["model.safetensors", "pytorch_model.bin"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("no model weights found under {}", dir.display()))?;

    let tokenizer = match tokenizer {
        Some(path) => path.to_path_buf(),
        None => dir.join("tokenizer.json"),
    };
    if !tokenizer.exists() {
        bail!(
            "tokenizer not found at {}; set PARAPHRASE_TOKENIZER to a tokenizer.json",
            tokenizer.display()
        );
    }

    Ok(SnapshotFiles {
        config,
        weights,
        tokenizer,
    })
}

fn resolve_hub(model_id: &str, revision: &str, tokenizer: Option<&Path>) -> Result<SnapshotFiles> {
    let api = Api::new().context("failed to initialize the hub client")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .with_context(|| format!("{model_id}: config.json unavailable"))?;
    let weights = repo
        .get("model.safetensors")
        .or_else(|_| repo.get("pytorch_model.bin"))
        .with_context(|| format!("{model_id}: no safetensors or pytorch weights"))?;
    let tokenizer = match tokenizer {
        Some(path) => path.to_path_buf(),
        None => repo.get("tokenizer.json").with_context(|| {
            format!("{model_id}: tokenizer.json unavailable; set PARAPHRASE_TOKENIZER")
        })?,
    };

    Ok(SnapshotFiles {
        config,
        weights,
        tokenizer,
    })
}

fn build_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ext == "safetensors" {
        let files = vec![path.to_path_buf()];
        unsafe {
            VarBuilder::from_mmaped_safetensors(&files, dtype, device)
                .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
        }
    } else {
        VarBuilder::from_pth(path, dtype, device)
            .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
    }
}
