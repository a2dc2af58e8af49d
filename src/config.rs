use anyhow::{Context, Result};
use std::{net::SocketAddr, path::PathBuf};

use crate::inference::device::DevicePreference;
use crate::inference::GenerationMode;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_MODEL: &str = "cahya/t5-base-indonesian-summarization-cased";

/// Where the paraphrase weights come from and where they run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_id: String,
    pub revision: String,
    /// Local snapshot directory; when set the hub is never contacted.
    pub snapshot_dir: Option<PathBuf>,
    /// Explicit tokenizer.json, for checkpoints that only ship a sentencepiece model.
    pub tokenizer: Option<PathBuf>,
    pub device: DevicePreference,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL.to_string(),
            revision: "main".to_string(),
            snapshot_dir: None,
            tokenizer: None,
            device: DevicePreference::Cpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub mode: GenerationMode,
    pub seed: Option<u64>,
    pub model: ModelSettings,
}

impl ServerConfig {
    /// Reads `.env` (if present) and the `PARAPHRASE_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_raw = var("PARAPHRASE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("PARAPHRASE_BIND: invalid address '{bind_raw}'"))?;

        let mode = match var("PARAPHRASE_MODE") {
            Some(raw) => raw.parse::<GenerationMode>().context("PARAPHRASE_MODE")?,
            None => GenerationMode::default(),
        };

        let seed = var("PARAPHRASE_SEED")
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("PARAPHRASE_SEED: not a number '{raw}'"))
            })
            .transpose()?;

        let defaults = ModelSettings::default();
        let model = ModelSettings {
            model_id: var("PARAPHRASE_MODEL").unwrap_or(defaults.model_id),
            revision: var("PARAPHRASE_MODEL_REVISION").unwrap_or(defaults.revision),
            snapshot_dir: var("PARAPHRASE_MODEL_DIR").map(PathBuf::from),
            tokenizer: var("PARAPHRASE_TOKENIZER").map(PathBuf::from),
            device: var("PARAPHRASE_DEVICE")
                .map(|raw| DevicePreference::parse(&raw))
                .unwrap_or(defaults.device),
        };

        Ok(Self {
            bind,
            mode,
            seed,
            model,
        })
    }
}
