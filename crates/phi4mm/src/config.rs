use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::error::Phi4MmError;

/// Hugging Face repository of the model served by default.
pub const DEFAULT_MODEL_ID: &str = "microsoft/Phi-4-multimodal-instruct";

/// Number of new tokens generated when neither the request nor the generation
/// configuration provide a bound.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

/// Runtime configuration of the [`crate::Phi4Multimodal`] pipeline.
///
/// The sampling fields are overrides: when left to `None` the values of the
/// model's `generation_config.json` are used.
#[derive(Clone, Debug)]
pub struct Phi4MmConfig {
    /// Hub repository to download the model from.
    pub model_id: String,
    /// Optional hub revision (branch, tag or commit).
    pub revision: Option<String>,
    /// Optional local directory holding the model files. If provided, nothing
    /// is downloaded from the Hugging Face Hub.
    pub weights_dir: Option<PathBuf>,
    pub seed: u64,
    pub do_sample: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_n: usize,
    /// Run on the CPU even when the `cuda` feature is enabled.
    pub force_cpu: bool,
    /// Accept `file://` urls and plain paths as `content_url`.
    pub allow_local_files: bool,
    pub debug: bool,
}

impl Default for Phi4MmConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: None,
            weights_dir: None,
            seed: 42,
            do_sample: None,
            temperature: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            repeat_last_n: 64,
            force_cpu: false,
            allow_local_files: true,
            debug: false,
        }
    }
}

/// Decoding parameters stored in the model's `generation_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, deserialize_with = "one_or_many")]
    pub eos_token_id: Vec<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            eos_token_id: Vec::new(),
            bos_token_id: None,
            pad_token_id: None,
            do_sample: false,
            temperature: default_temperature(),
            top_p: None,
            top_k: None,
            repetition_penalty: default_repetition_penalty(),
            max_new_tokens: None,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Phi4MmError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

fn default_temperature() -> f64 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

/// `eos_token_id` is either a single id or a list of ids.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
        None => Vec::new(),
    })
}
