use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use log::{debug, info};
use serde::Deserialize;

use crate::config::Phi4MmConfig;
use crate::error::Phi4MmError;

const CONFIG_FILE: &str = "config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// Local paths of every file needed to build the pipeline.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub generation_config: PathBuf,
    pub tokenizer: PathBuf,
    pub preprocessor_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

impl ModelFiles {
    /// Use the local directory of `config` when set, the Hugging Face Hub otherwise.
    pub fn resolve(config: &Phi4MmConfig) -> Result<Self, Phi4MmError> {
        match &config.weights_dir {
            Some(dir) => Self::from_dir(dir),
            None => Self::from_hub(&config.model_id, config.revision.as_deref()),
        }
    }

    /// Download (or reuse from the cache) the model files of `model_id`.
    ///
    /// The `HF_TOKEN` environment variable is used for gated repositories.
    pub fn from_hub(model_id: &str, revision: Option<&str>) -> Result<Self, Phi4MmError> {
        info!("Loading model files from HuggingFace Hub: {model_id}");
        let api = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .build()?;
        let repo = match revision {
            Some(revision) => api.repo(Repo::with_revision(
                model_id.to_string(),
                RepoType::Model,
                revision.to_string(),
            )),
            None => api.model(model_id.to_string()),
        };

        let weights = match repo.get(WEIGHTS_INDEX_FILE) {
            Ok(index) => hub_load_safetensors(&repo, &index)?,
            Err(err) => {
                debug!("No {WEIGHTS_INDEX_FILE} ({err}), using {SINGLE_WEIGHTS_FILE}");
                vec![repo.get(SINGLE_WEIGHTS_FILE)?]
            }
        };

        Ok(Self {
            config: repo.get(CONFIG_FILE)?,
            generation_config: repo.get(GENERATION_CONFIG_FILE)?,
            tokenizer: repo.get(TOKENIZER_FILE)?,
            preprocessor_config: repo.get(PREPROCESSOR_CONFIG_FILE).ok(),
            weights,
        })
    }

    /// Read the model files from a directory laid out like the hub repository.
    pub fn from_dir(dir: &Path) -> Result<Self, Phi4MmError> {
        info!("Loading model files from {}", dir.display());
        let required = |name: &str| -> Result<PathBuf, Phi4MmError> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Phi4MmError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )))
            }
        };

        let index = dir.join(WEIGHTS_INDEX_FILE);
        let weights = if index.is_file() {
            weight_files(&index)?
                .into_iter()
                .map(|name| required(&name))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![required(SINGLE_WEIGHTS_FILE)?]
        };

        let preprocessor_config = dir.join(PREPROCESSOR_CONFIG_FILE);
        Ok(Self {
            config: required(CONFIG_FILE)?,
            generation_config: required(GENERATION_CONFIG_FILE)?,
            tokenizer: required(TOKENIZER_FILE)?,
            preprocessor_config: preprocessor_config.is_file().then_some(preprocessor_config),
            weights,
        })
    }
}

/// Fetch every shard referenced by a downloaded safetensors index.
fn hub_load_safetensors(repo: &ApiRepo, index: &Path) -> Result<Vec<PathBuf>, Phi4MmError> {
    weight_files(index)?
        .iter()
        .map(|name| Ok(repo.get(name)?))
        .collect()
}

/// Distinct shard names of a `model.safetensors.index.json`, sorted.
fn weight_files(index: &Path) -> Result<Vec<String>, Phi4MmError> {
    let index: WeightsIndex = serde_json::from_str(&std::fs::read_to_string(index)?)?;
    Ok(index
        .weight_map
        .into_values()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_index(dir: &Path) -> Result<(), Phi4MmError> {
        let index = serde_json::json!({
            "metadata": {"total_size": 0},
            "weight_map": {
                "lm_head.weight": "model-00003-of-00003.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00003.safetensors",
                "model.layers.0.mlp.down_proj.base_layer.weight": "model-00001-of-00003.safetensors",
                "model.norm.weight": "model-00002-of-00003.safetensors"
            }
        });
        std::fs::write(dir.join(WEIGHTS_INDEX_FILE), index.to_string())?;
        Ok(())
    }

    #[test]
    fn test_weight_files_are_deduplicated_and_sorted() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        write_index(dir.path())?;

        let files = weight_files(&dir.path().join(WEIGHTS_INDEX_FILE))?;
        assert_eq!(
            files,
            vec![
                "model-00001-of-00003.safetensors",
                "model-00002-of-00003.safetensors",
                "model-00003-of-00003.safetensors",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_from_dir() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        for name in [CONFIG_FILE, GENERATION_CONFIG_FILE, TOKENIZER_FILE, SINGLE_WEIGHTS_FILE] {
            std::fs::write(dir.path().join(name), "{}")?;
        }

        let files = ModelFiles::from_dir(dir.path())?;
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_WEIGHTS_FILE)]);
        assert!(files.preprocessor_config.is_none());

        // once an index exists its shards are required
        write_index(dir.path())?;
        assert!(matches!(
            ModelFiles::from_dir(dir.path()),
            Err(Phi4MmError::IoError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_resolve_uses_local_dir() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let config = Phi4MmConfig {
            weights_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        // an empty directory must not fall back to the network
        assert!(matches!(
            ModelFiles::resolve(&config),
            Err(Phi4MmError::IoError(_))
        ));
        Ok(())
    }
}
