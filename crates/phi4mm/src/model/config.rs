use std::path::Path;

use serde::Deserialize;

use crate::error::Phi4MmError;

#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    pub short_factor: Vec<f64>,
    pub long_factor: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NemoConvSettings {
    #[serde(default = "default_conv_channels")]
    pub conv_channels: usize,
}

impl Default for NemoConvSettings {
    fn default() -> Self {
        Self {
            conv_channels: default_conv_channels(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelativeAttentionBiasArgs {
    #[serde(default = "default_t5_bias_max_distance")]
    pub t5_bias_max_distance: usize,
}

impl Default for RelativeAttentionBiasArgs {
    fn default() -> Self {
        Self {
            t5_bias_max_distance: default_t5_bias_max_distance(),
        }
    }
}

/// Conformer speech encoder hyper-parameters (`audio_processor.config`).
#[derive(Debug, Clone, Deserialize)]
pub struct ConformerConfig {
    #[serde(default = "default_audio_input_size")]
    pub input_size: usize,
    #[serde(default = "default_attention_dim")]
    pub attention_dim: usize,
    #[serde(default = "default_attention_heads")]
    pub attention_heads: usize,
    #[serde(default = "default_linear_units")]
    pub linear_units: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_time_reduction")]
    pub time_reduction: usize,
    #[serde(default)]
    pub nemo_conv_settings: NemoConvSettings,
    #[serde(default)]
    pub relative_attention_bias_args: RelativeAttentionBiasArgs,
}

impl Default for ConformerConfig {
    fn default() -> Self {
        Self {
            input_size: default_audio_input_size(),
            attention_dim: default_attention_dim(),
            attention_heads: default_attention_heads(),
            linear_units: default_linear_units(),
            num_blocks: default_num_blocks(),
            kernel_size: default_kernel_size(),
            time_reduction: default_time_reduction(),
            nemo_conv_settings: NemoConvSettings::default(),
            relative_attention_bias_args: RelativeAttentionBiasArgs::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioProcessorConfig {
    #[serde(default)]
    pub config: ConformerConfig,
}

/// SigLIP image encoder used by the vision embedding. Not part of `config.json`.
#[derive(Debug, Clone, Copy)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Layers actually evaluated: features are read from the second to last layer.
    pub num_layers_used: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    pub const SIGLIP_SO400M_448: VisionConfig = VisionConfig {
        hidden_size: 1152,
        intermediate_size: 4304,
        num_attention_heads: 16,
        num_layers_used: 26,
        image_size: 448,
        patch_size: 14,
        layer_norm_eps: 1e-6,
    };

    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }
}

/// `config.json` of the Phi-4 multimodal checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Phi4MmModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub vision_lora: Option<LoraConfig>,
    #[serde(default)]
    pub speech_lora: Option<LoraConfig>,
    #[serde(default)]
    pub audio_processor: AudioProcessorConfig,
}

impl Phi4MmModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Phi4MmError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn rotary_dim(&self) -> usize {
        (self.head_dim() as f64 * self.partial_rotary_factor) as usize
    }

    pub fn original_max_position_embeddings(&self) -> usize {
        self.original_max_position_embeddings
            .unwrap_or(self.max_position_embeddings)
    }

    fn validate(&self) -> Result<(), Phi4MmError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Phi4MmError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_kv_heads() == 0 || self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(Phi4MmError::InvalidConfig(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        let rotary_dim = self.rotary_dim();
        if rotary_dim % 2 != 0 || rotary_dim > self.head_dim() {
            return Err(Phi4MmError::InvalidConfig(format!(
                "invalid rotary dimension {rotary_dim}"
            )));
        }
        if let Some(scaling) = &self.rope_scaling {
            if scaling.short_factor.len() != rotary_dim / 2
                || scaling.long_factor.len() != rotary_dim / 2
            {
                return Err(Phi4MmError::InvalidConfig(format!(
                    "rope scaling factors must have {} entries",
                    rotary_dim / 2
                )));
            }
        }
        Ok(())
    }
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_partial_rotary_factor() -> f64 {
    1.0
}

fn default_conv_channels() -> usize {
    1024
}

fn default_t5_bias_max_distance() -> usize {
    500
}

fn default_audio_input_size() -> usize {
    80
}

fn default_attention_dim() -> usize {
    1024
}

fn default_attention_heads() -> usize {
    16
}

fn default_linear_units() -> usize {
    1536
}

fn default_num_blocks() -> usize {
    24
}

fn default_kernel_size() -> usize {
    3
}

fn default_time_reduction() -> usize {
    8
}
