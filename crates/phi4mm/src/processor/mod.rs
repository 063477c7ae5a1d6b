//! Turns a formatted prompt and its media into model inputs.

pub mod audio;
pub mod image;

use std::path::Path;

use candle_core::Device;
use log::debug;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::Phi4MmError;
use crate::media::Media;

pub use audio::{AudioFeatureExtractor, AudioInputs};
pub use image::{HdLayout, ImageInputs, ImageProcessor, ImageProcessorConfig};

/// Special token repeated once per image embedding.
pub const IMAGE_TOKEN: &str = "<|endoftext10|>";
/// Special token repeated once per audio embedding.
pub const AUDIO_TOKEN: &str = "<|endoftext11|>";

const IMAGE_TAG_PREFIX: &str = "<|image_";
const AUDIO_TAG_PREFIX: &str = "<|audio_";

/// Subset of `preprocessor_config.json` used by the processors.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "default_dynamic_hd")]
    pub dynamic_hd: usize,
    #[serde(default = "default_audio_compression_rate")]
    pub audio_compression_rate: usize,
    #[serde(default = "default_one")]
    pub audio_downsample_rate: usize,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            dynamic_hd: default_dynamic_hd(),
            audio_compression_rate: default_audio_compression_rate(),
            audio_downsample_rate: default_one(),
        }
    }
}

impl PreprocessorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Phi4MmError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

fn default_dynamic_hd() -> usize {
    36
}

fn default_audio_compression_rate() -> usize {
    8
}

fn default_one() -> usize {
    1
}

/// Media tensors of a processed request.
#[derive(Debug, Clone)]
pub enum MediaInputs {
    Image(ImageInputs),
    Audio(AudioInputs),
}

impl MediaInputs {
    pub fn num_tokens(&self) -> usize {
        match self {
            MediaInputs::Image(inputs) => inputs.num_tokens,
            MediaInputs::Audio(inputs) => inputs.num_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedInputs {
    /// Prompt token ids, media placeholders expanded.
    pub input_ids: Vec<u32>,
    pub media: Option<MediaInputs>,
}

pub struct Phi4MmProcessor {
    tokenizer: Tokenizer,
    image_processor: ImageProcessor,
    audio_processor: AudioFeatureExtractor,
    image_token_id: u32,
    audio_token_id: u32,
    device: Device,
}

impl Phi4MmProcessor {
    pub fn new(
        tokenizer: Tokenizer,
        config: &PreprocessorConfig,
        device: &Device,
    ) -> Result<Self, Phi4MmError> {
        let token_id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| Phi4MmError::MissingSpecialToken(token.to_string()))
        };
        let image_token_id = token_id(IMAGE_TOKEN)?;
        let audio_token_id = token_id(AUDIO_TOKEN)?;

        Ok(Self {
            image_processor: ImageProcessor::new(
                ImageProcessorConfig::phi4_mm(config.dynamic_hd),
                device,
            )?,
            audio_processor: AudioFeatureExtractor::new(
                config.audio_compression_rate,
                config.audio_downsample_rate,
                device,
            )?,
            tokenizer,
            image_token_id,
            audio_token_id,
            device: device.clone(),
        })
    }

    pub fn from_files(
        tokenizer_file: impl AsRef<Path>,
        preprocessor_config_file: Option<&Path>,
        device: &Device,
    ) -> Result<Self, Phi4MmError> {
        let tokenizer = Tokenizer::from_file(tokenizer_file)?;
        let config = match preprocessor_config_file {
            Some(path) => PreprocessorConfig::from_file(path)?,
            None => PreprocessorConfig::default(),
        };
        Self::new(tokenizer, &config, device)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn image_token_id(&self) -> u32 {
        self.image_token_id
    }

    pub fn audio_token_id(&self) -> u32 {
        self.audio_token_id
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Preprocess the media, expand its placeholder in the prompt and tokenize.
    pub fn process(&self, prompt: &str, media: Option<&Media>) -> Result<ProcessedInputs, Phi4MmError> {
        let media = match media {
            Some(Media::Image(image)) => Some(MediaInputs::Image(
                self.image_processor.preprocess(image, &self.device)?,
            )),
            Some(Media::Audio(clip)) => Some(MediaInputs::Audio(self.audio_processor.extract(clip)?)),
            None => None,
        };

        let (image_counts, audio_counts) = match &media {
            Some(MediaInputs::Image(inputs)) => (vec![inputs.num_tokens], vec![]),
            Some(MediaInputs::Audio(inputs)) => (vec![], vec![inputs.num_tokens]),
            None => (vec![], vec![]),
        };
        let expanded = expand_placeholders(prompt, IMAGE_TAG_PREFIX, IMAGE_TOKEN, &image_counts)?;
        let expanded = expand_placeholders(&expanded, AUDIO_TAG_PREFIX, AUDIO_TOKEN, &audio_counts)?;

        let input_ids = self.tokenizer.encode(expanded, true)?.get_ids().to_vec();
        debug!("Prompt encoded into {} tokens", input_ids.len());

        Ok(ProcessedInputs { input_ids, media })
    }

    /// Decode generated ids, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String, Phi4MmError> {
        Ok(self.tokenizer.decode(ids, true)?)
    }
}

/// Replace every `<|{prefix}N|>` tag with `counts[N - 1]` copies of `token`.
///
/// Each media item must be referenced by exactly one tag.
fn expand_placeholders(
    prompt: &str,
    prefix: &str,
    token: &str,
    counts: &[usize],
) -> Result<String, Phi4MmError> {
    let mut out = String::with_capacity(prompt.len() + counts.iter().sum::<usize>() * token.len());
    let mut seen = vec![false; counts.len()];
    let mut tags = 0;
    let mut rest = prompt;

    while let Some(start) = rest.find(prefix) {
        let after = &rest[start + prefix.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !after[digits..].starts_with("|>") {
            // not a tag, keep the prefix verbatim
            out.push_str(&rest[..start + prefix.len()]);
            rest = after;
            continue;
        }

        tags += 1;
        let index = after[..digits].parse::<usize>().unwrap_or(0);
        if index == 0 || index > counts.len() || seen[index - 1] {
            return Err(Phi4MmError::MismatchedMediaCount {
                tags,
                media: counts.len(),
            });
        }
        seen[index - 1] = true;

        out.push_str(&rest[..start]);
        out.push_str(&token.repeat(counts[index - 1]));
        rest = &after[digits + 2..];
    }
    out.push_str(rest);

    if tags != counts.len() {
        return Err(Phi4MmError::MismatchedMediaCount {
            tags,
            media: counts.len(),
        });
    }
    Ok(out)
}
