pub mod config;

mod audio;
mod lora;
mod text;
mod vision;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use log::debug;

pub use config::{ConformerConfig, LoraConfig, Phi4MmModelConfig, RopeScaling, VisionConfig};
pub use lora::Adapter;

use crate::error::Phi4MmError;
use crate::processor::MediaInputs;
use audio::AudioEmbedding;
use text::TextModel;
use vision::VisionEmbedding;

/// A decoder that can be prompted with token ids plus, on the first step, one media input.
pub trait MultimodalModel {
    /// Run the tokens placed at `index_pos` and return the logits of the last
    /// position, `[vocab_size]`. Media is passed on the prefill step only.
    fn forward(
        &mut self,
        input_ids: &[u32],
        index_pos: usize,
        media: Option<&MediaInputs>,
    ) -> Result<Tensor, Phi4MmError>;

    /// Forget the cached keys and values of the previous request.
    fn clear_kv_cache(&mut self);

    fn device(&self) -> &Device;
}

/// Phi-4 multimodal: the language model, the image and speech embeddings and
/// the LoRA adapters switched on by the modality of the prompt.
pub struct Phi4MmModel {
    text: TextModel,
    vision: VisionEmbedding,
    audio: AudioEmbedding,
    image_token_id: u32,
    audio_token_id: u32,
    adapter: Option<Adapter>,
    device: Device,
    dtype: DType,
}

impl Phi4MmModel {
    pub fn new(
        config: &Phi4MmModelConfig,
        image_token_id: u32,
        audio_token_id: u32,
        vb: VarBuilder,
    ) -> Result<Self, Phi4MmError> {
        let vb_x = vb.pp("model.embed_tokens_extend");
        Ok(Self {
            text: TextModel::new(config, vb.clone())?,
            vision: VisionEmbedding::new(
                VisionConfig::SIGLIP_SO400M_448,
                config.hidden_size,
                vb_x.pp("image_embed"),
            )?,
            audio: AudioEmbedding::new(
                &config.audio_processor.config,
                config.hidden_size,
                vb_x.pp("audio_embed"),
            )?,
            image_token_id,
            audio_token_id,
            adapter: None,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Memory-map the safetensors shards and build the model.
    pub fn load<P: AsRef<Path>>(
        config: &Phi4MmModelConfig,
        weights: &[P],
        image_token_id: u32,
        audio_token_id: u32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, Phi4MmError> {
        debug!("Loading {} safetensors files as {dtype:?}", weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        Self::new(config, image_token_id, audio_token_id, vb)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Project the media into `[tokens, hidden]` embeddings and return them with
    /// the placeholder id they replace and the adapter they enable.
    fn embed_media(&self, media: &MediaInputs) -> Result<(Tensor, u32, Adapter), Phi4MmError> {
        match media {
            MediaInputs::Image(inputs) => {
                let pixel_values = inputs.pixel_values.to_dtype(self.dtype)?;
                let embeds = self.vision.forward(&pixel_values, &inputs.layout)?;
                Ok((embeds, self.image_token_id, Adapter::Vision))
            }
            MediaInputs::Audio(inputs) => {
                let features = inputs.features.to_dtype(self.dtype)?;
                let embeds = self.audio.forward(&features)?;
                Ok((embeds, self.audio_token_id, Adapter::Speech))
            }
        }
    }
}

impl MultimodalModel for Phi4MmModel {
    fn forward(
        &mut self,
        input_ids: &[u32],
        index_pos: usize,
        media: Option<&MediaInputs>,
    ) -> Result<Tensor, Phi4MmError> {
        let ids = Tensor::new(input_ids, &self.device)?;
        let mut embeds = self.text.embed(&ids)?;

        if let Some(media) = media {
            let (media_embeds, token_id, adapter) = self.embed_media(media)?;
            debug!(
                "Merging {} {} embeddings into {} prompt tokens",
                media_embeds.dim(0)?,
                adapter.name(),
                input_ids.len()
            );
            embeds = merge_media_embeddings(input_ids, &embeds, &media_embeds, token_id)?;
            self.adapter = Some(adapter);
        }

        let logits = self
            .text
            .forward_embeds(&embeds.unsqueeze(0)?, index_pos, self.adapter)?;
        Ok(logits.squeeze(0)?)
    }

    fn clear_kv_cache(&mut self) {
        self.text.clear_kv_cache();
        self.adapter = None;
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Replace the embeddings of every `token_id` position, in order, with the
/// rows of `media_embeds`.
pub fn merge_media_embeddings(
    input_ids: &[u32],
    inputs_embeds: &Tensor,
    media_embeds: &Tensor,
    token_id: u32,
) -> Result<Tensor, Phi4MmError> {
    let (seq_len, hidden_size) = inputs_embeds.dims2()?;
    let (num_embeds, _hidden_size) = media_embeds.dims2()?;

    let mask = input_ids
        .iter()
        .map(|&id| u8::from(id == token_id))
        .collect::<Vec<_>>();
    let num_tokens = mask.iter().filter(|&&m| m == 1).count();
    if num_tokens != num_embeds {
        return Err(Phi4MmError::MediaTokenMismatch {
            tokens: num_tokens,
            embeddings: num_embeds,
        });
    }
    if num_tokens == 0 {
        return Ok(inputs_embeds.clone());
    }

    // running count of placeholders gives the media row of every position
    let mut seen = 0u32;
    let indices = mask
        .iter()
        .map(|&m| {
            let index = seen.saturating_sub(1 - m as u32);
            seen += m as u32;
            index.min(num_embeds as u32 - 1)
        })
        .collect::<Vec<_>>();

    let device = inputs_embeds.device();
    let gathered = media_embeds
        .to_dtype(inputs_embeds.dtype())?
        .index_select(&Tensor::new(indices, device)?, 0)?;
    let mask = Tensor::from_vec(mask, seq_len, device)?;
    Ok(mask
        .unsqueeze(1)?
        .expand((seq_len, hidden_size))?
        .where_cond(&gathered, inputs_embeds)?)
}
