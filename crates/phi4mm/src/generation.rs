use std::time::Instant;

use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use log::{debug, info};

use crate::config::{GenerationConfig, Phi4MmConfig};
use crate::error::Phi4MmError;
use crate::model::MultimodalModel;
use crate::processor::ProcessedInputs;

/// Decoding parameters after applying the runtime overrides on top of the
/// model's generation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TextGenerationConfig {
    pub seed: u64,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for TextGenerationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            do_sample: false,
            temperature: 1.0,
            top_p: None,
            top_k: None,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

impl TextGenerationConfig {
    pub fn resolve(config: &Phi4MmConfig, generation: &GenerationConfig) -> Self {
        Self {
            seed: config.seed,
            do_sample: config.do_sample.unwrap_or(generation.do_sample),
            temperature: config.temperature.unwrap_or(generation.temperature),
            top_p: config.top_p.or(generation.top_p),
            top_k: config.top_k.or(generation.top_k),
            repeat_penalty: config
                .repeat_penalty
                .unwrap_or(generation.repetition_penalty),
            repeat_last_n: config.repeat_last_n,
        }
    }

    fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match (self.top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

/// Autoregressive decoding loop over a [`MultimodalModel`].
pub struct TextGeneration {
    logits_processor: LogitsProcessor,
    config: TextGenerationConfig,
    eos_token_ids: Vec<u32>,
}

impl TextGeneration {
    pub fn new(config: TextGenerationConfig, eos_token_ids: Vec<u32>) -> Self {
        let logits_processor = LogitsProcessor::from_sampling(config.seed, config.sampling());
        Self {
            logits_processor,
            config,
            eos_token_ids,
        }
    }

    pub fn config(&self) -> &TextGenerationConfig {
        &self.config
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Generate at most `max_new_tokens` tokens after the prompt.
    ///
    /// Returns only the generated ids: the prompt is sliced off and a final EOS
    /// token is not included.
    pub fn generate<M: MultimodalModel>(
        &mut self,
        model: &mut M,
        inputs: &ProcessedInputs,
        max_new_tokens: usize,
    ) -> Result<Vec<u32>, Phi4MmError> {
        if inputs.input_ids.is_empty() {
            return Err(Phi4MmError::InvalidRequest(
                "prompt encodes to zero tokens".to_string(),
            ));
        }

        model.clear_kv_cache();
        let prompt_len = inputs.input_ids.len();
        let mut tokens = inputs.input_ids.clone();
        let mut stopped_on_eos = false;

        let start_gen = Instant::now();
        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len() - context_size;
            let media = if index == 0 { inputs.media.as_ref() } else { None };

            let logits = model
                .forward(&tokens[start_pos..], start_pos, media)?
                .to_dtype(DType::F32)?;
            let logits = self.apply_repeat_penalty(logits, &tokens)?;
            check_finite(&logits)?;

            let next_token = self.logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if self.eos_token_ids.contains(&next_token) {
                stopped_on_eos = true;
                break;
            }
        }
        model.clear_kv_cache();

        let mut generated = tokens.split_off(prompt_len);
        if stopped_on_eos {
            generated.pop();
        }

        let dt = start_gen.elapsed();
        info!(
            "{} tokens generated ({:.2} token/s)",
            generated.len(),
            generated.len() as f64 / dt.as_secs_f64().max(f64::EPSILON),
        );
        debug!("Generated ids: {generated:?}");

        Ok(generated)
    }

    fn apply_repeat_penalty(&self, logits: Tensor, tokens: &[u32]) -> Result<Tensor, Phi4MmError> {
        if self.config.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start_at = tokens.len().saturating_sub(self.config.repeat_last_n);
        Ok(candle_transformers::utils::apply_repeat_penalty(
            &logits,
            self.config.repeat_penalty,
            &tokens[start_at..],
        )?)
    }
}

fn check_finite(logits: &Tensor) -> Result<(), Phi4MmError> {
    if logits.to_vec1::<f32>()?.iter().any(|v| !v.is_finite()) {
        return Err(Phi4MmError::InvalidLogits(
            "Non-finite values (NaN or +/-Inf) found in logits".to_string(),
        ));
    }
    Ok(())
}
