use std::time::Instant;

use candle_core::{DType, Device};
use log::{debug, info};

use crate::config::{GenerationConfig, Phi4MmConfig, DEFAULT_MAX_NEW_TOKENS};
use crate::error::Phi4MmError;
use crate::generation::{TextGeneration, TextGenerationConfig};
use crate::hub::ModelFiles;
use crate::media::{load_media, MediaFetcher};
use crate::model::{MultimodalModel, Phi4MmModel, Phi4MmModelConfig};
use crate::processor::Phi4MmProcessor;
use crate::prompt::PromptTemplate;
use crate::request::{InferenceRequest, InferenceResponse};

/// Tokens ending the assistant turn when the generation configuration names none.
const FALLBACK_EOS_TOKENS: [&str; 2] = ["<|end|>", "<|endoftext|>"];

/// A loaded Phi-4 multimodal model with its processor, answering one request at a time.
///
/// ```no_run
/// use phi4mm::{InferenceRequest, Phi4MmConfig, Phi4Multimodal, TaskType};
///
/// let mut pipeline = Phi4Multimodal::new(Phi4MmConfig::default())?;
/// let request = InferenceRequest::new(
///     TaskType::Image,
///     "What is shown in this image?",
///     "https://www.ilankelman.org/stopsigns/australia.jpg",
/// );
/// println!("{}", pipeline.infer(&request)?.generated_result);
/// pipeline.finalize();
/// # Ok::<(), phi4mm::Phi4MmError>(())
/// ```
pub struct Phi4Multimodal<M: MultimodalModel = Phi4MmModel> {
    model: M,
    processor: Phi4MmProcessor,
    generation_config: GenerationConfig,
    sampling: TextGenerationConfig,
    eos_token_ids: Vec<u32>,
    fetcher: MediaFetcher,
    template: PromptTemplate,
    config: Phi4MmConfig,
}

impl Phi4Multimodal<Phi4MmModel> {
    /// Fetch the model files, pick the device and load the model.
    pub fn new(config: Phi4MmConfig) -> Result<Self, Phi4MmError> {
        let (device, dtype) = select_device(config.force_cpu);
        info!("Running on {device:?} with {dtype:?} weights");

        let files = ModelFiles::resolve(&config)?;
        let model_config = Phi4MmModelConfig::from_file(&files.config)?;
        let generation_config = GenerationConfig::from_file(&files.generation_config)?;
        let processor = Phi4MmProcessor::from_files(
            &files.tokenizer,
            files.preprocessor_config.as_deref(),
            &device,
        )?;

        let start = Instant::now();
        let model = Phi4MmModel::load(
            &model_config,
            &files.weights,
            processor.image_token_id(),
            processor.audio_token_id(),
            dtype,
            &device,
        )?;
        info!("Model loaded in {:.2}s", start.elapsed().as_secs_f32());

        Self::from_parts(processor, model, generation_config, config)
    }
}

impl<M: MultimodalModel> Phi4Multimodal<M> {
    /// Assemble a pipeline from already loaded parts.
    pub fn from_parts(
        processor: Phi4MmProcessor,
        model: M,
        generation_config: GenerationConfig,
        config: Phi4MmConfig,
    ) -> Result<Self, Phi4MmError> {
        let eos_token_ids = if generation_config.eos_token_id.is_empty() {
            let ids = FALLBACK_EOS_TOKENS
                .iter()
                .filter_map(|token| processor.token_id(token))
                .collect::<Vec<_>>();
            if ids.is_empty() {
                return Err(Phi4MmError::MissingSpecialToken(
                    FALLBACK_EOS_TOKENS[0].to_string(),
                ));
            }
            ids
        } else {
            generation_config.eos_token_id.clone()
        };
        debug!("EOS token ids: {eos_token_ids:?}");

        Ok(Self {
            sampling: TextGenerationConfig::resolve(&config, &generation_config),
            fetcher: MediaFetcher::new(config.allow_local_files)?,
            template: PromptTemplate::PHI4_MM,
            model,
            processor,
            generation_config,
            eos_token_ids,
            config,
        })
    }

    /// Answer a request: fetch its media, build the prompt, generate and decode.
    ///
    /// The returned text holds only the generated continuation, never the prompt.
    pub fn infer(&mut self, request: &InferenceRequest) -> Result<InferenceResponse, Phi4MmError> {
        request.validate()?;
        let start = Instant::now();

        let media = load_media(&self.fetcher, request.task_type, &request.content_url)?;
        let prompt = self.template.format(request.task_type, &request.prompt);
        if self.config.debug {
            debug!("Prompt: {prompt}");
        }

        let inputs = self.processor.process(&prompt, Some(&media))?;
        debug!(
            "{} task: {} prompt tokens, {} media tokens",
            request.task_type,
            inputs.input_ids.len(),
            inputs.media.as_ref().map_or(0, |media| media.num_tokens())
        );

        let max_new_tokens = self.max_new_tokens(request);
        let mut generation = TextGeneration::new(self.sampling.clone(), self.eos_token_ids.clone());
        let generated = generation.generate(&mut self.model, &inputs, max_new_tokens)?;
        let generated_result = self.processor.decode(&generated)?;

        info!(
            "Answered {} request in {:.2}s",
            request.task_type,
            start.elapsed().as_secs_f32()
        );
        Ok(InferenceResponse { generated_result })
    }

    /// Request bound, else the generation configuration's, else [`DEFAULT_MAX_NEW_TOKENS`].
    fn max_new_tokens(&self, request: &InferenceRequest) -> usize {
        request
            .max_new_tokens
            .or(self.generation_config.max_new_tokens)
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS)
    }

    pub fn config(&self) -> &Phi4MmConfig {
        &self.config
    }

    pub fn processor(&self) -> &Phi4MmProcessor {
        &self.processor
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Release the model and its weights.
    pub fn finalize(mut self) {
        self.model.clear_kv_cache();
        debug!("Releasing the model");
    }
}

fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        return (Device::Cpu, DType::F32);
    }

    #[cfg(feature = "cuda")]
    let (device, dtype) = match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => (device, DType::BF16),
        Ok(device) => (device, DType::F32),
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e:?}");
            (Device::Cpu, DType::F32)
        }
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = (Device::Cpu, DType::F32);

    (device, dtype)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::generation::tests::ScriptedModel;
    use crate::media::tests::{png_bytes, wav_bytes};
    use crate::processor::tests::{test_tokenizer, TEST_EOS_ID};
    use crate::processor::PreprocessorConfig;
    use crate::request::TaskType;

    const VOCAB_SIZE: usize = 17;
    // word ids of the test tokenizer
    const A: u32 = 8;
    const RED: u32 = 9;
    const STOP: u32 = 10;
    const SIGN: u32 = 11;
    const HELLO: u32 = 12;
    const WORLD: u32 = 13;

    fn scripted_pipeline(script: Vec<u32>) -> Result<Phi4Multimodal<ScriptedModel>, Phi4MmError> {
        let processor = Phi4MmProcessor::new(test_tokenizer(), &PreprocessorConfig::default(), &Device::Cpu)?;
        let generation_config = GenerationConfig {
            eos_token_id: vec![TEST_EOS_ID],
            ..Default::default()
        };
        Phi4Multimodal::from_parts(
            processor,
            ScriptedModel::new(script, A, VOCAB_SIZE),
            generation_config,
            Phi4MmConfig::default(),
        )
    }

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, Phi4MmError> {
        let path = dir.join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    #[test]
    fn test_image_request_returns_only_generated_text() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let image = write_file(dir.path(), "sign.png", &png_bytes(64, 48))?;

        let mut pipeline = scripted_pipeline(vec![A, RED, STOP, SIGN, TEST_EOS_ID])?;
        let request = InferenceRequest::new(TaskType::Image, "Describe it", image.display().to_string());
        let response = pipeline.infer(&request)?;

        assert_eq!(response.generated_result, "a red stop sign");
        assert!(!response.generated_result.contains("Describe"));

        // one prefill with the image, then one token per step
        let calls = &pipeline.model().calls;
        assert_eq!(calls.len(), 5);
        assert!(calls[0].2);
        assert!(calls[1..].iter().all(|&(len, _, media)| len == 1 && !media));
        Ok(())
    }

    #[test]
    fn test_audio_request() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let samples = vec![0i16; 16000];
        let clip = write_file(dir.path(), "clip.wav", &wav_bytes(&samples, 16000, 1))?;

        let mut pipeline = scripted_pipeline(vec![HELLO, WORLD, TEST_EOS_ID])?;
        // any task type other than "image" is served as audio
        let request = InferenceRequest::new(TaskType::from("speech"), "Transcribe", format!("file://{}", clip.display()));
        let response = pipeline.infer(&request)?;

        assert_eq!(response.generated_result, "hello world");
        Ok(())
    }

    #[test]
    fn test_max_new_tokens_bounds_the_answer() -> Result<(), Phi4MmError> {
        let dir = tempfile::tempdir()?;
        let image = write_file(dir.path(), "sign.png", &png_bytes(32, 32))?;

        let mut pipeline = scripted_pipeline(vec![A, RED, STOP, SIGN, TEST_EOS_ID])?;
        let request = InferenceRequest::new(TaskType::Image, "Describe it", image.display().to_string())
            .with_max_new_tokens(Some(2));
        assert_eq!(pipeline.infer(&request)?.generated_result, "a red");

        // without a bound the filler token runs up to the default limit
        let mut pipeline = scripted_pipeline(vec![])?;
        let request = request.with_max_new_tokens(None);
        let response = pipeline.infer(&request)?;
        assert_eq!(response.generated_result.split_whitespace().count(), DEFAULT_MAX_NEW_TOKENS);
        Ok(())
    }

    #[test]
    fn test_invalid_requests_are_rejected() -> Result<(), Phi4MmError> {
        let mut pipeline = scripted_pipeline(vec![])?;

        let request = InferenceRequest::default().with_max_new_tokens(Some(0));
        assert!(matches!(pipeline.infer(&request), Err(Phi4MmError::InvalidRequest(_))));

        let request = InferenceRequest::new(TaskType::Image, "Describe it", "/does/not/exist.png");
        assert!(matches!(pipeline.infer(&request), Err(Phi4MmError::IoError(_))));
        assert!(pipeline.model().calls.is_empty());
        Ok(())
    }

    #[test]
    fn test_eos_falls_back_to_tokenizer() -> Result<(), Phi4MmError> {
        let processor = Phi4MmProcessor::new(test_tokenizer(), &PreprocessorConfig::default(), &Device::Cpu)?;
        let pipeline = Phi4Multimodal::from_parts(
            processor,
            ScriptedModel::new(vec![], A, VOCAB_SIZE),
            GenerationConfig::default(),
            Phi4MmConfig::default(),
        )?;
        assert_eq!(pipeline.eos_token_ids(), &[5, TEST_EOS_ID]);
        pipeline.finalize();
        Ok(())
    }

    // RUST_LOG=debug cargo test -p phi4mm test_phi4mm_image_inference -- --nocapture --ignored
    #[test]
    #[ignore = "Downloads the Phi-4 multimodal weights"]
    fn test_phi4mm_image_inference() -> Result<(), Phi4MmError> {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut pipeline = Phi4Multimodal::new(Phi4MmConfig::default())?;
        let request = InferenceRequest::default().with_max_new_tokens(Some(32));
        let response = pipeline.infer(&request)?;

        assert!(!response.generated_result.is_empty());
        assert!(!response.generated_result.contains("<|assistant|>"));
        pipeline.finalize();
        Ok(())
    }
}
