//! # Phi-4 multimodal inference
//!
//! Runs `microsoft/Phi-4-multimodal-instruct` on [candle](https://github.com/huggingface/candle):
//! an image or audio url plus a text prompt in, generated text out.
//!
//! The request path is four blocking steps:
//!
//! - acquire the model files from the Hugging Face Hub or a local directory
//! - fetch and decode the media, format the chat prompt, tokenize
//! - generate with the multimodal model
//! - decode the generated tokens, without the prompt
//!
//! ```no_run
//! use phi4mm::{InferenceRequest, Phi4MmConfig, Phi4Multimodal, TaskType};
//!
//! let mut pipeline = Phi4Multimodal::new(Phi4MmConfig::default())?;
//! let request = InferenceRequest::new(TaskType::Audio, "Transcribe the audio.", "speech.wav");
//! println!("{}", pipeline.infer(&request)?.generated_result);
//! # Ok::<(), phi4mm::Phi4MmError>(())
//! ```

/// Runtime and generation configuration.
pub mod config;

mod error;

/// Autoregressive decoding loop.
pub mod generation;

/// Model files acquisition.
pub mod hub;

/// Media fetching and decoding.
pub mod media;

/// The Phi-4 multimodal network.
pub mod model;

mod pipeline;

/// Tokenizer, image and audio preprocessing.
pub mod processor;

/// Chat prompt formatting.
pub mod prompt;

mod request;

pub use config::{GenerationConfig, Phi4MmConfig, DEFAULT_MAX_NEW_TOKENS, DEFAULT_MODEL_ID};
pub use error::Phi4MmError;
pub use generation::{TextGeneration, TextGenerationConfig};
pub use model::{MultimodalModel, Phi4MmModel};
pub use pipeline::Phi4Multimodal;
pub use processor::Phi4MmProcessor;
pub use prompt::PromptTemplate;
pub use request::{InferenceRequest, InferenceResponse, TaskType};
