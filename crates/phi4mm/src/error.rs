/// Errors raised while loading or running the Phi-4 multimodal model.
#[derive(thiserror::Error, Debug)]
pub enum Phi4MmError {
    #[error(transparent)]
    FailedToLoadModel(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    ImageDecodeError(#[from] image::ImageError),

    #[error(transparent)]
    AudioDecodeError(#[from] symphonia::core::errors::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Fetching {url} failed with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Unsupported content url: {0}")]
    UnsupportedUrl(String),

    #[error("Audio stream contains no decodable track")]
    EmptyAudio,

    #[error("Audio is too short: {samples} samples, need at least {window}")]
    AudioTooShort { samples: usize, window: usize },

    #[error("Unsupported audio sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Cannot find the {0} token in the tokenizer vocabulary")]
    MissingSpecialToken(String),

    #[error("Mismatched media count: tags = {tags}, media = {media}")]
    MismatchedMediaCount { tags: usize, media: usize },

    #[error("Expected {tokens} media embeddings, got {embeddings}")]
    MediaTokenMismatch { tokens: usize, embeddings: usize },

    #[error("Invalid logits detected: {0}")]
    InvalidLogits(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}
