use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_NEW_TOKENS;
use crate::error::Phi4MmError;

/// The input modality of a request.
///
/// Parsed leniently: `"image"` selects [`TaskType::Image`] and any other value
/// selects [`TaskType::Audio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Image,
    Audio,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Image => "image",
            TaskType::Audio => "audio",
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        if value == "image" {
            TaskType::Image
        } else {
            TaskType::Audio
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        TaskType::from(value.as_str())
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single inference request: a media url plus a text prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default = "default_task_type")]
    pub task_type: TaskType,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_content_url")]
    pub content_url: String,
    /// Upper bound on the number of generated tokens. An explicit `null` defers
    /// to the model's generation configuration.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: Option<usize>,
}

impl Default for InferenceRequest {
    fn default() -> Self {
        Self {
            task_type: default_task_type(),
            prompt: default_prompt(),
            content_url: default_content_url(),
            max_new_tokens: default_max_new_tokens(),
        }
    }
}

impl InferenceRequest {
    pub fn new(
        task_type: TaskType,
        prompt: impl Into<String>,
        content_url: impl Into<String>,
    ) -> Self {
        Self {
            task_type,
            prompt: prompt.into(),
            content_url: content_url.into(),
            max_new_tokens: default_max_new_tokens(),
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: Option<usize>) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn validate(&self) -> Result<(), Phi4MmError> {
        if self.max_new_tokens == Some(0) {
            return Err(Phi4MmError::InvalidRequest(
                "max_new_tokens must be a positive integer".to_string(),
            ));
        }
        if self.content_url.trim().is_empty() {
            return Err(Phi4MmError::InvalidRequest(
                "content_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The text generated for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default = "default_generated_result")]
    pub generated_result: String,
}

fn default_task_type() -> TaskType {
    TaskType::Image
}

fn default_prompt() -> String {
    "What is shown in this image?".to_string()
}

fn default_content_url() -> String {
    "https://www.ilankelman.org/stopsigns/australia.jpg".to_string()
}

fn default_max_new_tokens() -> Option<usize> {
    Some(DEFAULT_MAX_NEW_TOKENS)
}

fn default_generated_result() -> String {
    "Test output".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_parsing() {
        assert_eq!(TaskType::from("image"), TaskType::Image);
        assert_eq!(TaskType::from("audio"), TaskType::Audio);
        assert_eq!(TaskType::from("speech"), TaskType::Audio);
        assert_eq!(TaskType::from("Image"), TaskType::Audio);
        assert_eq!(TaskType::from(""), TaskType::Audio);
    }

    #[test]
    fn test_request_defaults() -> Result<(), Phi4MmError> {
        let request: InferenceRequest = serde_json::from_str("{}")?;
        assert_eq!(request, InferenceRequest::default());
        assert_eq!(request.task_type, TaskType::Image);
        assert_eq!(request.prompt, "What is shown in this image?");
        assert_eq!(request.max_new_tokens, Some(128));
        Ok(())
    }

    #[test]
    fn test_request_explicit_null_max_tokens() -> Result<(), Phi4MmError> {
        let request: InferenceRequest = serde_json::from_str(
            r#"{"task_type": "audio", "prompt": "Transcribe", "content_url": "a.wav", "max_new_tokens": null}"#,
        )?;
        assert_eq!(request.task_type, TaskType::Audio);
        assert_eq!(request.max_new_tokens, None);
        Ok(())
    }

    #[test]
    fn test_request_unknown_task_type_is_audio() -> Result<(), Phi4MmError> {
        let request: InferenceRequest =
            serde_json::from_str(r#"{"task_type": "video", "content_url": "clip.flac"}"#)?;
        assert_eq!(request.task_type, TaskType::Audio);

        let json = serde_json::to_value(&request)?;
        assert_eq!(json["task_type"], "audio");
        Ok(())
    }

    #[test]
    fn test_request_validation() {
        let request = InferenceRequest::new(TaskType::Image, "hi", "img.png");
        assert!(request.validate().is_ok());

        let zero = request.clone().with_max_new_tokens(Some(0));
        assert!(matches!(
            zero.validate(),
            Err(Phi4MmError::InvalidRequest(_))
        ));

        let unbounded = request.clone().with_max_new_tokens(None);
        assert!(unbounded.validate().is_ok());

        let no_url = InferenceRequest::new(TaskType::Audio, "hi", "  ");
        assert!(matches!(
            no_url.validate(),
            Err(Phi4MmError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_negative_max_tokens_rejected() {
        let request =
            serde_json::from_str::<InferenceRequest>(r#"{"max_new_tokens": -3}"#);
        assert!(request.is_err());
    }

    #[test]
    fn test_response_serialization() -> Result<(), Phi4MmError> {
        let response = InferenceResponse {
            generated_result: "A stop sign.".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&response)?,
            r#"{"generated_result":"A stop sign."}"#
        );
        Ok(())
    }
}
