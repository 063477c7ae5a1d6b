use crate::request::TaskType;

/// Placeholder standing for the first image of a request.
pub const IMAGE_PLACEHOLDER: &str = "<|image_1|>";
/// Placeholder standing for the first audio clip of a request.
pub const AUDIO_PLACEHOLDER: &str = "<|audio_1|>";

/// Chat delimiters expected by the Phi-4 tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub user: &'static str,
    pub assistant: &'static str,
    pub end: &'static str,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::PHI4_MM
    }
}

impl PromptTemplate {
    pub const PHI4_MM: PromptTemplate = PromptTemplate {
        user: "<|user|>",
        assistant: "<|assistant|>",
        end: "<|end|>",
    };

    /// Wrap a user prompt into a single user turn carrying one media placeholder,
    /// followed by the opening of the assistant turn.
    ///
    /// ```
    /// use phi4mm::{PromptTemplate, TaskType};
    ///
    /// let prompt = PromptTemplate::PHI4_MM.format(TaskType::Image, "What is shown?");
    /// assert_eq!(prompt, "<|user|><|image_1|>What is shown?<|end|><|assistant|>");
    /// ```
    pub fn format(&self, task_type: TaskType, prompt: &str) -> String {
        let placeholder = match task_type {
            TaskType::Image => IMAGE_PLACEHOLDER,
            TaskType::Audio => AUDIO_PLACEHOLDER,
        };
        format!(
            "{}{}{}{}{}",
            self.user, placeholder, prompt, self.end, self.assistant
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_prompt_has_placeholder_and_delimiters() {
        let template = PromptTemplate::default();
        let prompt = template.format(TaskType::Image, "Describe the sign.");

        assert!(prompt.contains(IMAGE_PLACEHOLDER));
        assert!(!prompt.contains(AUDIO_PLACEHOLDER));
        assert!(prompt.starts_with("<|user|>"));
        assert!(prompt.ends_with("<|assistant|>"));

        let user = prompt.find("<|user|>").unwrap();
        let media = prompt.find(IMAGE_PLACEHOLDER).unwrap();
        let text = prompt.find("Describe the sign.").unwrap();
        let end = prompt.find("<|end|>").unwrap();
        let assistant = prompt.find("<|assistant|>").unwrap();
        assert!(user < media && media < text && text < end && end < assistant);
    }

    #[test]
    fn test_non_image_task_uses_audio_placeholder() {
        let template = PromptTemplate::default();
        for task in ["audio", "speech", "transcribe", ""] {
            let prompt = template.format(TaskType::from(task), "Transcribe the audio.");
            assert!(prompt.contains(AUDIO_PLACEHOLDER), "task {task:?}");
            assert!(!prompt.contains(IMAGE_PLACEHOLDER), "task {task:?}");
        }
    }

    #[test]
    fn test_audio_prompt_exact() {
        let prompt = PromptTemplate::PHI4_MM.format(TaskType::Audio, "Transcribe.");
        assert_eq!(prompt, "<|user|><|audio_1|>Transcribe.<|end|><|assistant|>");
    }

    #[test]
    fn test_empty_prompt() {
        let prompt = PromptTemplate::PHI4_MM.format(TaskType::Image, "");
        assert_eq!(prompt, "<|user|><|image_1|><|end|><|assistant|>");
    }
}
