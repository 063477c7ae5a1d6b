use argh::FromArgs;
use std::path::PathBuf;

use phi4mm::{InferenceRequest, Phi4MmConfig, Phi4Multimodal, TaskType};

#[derive(FromArgs)]
/// Describe an image or transcribe an audio clip using Microsoft Phi-4 multimodal
struct Args {
    /// url or path of the input image or audio
    #[argh(option, short = 'u')]
    content_url: String,

    /// prompt to ask the model
    #[argh(option, short = 'p', default = "String::from(\"What is shown in this image?\")")]
    text_prompt: String,

    /// task type: "image" or any other value for audio
    #[argh(option, short = 't', default = "String::from(\"image\")")]
    task_type: String,

    /// the maximum number of generated tokens
    #[argh(option, default = "128")]
    sample_length: usize,

    /// local directory holding the model files
    #[argh(option)]
    weights_dir: Option<PathBuf>,

    /// run on the cpu even when cuda is available
    #[argh(switch)]
    cpu: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    // create the phi-4 multimodal pipeline
    let mut phi4 = Phi4Multimodal::new(Phi4MmConfig {
        weights_dir: args.weights_dir,
        force_cpu: args.cpu,
        ..Default::default()
    })?;

    let request = InferenceRequest::new(
        TaskType::from(args.task_type.as_str()),
        args.text_prompt,
        args.content_url,
    )
    .with_max_new_tokens(Some(args.sample_length));

    let response = phi4.infer(&request)?;
    println!("{}", response.generated_result);

    phi4.finalize();

    Ok(())
}
