mod infer;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use argh::FromArgs;
use phi4mm::{Phi4MmConfig, Phi4Multimodal, DEFAULT_MODEL_ID};

#[derive(FromArgs)]
/// Serve Phi-4 multimodal inference over HTTP
struct Args {
    /// address to listen on
    #[argh(option, default = "String::from(\"0.0.0.0:3000\")")]
    addr: String,

    /// hugging face hub model id
    #[argh(option, default = "DEFAULT_MODEL_ID.to_string()")]
    model_id: String,

    /// hub revision to download
    #[argh(option)]
    revision: Option<String>,

    /// local directory holding the model files, skips the download
    #[argh(option)]
    weights_dir: Option<PathBuf>,

    /// seed of the sampler
    #[argh(option, default = "42")]
    seed: u64,

    /// run on the cpu even when cuda is available
    #[argh(switch)]
    cpu: bool,

    /// accept file:// urls and local paths as content_url
    #[argh(switch)]
    allow_local_files: bool,

    /// log the formatted prompts
    #[argh(switch)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = Phi4MmConfig {
        model_id: args.model_id,
        revision: args.revision,
        weights_dir: args.weights_dir,
        seed: args.seed,
        force_cpu: args.cpu,
        allow_local_files: args.allow_local_files,
        debug: args.debug,
        ..Default::default()
    };

    log::info!("🚀 Loading {}", config.model_id);
    let pipeline = tokio::task::spawn_blocking(move || Phi4Multimodal::new(config)).await??;
    let pipeline = Arc::new(Mutex::new(pipeline));

    let app = infer::router(pipeline.clone());

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    log::info!("🔥 Listening on: http://{}", args.addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Ok(pipeline) = Arc::try_unwrap(pipeline) {
        if let Ok(pipeline) = pipeline.into_inner() {
            pipeline.finalize();
        }
    }
    log::info!("👋 Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for the shutdown signal: {err}");
    }
}
