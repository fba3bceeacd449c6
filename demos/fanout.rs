//! Send one prompt to several OpenAI-compatible servers at once and print
//! the merged SSE frames.
//!
//! Usage:
//!   cargo run --example fanout -- --target http://10.0.0.5:8000=Qwen/Qwen2-7B-Instruct \
//!       --target http://10.0.0.6:8000=meta-llama/Llama-3.1-8B "Write a haiku"
//!   cargo run --example fanout -- --bedrock anthropic.claude-3-haiku-20240307-v1:0 "hi"
//!   RUST_LOG=nexus_fanout=debug cargo run --example fanout -- ...

use clap::Parser;
use futures::StreamExt;
use nexus_fanout::{
    sse_frames, BedrockDialect, FanOut, FanOutConfig, HttpBackend, InferenceRequest,
    StaticCatalog, TargetRef,
};

#[derive(Parser)]
#[command(name = "fanout", about = "Fan a prompt out to several models")]
struct Cli {
    /// Prompt text
    prompt: String,

    /// OpenAI-compatible target as URL=MODEL (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Bedrock Claude model id (repeatable)
    #[arg(long = "bedrock")]
    bedrock: Vec<String>,

    /// Base64 image file contents to attach (repeatable)
    #[arg(long = "image")]
    images: Vec<String>,

    /// Max output tokens per target
    #[arg(long, default_value_t = 512)]
    max_tokens: u32,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 500)]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut http = HttpBackend::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        http = http.with_api_key(key);
    }
    let backends = nexus_fanout::Backends::from_env(http).await;

    let mut catalog = StaticCatalog::new();
    let mut request = InferenceRequest::new(&cli.prompt, cli.max_tokens)
        .with_temperature(cli.temperature);

    for spec in &cli.targets {
        let Some((url, model)) = spec.split_once('=') else {
            eprintln!("error: --target expects URL=MODEL, got '{spec}'");
            std::process::exit(1);
        };
        request = request.with_target(TargetRef::manual(url, model));
    }
    for model_id in &cli.bedrock {
        catalog = catalog.bedrock(model_id, model_id, BedrockDialect::Claude, true);
        request = request.with_target(TargetRef::model(model_id));
    }
    for image in &cli.images {
        match std::fs::read_to_string(image) {
            Ok(data) => request = request.with_image(data.trim()),
            Err(e) => {
                eprintln!("error: cannot read {image}: {e}");
                std::process::exit(1);
            }
        }
    }

    if request.targets.is_empty() {
        eprintln!("error: give at least one --target or --bedrock");
        std::process::exit(1);
    }

    let config = FanOutConfig {
        heartbeat_interval: std::time::Duration::from_millis(cli.heartbeat_ms),
        ..FanOutConfig::default()
    };
    let fanout = FanOut::new(backends, config).with_catalog(catalog);

    let mut frames = Box::pin(sse_frames(fanout.run(request)));
    while let Some(frame) = frames.next().await {
        print!("{frame}");
    }
}
