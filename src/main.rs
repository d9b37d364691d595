use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use weld_mentor::config::{DialogueConfig, ModelConfig, ServerConfig};
use weld_mentor::constants;
use weld_mentor::dialogue::VoiceflowClient;
use weld_mentor::predictor::{ModelHandle, Predictor};
use weld_mentor::session::SessionContext;
use weld_mentor::{chat, console, model, web_server};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct DialogueArgs {
    /// Voiceflow Dialog Manager API key, sent as the Authorization header.
    #[arg(long, env = "VOICEFLOW_API_KEY", hide_env_values = true)]
    api_key: String,
    #[arg(long, env = "VOICEFLOW_RUNTIME_URL", default_value = constants::DEFAULT_RUNTIME_URL)]
    runtime_url: String,
    /// Give up on a dialogue call after this many seconds (no limit by default).
    #[arg(long, env = "WELD_MENTOR_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,
}

impl From<DialogueArgs> for DialogueConfig {
    fn from(args: DialogueArgs) -> Self {
        let mut config = DialogueConfig::new(args.api_key).with_runtime_url(args.runtime_url);
        config.request_timeout = args.request_timeout_secs.map(Duration::from_secs);
        config
    }
}

#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Model definition (model.json), local path or URL.
    #[arg(long, env = "WELD_MENTOR_MODEL_URL", default_value = constants::DEFAULT_MODEL_URL)]
    model_url: String,
    /// Model metadata (metadata.json), local path or URL.
    #[arg(long, env = "WELD_MENTOR_METADATA_URL", default_value = constants::DEFAULT_METADATA_URL)]
    metadata_url: String,
    /// Endpoint that scores a 224x224 PNG for the model.
    #[arg(long, env = "WELD_MENTOR_INFERENCE_URL")]
    inference_url: String,
}

impl From<ModelArgs> for ModelConfig {
    fn from(args: ModelArgs) -> Self {
        let mut config = ModelConfig::new(args.inference_url);
        config.model_url = args.model_url;
        config.metadata_url = args.metadata_url;
        config
    }
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the Weld Mentor web server.
    Serve {
        #[arg(long, env = "WELD_MENTOR_PORT", default_value_t = constants::DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
        #[arg(long, default_value = constants::DEFAULT_TEMPLATE_DIR)]
        templates: PathBuf,
        #[arg(long, default_value = constants::DEFAULT_STATIC_DIR)]
        static_dir: PathBuf,
        /// Delay before prediction bars grow to their final width.
        #[arg(long, default_value_t = 100)]
        animation_delay_ms: u64,
        /// Drop page sessions that have not been used for this many seconds.
        #[arg(long, env = "WELD_MENTOR_SESSION_IDLE_SECS", default_value_t = constants::DEFAULT_SESSION_IDLE.as_secs())]
        session_idle_secs: u64,
        #[command(flatten)]
        dialogue: DialogueArgs,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Chat with the mentor in the terminal.
    Chat {
        #[command(flatten)]
        dialogue: DialogueArgs,
    },
    /// Classify a single weld photo and print the scores.
    Classify {
        /// Image file to classify.
        image: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for the Voiceflow API key and endpoints)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,weld_mentor=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    info!("Weld Mentor starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Serve {
            port,
            templates,
            static_dir,
            animation_delay_ms,
            session_idle_secs,
            dialogue: dialogue_args,
            model: model_args,
        } => {
            let server_config = ServerConfig {
                port,
                template_dir: templates,
                static_dir,
                animation_delay: Duration::from_millis(animation_delay_ms),
                session_idle: Duration::from_secs(session_idle_secs),
            };
            let dialogue = Arc::new(
                VoiceflowClient::new(dialogue_args.into()).context("Failed to initialize dialogue client")?,
            );

            // Pages are served right away; uploads made before the model is ready are held
            // until it is installed.
            let model_handle = ModelHandle::new();
            let model_config: ModelConfig = model_args.into();
            let loader_handle = model_handle.clone();
            let model_task = tokio::spawn(async move {
                match model::load(&model_config).await {
                    Ok(loaded) => loader_handle.install(Arc::new(loaded)),
                    Err(e) => error!("Model failed to load: {:?}", e),
                }
            });

            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(server_config, dialogue, model_handle).await {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            info!("Shutting down remaining tasks...");
            if !web_server_handle.is_finished() {
                web_server_handle.abort();
            }
            if !model_task.is_finished() {
                model_task.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Chat { dialogue: dialogue_args } => {
            let client = Arc::new(
                VoiceflowClient::new(dialogue_args.into()).context("Failed to initialize dialogue client")?,
            );
            let widget = chat::ChatWidget::new(SessionContext::new(), client);
            console::run_chat(&widget, tokio::io::stdin(), tokio::io::stdout())
                .await
                .context("Chat session failed")?;
        }
        Commands::Classify { image, model: model_args } => {
            let model_config: ModelConfig = model_args.into();
            let loaded = model::load(&model_config)
                .await
                .context("Failed to load model")?;
            let predictor = Predictor::new(
                ModelHandle::ready(Arc::new(loaded)),
                constants::DEFAULT_ANIMATION_DELAY,
            );
            let results = console::classify_file(&predictor, &image).await?;
            console::print_predictions(&results);
        }
    }

    Ok(())
}
