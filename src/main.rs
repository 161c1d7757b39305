use anyhow::Result;
use clap::{Parser, Subcommand};
use kotoba::config::Config;
use kotoba::gateway::{AppState, run_gateway};
use kotoba::providers::ImageAttachment;
use kotoba::worker::user_message;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kotoba", version, about = "Personal AI chat assistant")]
struct Cli {
    /// Workspace directory override (default: ~/.kotoba)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server
    Serve {
        /// Listen host (default from config)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (default from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one prompt and print the reply
    Chat {
        message: String,
        /// Attach an image file
        #[arg(long)]
        image: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = match &cli.workspace {
        Some(dir) => Config::load_or_init_at(dir)?,
        None => Config::load_or_init()?,
    };

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            let state = AppState::from_config(&config)?;
            run_gateway(&host, port, state).await?;
        }
        Command::Chat { message, image } => {
            let state = AppState::from_config(&config)?;
            let attachment = match image {
                Some(path) => {
                    let data = std::fs::read(&path)?;
                    let mime_type = mime_type_for(&path);
                    Some(ImageAttachment { data, mime_type })
                }
                None => None,
            };

            let session = state.sessions.get_or_create("cli");
            let prefix = state.personas.active_prefix();
            match state
                .dispatcher
                .submit("cli", &session.ledger, &message, attachment, prefix.as_deref())
                .await
            {
                Ok(reply) => {
                    println!("{}", reply.text);
                    tracing::info!(
                        tokens = reply.tokens_used,
                        elapsed_ms = reply.elapsed.as_millis() as u64,
                        "done"
                    );
                }
                Err(error) => {
                    eprintln!("{}", user_message(&error));
                    state.dispatcher.shutdown();
                    std::process::exit(1);
                }
            }
            state.dispatcher.shutdown();
        }
    }

    Ok(())
}

fn mime_type_for(path: &std::path::Path) -> String {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
    .to_string()
}
