//! Command-line front end: serve the HTTP API, send one chat, or list
//! the configured pools.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchboard::config::GatewayConfig;
use switchboard::llm::{DispatchOptions, Dispatched, Dispatcher, LoadBalanceStrategy};
use switchboard::server::Server;
use switchboard::telemetry::init_logging;
use switchboard::types::{ChatMessage, ChatRequest};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Route chat completions across LLM vendors with failover")]
struct Cli {
    /// Path to a TOML, YAML or JSON config file; the environment is used when omitted
    #[arg(short, long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the OpenAI-compatible HTTP server
    Serve {
        /// Listen address as host:port, overriding the config
        #[arg(long)]
        addr: Option<String>,
    },

    /// Send one message and print the reply
    Chat {
        /// Logical model name
        #[arg(short, long)]
        model: String,

        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,

        /// round_robin, random or first_available
        #[arg(long)]
        strategy: Option<LoadBalanceStrategy>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// The message to send
        message: String,
    },

    /// Show configured pools and instance health
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let mut logging = config.logging.clone();
    if cli.debug {
        logging.level = "debug".to_string();
    }
    let _guard = init_logging(logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Serve { addr } => cmd_serve(config, addr).await,
        Commands::Chat {
            model,
            stream,
            strategy,
            system,
            temperature,
            max_tokens,
            timeout,
            message,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(message));

            let mut request = ChatRequest::new(model, messages);
            request.temperature = temperature;
            request.max_tokens = max_tokens;

            let mut options = DispatchOptions::default();
            if let Some(strategy) = strategy {
                options = options.with_strategy(strategy);
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            cmd_chat(&config, request, options, stream).await
        }
        Commands::Providers => cmd_providers(&config).await,
    }
}

async fn build_dispatcher(config: &GatewayConfig) -> Result<Dispatcher> {
    config.validate().context("Invalid configuration")?;
    Dispatcher::from_gateway_config(config)
        .await
        .context("Failed to build provider pools")
}

async fn cmd_serve(mut config: GatewayConfig, addr: Option<String>) -> Result<()> {
    if let Some(addr) = addr {
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("Listen address '{}' must be host:port", addr))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .with_context(|| format!("Invalid port in listen address '{}'", addr))?;
    }

    let dispatcher = Arc::new(build_dispatcher(&config).await?);
    for model in dispatcher.models() {
        info!(model = %model, "Serving model");
    }

    Server::new(dispatcher, config.server.clone())
        .start()
        .await
        .context("HTTP server failed")
}

async fn cmd_chat(config: &GatewayConfig, request: ChatRequest, options: DispatchOptions, stream: bool) -> Result<()> {
    let dispatcher = build_dispatcher(config).await?;

    // Ctrl-C aborts the dispatch, including a stream being printed
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling dispatch");
            on_signal.cancel();
        }
    });

    match dispatcher.dispatch(&request, options.with_cancel(cancel), stream).await? {
        Dispatched::Complete(response) => {
            println!("{}", response.content());
            if let Some(usage) = response.usage {
                info!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Completion finished"
                );
            }
        }
        Dispatched::Stream(mut chunks) => {
            info!(instance = chunks.instance(), provider = %chunks.provider(), "Streaming reply");
            let mut stdout = std::io::stdout();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                write!(stdout, "{}", chunk.content())?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}

async fn cmd_providers(config: &GatewayConfig) -> Result<()> {
    let dispatcher = build_dispatcher(config).await?;
    for pool in dispatcher.status() {
        println!("{} ({} of {} available)", pool.model, pool.available_instances, pool.instances.len());
        for instance in pool.instances {
            println!(
                "  {:<24} {:<9} {:<48} {}",
                instance.id,
                instance.provider.as_str(),
                instance.model,
                if instance.available { "available" } else { "cooling down" }
            );
        }
    }
    Ok(())
}
