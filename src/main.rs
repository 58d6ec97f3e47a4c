use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_session::config::{self, SessionConfig};
use rabbit_session::{ExchangeType, Session};

#[derive(Parser, Debug)]
#[command(name = "rabbit-session", version, about = "Declare, publish to and consume from RabbitMQ")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    exchange: Option<String>,

    #[arg(long, global = true)]
    queue: Option<String>,

    #[arg(long, global = true)]
    routing_key: Option<String>,

    #[arg(long, global = true)]
    consumer_tag: Option<String>,

    /// direct, fanout, topic or headers
    #[arg(long, global = true)]
    exchange_type: Option<ExchangeType>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Declare the exchange, queue and binding
    Declare,
    /// Publish one JSON document
    Send { payload: String },
    /// Print message bodies until Ctrl-C or the broker closes the channel
    Listen,
    /// Print the number of ready messages in the queue
    Count,
    /// Write a default configuration file
    InitConfig { path: PathBuf },
}

fn load(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };

    let topology = &mut config.topology;
    if let Some(exchange) = &cli.exchange {
        topology.exchange = Some(exchange.clone());
    }
    if let Some(queue) = &cli.queue {
        topology.queue = Some(queue.clone());
    }
    if let Some(routing_key) = &cli.routing_key {
        topology.routing_key = routing_key.clone();
    }
    if let Some(consumer_tag) = &cli.consumer_tag {
        topology.consumer_tag = consumer_tag.clone();
    }
    if let Some(exchange_type) = cli.exchange_type {
        topology.exchange_type = exchange_type;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        return config::create_default_config_file(path);
    }

    let config = load(&cli)?;
    let mut session = Session::from_config(&config).await?;

    match cli.command {
        Command::Declare => {
            session.declare_binding().await?;
            session.close().await?;
            info!("Topology declared");
        }
        Command::Send { payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            session.send(&payload).await?;
        }
        Command::Listen => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    futures::future::pending::<()>().await;
                }
            };
            session
                .listen_until(
                    |delivery| {
                        println!("{}", delivery.body_str());
                        async { Ok(()) }
                    },
                    shutdown,
                )
                .await?;
        }
        Command::Count => {
            let count = session.get_count_messages().await;
            session.close().await?;
            println!("{}", count);
        }
        // Handled before connecting.
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
