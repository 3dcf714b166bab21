use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use mega_broker::{
    Broker, BrokerClient, BrokerConfig, BrokerServer, InMemoryTopicRepository,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker
    Serve(ServeArgs),

    /// Create a topic on a running broker
    CreateTopic {
        #[command(flatten)]
        target: Target,
        topic: String,
    },

    /// Append a message to a topic
    Produce {
        #[command(flatten)]
        target: Target,
        topic: String,
        payload: String,
    },

    /// Read the message stored at an offset
    Consume {
        #[command(flatten)]
        target: Target,
        topic: String,
        #[arg(allow_negative_numbers = true)]
        offset: i32,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// TOML file to load settings from
    #[arg(short, long, env = "MEGA_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind the server to
    #[arg(short = 'H', long, env = "MEGA_BROKER_HOST")]
    host: Option<String>,

    /// Port to bind the server to
    #[arg(short, long, env = "MEGA_BROKER_PORT")]
    port: Option<u16>,

    /// Maximum number of connections served at once
    #[arg(long, env = "MEGA_BROKER_WORKERS")]
    workers: Option<usize>,

    /// Seconds a connection may stay silent before it is closed
    #[arg(long, env = "MEGA_BROKER_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Largest accepted message payload, in bytes
    #[arg(long, env = "MEGA_BROKER_MAX_MESSAGE_BYTES")]
    max_message_bytes: Option<usize>,

    /// Largest number of messages a topic may hold
    #[arg(long, env = "MEGA_BROKER_MAX_MESSAGES_PER_TOPIC")]
    max_messages_per_topic: Option<usize>,
}

impl ServeArgs {
    fn into_config(self) -> anyhow::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::from_file(path)?,
            None => BrokerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.worker_pool_size = workers;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if let Some(bytes) = self.max_message_bytes {
            config.max_message_bytes = bytes;
        }
        if let Some(max) = self.max_messages_per_topic {
            config.max_messages_per_topic = max;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
struct Target {
    /// Broker host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Broker port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
}

impl Target {
    async fn connect(&self) -> anyhow::Result<BrokerClient> {
        BrokerClient::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", self.host, self.port))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args.into_config()?).await,
        Command::CreateTopic { target, topic } => {
            let created = target.connect().await?.create_topic(&topic).await?;
            println!("created topic {} (timestamp {})", created.topic, created.timestamp);
            Ok(())
        }
        Command::Produce {
            target,
            topic,
            payload,
        } => {
            let produced = target.connect().await?.produce(&topic, payload).await?;
            println!("offset {} (timestamp {})", produced.offset, produced.timestamp);
            Ok(())
        }
        Command::Consume {
            target,
            topic,
            offset,
        } => {
            let consumed = target.connect().await?.consume(&topic, offset).await?;
            println!(
                "{} (timestamp {}, next offset {})",
                String::from_utf8_lossy(&consumed.payload),
                consumed.timestamp,
                consumed.next_offset
            );
            Ok(())
        }
    }
}

async fn serve(config: BrokerConfig) -> anyhow::Result<()> {
    info!("Starting mega-broker on {}", config.bind_addr());

    let topic_repo = Arc::new(InMemoryTopicRepository::new());
    let broker = Arc::new(Broker::new(topic_repo, config.topic_limits()));

    let server = BrokerServer::bind(&config, broker)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                shutdown.notify_one();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await;
    Ok(())
}
