//! CLI for msgbus
//!
//! Subcommands:
//! - `publish`: publish one message to a channel
//! - `subscribe`: print every message on a topic until interrupted
//!
//! The backend comes from the configuration (`config/default.*` and
//! `MSGBUS_*` variables) unless overridden on the command line.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use msgbus::{BrokerKind, Error, Message, MessageHandler};
use msgbus::broker::topic::{ALL_CHANNELS, build_topic, normalize_subtopic};
use msgbus::config::load_config;
use msgbus::utils::logging;

#[derive(Parser)]
#[command(name = "msgbus", version, about = "Publish and subscribe through the platform broker")]
struct Cli {
    /// Broker backend: nats, rabbitmq, kafka or mqtt
    #[arg(long, global = true)]
    backend: Option<BrokerKind>,

    /// Broker URL
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one message
    Publish {
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "")]
        subtopic: String,
        #[arg(long, default_value = "msgbus-cli")]
        publisher: String,
        #[arg(long, default_value = "http")]
        protocol: String,
        payload: String,
    },
    /// Print messages as JSON lines until Ctrl-C
    Subscribe {
        #[arg(long, default_value = ALL_CHANNELS)]
        topic: String,
        /// Subscriber id
        #[arg(long, default_value = "msgbus-cli")]
        id: String,
    },
}

struct Printer;

#[async_trait]
impl MessageHandler for Printer {
    async fn handle(&self, msg: Message) -> msgbus::Result<()> {
        let line = serde_json::to_string(&msg).map_err(|e| Error::Handler(e.to_string()))?;
        println!("{line}");
        Ok(())
    }

    async fn cancel(&self) -> msgbus::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = load_config().context("failed to load configuration")?;
    logging::init(&settings.log.level);
    if let Some(backend) = cli.backend {
        settings.messaging.backend = backend;
    }
    if let Some(url) = cli.url {
        settings.messaging.url = url;
    }

    match cli.command {
        Command::Publish {
            channel,
            subtopic,
            publisher,
            protocol,
            payload,
        } => {
            let topic = build_topic(&channel, &subtopic)?;
            let subtopic = normalize_subtopic(&subtopic)?;
            let pubsub = msgbus::connect_publisher(&settings.messaging).await?;
            let msg = Message::new(channel, subtopic, publisher, protocol, payload);
            let published = pubsub.publish(&topic, &msg).await;
            pubsub.close().await?;
            published.with_context(|| format!("failed to publish to {topic}"))?;
            info!("published to {topic}");
        }
        Command::Subscribe { topic, id } => {
            let pubsub = msgbus::connect_pubsub(&settings.messaging).await?;
            pubsub.subscribe(&id, &topic, Arc::new(Printer)).await?;
            info!("{id} subscribed to {topic}, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            pubsub.close().await?;
        }
    }
    Ok(())
}
