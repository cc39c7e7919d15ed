// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_relay::{
    broker::BrokerChannel,
    channel,
    consumer,
    handler::{DelayedHandler, LogMessageHandler},
    history::SentHistory,
    http::{self, AppState},
    memory::InMemoryBroker,
    publisher::Publisher,
    settings::Settings,
    topology::ensure_topology,
};
use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "amqp-relay")]
#[command(about = "Publish and consume tutorial messages over AMQP exchanges")]
struct Cli {
    /// TOML configuration file, layered under RELAY_* environment variables
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Use the in-process broker instead of connecting to RabbitMQ
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP producer
    Serve,
    /// Consume a queue and log every message
    Consume {
        /// Queue key (alias or name) from the topology
        #[arg(short, long)]
        queue: Option<String>,

        /// Simulated processing time per message
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Declare the topology and print the resulting queue names
    Topology,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    if let Commands::Consume { queue, delay_ms } = &cli.command {
        if let Some(queue) = queue {
            settings.consumer.queue = queue.clone();
        }
        if let Some(delay_ms) = delay_ms {
            settings.consumer.processing_delay_ms = *delay_ms;
        }
    }

    // The AMQP connection must outlive every channel opened on it.
    let mut _conn = None;
    let broker: Arc<dyn BrokerChannel> = if cli.in_memory {
        info!("using the in-process broker");
        InMemoryBroker::new()
    } else {
        let (conn, channel) = channel::new_amqp_channel(&settings.broker)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "could not reach the broker"))?;
        _conn = Some(conn);
        channel
    };

    let declared = ensure_topology(broker.clone(), &settings.topology).await?;

    match cli.command {
        Commands::Topology => {
            for (key, name) in &declared.queues {
                println!("{key}\t{name}");
            }
        }
        Commands::Serve => serve(settings, broker).await?,
        Commands::Consume { .. } => {
            let queue = declared
                .queue_name(&settings.consumer.queue)
                .ok_or_else(|| {
                    anyhow!(
                        "queue `{}` is not part of the configured topology",
                        settings.consumer.queue
                    )
                })?
                .to_owned();

            let handler = Arc::new(DelayedHandler::new(
                LogMessageHandler,
                settings.consumer.processing_delay(),
            ));
            let handle = consumer::subscribe(
                broker,
                settings.consumer.subscription(&queue),
                handler,
            )
            .await?;

            info!("press CTRL+C to exit");
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await?;
        }
    }

    Ok(())
}

async fn serve(settings: Settings, broker: Arc<dyn BrokerChannel>) -> Result<()> {
    let state = AppState {
        publisher: Publisher::new(broker),
        history: SentHistory::new(settings.publisher.history_capacity),
        exchange: settings.publisher.exchange.clone(),
        routes: Arc::new(settings.publisher.routes.clone()),
        mandatory: settings.publisher.mandatory,
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "producer listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
