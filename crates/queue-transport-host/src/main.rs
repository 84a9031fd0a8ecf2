//! # Queue Transport Host
//!
//! Binary entry point running the queue transport against in-memory storage.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes logging
//! - Builds the transport with a logging message pipeline
//! - Receives until Ctrl+C, then drains in-flight messages

mod processor;
mod settings;

use bytes::Bytes;
use clap::Parser;
use processor::LoggingProcessor;
use queue_transport::{
    CriticalError, DelayConstraint, InMemoryDelayedStore, InMemoryLeaseClient,
    InMemoryQueueService, MessageId, OutgoingMessage, TransportDependencies,
    TransportInfrastructure, TransportOperation,
};
use settings::HostConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run a queue transport endpoint against in-memory storage
#[derive(Debug, Parser)]
#[command(name = "queue-transport-host", version)]
struct Args {
    /// Explicit YAML configuration file, applied after the default locations
    #[arg(long, env = "QT_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Override the configured maximum concurrency
    #[arg(long)]
    max_concurrency: Option<u32>,

    /// Emit logs as JSON lines
    #[arg(long, env = "QT_JSON_LOGS")]
    json_logs: bool,

    /// Send this many sample messages to the input queue after start
    #[arg(long, default_value_t = 0)]
    seed: u32,

    /// Deliver the sample messages after this many seconds
    #[arg(long)]
    seed_delay_seconds: Option<u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!("Starting queue transport host");

    let mut host_config = match settings::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Failed to load configuration; aborting");
            std::process::exit(3);
        }
    };
    if let Some(max_concurrency) = args.max_concurrency {
        host_config.max_concurrency = max_concurrency;
    }
    if let Err(e) = host_config.validate() {
        error!(error = %e, "Host configuration is invalid; aborting");
        std::process::exit(3);
    }

    if let Err(e) = run(host_config, &args).await {
        error!(error = %e, "Queue transport host failed");
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "queue_transport_host=info,queue_transport=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(host_config: HostConfig, args: &Args) -> anyhow::Result<()> {
    let settings = host_config.transport.clone();
    let input_queue = settings.input_queue_name()?;

    let account = InMemoryQueueService::new("devaccount");
    let mut dependencies = TransportDependencies::new(Arc::new(account.clone()));
    // Every configured alias maps to the same in-memory account.
    for account_name in settings.account_aliases.values() {
        dependencies = dependencies.with_account(account_name.clone(), Arc::new(account.clone()));
    }
    if settings.delayed_delivery.enabled {
        dependencies = dependencies.with_delayed_delivery(
            Arc::new(InMemoryLeaseClient::new()),
            Arc::new(InMemoryDelayedStore::new()),
        );
    }

    let mut transport = TransportInfrastructure::build(settings, dependencies)?;
    transport.create_queues().await?;

    let processor = Arc::new(LoggingProcessor::new(
        input_queue.clone(),
        host_config.max_delivery_attempts,
    ));
    let critical_error = CriticalError::new(|message, error| {
        error!(error = %error, "Critical transport failure: {}", message);
    });
    transport.initialize(processor.clone(), critical_error)?;
    transport.start_receive(host_config.max_concurrency)?;

    info!(
        input_queue = %input_queue,
        max_concurrency = host_config.max_concurrency,
        transaction_mode = ?transport.settings().transaction_mode,
        "Receiving; press Ctrl+C to stop"
    );

    if args.seed > 0 {
        let operations = (0..args.seed)
            .map(|i| {
                let message = OutgoingMessage::new(
                    MessageId::new(),
                    Bytes::from(format!("sample message {}", i)),
                );
                let operation = TransportOperation::new(message, input_queue.as_str());
                match args.seed_delay_seconds {
                    Some(seconds) => operation.with_delay(DelayConstraint::DelayDeliveryWith(
                        Duration::from_secs(seconds),
                    )),
                    None => operation,
                }
            })
            .collect();
        transport.dispatch(operations).await?;
        info!(count = args.seed, "Sample messages sent");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    transport.stop_receive().await;
    info!(processed = processor.processed(), "Queue transport host stopped");
    Ok(())
}
