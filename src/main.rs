//! MQ Stream Relay - Main Entry Point
//!
//! Usage: `mq-stream-relay [config.toml]`
//!
//! Without an argument the config path comes from `CONNECTOR_CONFIG_PATH`,
//! falling back to `./connector.toml`.

use anyhow::Context;
use mq_stream_relay::{
    IngestChannel, LocalTableChannel, MqttQueue, Relay, RelayConfig, RelayError, RelaySettings, RowBuilder,
};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging first
    let filter = init_tracing();

    tracing::info!("Starting MQ Stream Relay");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = RelayConfig::resolve_path(std::env::args().nth(1));
    tracing::info!("Loading configuration from: {}", config_path.display());

    let config = match RelayConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration");
            e.report();
            return exit_code(e.exit_code());
        }
    };

    if config.relay.debug {
        enable_debug_logging(&filter);
        for (key, value) in config.redacted_properties() {
            tracing::debug!("  * {}: {}", key, value);
        }
    }

    tracing::info!("Configuration loaded and validated successfully");
    tracing::info!(
        "Queue: {} on {} ({}:{})",
        config.queue.queue(),
        config.queue.queue_manager(),
        config.queue.broker_host,
        config.queue.broker_port
    );
    tracing::info!(
        "Sink: {}.{}.{} via {}",
        config.sink.database,
        config.sink.schema,
        config.sink.table,
        config.sink.endpoint()
    );
    tracing::info!("Batch window: {}s", config.relay.batch_seconds);

    let mut relay = match connect(&config).await {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!("{:#}", e);
            let code = e
                .downcast_ref::<RelayError>()
                .map(RelayError::exit_code)
                .unwrap_or(1);
            return exit_code(code);
        }
    };

    let outcome = tokio::select! {
        err = relay.run() => Some(err),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
            None
        }
    };

    if let Some(err) = &outcome {
        err.report();
    }

    relay.shutdown().await;

    match outcome {
        Some(err) => exit_code(err.exit_code()),
        None => ExitCode::SUCCESS,
    }
}

/// Open the channel and the queue, then position the sequence ids
async fn connect(config: &RelayConfig) -> anyhow::Result<Relay<MqttQueue, LocalTableChannel>> {
    let mut channel = LocalTableChannel::open(&config.sink)
        .await
        .context("Failed to open ingest channel")?;

    let queue = match MqttQueue::connect(&config.queue).await {
        Ok(queue) => queue,
        Err(e) => {
            if let Err(close_err) = channel.close().await {
                tracing::warn!("Error closing ingest channel: {}", close_err);
            }
            return Err(e).context("Failed to connect to queue");
        }
    };

    let settings = RelaySettings {
        idle_wait: config.relay.idle_wait(),
        retry: config.relay.retry_policy(),
        rows: RowBuilder::new(config.sink.content_column.as_str()),
    };

    if config.relay.resume_from_committed_offset {
        Relay::resume(queue, channel, settings)
            .await
            .context("Failed to read committed offset")
    } else {
        Ok(Relay::new(queue, channel, settings))
    }
}

/// Initialize tracing with a reloadable filter
fn init_tracing() -> FilterHandle {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .ok(); // Ignore error if already initialized

    handle
}

/// Raise the default level to debug unless RUST_LOG chose one
fn enable_debug_logging(filter: &FilterHandle) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Err(e) = filter.reload(EnvFilter::new("debug")) {
        tracing::warn!("Failed to enable debug logging: {}", e);
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
