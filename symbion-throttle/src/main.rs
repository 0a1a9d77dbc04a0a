//! Symbion Throttle - adaptive consumer throttling daemon
//!
//! Usage: `symbion-throttle [CONFIG_PATH]`
//!
//! Starts the consumer pool, then ticks the control loop until Ctrl-C or
//! SIGTERM. Exits non-zero if any consumer ended in error.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use symbion_throttle::config::ThrottleConfig;
use symbion_throttle::consumer::mqtt::MqttStreamClient;
use symbion_throttle::consumer::{LogSink, MessageSink, StreamClient};
use symbion_throttle::control::ControlLoop;
use symbion_throttle::pool::ConsumerPool;
use symbion_throttle::sampler::build_sampler;
use symbion_throttle::status::{spawn_status_publisher, StatusTracker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("symbion_throttle=info")),
        )
        .init();

    info!("Symbion Throttle v{} starting", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ThrottleConfig::load(config_path)
        .await
        .context("Failed to load configuration")?;

    let policy = config.throttle_policy().context("Invalid throttle policy")?;
    let sampler = build_sampler(&config.sampler).context("Failed to build resource sampler")?;
    info!("Sampling with {}", sampler.name());

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let topic = config.subscription_topic();
    let sink: Arc<dyn MessageSink> = Arc::new(LogSink);

    let pool = ConsumerPool::spawn(
        config.consumers.count,
        &topic,
        sink,
        config.consumer_settings(),
        |id| {
            let client_id = format!("{}-{}-{}", config.broker.client_id_prefix, host, id);
            Box::new(MqttStreamClient::connect(&client_id, &config.broker, &config.stream))
                as Box<dyn StreamClient>
        },
    )
    .await
    .context("Failed to start consumer pool")?;
    let pool = Arc::new(pool);

    let tracker = StatusTracker::new();
    let publisher = config.status.enabled.then(|| {
        info!("Publishing status on {}", config.status.topic);
        spawn_status_publisher(tracker.clone(), Arc::clone(&pool), &config.broker, &config.status)
    });

    let aggregator = config.aggregator();
    info!(
        "Aggregating {:?} over {:?}",
        aggregator.strategy(),
        aggregator.source()
    );

    let control = ControlLoop::new(
        sampler,
        aggregator,
        policy,
        pool,
        config.control_settings(),
    )
    .with_status(tracker);

    let report = control.run(shutdown_signal()).await;

    if let Some(publisher) = publisher {
        publisher.abort();
    }

    for failure in &report.failures {
        error!("{}", failure);
    }
    if !report.is_clean() {
        anyhow::bail!(
            "{} of {} consumers failed",
            report.failures.len(),
            report.consumers
        );
    }

    info!("Symbion Throttle stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
