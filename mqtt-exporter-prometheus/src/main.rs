//! Prometheus exporter for MQTT topics.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mqtt_exporter_prometheus::mapping::exposition_name;
use mqtt_exporter_prometheus::{
    ExporterConfig, HttpServer, IngestCoordinator, MqttSubscriber, RuleSet,
};

/// Prometheus exporter for MQTT topics.
#[derive(Parser, Debug)]
#[command(name = "mqtt-exporter-prometheus")]
#[command(about = "Export MQTT topic values as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (YAML or JSON5).
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error), overrides the config.
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration, print the compiled rules and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ExporterConfig::load_from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("{}: {}", args.config, e))?;

    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let rules = config.compile_rules()?;

    if args.check {
        print_rules(&rules);
        return Ok(());
    }

    // Initialize logging
    mqtt_exporter_common::init_tracing(&config.logging())?;

    info!(
        config = %args.config,
        rules = rules.len(),
        "Starting MQTT Prometheus Exporter"
    );

    if rules.is_empty() {
        warn!("No export rules configured, nothing will be exported");
    }

    let listen_addr = config.prometheus.listen_addr()?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create components
    let ingest = Arc::new(IngestCoordinator::new(rules));
    let subscriber = MqttSubscriber::new(ingest.clone(), config.mqtt.clone());
    let http_server = HttpServer::new(ingest.clone(), listen_addr, config.prometheus.path.clone());

    // Start subscriber
    let subscriber_shutdown = shutdown_rx.clone();
    let subscriber_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(subscriber_shutdown).await {
            error!("Subscriber error: {}", e);
        }
    });

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_signal().await;

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = subscriber_task.await;
        let _ = http_task.await;
    })
    .await;

    // Print final stats
    let stats = ingest.stats();
    info!(
        messages_received = stats.messages_received,
        messages_unmatched = stats.messages_unmatched,
        updates_applied = stats.updates_applied,
        updates_dropped = stats.updates_dropped,
        series_count = ingest.registry().series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl+C");
    }
    info!("Shutting down...");
}

fn print_rules(rules: &RuleSet) {
    println!("{} rule(s)", rules.len());
    for rule in rules.rules() {
        let name = rule
            .static_metric_name(rules.prefix())
            .map(|name| exposition_name(&name, rule.metric_kind()))
            .unwrap_or_else(|| "<derived from topic>".to_string());
        println!(
            "  {} -> {} {} (filter {})",
            rule.subscribe(),
            rule.metric_kind(),
            name,
            rule.filter()
        );
    }
}
