//! IoT telemetry middleware - main server binary
//!
//! Wires the Event Bus, State Cache, ingress adapter, normalizer, storage
//! writer, command translator, cache watchdog, and REST/WebSocket API
//! into one process.
//!
//! Usage:
//!   cargo run --bin iot-middleware
//!   cargo run --bin iot-middleware -- --config config.toml

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use iot_middleware_rs::bus::{spawn_error_logger, EventBus};
use iot_middleware_rs::cache::StateCache;
use iot_middleware_rs::command_translator::{CommandTranslator, MqttEgress};
use iot_middleware_rs::common::setup_shutdown;
use iot_middleware_rs::config::Config;
use iot_middleware_rs::ingress::IngressAdapter;
use iot_middleware_rs::normalizer::Normalizer;
use iot_middleware_rs::operator::{create_router, AppState};
use iot_middleware_rs::storage::{StorageConfig, StorageWriter};
use iot_middleware_rs::watchdog::Watchdog;
use rumqttc::{AsyncClient, MqttOptions};
use tracing_subscriber::EnvFilter;

/// IoT telemetry middleware server
#[derive(Parser, Debug)]
#[command(name = "iot-middleware", about = "Real-time IoT telemetry integration middleware")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("iot_middleware_rs=info".parse()?))
        .init();

    let args = Args::parse();

    let config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(config_file = %args.config, "config file not found, refusing to start without a broker_url");
        anyhow::bail!("config file {} not found", args.config);
    };

    let (_shutdown_tx, shutdown_rx) = setup_shutdown();

    let bus = EventBus::new();
    let cache = Arc::new(StateCache::new());

    let mut handles = Vec::new();
    handles.push(spawn_error_logger(bus.clone(), shutdown_rx.resubscribe()));

    let ingress = IngressAdapter::new(bus.clone(), config.mqtt.clone());
    let ingress_counters = ingress.counters();
    handles.push(tokio::spawn(ingress.run(shutdown_rx.resubscribe())));

    let heartbeat_interval = std::time::Duration::from_millis(config.modules.normalizer.heartbeat_timeout);
    let normalizer = Arc::new(Normalizer::new(cache.clone(), bus.clone(), heartbeat_interval));
    let normalizer_counters = normalizer.counters();
    handles.push(tokio::spawn(normalizer.run(shutdown_rx.resubscribe())));

    let watchdog = Watchdog::new(cache.clone(), config.modules.normalizer.heartbeat_timeout);
    handles.push(tokio::spawn(watchdog.run(shutdown_rx.resubscribe())));

    let mut storage_counters = None;
    if config.modules.storage.enabled {
        let connection_string = config.modules.database.connection.connection_string();
        match sqlx::PgPool::connect(&connection_string).await {
            Ok(pool) => {
                let storage_config = StorageConfig {
                    flush_interval: std::time::Duration::from_millis(config.modules.storage.flush_interval),
                    batch_size: config.modules.storage.batch_size,
                };
                let writer = StorageWriter::new(pool, bus.clone(), storage_config);
                storage_counters = Some(writer.counters());
                handles.push(tokio::spawn(writer.run(shutdown_rx.resubscribe())));
            }
            Err(e) => {
                bus.publish_error("StorageWriter", format!("failed to connect to database: {e}"));
                tracing::error!(error = %e, "storage disabled for this run: database connection failed");
            }
        }
    }

    let egress_client_id = format!("{}-egress", config.mqtt.options.client_id);
    let mut egress_options = MqttOptions::new(
        egress_client_id,
        broker_host(&config.mqtt.broker_url),
        broker_port(&config.mqtt.broker_url),
    );
    egress_options.set_keep_alive(std::time::Duration::from_secs(30));
    let (egress_client, mut egress_eventloop) = AsyncClient::new(egress_options, 256);
    let egress_reconnect_period = config.mqtt.options.reconnect_period;
    tokio::spawn(async move {
        loop {
            if let Err(e) = egress_eventloop.poll().await {
                tracing::warn!(error = %e, "command egress mqtt connection error");
                tokio::time::sleep(std::time::Duration::from_millis(egress_reconnect_period)).await;
            }
        }
    });
    let translator = CommandTranslator::new(MqttEgress::new(egress_client), bus.clone());
    let translator_counters = translator.counters();
    handles.push(tokio::spawn(translator.run(shutdown_rx.resubscribe())));

    let mut app_state = AppState::new(cache.clone(), bus.clone(), config.clone());
    app_state.mqtt_connected.store(true, Ordering::Relaxed);
    app_state.ingress_counters = ingress_counters.clone();
    let app_state = Arc::new(app_state);

    {
        let mut reporter_shutdown = shutdown_rx.resubscribe();
        let normalizer_counters = normalizer_counters.clone();
        let storage_counters = storage_counters.clone();
        let translator_counters = translator_counters.clone();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reporter_shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let ingress_snap = ingress_counters.snapshot();
                        let normalizer_snap = normalizer_counters.snapshot();
                        let translator_snap = translator_counters.snapshot();
                        tracing::info!(
                            ingress_received = ingress_snap.received,
                            ingress_processed = ingress_snap.processed,
                            ingress_dropped = ingress_snap.dropped,
                            normalizer_received = normalizer_snap.received,
                            normalizer_processed = normalizer_snap.processed,
                            translator_received = translator_snap.received,
                            translator_processed = translator_snap.processed,
                            translator_dropped = translator_snap.dropped,
                            "pipeline stats summary"
                        );
                        if let Some(storage) = &storage_counters {
                            let storage_snap = storage.snapshot();
                            tracing::info!(
                                storage_received = storage_snap.received,
                                storage_processed = storage_snap.processed,
                                storage_dropped = storage_snap.dropped,
                                "storage writer stats summary"
                            );
                        }
                    }
                }
            }
        }));
    }

    if config.modules.api_server.enabled {
        let app = create_router(app_state.clone());
        let addr = format!("{}:{}", config.modules.api_server.host, config.modules.api_server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "api server listening");
        tracing::info!("swagger ui: http://{}/swagger-ui/", addr);

        let mut server_shutdown = shutdown_rx.resubscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.recv().await;
        });
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "api server exited with error");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn broker_host(url: &str) -> String {
    url.split("://").last().unwrap_or(url).split(':').next().unwrap_or(url).to_string()
}

fn broker_port(url: &str) -> u16 {
    url.split("://")
        .last()
        .unwrap_or(url)
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1883)
}
