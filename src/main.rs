use rumqttc::QoS;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use telemetry_gateway::adapters::{InfluxRepository, MqttAdapter};
use telemetry_gateway::config::{AppConfig, RuleBackend};
use telemetry_gateway::ports::{MessageBroker, RuleStore, TimeSeriesSink};
use telemetry_gateway::service::control::ControlPlane;
use telemetry_gateway::service::gateway::{run_control_loop, run_ingest_loop, run_scheduler};
use telemetry_gateway::service::ingest::IngestPipeline;
use telemetry_gateway::service::rule_engine::RuleEngine;
use telemetry_gateway::service::status::{default_probes, StatusAggregator};
use telemetry_gateway::service::worker_pool::WorkerPool;
use telemetry_gateway::state::{JsonFileRuleStore, PgRuleStore};
use telemetry_gateway::telemetry::{init_telemetry, shutdown_telemetry};
use tracing::{error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 0. Load Env Vars First
    dotenvy::dotenv().ok();

    // 1. Initialize Structured Logging
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().filter(|v| !v.is_empty());
    init_telemetry("telemetry-gateway", otlp_endpoint.as_deref())?;

    info!("Starting telemetry gateway...");

    // 2. Load Configuration
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded.");

    // 2b. Initialize Metrics
    let installed = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_listen)
        .idle_timeout(
            metrics_util::MetricKindMask::ALL,
            Some(Duration::from_secs(60)),
        )
        .install();
    match installed {
        Ok(()) => info!("Prometheus Metrics listening on {}", config.metrics_listen),
        Err(e) => warn!("Prometheus exporter disabled: {:?}", e),
    }

    // 3. Time-Series Store
    info!("Connecting to InfluxDB at {}:{}...", config.influx.host, config.influx.port);
    let sink: Arc<dyn TimeSeriesSink> = match InfluxRepository::connect(&config.influx).await {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!("Failed to connect to InfluxDB: {:?}", e);
            std::process::exit(1);
        }
    };

    // 4. Rule Store
    let store: Arc<dyn RuleStore> = match &config.rules {
        RuleBackend::Postgres { url } => {
            info!("Connecting to rule database...");
            let pool = match PgPoolOptions::new().max_connections(5).connect(url).await {
                Ok(pool) => pool,
                Err(e) => {
                    error!("Failed to connect to rule database: {:?}", e);
                    std::process::exit(1);
                }
            };
            let store = PgRuleStore::new(pool);
            if let Err(e) = store.init().await {
                error!("Failed to prepare rule table: {:?}", e);
                std::process::exit(1);
            }
            Arc::new(store)
        }
        RuleBackend::File { path } => {
            info!("Rules stored in {}", path.display());
            Arc::new(JsonFileRuleStore::new(path.clone()))
        }
    };

    // 5. MQTT Setup (local for ingest, remote for control and actions)
    let (local_client, mut local_eventloop) = MqttAdapter::build(&config.local_broker);
    let (remote_client, mut remote_eventloop) = MqttAdapter::build(&config.remote_broker);

    info!("Connecting to local broker {}:{}...", config.local_broker.host, config.local_broker.port);
    if let Err(e) = MqttAdapter::await_connack(&mut local_eventloop, CONNECT_TIMEOUT).await {
        error!("Local broker unavailable: {:?}", e);
        std::process::exit(1);
    }
    info!("Connecting to remote broker {}:{}...", config.remote_broker.host, config.remote_broker.port);
    if let Err(e) = MqttAdapter::await_connack(&mut remote_eventloop, CONNECT_TIMEOUT).await {
        error!("Remote broker unavailable: {:?}", e);
        std::process::exit(1);
    }

    let remote: Arc<dyn MessageBroker> = Arc::new(MqttAdapter::new(remote_client.clone(), QoS::AtLeastOnce));

    // 6. Services
    let engine = Arc::new(RuleEngine::new(store.clone(), sink.clone(), remote.clone()));
    let status = Arc::new(StatusAggregator::new(
        sink.clone(),
        remote.clone(),
        default_probes(),
        config.offline_timeout,
        config.dashboard_status_topic.clone(),
    ));
    let control = Arc::new(ControlPlane::new(store, remote, config.rules_list_topic.clone()));
    let pipeline = Arc::new(IngestPipeline::new(sink));

    // 7. Start Background Tasks
    let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(10000);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // 7a. Worker Pool
    let worker_pool = WorkerPool::new(pipeline, config.ingest_workers);
    let worker_handle = tokio::spawn(async move {
        worker_pool.run(raw_rx).await;
    });

    // 7b. Ingest Loop (Producer to Worker Pool)
    let topics = config.ingest_topics.clone();
    let ingest_shutdown = shutdown_rx.clone();
    let ingest_handle = tokio::spawn(async move {
        if let Err(e) = run_ingest_loop(local_eventloop, local_client, topics, raw_tx, ingest_shutdown).await {
            error!("Ingest Loop Error: {:?}", e);
        }
    });

    // 7c. Control Loop
    let manage_topic = config.rules_manage_topic.clone();
    let control_handle = tokio::spawn(async move {
        if let Err(e) = run_control_loop(remote_eventloop, remote_client, manage_topic, control, shutdown_rx).await {
            error!("Control Loop Error: {:?}", e);
        }
    });

    // 7d. Rule + Status Scheduler
    let scheduler_handle = tokio::spawn(run_scheduler(
        engine,
        status,
        config.rule_interval,
        config.status_interval,
    ));

    info!("System Running. Press Ctrl+C to stop.");

    // 8. Shutdown Signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown Signal Received..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    // 9. Graceful Shutdown
    let _ = shutdown_tx.send(true);
    scheduler_handle.abort();

    let _ = tokio::join!(ingest_handle, control_handle);
    // Ingest loop exits -> drops `raw_tx` -> Worker pool drains in-flight writes -> exits.

    info!("Waiting for Worker Pool to drain...");
    match tokio::time::timeout(Duration::from_secs(20), worker_handle).await {
        Ok(_) => info!("Worker Pool drained."),
        Err(_) => warn!("Timeout waiting for Worker Pool."),
    }

    shutdown_telemetry();
    info!("Shutdown Complete.");

    Ok(())
}
