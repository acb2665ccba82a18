use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kube_rightsize::bus::EventBus;
use kube_rightsize::config;
use kube_rightsize::crd::{MetricsProviderKind, RightSizerConfig, RightSizerConfigSpec};
use kube_rightsize::events::{Event, EventSeverity, EventType};
use kube_rightsize::executor::ResizeExecutor;
use kube_rightsize::health;
use kube_rightsize::metrics::cache::CachedMetricsProvider;
use kube_rightsize::metrics::metrics_server::MetricsServerProvider;
use kube_rightsize::metrics::prometheus::PrometheusProvider;
use kube_rightsize::metrics::{MetricsProvider, NodeMetricsSource};
use kube_rightsize::predictive::PredictiveMonitor;
use kube_rightsize::recommendations::{RecommendationManager, RecommendationStatus};
use kube_rightsize::reconciler::Reconciler;
use kube_rightsize::remediation::RemediationEngine;
use kube_rightsize::validation::ClusterInspector;

const EVENT_BUFFER: usize = 256;

pub async fn run() -> Result<()> {
    let store = config::global();
    let settings = store.snapshot();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    println!("Starting right-sizing operator...\n");

    let validation_errors = store.validate();
    if !validation_errors.is_empty() {
        anyhow::bail!("Invalid configuration: {}", validation_errors.join("; "));
    }

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // ── components ──
    let health = health::new_shared();
    {
        let mut state = health.lock().expect("health lock poisoned");
        state.config_loaded = true;
    }

    let bus = EventBus::start(EVENT_BUFFER);
    {
        let mut state = health.lock().expect("health lock poisoned");
        state.bus_running = true;
    }

    let metrics_server = Arc::new(MetricsServerProvider::new(client.clone()));
    let upstream: Arc<dyn MetricsProvider> = match settings.metrics_provider {
        MetricsProviderKind::MetricsServer => metrics_server.clone(),
        MetricsProviderKind::Prometheus => Arc::new(
            PrometheusProvider::new(&settings.prometheus_url)
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        ),
    };
    let provider = Arc::new(CachedMetricsProvider::new(
        upstream,
        settings.metrics_cache_ttl,
    ));

    let inspector = Arc::new(ClusterInspector::new(client.clone()));
    let executor = Arc::new(ResizeExecutor::new(
        client.clone(),
        settings.enable_in_place_resize,
    ));

    print!("  In-place resize support ..... ");
    if executor.detect_support().await {
        println!("OK");
    } else {
        println!("UNSUPPORTED (running in proposal mode)");
    }

    let recommendations = RecommendationManager::new(
        settings.max_recommendations as usize,
        bus.clone(),
    );
    recommendations.clone().start_cleanup(settings.cleanup_interval);

    let engine = Arc::new(RemediationEngine::with_defaults(
        client.clone(),
        executor.clone(),
        settings.dry_run,
        settings.safety_timeout,
    ));

    let monitor = PredictiveMonitor::new(store.clone(), bus.clone(), recommendations.clone());
    let node_source: Option<Arc<dyn NodeMetricsSource>> = match settings.metrics_provider {
        MetricsProviderKind::MetricsServer => Some(metrics_server.clone()),
        MetricsProviderKind::Prometheus => None,
    };
    monitor.clone().start(
        client.clone(),
        provider.clone() as Arc<dyn MetricsProvider>,
        node_source,
    );

    let reconciler = Reconciler::new(
        client.clone(),
        store.clone(),
        bus.clone(),
        provider.clone(),
        inspector,
        executor,
        recommendations.clone(),
        health.clone(),
    );
    reconciler.clone().start();

    // RightSizerConfig deliveries are folded into the effective config.
    let config_sync = {
        let store = store.clone();
        let bus = bus.clone();
        let api: Api<RightSizerConfig> = Api::all(client.clone());
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_applied: Option<RightSizerConfigSpec> = None;
            loop {
                tick.tick().await;
                let Ok(list) = api.list(&ListParams::default()).await else {
                    continue;
                };
                let Some(delivered) = list.items.into_iter().next() else {
                    continue;
                };
                if last_applied.as_ref() == Some(&delivered.spec) {
                    continue;
                }
                match store.update_from_source(&delivered.spec) {
                    Ok(()) => {
                        info!(config = %delivered.name_any(), "config_applied_from_crd");
                        bus.publish(Event::new(
                            EventType::SystemConfigUpdated,
                            EventSeverity::Info,
                            format!(
                                "configuration updated from RightSizerConfig '{}'",
                                delivered.name_any()
                            ),
                        ));
                        last_applied = Some(delivered.spec);
                    }
                    Err(e) => warn!(error = %e, "config_delivery_rejected"),
                }
            }
        })
    };

    // Approved recommendations flow into the remediation engine.
    let approval_worker = {
        let recommendations = recommendations.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(15));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for rec in recommendations.list() {
                    if rec.status == RecommendationStatus::Approved
                        && let Err(e) = recommendations.execute(&rec.id, &engine).await
                    {
                        warn!(id = %rec.id, error = %e, "recommendation_execute_failed");
                    }
                }
            }
        })
    };

    // ── health server ──
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_handle = tokio::spawn(health::serve(
        health.clone(),
        addr,
        shutdown_tx.subscribe(),
    ));

    health::set_component(&health, "reconciler", "running");
    health::set_component(&health, "predictive-monitor", "running");
    health::set_component(&health, "recommendation-manager", "running");
    health::set_component(&health, "event-bus", "running");

    println!(
        "  Metrics provider ............ {}",
        provider.name()
    );
    println!(
        "  Resize interval ............. {}s",
        settings.resize_interval.as_secs()
    );
    println!(
        "  Dry run ..................... {}",
        settings.dry_run
    );
    println!("  Health / metrics server ..... http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first metrics fetch)");
    println!("    GET /statusz .............. Per-component status report");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");
    bus.publish(Event::new(
        EventType::SystemStarted,
        EventSeverity::Info,
        "right-sizing operator started",
    ));

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping operator...");
    println!("{}", "=".repeat(70));

    // Deterministic shutdown: reconciler, monitor, recommendation cleanup,
    // event bus drain, caches last.
    reconciler.stop().await;
    monitor.stop();
    config_sync.abort();
    approval_worker.abort();
    recommendations.stop();

    bus.publish(Event::new(
        EventType::SystemStopped,
        EventSeverity::Info,
        "right-sizing operator stopping",
    ));
    bus.stop().await;

    provider.stop();
    provider.clear();

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}
