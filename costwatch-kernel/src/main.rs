/**
 * COSTWATCH KERNEL - Point d'entrée principal du serveur Costwatch
 *
 * RÔLE : Orchestration de tous les modules : config, store, event hub, plugins,
 * scheduler de collecte, proxy OpenCost, health et HTTP.
 * Bootstrap du système complet avec arrêt propre sur Ctrl-C / SIGTERM.
 *
 * ARCHITECTURE : Event-driven via hub WebSocket + API REST + collecte périodique.
 * UTILITÉ : Cerveau central de Costwatch, point d'administration unique.
 */

mod collectors;
mod config;
mod health;
mod http;
mod hub;
mod plugins;
mod proxy;
mod scheduler;
mod store;
mod stream;

use crate::collectors::{CollectorRegistry, KubernetesCollector};
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hub::EventHub;
use crate::plugins::PluginManager;
use crate::proxy::{OpenCostProxy, HEALTH_CHECK_INTERVAL};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{MemoryStore, Store};

use anyhow::{Context, Result};
use costwatch_plugin_budgets::BudgetsPlugin;
use costwatch_plugin_costbreakdown::CostBreakdownPlugin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = load_config().await;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // store
    let store: Arc<dyn Store> = if cfg.data_file.is_empty() {
        info!("[kernel] no data file configured, using in-memory store");
        Arc::new(MemoryStore::in_memory())
    } else {
        Arc::new(
            MemoryStore::open(&cfg.data_file)
                .await
                .with_context(|| format!("failed to open store {}", cfg.data_file))?,
        )
    };

    let hub = Arc::new(EventHub::new(cfg.hub.client_buffer));

    // collecteurs
    let registry = Arc::new(CollectorRegistry::new());
    match KubernetesCollector::new() {
        Ok(collector) => registry.register(Arc::new(collector)),
        Err(e) => error!(error = %e, "[kernel] failed to create Kubernetes collector"),
    }

    // plugins compilés
    let plugin_manager = PluginManager::new(hub.clone())
        .with_configs(cfg.plugin_configs())
        .with_execute_timeout(cfg.execute_timeout());
    match BudgetsPlugin::new() {
        Ok(plugin) => {
            if let Err(e) = plugin_manager.register(Arc::new(plugin)) {
                error!(error = %e, "[kernel] failed to register budgets plugin");
            }
        }
        Err(e) => error!(error = %e, "[kernel] failed to create budgets plugin"),
    }
    match CostBreakdownPlugin::new() {
        Ok(plugin) => {
            if let Err(e) = plugin_manager.register(Arc::new(plugin)) {
                error!(error = %e, "[kernel] failed to register costbreakdown plugin");
            }
        }
        Err(e) => error!(error = %e, "[kernel] failed to create costbreakdown plugin"),
    }
    let plugins = Arc::new(plugin_manager);

    let shutdown = CancellationToken::new();

    // collecte périodique
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        hub.clone(),
        SchedulerConfig {
            csp_interval: cfg.csp_interval(),
            kubernetes_interval: cfg.kubernetes_interval(),
        },
    ));
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown.child_token()));

    // proxy OpenCost et suivi de sa disponibilité
    let opencost = Arc::new(
        OpenCostProxy::new(&cfg.opencost_url).context("failed to create OpenCost client")?,
    );
    let opencost_task = opencost.spawn_health_check(HEALTH_CHECK_INTERVAL, shutdown.child_token());

    let initialized = plugins.initialize_all(&shutdown, &cfg.opencost_url).await;
    info!(initialized, registered = plugins.len(), "[kernel] plugins initialized");

    // démarre la publication auto du health
    let health = HealthTracker::new(hub.clone(), plugins.clone())
        .with_opencost(opencost.clone())
        .with_scheduler(scheduler);
    let health_task = health.spawn_health_publisher(shutdown.child_token());

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        registry,
        plugins: plugins.clone(),
        hub,
        health,
        opencost,
        shutdown: shutdown.clone(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http_addr))?;
    info!("[kernel] listening on http://{}", cfg.http_addr);

    tokio::spawn(wait_for_signal(shutdown.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    // Le serveur peut s'arrêter sur erreur sans signal
    shutdown.cancel();

    if tokio::time::timeout(cfg.shutdown_grace(), plugins.shutdown_all()).await.is_err() {
        warn!(
            grace_secs = cfg.shutdown_grace_secs,
            "[kernel] plugin shutdown exceeded grace period"
        );
    }
    let _ = scheduler_task.await;
    let _ = health_task.await;
    let _ = opencost_task.await;

    served.context("HTTP server failed")?;
    info!("[kernel] stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "[kernel] cannot listen for Ctrl-C");
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
                error!(error = %e, "[kernel] cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[kernel] Ctrl-C received, shutting down"),
        _ = terminate => info!("[kernel] SIGTERM received, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
