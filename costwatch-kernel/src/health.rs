use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use costwatch_sdk::event::TOPIC_SYSTEM;
use costwatch_sdk::Event;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::hub::EventHub;
use crate::plugins::PluginManager;
use crate::proxy::OpenCostProxy;
use crate::scheduler::Scheduler;

pub const EVENT_KERNEL_HEALTH: &str = "kernel.health";
const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub stream_clients: usize,
    pub plugins_registered: usize,
    pub memory_usage_mb: f32,
    /// Dépendances suivies : `opencost`, `scheduler`
    pub services: BTreeMap<&'static str, &'static str>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    hub: Arc<EventHub>,
    plugins: Arc<PluginManager>,
    opencost: Option<Arc<OpenCostProxy>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl HealthTracker {
    pub fn new(hub: Arc<EventHub>, plugins: Arc<PluginManager>) -> Self {
        Self { start_time: Instant::now(), hub, plugins, opencost: None, scheduler: None }
    }

    pub fn with_opencost(mut self, proxy: Arc<OpenCostProxy>) -> Self {
        self.opencost = Some(proxy);
        self
    }

    /// Le kernel n'est prêt qu'après la passe de collecte initiale
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn is_ready(&self) -> bool {
        match &self.scheduler {
            Some(scheduler) => scheduler.initial_pass_done(),
            None => true,
        }
    }

    fn services(&self) -> BTreeMap<&'static str, &'static str> {
        let mut services = BTreeMap::new();
        if let Some(proxy) = &self.opencost {
            let state = if proxy.is_healthy() { "healthy" } else { "unreachable" };
            services.insert("opencost", state);
        }
        if let Some(scheduler) = &self.scheduler {
            let state = if scheduler.initial_pass_done() { "ready" } else { "initializing" };
            services.insert("scheduler", state);
        }
        services
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            status: "ok",
            uptime_seconds: self.start_time.elapsed().as_secs(),
            stream_clients: self.hub.len(),
            plugins_registered: self.plugins.len(),
            memory_usage_mb: get_memory_usage_mb(),
            services: self.services(),
        }
    }

    /// Diffuse l'état du kernel à tous les clients toutes les 30s
    pub fn spawn_health_publisher(&self, token: CancellationToken) -> JoinHandle<()> {
        self.spawn_publisher_every(PUBLISH_INTERVAL, token)
    }

    fn spawn_publisher_every(&self, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tracker.publish_once(),
                }
            }
        })
    }

    fn publish_once(&self) {
        let health = self.get_health();
        match Event::new(EVENT_KERNEL_HEALTH, TOPIC_SYSTEM, "kernel", &health) {
            Ok(event) => {
                let delivered = self.hub.broadcast(&event);
                debug!(
                    uptime = health.uptime_seconds,
                    clients = delivered,
                    "[health] published kernel health"
                );
            }
            Err(e) => error!(error = %e, "[health] failed to build health event"),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    let kb = line.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok());
                    if let Some(kb) = kb {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}
