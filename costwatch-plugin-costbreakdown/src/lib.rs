//! Plugin costbreakdown : détection des ressources sous-utilisées.
//!
//! Toutes les 5 minutes, compare l'usage moyen CPU/RAM aux requêtes de chaque
//! namespace sur les dernières 24h. Sous 20% d'usage, une recommandation est
//! produite avec une estimation d'économie, et le lot est émis sur
//! `cost.idle.detected`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use costwatch_sdk::event::TOPIC_COST_IDLE;
use costwatch_sdk::plugin::EventChannel;
use costwatch_sdk::{
    Event, ExecuteRequest, ExecuteResponse, InitRequest, Metadata, Plugin, PluginError, Route,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PLUGIN_NAME: &str = "costbreakdown";
pub const EVENT_IDLE_DETECTED: &str = "idle_detected";
const POLL_INTERVAL: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const ALLOCATION_QUERY: &str = "/allocation?window=24h&aggregate=namespace&accumulate=true";

/// Ratio usage/requête sous lequel une ressource est considérée inactive
pub const IDLE_RATIO: f64 = 0.2;
const CPU_COST_SHARE: f64 = 0.8;
const RAM_COST_SHARE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_savings(savings: f64) -> Self {
        if savings > 50.0 {
            Severity::High
        } else if savings > 10.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub namespace: String,
    pub resource_type: ResourceType,
    pub requested: f64,
    pub used: f64,
    #[serde(rename = "estimatedSavings")]
    pub savings: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub cpu_core_request_average: f64,
    #[serde(default)]
    pub cpu_core_usage_average: f64,
    #[serde(default)]
    pub ram_byte_request_average: f64,
    #[serde(default)]
    pub ram_byte_usage_average: f64,
}

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    #[serde(default)]
    data: Vec<Option<HashMap<String, Allocation>>>,
}

fn idle_recommendation(
    alloc: &Allocation,
    resource_type: ResourceType,
    requested: f64,
    used: f64,
    cost_share: f64,
) -> Option<Recommendation> {
    if requested <= 0.0 || used <= 0.0 {
        return None;
    }
    let ratio = used / requested;
    if ratio >= IDLE_RATIO {
        return None;
    }
    let savings = alloc.total_cost * (1.0 - ratio) * cost_share;
    Some(Recommendation {
        namespace: alloc.name.clone(),
        resource_type,
        requested,
        used,
        savings,
        severity: Severity::from_savings(savings),
    })
}

pub fn detect_idle(allocations: &[Allocation]) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    for alloc in allocations {
        recs.extend(idle_recommendation(
            alloc,
            ResourceType::Cpu,
            alloc.cpu_core_request_average,
            alloc.cpu_core_usage_average,
            CPU_COST_SHARE,
        ));
        recs.extend(idle_recommendation(
            alloc,
            ResourceType::Memory,
            alloc.ram_byte_request_average,
            alloc.ram_byte_usage_average,
            RAM_COST_SHARE,
        ));
    }
    recs
}

struct Shared {
    client: reqwest::Client,
    opencost_url: RwLock<String>,
    recommendations: RwLock<Vec<Recommendation>>,
    events: EventChannel,
}

impl Shared {
    fn allocation_url(&self) -> String {
        format!("{}{}", self.opencost_url.read().trim_end_matches('/'), ALLOCATION_QUERY)
    }

    async fn fetch_allocations(&self) -> Result<Vec<Allocation>> {
        let url = self.allocation_url();
        let response: AllocationResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse allocation response")?;

        let mut allocations = Vec::new();
        for window in response.data.into_iter().flatten() {
            for (key, mut alloc) in window {
                if alloc.name.is_empty() {
                    alloc.name = key;
                }
                allocations.push(alloc);
            }
        }
        // Ordre stable pour /recommendations
        allocations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(allocations)
    }

    async fn detect(&self) {
        let allocations = match self.fetch_allocations().await {
            Ok(allocations) => allocations,
            Err(e) => {
                error!(error = %format!("{:#}", e), "[costbreakdown] failed to fetch allocations");
                return;
            }
        };

        let recs = detect_idle(&allocations);
        debug!(
            allocations = allocations.len(),
            recommendations = recs.len(),
            "[costbreakdown] idle detection done"
        );

        if !recs.is_empty() {
            let payload = serde_json::json!({ "count": recs.len(), "recommendations": recs });
            match Event::new(EVENT_IDLE_DETECTED, TOPIC_COST_IDLE, PLUGIN_NAME, &payload) {
                Ok(event) => {
                    if !self.events.emit(event) {
                        warn!("[costbreakdown] event channel full, idle report dropped");
                    }
                }
                Err(e) => error!(error = %e, "[costbreakdown] failed to build idle event"),
            }
        }
        *self.recommendations.write() = recs;
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken) {
        self.detect().await;
        let start = tokio::time::Instant::now() + POLL_INTERVAL;
        let mut interval = tokio::time::interval_at(start, POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.detect().await,
            }
        }
        debug!("[costbreakdown] poll loop stopped");
    }

    /// Relaye la réponse brute d'OpenCost
    async fn summary(&self) -> ExecuteResponse {
        let url = self.allocation_url();
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return ExecuteResponse::error(502, e.to_string()),
        };
        let status_code = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => ExecuteResponse {
                data: body.to_vec(),
                content_type: "application/json".to_string(),
                status_code,
                error: None,
            },
            Err(e) => ExecuteResponse::error(500, e.to_string()),
        }
    }
}

pub struct CostBreakdownPlugin {
    shared: Arc<Shared>,
}

impl CostBreakdownPlugin {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                opencost_url: RwLock::new(String::new()),
                recommendations: RwLock::new(Vec::new()),
                events: EventChannel::default(),
            }),
        })
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.shared.recommendations.read().clone()
    }
}

#[async_trait]
impl Plugin for CostBreakdownPlugin {
    fn metadata(&self) -> Result<Metadata, PluginError> {
        Ok(Metadata {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description:
                "Enriched cost breakdown with idle resource detection and savings recommendations"
                    .to_string(),
            plugin_type: "cost".to_string(),
            topics: vec![TOPIC_COST_IDLE.to_string()],
            routes: vec![
                Route::get("/recommendations", "List idle resource recommendations"),
                Route::get("/summary", "Cost breakdown summary"),
            ],
        })
    }

    async fn initialize(
        &self,
        token: CancellationToken,
        req: InitRequest,
    ) -> Result<(), PluginError> {
        *self.shared.opencost_url.write() = req.external_service_url;
        info!("[costbreakdown] initialized");
        tokio::spawn(self.shared.clone().poll_loop(token));
        Ok(())
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, PluginError> {
        match req.action.as_str() {
            "/recommendations" => {
                let recs = self.recommendations();
                let body = serde_json::json!({ "count": recs.len(), "recommendations": recs });
                ExecuteResponse::json(&body)
            }
            "/summary" => Ok(self.shared.summary().await),
            other => Ok(ExecuteResponse::error(404, format!("unknown action: {}", other))),
        }
    }

    async fn stream_events(
        &self,
        _token: CancellationToken,
    ) -> Result<Option<mpsc::Receiver<Event>>, PluginError> {
        self.shared
            .events
            .take_receiver()
            .map(Some)
            .ok_or_else(|| PluginError::Stream("event stream already taken".into()))
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.shared.events.close();
        info!("[costbreakdown] stopped");
        Ok(())
    }
}
