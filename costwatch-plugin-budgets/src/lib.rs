/**
 * PLUGIN BUDGETS - Suivi des budgets mensuels par namespace Kubernetes
 *
 * RÔLE :
 * Interroge OpenCost toutes les 2 minutes sur le mois en cours, calcule
 * l'utilisation de chaque budget configuré et émet une alerte temps réel
 * sur `budget.warning` ou `budget.exceeded`.
 *
 * CONFIGURATION (JSON) :
 * {"budgets": [{"namespace": "default", "monthlyBudget": 100, "warningPercent": 0.8}]}
 * Sans configuration : budgets par défaut pour `default` et `kube-system`.
 *
 * ROUTES :
 * - GET /status → dernier état calculé `{"budgets": [...], "count": n}`
 * - GET /config → budgets actifs
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use costwatch_sdk::event::{TOPIC_BUDGET_EXCEEDED, TOPIC_BUDGET_WARNING};
use costwatch_sdk::plugin::EventChannel;
use costwatch_sdk::{
    Event, ExecuteRequest, ExecuteResponse, InitRequest, Metadata, Plugin, PluginError, Route,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PLUGIN_NAME: &str = "budgets";
const POLL_INTERVAL: Duration = Duration::from_secs(120);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub namespace: String,
    pub monthly_budget: f64,
    /// Seuil d'alerte en fraction du budget (0.8 = 80%)
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
}

fn default_warning_percent() -> f64 {
    0.8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    Ok,
    Warning,
    Exceeded,
}

impl BudgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetState::Ok => "ok",
            BudgetState::Warning => "warning",
            BudgetState::Exceeded => "exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub namespace: String,
    pub monthly_budget: f64,
    pub current_spend: f64,
    pub utilization: f64,
    pub status: BudgetState,
    #[serde(rename = "projectedEndOfMonth")]
    pub projected_end: f64,
}

#[derive(Debug, Deserialize)]
struct BudgetsConfig {
    #[serde(default)]
    budgets: Vec<Budget>,
}

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    #[serde(default)]
    data: Vec<Option<HashMap<String, NamespaceAllocation>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceAllocation {
    #[serde(default)]
    total_cost: f64,
}

pub fn default_budgets() -> Vec<Budget> {
    vec![
        Budget { namespace: "default".into(), monthly_budget: 100.0, warning_percent: 0.8 },
        Budget { namespace: "kube-system".into(), monthly_budget: 200.0, warning_percent: 0.8 },
    ]
}

/// Fraction du mois écoulée, jour courant inclus
pub fn month_progress(date: Date) -> f64 {
    f64::from(date.day()) / f64::from(days_in_month(date))
}

fn days_in_month(date: Date) -> u8 {
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    Date::from_calendar_date(year, month, 1)
        .ok()
        .and_then(|first| first.previous_day())
        .map(|last| last.day())
        .unwrap_or(30)
}

/// Statut de chaque budget dont le namespace apparaît dans `costs`
pub fn evaluate(
    budgets: &[Budget],
    costs: &HashMap<String, f64>,
    progress: f64,
) -> Vec<BudgetStatus> {
    budgets
        .iter()
        .filter_map(|b| {
            let spend = *costs.get(&b.namespace)?;
            let utilization = if b.monthly_budget > 0.0 { spend / b.monthly_budget } else { 0.0 };
            let projected_end = if progress > 0.0 { spend / progress } else { 0.0 };
            let status = if utilization >= 1.0 {
                BudgetState::Exceeded
            } else if utilization >= b.warning_percent {
                BudgetState::Warning
            } else {
                BudgetState::Ok
            };
            Some(BudgetStatus {
                namespace: b.namespace.clone(),
                monthly_budget: b.monthly_budget,
                current_spend: spend,
                utilization,
                status,
                projected_end,
            })
        })
        .collect()
}

/// Événement d'alerte ; `None` pour un budget dans les clous
pub fn alert_event(status: &BudgetStatus) -> Option<Event> {
    let topic = match status.status {
        BudgetState::Ok => return None,
        BudgetState::Warning => TOPIC_BUDGET_WARNING,
        BudgetState::Exceeded => TOPIC_BUDGET_EXCEEDED,
    };
    let payload = serde_json::json!({
        "namespace": status.namespace,
        "budget": status.monthly_budget,
        "currentSpend": status.current_spend,
        "utilization": status.utilization,
        "projected": status.projected_end,
        "status": status.status.as_str(),
    });
    match Event::new(status.status.as_str(), topic, PLUGIN_NAME, &payload) {
        Ok(event) => Some(event),
        Err(e) => {
            error!(
                namespace = %status.namespace,
                error = %e,
                "[budgets] failed to build alert event"
            );
            None
        }
    }
}

struct Shared {
    client: reqwest::Client,
    opencost_url: RwLock<String>,
    budgets: RwLock<Vec<Budget>>,
    statuses: RwLock<Vec<BudgetStatus>>,
    events: EventChannel,
}

impl Shared {
    async fn fetch_namespace_costs(&self) -> Result<HashMap<String, f64>> {
        let url = format!(
            "{}/allocation?window=month&aggregate=namespace&accumulate=true",
            self.opencost_url.read().trim_end_matches('/')
        );
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

        let mut costs = HashMap::new();
        for window in response.data.into_iter().flatten() {
            for (namespace, alloc) in window {
                *costs.entry(namespace).or_insert(0.0) += alloc.total_cost;
            }
        }
        Ok(costs)
    }

    async fn check_budgets(&self) {
        let costs = match self.fetch_namespace_costs().await {
            Ok(costs) => costs,
            Err(e) => {
                error!(error = %format!("{:#}", e), "[budgets] failed to fetch namespace costs");
                return;
            }
        };

        let progress = month_progress(OffsetDateTime::now_utc().date());
        let budgets = self.budgets.read().clone();
        let statuses = evaluate(&budgets, &costs, progress);

        for status in &statuses {
            if let Some(event) = alert_event(status) {
                if !self.events.emit(event) {
                    warn!(
                        namespace = %status.namespace,
                        "[budgets] event channel full, alert dropped"
                    );
                }
            }
        }
        debug!(evaluated = statuses.len(), "[budgets] budgets checked");
        *self.statuses.write() = statuses;
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken) {
        self.check_budgets().await;
        let start = tokio::time::Instant::now() + POLL_INTERVAL;
        let mut interval = tokio::time::interval_at(start, POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.check_budgets().await,
            }
        }
        debug!("[budgets] poll loop stopped");
    }
}

pub struct BudgetsPlugin {
    shared: Arc<Shared>,
}

impl BudgetsPlugin {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_budgets(default_budgets())
    }

    pub fn with_budgets(budgets: Vec<Budget>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                opencost_url: RwLock::new(String::new()),
                budgets: RwLock::new(budgets),
                statuses: RwLock::new(Vec::new()),
                events: EventChannel::default(),
            }),
        })
    }

    pub fn budgets(&self) -> Vec<Budget> {
        self.shared.budgets.read().clone()
    }

    pub fn statuses(&self) -> Vec<BudgetStatus> {
        self.shared.statuses.read().clone()
    }
}

#[async_trait]
impl Plugin for BudgetsPlugin {
    fn metadata(&self) -> Result<Metadata, PluginError> {
        Ok(Metadata {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Budget tracking and enforcement per namespace with streaming alerts"
                .to_string(),
            plugin_type: "policy".to_string(),
            topics: vec![TOPIC_BUDGET_WARNING.to_string(), TOPIC_BUDGET_EXCEEDED.to_string()],
            routes: vec![
                Route::get("/status", "Budget status per namespace"),
                Route::get("/config", "Current budget configuration"),
            ],
        })
    }

    async fn initialize(
        &self,
        token: CancellationToken,
        req: InitRequest,
    ) -> Result<(), PluginError> {
        if !req.config.is_empty() {
            let cfg: BudgetsConfig = serde_json::from_slice(&req.config)
                .map_err(|e| PluginError::Initialize(format!("invalid budgets config: {}", e)))?;
            if !cfg.budgets.is_empty() {
                *self.shared.budgets.write() = cfg.budgets;
            }
        }
        *self.shared.opencost_url.write() = req.external_service_url;

        info!(budgets = self.shared.budgets.read().len(), "[budgets] initialized");
        tokio::spawn(self.shared.clone().poll_loop(token));
        Ok(())
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, PluginError> {
        match req.action.as_str() {
            "/status" => {
                let statuses = self.statuses();
                let body = serde_json::json!({ "count": statuses.len(), "budgets": statuses });
                ExecuteResponse::json(&body)
            }
            "/config" => ExecuteResponse::json(&serde_json::json!({ "budgets": self.budgets() })),
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
        info!("[budgets] stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn costs(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(ns, c)| (ns.to_string(), *c)).collect()
    }

    #[test]
    fn test_month_progress() {
        assert_eq!(month_progress(date!(2026 - 06 - 15)), 0.5);
        assert_eq!(month_progress(date!(2026 - 12 - 31)), 1.0);
        assert_eq!(month_progress(date!(2028 - 02 - 29)), 1.0);
        assert_eq!(days_in_month(date!(2026 - 02 - 10)), 28);
    }

    #[test]
    fn test_evaluate_thresholds() {
        let budgets = vec![
            Budget { namespace: "a".into(), monthly_budget: 100.0, warning_percent: 0.8 },
            Budget { namespace: "b".into(), monthly_budget: 100.0, warning_percent: 0.8 },
            Budget { namespace: "c".into(), monthly_budget: 100.0, warning_percent: 0.8 },
            Budget { namespace: "absent".into(), monthly_budget: 100.0, warning_percent: 0.8 },
        ];
        let statuses = evaluate(&budgets, &costs(&[("a", 10.0), ("b", 80.0), ("c", 120.0)]), 0.5);

        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].status, BudgetState::Ok);
        assert_eq!(statuses[1].status, BudgetState::Warning);
        assert_eq!(statuses[2].status, BudgetState::Exceeded);
        assert_eq!(statuses[1].projected_end, 160.0);
        assert_eq!(statuses[2].utilization, 1.2);
    }

    #[test]
    fn test_zero_budget_and_progress() {
        let budgets =
            vec![Budget { namespace: "a".into(), monthly_budget: 0.0, warning_percent: 0.8 }];
        let statuses = evaluate(&budgets, &costs(&[("a", 5.0)]), 0.0);
        assert_eq!(statuses[0].utilization, 0.0);
        assert_eq!(statuses[0].projected_end, 0.0);
        assert_eq!(statuses[0].status, BudgetState::Ok);
    }

    #[test]
    fn test_alert_event_topics() {
        let budgets = vec![
            Budget { namespace: "ok".into(), monthly_budget: 100.0, warning_percent: 0.8 },
            Budget { namespace: "warn".into(), monthly_budget: 100.0, warning_percent: 0.8 },
            Budget { namespace: "over".into(), monthly_budget: 100.0, warning_percent: 0.8 },
        ];
        let spent = costs(&[("ok", 1.0), ("warn", 90.0), ("over", 150.0)]);
        let statuses = evaluate(&budgets, &spent, 1.0);

        assert!(alert_event(&statuses[0]).is_none());
        let warning = alert_event(&statuses[1]).unwrap();
        assert_eq!(warning.topic(), "budget.warning");
        assert_eq!(warning.event_type(), "warning");
        assert_eq!(warning.source(), "budgets");
        let exceeded = alert_event(&statuses[2]).unwrap();
        assert_eq!(exceeded.topic(), "budget.exceeded");
        let payload: serde_json::Value = exceeded.payload_as().unwrap();
        assert_eq!(payload["namespace"], "over");
        assert_eq!(payload["status"], "exceeded");
    }

    #[tokio::test]
    async fn test_initialize_applies_config() {
        let plugin = BudgetsPlugin::new().unwrap();
        let token = CancellationToken::new();
        let config = br#"{"budgets":[{"namespace":"team-a","monthlyBudget":500}]}"#.to_vec();
        plugin
            .initialize(
                token.clone(),
                InitRequest { config, external_service_url: "http://127.0.0.1:9".into() },
            )
            .await
            .unwrap();
        token.cancel();

        let budgets = plugin.budgets();
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0].namespace, "team-a");
        assert_eq!(budgets[0].warning_percent, 0.8);

        let resp = plugin
            .execute(ExecuteRequest { action: "/config".into(), ..Default::default() })
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&resp.data).unwrap();
        assert_eq!(body["budgets"][0]["monthlyBudget"], 500.0);
    }

    #[tokio::test]
    async fn test_initialize_rejects_malformed_config() {
        let plugin = BudgetsPlugin::new().unwrap();
        let err = plugin
            .initialize(
                CancellationToken::new(),
                InitRequest { config: b"{not json".to_vec(), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Initialize(_)));
        assert_eq!(plugin.budgets(), default_budgets());
    }

    #[tokio::test]
    async fn test_execute_routes() {
        let plugin = BudgetsPlugin::new().unwrap();
        let status = plugin
            .execute(ExecuteRequest { action: "/status".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(status.status_code, 200);
        let body: serde_json::Value = serde_json::from_slice(&status.data).unwrap();
        assert_eq!(body["count"], 0);
        assert!(body["budgets"].as_array().unwrap().is_empty());

        let unknown = plugin
            .execute(ExecuteRequest { action: "/nope".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(unknown.status_code, 404);
        assert_eq!(unknown.error.as_deref(), Some("unknown action: /nope"));
    }

    #[tokio::test]
    async fn test_stream_taken_once_and_closed_on_shutdown() {
        let plugin = BudgetsPlugin::new().unwrap();
        let mut rx = plugin.stream_events(CancellationToken::new()).await.unwrap().unwrap();
        assert!(plugin.stream_events(CancellationToken::new()).await.is_err());

        plugin.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
