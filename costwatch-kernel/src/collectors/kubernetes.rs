//! Collecteur Kubernetes : API d'allocation OpenCost agrégée par namespace.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use costwatch_sdk::collector::{CollectError, Collector, TimeWindow};
use costwatch_sdk::models::{CostRecord, CostSource, CostSourceType};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub opencost_url: String,
    #[serde(default)]
    pub kubeconfig_ref: Option<String>,
}

impl KubernetesConfig {
    pub fn parse(config: &serde_json::Value) -> Result<Self, CollectError> {
        let cfg: Self = serde_json::from_value(config.clone())
            .map_err(|e| CollectError::InvalidConfig(format!("invalid Kubernetes config: {}", e)))?;
        if cfg.cluster_name.is_empty() {
            return Err(CollectError::InvalidConfig("clusterName is required".into()));
        }
        if cfg.opencost_url.is_empty() {
            return Err(CollectError::InvalidConfig("opencostUrl is required".into()));
        }
        Ok(cfg)
    }
}

#[derive(Debug, Deserialize)]
pub struct AllocationResponse {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub data: Vec<Option<BTreeMap<String, Allocation>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    #[serde(default)]
    pub cpu_cost: f64,
    #[serde(default)]
    pub ram_cost: f64,
    #[serde(default)]
    pub gpu_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
}

pub struct KubernetesCollector {
    http: reqwest::Client,
}

impl KubernetesCollector {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }
}

fn rfc3339(ts: OffsetDateTime) -> Result<String, CollectError> {
    ts.format(&Rfc3339).map_err(|e| CollectError::InvalidConfig(e.to_string()))
}

/// Un enregistrement par namespace, sur toute la fenêtre
pub fn normalize(
    source: &CostSource,
    cluster: &str,
    window: TimeWindow,
    response: AllocationResponse,
) -> Vec<CostRecord> {
    let mut records = Vec::new();
    for set in response.data.into_iter().flatten() {
        for (namespace, alloc) in set {
            let mut record = CostRecord::new(source, "kubernetes", window.start, window.end);
            record.provider_id = format!("{}/{}", cluster, namespace);
            record.account_id = cluster.to_string();
            record.account_name = cluster.to_string();
            record.service = format!("Kubernetes/{}", namespace);
            record.category = "Compute".to_string();
            record.list_cost = alloc.total_cost;
            record.net_cost = alloc.total_cost;
            record.amortized_cost = alloc.total_cost;
            record.amortized_net_cost = alloc.total_cost;
            record.labels.insert("namespace".into(), namespace);
            record.labels.insert("cluster".into(), cluster.to_string());
            record.kubernetes_percent = 1.0;
            records.push(record);
        }
    }
    records
}

#[async_trait]
impl Collector for KubernetesCollector {
    fn source_type(&self) -> CostSourceType {
        CostSourceType::Kubernetes
    }

    fn validate(&self, config: &serde_json::Value) -> Result<(), CollectError> {
        KubernetesConfig::parse(config).map(|_| ())
    }

    async fn collect(
        &self,
        source: &CostSource,
        window: TimeWindow,
    ) -> Result<Vec<CostRecord>, CollectError> {
        let cfg = KubernetesConfig::parse(&source.config)?;
        info!(
            cluster = %cfg.cluster_name,
            opencost = %cfg.opencost_url,
            kubeconfig = cfg.kubeconfig_ref.as_deref().unwrap_or("in-cluster"),
            "[collectors] collecting Kubernetes costs"
        );

        let url = format!("{}/allocation", cfg.opencost_url.trim_end_matches('/'));
        let range = format!("{},{}", rfc3339(window.start)?, rfc3339(window.end)?);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("window", range.as_str()),
                ("aggregate", "namespace"),
                ("accumulate", "true"),
            ])
            .send()
            .await
            .map_err(|e| CollectError::Upstream(format!("opencost allocation request: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollectError::Upstream(format!(
                "opencost returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: AllocationResponse = resp
            .json()
            .await
            .map_err(|e| CollectError::Decode(format!("decode allocation response: {}", e)))?;
        Ok(normalize(source, &cfg.cluster_name, window, parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use costwatch_devkit::cost_source;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use time::macros::datetime;

    type Seen = Arc<Mutex<Vec<BTreeMap<String, String>>>>;

    /// OpenCost local : répond `status` / `body` et garde les query reçues
    async fn opencost_stub(status: StatusCode, body: serde_json::Value) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/allocation",
                get(
                    move |State(seen): State<Seen>, Query(q): Query<BTreeMap<String, String>>| {
                        let body = body.clone();
                        async move {
                            seen.lock().push(q);
                            (status, Json(body))
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}", addr), seen)
    }

    fn k8s_source(opencost_url: &str) -> CostSource {
        let mut source = cost_source("src-k8s", "proj-1", CostSourceType::Kubernetes);
        source.config = serde_json::json!({"clusterName": "prod", "opencostUrl": opencost_url});
        source
    }

    #[tokio::test]
    async fn test_collect_queries_namespace_allocation_for_window() {
        let body = serde_json::json!({
            "code": 200,
            "data": [{"team-a": {"cpuCost": 3.0, "totalCost": 4.5}}]
        });
        let (url, seen) = opencost_stub(StatusCode::OK, body).await;
        let window = TimeWindow {
            start: datetime!(2026-04-01 00:00 UTC),
            end: datetime!(2026-04-01 00:05 UTC),
        };

        let collector = KubernetesCollector::new().unwrap();
        // la barre finale est retirée avant d'ajouter /allocation
        let records = collector.collect(&k8s_source(&format!("{}/", url)), window).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_id, "prod/team-a");
        assert_eq!(records[0].list_cost, 4.5);

        let queries = seen.lock().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0]["window"], "2026-04-01T00:00:00Z,2026-04-01T00:05:00Z");
        assert_eq!(queries[0]["aggregate"], "namespace");
        assert_eq!(queries[0]["accumulate"], "true");
    }

    #[tokio::test]
    async fn test_collect_maps_non_success_status_to_upstream() {
        let body = serde_json::json!({"error": "warming up"});
        let (url, _) = opencost_stub(StatusCode::SERVICE_UNAVAILABLE, body).await;
        let window = TimeWindow::since(None, OffsetDateTime::now_utc());

        let collector = KubernetesCollector::new().unwrap();
        let err = collector.collect(&k8s_source(&url), window).await.unwrap_err();
        match err {
            CollectError::Upstream(msg) => {
                assert!(msg.contains("503"), "{}", msg);
                assert!(msg.contains("warming up"), "{}", msg);
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collect_reports_unreachable_opencost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let collector = KubernetesCollector::new().unwrap();
        let window = TimeWindow::since(None, OffsetDateTime::now_utc());
        let err = collector.collect(&k8s_source(&url), window).await.unwrap_err();
        assert!(matches!(err, CollectError::Upstream(ref m) if m.contains("allocation request")));
    }

    #[test]
    fn test_validate_requires_cluster_and_url() {
        let ok = serde_json::json!({"clusterName": "prod", "opencostUrl": "http://opencost:9003"});
        assert!(KubernetesConfig::parse(&ok).is_ok());

        let err =
            KubernetesConfig::parse(&serde_json::json!({"opencostUrl": "http://x"})).unwrap_err();
        assert!(err.to_string().contains("clusterName is required"));

        let err = KubernetesConfig::parse(&serde_json::json!({"clusterName": "prod"})).unwrap_err();
        assert!(err.to_string().contains("opencostUrl is required"));

        assert!(KubernetesConfig::parse(&serde_json::json!("not an object")).is_err());
    }

    #[test]
    fn test_normalize_one_record_per_namespace() {
        let body = r#"{
            "code": 200,
            "data": [{
                "kube-system": {
                    "name": "kube-system", "cpuCost": 1.0, "ramCost": 0.5, "totalCost": 1.5
                },
                "team-a": {
                    "name": "team-a", "cpuCost": 10.0, "ramCost": 2.0, "gpuCost": 0.0,
                    "totalCost": 12.0
                }
            }]
        }"#;
        let response: AllocationResponse = serde_json::from_str(body).unwrap();
        let source = cost_source("src-k8s", "proj-1", CostSourceType::Kubernetes);
        let window = TimeWindow {
            start: datetime!(2026-04-01 00:00 UTC),
            end: datetime!(2026-04-01 00:05 UTC),
        };

        let records = normalize(&source, "prod", window, response);
        assert_eq!(records.len(), 2);

        let team = &records[1];
        assert_eq!(team.project_id, "proj-1");
        assert_eq!(team.cost_source_id, "src-k8s");
        assert_eq!(team.provider, "kubernetes");
        assert_eq!(team.provider_id, "prod/team-a");
        assert_eq!(team.service, "Kubernetes/team-a");
        assert_eq!(team.category, "Compute");
        assert_eq!(team.list_cost, 12.0);
        assert_eq!(team.currency, "USD");
        assert_eq!(team.labels["namespace"], "team-a");
        assert_eq!(team.labels["cluster"], "prod");
        assert_eq!(team.start_time, window.start);
        assert_eq!(team.end_time, window.end);
        assert!(team.validate().is_ok());
    }

    #[test]
    fn test_normalize_skips_null_sets() {
        let response: AllocationResponse =
            serde_json::from_str(r#"{"code":200,"data":[null]}"#).unwrap();
        let source = cost_source("s", "p", CostSourceType::Kubernetes);
        let window = TimeWindow::since(None, OffsetDateTime::now_utc());
        assert!(normalize(&source, "prod", window, response).is_empty());
    }
}
