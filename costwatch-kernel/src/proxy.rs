/**
 * PROXY OPENCOST - Relais des API d'allocation et d'actifs
 *
 * RÔLE :
 * Transmet les requêtes du dashboard vers OpenCost sans les interpréter
 * (query string, statut, en-têtes et corps passent tels quels) et suit la
 * disponibilité d'OpenCost via `/healthz`.
 *
 * ROUTES (sous /api/v1) :
 * - GET /allocation  → {opencost}/allocation
 * - GET /assets      → {opencost}/assets
 * - GET /cloudcost   → {opencost}/cloudCost
 * - GET /customcost  → {opencost}/customCost/total
 *
 * OpenCost injoignable : 502 `{"error":"opencost unreachable: ..."}`.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::http::{ApiError, AppState};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// En-têtes propres à une connexion, jamais relayés
fn is_hop_by_hop(name: &HeaderName) -> bool {
    [
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::HOST,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
    .contains(name)
}

pub struct OpenCostProxy {
    base_url: String,
    http: reqwest::Client,
    healthy: AtomicBool,
}

impl OpenCostProxy {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            healthy: AtomicBool::new(false),
        })
    }

    /// Faux tant qu'aucun `/healthz` n'a répondu 200
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn check_health(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        let healthy = match self.http.get(&url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "[proxy] opencost health check failed");
                false
            }
        };
        let was = self.healthy.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            info!(healthy, opencost = %self.base_url, "[proxy] opencost availability changed");
        }
        healthy
    }

    /// Vérifie `/healthz` immédiatement puis toutes les `period`
    pub fn spawn_health_check(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let proxy = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = proxy.check_health() => {}
                        }
                    }
                }
            }
        })
    }

    pub async fn forward(
        &self,
        upstream_path: &str,
        query: Option<String>,
        headers: &HeaderMap,
    ) -> Response {
        let mut url = format!("{}{}", self.base_url, upstream_path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(&query);
        }

        let mut outgoing = HeaderMap::new();
        for (name, value) in headers.iter() {
            if !is_hop_by_hop(name) {
                outgoing.append(name.clone(), value.clone());
            }
        }

        let upstream = match self.http.get(&url).headers(outgoing).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(path = upstream_path, error = %e, "[proxy] opencost request failed");
                return ApiError::BadGateway(format!("opencost unreachable: {}", e)).into_response();
            }
        };

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!(path = upstream_path, error = %e, "[proxy] opencost response interrupted");
                return ApiError::BadGateway(format!("opencost unreachable: {}", e)).into_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let out = response.headers_mut();
        for (name, value) in upstream_headers.iter() {
            if !is_hop_by_hop(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out.insert("x-proxied-by", HeaderValue::from_static("costwatch"));
        response
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/allocation", get(proxy_allocation))
        .route("/assets", get(proxy_assets))
        .route("/cloudcost", get(proxy_cloud_cost))
        .route("/customcost", get(proxy_custom_cost))
}

async fn proxy_allocation(
    State(app): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    app.opencost.forward("/allocation", query, &headers).await
}

async fn proxy_assets(
    State(app): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    app.opencost.forward("/assets", query, &headers).await
}

async fn proxy_cloud_cost(
    State(app): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    app.opencost.forward("/cloudCost", query, &headers).await
}

async fn proxy_custom_cost(
    State(app): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    app.opencost.forward("/customCost/total", query, &headers).await
}
