/**
 * PLUGIN MANAGER - Cycle de vie des plugins compilés dans le kernel
 *
 * RÔLE :
 * Héberge les plugins derrière une capacité uniforme (métadonnées, initialisation,
 * exécution, flux d'événements, arrêt), relaie leurs événements vers l'Event Hub
 * et expose leurs routes HTTP déclarées via un dispatcher commun.
 *
 * FONCTIONNEMENT :
 * - register : métadonnées lues une seule fois et mises en cache, nom unique
 * - initialize_all : un échec n'affecte pas les autres plugins, pont d'événements par plugin
 * - mount_routes : `/plugins/{name}{path}` en GET/POST uniquement
 * - shutdown_all : annule chaque pont, attend sa fin, appelle shutdown
 *
 * CYCLE DE VIE :
 * Registered → Initializing → Initialized (ou Failed) → ShuttingDown → Shutdown
 * Initialized, Failed et Shutdown sont publiés sur le topic `plugin.status`.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Query,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::MethodRouter,
    Json, Router,
};
use costwatch_sdk::event::TOPIC_PLUGIN_STATUS;
use costwatch_sdk::plugin::{
    ExecuteRequest, ExecuteResponse, InitRequest, Metadata, Plugin, PluginError,
};
use costwatch_sdk::Event;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::EventHub;

pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// État d'un plugin dans son cycle de vie
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Enregistré, pas encore initialisé
    Registered,
    /// Initialisation en cours
    Initializing,
    /// Initialisé, pont d'événements actif
    Initialized,
    /// Initialisation refusée
    Failed(String),
    ShuttingDown,
    Shutdown,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Registered => "registered",
            PluginStatus::Initializing => "initializing",
            PluginStatus::Initialized => "initialized",
            PluginStatus::Failed(_) => "failed",
            PluginStatus::ShuttingDown => "shutting_down",
            PluginStatus::Shutdown => "shutdown",
        }
    }
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    name: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

type PendingShutdown = (
    usize,
    String,
    Arc<dyn Plugin>,
    Option<CancellationToken>,
    Option<JoinHandle<()>>,
);

/// Vue publique d'un plugin pour `GET /api/v1/plugins`
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub status: PluginStatus,
}

struct RegisteredPlugin {
    instance: Arc<dyn Plugin>,
    metadata: Metadata,
    status: PluginStatus,
    seq: usize,
    cancel: Option<CancellationToken>,
    bridge: Option<JoinHandle<()>>,
}

pub struct PluginManager {
    plugins: RwLock<HashMap<String, RegisteredPlugin>>,
    hub: Arc<EventHub>,
    configs: HashMap<String, Vec<u8>>,
    execute_timeout: Duration,
}

impl PluginManager {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            hub,
            configs: HashMap::new(),
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
        }
    }

    /// Configurations JSON transmises à `initialize`, par nom de plugin
    pub fn with_configs(mut self, configs: HashMap<String, Vec<u8>>) -> Self {
        self.configs = configs;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Enregistre un plugin ; un nom déjà présent est refusé sans modification
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let metadata = plugin.metadata()?;
        if !is_valid_plugin_name(&metadata.name) {
            return Err(PluginError::Metadata(format!(
                "invalid plugin name `{}`: expected letters, digits, '-', '_' or '.'",
                metadata.name
            )));
        }

        let mut plugins = self.plugins.write();
        if plugins.contains_key(&metadata.name) {
            return Err(PluginError::AlreadyRegistered(metadata.name));
        }

        info!(
            name = %metadata.name,
            version = %metadata.version,
            routes = metadata.routes.len(),
            "[plugins] registered"
        );
        let seq = plugins.len();
        plugins.insert(
            metadata.name.clone(),
            RegisteredPlugin {
                instance: plugin,
                metadata,
                status: PluginStatus::Registered,
                seq,
                cancel: None,
                bridge: None,
            },
        );
        Ok(())
    }

    /// Diffuse une transition d'état ; `type` vaut `plugin.<état>`
    fn publish_status(&self, name: &str, status: &PluginStatus) {
        let payload = StatusPayload {
            name,
            status: status.as_str(),
            error: match status {
                PluginStatus::Failed(e) => Some(e.as_str()),
                _ => None,
            },
        };
        let event_type = format!("plugin.{}", status.as_str());
        match Event::new(event_type, TOPIC_PLUGIN_STATUS, "kernel", &payload) {
            Ok(event) => {
                self.hub.publish(&event);
            }
            Err(e) => error!(name = %name, error = %e, "[plugins] failed to build status event"),
        }
    }

    /// Initialise chaque plugin enregistré, dans l'ordre d'enregistrement.
    /// Retourne le nombre de plugins initialisés avec succès.
    pub async fn initialize_all(
        &self,
        parent: &CancellationToken,
        external_service_url: &str,
    ) -> usize {
        let pending = self.claim(PluginStatus::Registered, PluginStatus::Initializing);
        let mut initialized = 0;

        for (name, instance) in pending {
            let token = parent.child_token();
            let req = InitRequest {
                config: self.configs.get(&name).cloned().unwrap_or_default(),
                external_service_url: external_service_url.to_string(),
            };

            match instance.initialize(token.clone(), req).await {
                Ok(()) => {
                    let bridge = tokio::spawn(run_bridge(
                        name.clone(),
                        instance.clone(),
                        self.hub.clone(),
                        token.clone(),
                    ));
                    if let Some(entry) = self.plugins.write().get_mut(&name) {
                        entry.status = PluginStatus::Initialized;
                        entry.cancel = Some(token);
                        entry.bridge = Some(bridge);
                    }
                    info!(name = %name, "[plugins] initialized");
                    self.publish_status(&name, &PluginStatus::Initialized);
                    initialized += 1;
                }
                Err(e) => {
                    error!(
                        name = %name,
                        error = %e,
                        "[plugins] initialization failed, plugin skipped"
                    );
                    let status = PluginStatus::Failed(e.to_string());
                    if let Some(entry) = self.plugins.write().get_mut(&name) {
                        entry.status = status.clone();
                    }
                    self.publish_status(&name, &status);
                }
            }
        }

        initialized
    }

    /// Arrête tous les plugins (ordre inverse d'enregistrement) ; idempotent
    pub async fn shutdown_all(&self) {
        let mut pending: Vec<PendingShutdown> = {
            let mut plugins = self.plugins.write();
            plugins
                .iter_mut()
                .filter(|(_, p)| {
                    !matches!(p.status, PluginStatus::ShuttingDown | PluginStatus::Shutdown)
                })
                .map(|(name, p)| {
                    p.status = PluginStatus::ShuttingDown;
                    (p.seq, name.clone(), p.instance.clone(), p.cancel.take(), p.bridge.take())
                })
                .collect()
        };
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        info!(count = pending.len(), "[plugins] shutting down plugins");

        for (_, name, instance, cancel, bridge) in pending {
            if let Some(token) = cancel {
                token.cancel();
            }
            if let Some(handle) = bridge {
                if let Err(e) = handle.await {
                    warn!(name = %name, error = %e, "[plugins] event bridge ended abnormally");
                }
            }
            match instance.shutdown().await {
                Ok(()) => info!(name = %name, "[plugins] stopped"),
                Err(e) => error!(name = %name, error = %e, "[plugins] shutdown failed"),
            }
            if let Some(entry) = self.plugins.write().get_mut(&name) {
                entry.status = PluginStatus::Shutdown;
            }
            self.publish_status(&name, &PluginStatus::Shutdown);
        }
    }

    /// Monte les routes déclarées sous `/plugins/{name}{path}`.
    /// Une route invalide ou en conflit est ignorée avec un warning.
    pub fn mount_routes<S>(self: &Arc<Self>, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut by_path: HashMap<String, MethodRouter<S>> = HashMap::new();
        let mut mounted = 0;

        for (metadata, instance) in self.snapshot() {
            let mut seen: HashSet<(String, String)> = HashSet::new();
            let mut captures: HashMap<String, String> = HashMap::new();

            for route in &metadata.routes {
                let method = route.method.to_ascii_uppercase();
                if method != "GET" && method != "POST" {
                    warn!(
                        name = %metadata.name,
                        method = %route.method,
                        path = %route.path,
                        "[plugins] unsupported method, route not mounted"
                    );
                    continue;
                }
                if let Err(reason) = validate_route_path(&route.path) {
                    warn!(
                        name = %metadata.name,
                        path = %route.path,
                        reason = %reason,
                        "[plugins] invalid route path, not mounted"
                    );
                    continue;
                }
                if let Err(existing) = claim_captures(&mut captures, &route.path) {
                    warn!(
                        name = %metadata.name,
                        path = %route.path,
                        existing = %existing,
                        "[plugins] capture conflicts with another route, not mounted"
                    );
                    continue;
                }

                let full_path = format!("/plugins/{}{}", metadata.name, route.path);
                if !seen.insert((method.clone(), full_path.clone())) {
                    warn!(
                        method = %method,
                        path = %full_path,
                        "[plugins] duplicate route, not mounted"
                    );
                    continue;
                }

                let plugin = instance.clone();
                let action = route.path.clone();
                let timeout = self.execute_timeout;
                let handler = move |Query(query): Query<Vec<(String, String)>>| {
                    let plugin = plugin.clone();
                    let action = action.clone();
                    async move {
                        dispatch(plugin.as_ref(), action, first_values(query), timeout).await
                    }
                };

                let entry = by_path.remove(&full_path).unwrap_or_else(MethodRouter::new);
                let entry = if method == "GET" {
                    entry.get(handler)
                } else {
                    entry.post(handler)
                };
                by_path.insert(full_path.clone(), entry);
                debug!(method = %method, path = %full_path, "[plugins] route mounted");
                mounted += 1;
            }
        }

        info!(routes = mounted, "[plugins] plugin routes mounted");
        by_path
            .into_iter()
            .fold(router, |router, (path, method_router)| router.route(&path, method_router))
    }

    /// Métadonnées en cache, triées par nom
    pub fn list_plugins(&self) -> Vec<Metadata> {
        let mut list: Vec<Metadata> =
            self.plugins.read().values().map(|p| p.metadata.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn list_plugin_info(&self) -> Vec<PluginInfo> {
        let mut list: Vec<PluginInfo> = self
            .plugins
            .read()
            .values()
            .map(|p| PluginInfo { metadata: p.metadata.clone(), status: p.status.clone() })
            .collect();
        list.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        list
    }

    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.plugins.read().get(name).map(|p| p.status.clone())
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    /// Passe de `from` à `to` sous verrou les plugins concernés
    fn claim(&self, from: PluginStatus, to: PluginStatus) -> Vec<(String, Arc<dyn Plugin>)> {
        let mut plugins = self.plugins.write();
        let mut claimed: Vec<(usize, String, Arc<dyn Plugin>)> = plugins
            .iter_mut()
            .filter(|(_, p)| p.status == from)
            .map(|(name, p)| {
                p.status = to.clone();
                (p.seq, name.clone(), p.instance.clone())
            })
            .collect();
        claimed.sort_by_key(|(seq, _, _)| *seq);
        claimed.into_iter().map(|(_, name, instance)| (name, instance)).collect()
    }

    fn snapshot(&self) -> Vec<(Metadata, Arc<dyn Plugin>)> {
        let mut list: Vec<(Metadata, Arc<dyn Plugin>)> = self
            .plugins
            .read()
            .values()
            .map(|p| (p.metadata.clone(), p.instance.clone()))
            .collect();
        list.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        list
    }
}

/// Relaie le canal d'un plugin vers le hub jusqu'à annulation ou fermeture
async fn run_bridge(
    name: String,
    plugin: Arc<dyn Plugin>,
    hub: Arc<EventHub>,
    token: CancellationToken,
) {
    let mut events = match plugin.stream_events(token.clone()).await {
        Ok(Some(rx)) => rx,
        Ok(None) => {
            debug!(name = %name, "[plugins] no event stream");
            return;
        }
        Err(e) => {
            warn!(name = %name, error = %e, "[plugins] event stream unavailable");
            return;
        }
    };

    debug!(name = %name, "[plugins] event bridge started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = events.recv() => match received {
                Some(event) => {
                    hub.publish(&event);
                }
                None => {
                    debug!(name = %name, "[plugins] event channel closed");
                    break;
                }
            }
        }
    }
    debug!(name = %name, "[plugins] event bridge stopped");
}

/// Nom de plugin utilisable comme segment statique de route
fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn capture_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
}

/// Syntaxe acceptée : segments statiques ou captures entières `{name}`
fn validate_route_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err("path must start with '/'".into());
    }
    for segment in path.split('/').skip(1) {
        if segment.starts_with(':') || segment.starts_with('*') {
            return Err(format!("segment `{}` uses an unsupported capture syntax", segment));
        }
        if segment.contains(|c| c == '{' || c == '}') {
            let valid = capture_name(segment).is_some_and(|name| {
                !name.is_empty() && !name.contains(|c| matches!(c, '{' | '}' | '*' | ':'))
            });
            if !valid {
                return Err(format!("segment `{}` is not a valid capture", segment));
            }
        }
    }
    Ok(())
}

/// Deux captures à la même position doivent porter le même nom.
/// `captures` associe le préfixe normalisé (captures en `{}`) au nom retenu ;
/// en cas de conflit rien n'est enregistré et le nom existant est retourné.
fn claim_captures(captures: &mut HashMap<String, String>, path: &str) -> Result<(), String> {
    let mut prefix = String::new();
    let mut claimed = Vec::new();
    for segment in path.split('/').skip(1) {
        match capture_name(segment) {
            Some(name) => {
                if let Some(existing) = captures.get(&prefix).filter(|existing| *existing != name) {
                    return Err(format!("{{{}}}", existing));
                }
                claimed.push((prefix.clone(), name.to_string()));
                prefix.push_str("/{}");
            }
            None => {
                prefix.push('/');
                prefix.push_str(segment);
            }
        }
    }
    captures.extend(claimed);
    Ok(())
}

/// Première valeur de chaque paramètre de requête
fn first_values(query: Vec<(String, String)>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in query {
        params.entry(key).or_insert(value);
    }
    params
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn status_or(code: u16, default: StatusCode) -> StatusCode {
    if code == 0 {
        return default;
    }
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn dispatch(
    plugin: &dyn Plugin,
    action: String,
    params: HashMap<String, String>,
    timeout: Duration,
) -> Response {
    let req = ExecuteRequest { action, params };
    match tokio::time::timeout(timeout, plugin.execute(req)).await {
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "plugin execution timed out"),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Ok(Ok(resp)) => render(resp),
    }
}

fn render(resp: ExecuteResponse) -> Response {
    if let Some(message) = resp.error.filter(|m| !m.is_empty()) {
        let status = status_or(resp.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        return error_response(status, message);
    }

    let status = status_or(resp.status_code, StatusCode::OK);
    let content_type = if resp.content_type.is_empty() {
        "application/json".to_string()
    } else {
        resp.content_type
    };
    (status, [(header::CONTENT_TYPE, content_type)], resp.data).into_response()
}
