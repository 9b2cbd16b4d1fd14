//! Contrat des plugins compilés dans le kernel.
//!
//! Un plugin déclare ses topics et ses routes HTTP via `metadata()`, démarre
//! ses boucles internes dans `initialize()`, répond aux routes via `execute()`
//! et pousse ses événements sur le canal renvoyé par `stream_events()`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Capacité du canal d'événements d'un plugin
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// 🗂️ Identité statique d'un plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    pub description: String,
    /// "cost", "policy", "security", "governance"
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub topics: Vec<String>,
    pub routes: Vec<Route>,
}

/// Route HTTP déclarée, montée sous `/plugins/{name}{path}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub description: String,
}

impl Route {
    pub fn get(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitRequest {
    /// Configuration JSON propre au plugin (vide si absente)
    pub config: Vec<u8>,
    /// URL du service de coûts externe (OpenCost)
    pub external_service_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub action: String,
    pub params: HashMap<String, String>,
}

/// Réponse d'exécution ; `status_code == 0` et `content_type` vide prennent
/// les valeurs par défaut du dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResponse {
    pub data: Vec<u8>,
    pub content_type: String,
    pub status_code: u16,
    pub error: Option<String>,
}

impl ExecuteResponse {
    /// Réponse 200 sérialisée en JSON
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, PluginError> {
        let data = serde_json::to_vec(value).map_err(|e| PluginError::Execute(e.to_string()))?;
        Ok(Self {
            data,
            content_type: "application/json".to_string(),
            status_code: 200,
            error: None,
        })
    }

    /// Réponse d'erreur applicative rendue en `{"error": ...}`
    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Metadata unavailable: {0}")]
    Metadata(String),
    #[error("Initialization failed: {0}")]
    Initialize(String),
    #[error("Execution failed: {0}")]
    Execute(String),
    #[error("Event stream unavailable: {0}")]
    Stream(String),
    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}

/// 🔌 Capacité implémentée par chaque plugin
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Appelé une seule fois à l'enregistrement, doit rester sans effet de bord
    fn metadata(&self) -> Result<Metadata, PluginError>;

    /// Initialisation unique ; `token` borne la durée de vie des tâches internes
    async fn initialize(&self, token: CancellationToken, req: InitRequest)
        -> Result<(), PluginError>;

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, PluginError>;

    /// `None` : le plugin n'émet pas d'événements
    async fn stream_events(
        &self,
        token: CancellationToken,
    ) -> Result<Option<mpsc::Receiver<Event>>, PluginError>;

    /// Libère les ressources et ferme le canal d'événements
    async fn shutdown(&self) -> Result<(), PluginError>;
}

/// Canal d'événements privé d'un plugin.
///
/// L'émission ne bloque jamais : un canal plein perd l'événement. `close()`
/// lâche l'unique émetteur, ce qui termine le pont côté kernel.
pub struct EventChannel {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// Retourne `false` si l'événement a été perdu (canal plein ou fermé)
    pub fn emit(&self, event: Event) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Le récepteur ne peut être pris qu'une fois
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.receiver.lock().take()
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
