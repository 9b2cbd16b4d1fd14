/*!
Plugin simulé pour tester le Plugin Manager sans plugin réel

Enregistre tous les appels reçus, renvoie des réponses programmées par action
et permet d'injecter des événements dans le pont du kernel.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use costwatch_sdk::plugin::{
    EventChannel, ExecuteRequest, ExecuteResponse, InitRequest, Metadata, Plugin, PluginError,
    Route,
};
use costwatch_sdk::Event;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Initialize { config: Vec<u8>, external_service_url: String },
    Execute { action: String, params: HashMap<String, String> },
    StreamEvents,
    Shutdown,
}

/// Mock de la capacité `Plugin`
#[derive(Clone)]
pub struct MockPlugin {
    metadata: Metadata,
    fail_init: Option<String>,
    fail_shutdown: Option<String>,
    fail_execute: Option<String>,
    execute_delay: Option<Duration>,
    no_stream: bool,
    responses: Arc<Mutex<HashMap<String, ExecuteResponse>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    events: Arc<EventChannel>,
}

impl MockPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metadata: Metadata {
                description: format!("Mock plugin {}", name),
                name,
                version: "0.0.1".to_string(),
                plugin_type: "cost".to_string(),
                topics: Vec::new(),
                routes: Vec::new(),
            },
            fail_init: None,
            fail_shutdown: None,
            fail_execute: None,
            execute_delay: None,
            no_stream: false,
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(EventChannel::default()),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.metadata.topics.push(topic.into());
        self
    }

    pub fn with_route(mut self, method: &str, path: &str) -> Self {
        self.metadata.routes.push(Route {
            method: method.to_string(),
            path: path.to_string(),
            description: format!("mock {} {}", method, path),
        });
        self
    }

    /// `initialize()` échouera avec ce message
    pub fn failing_init(mut self, reason: impl Into<String>) -> Self {
        self.fail_init = Some(reason.into());
        self
    }

    pub fn failing_shutdown(mut self, reason: impl Into<String>) -> Self {
        self.fail_shutdown = Some(reason.into());
        self
    }

    /// `execute()` renverra une erreur
    pub fn failing_execute(mut self, reason: impl Into<String>) -> Self {
        self.fail_execute = Some(reason.into());
        self
    }

    /// `execute()` attend `delay` avant de répondre
    pub fn slow_execute(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// `stream_events()` renverra `None`
    pub fn without_stream(mut self) -> Self {
        self.no_stream = true;
        self
    }

    /// Programme la réponse renvoyée pour une action
    pub fn respond(&self, action: &str, response: ExecuteResponse) {
        self.responses.lock().insert(action.to_string(), response);
    }

    /// Pousse un événement comme le ferait la boucle interne d'un plugin
    pub fn emit(&self, event: Event) -> bool {
        self.events.emit(event)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| matches(c)).count()
    }

    pub fn is_stream_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn metadata(&self) -> Result<Metadata, PluginError> {
        Ok(self.metadata.clone())
    }

    async fn initialize(
        &self,
        _token: CancellationToken,
        req: InitRequest,
    ) -> Result<(), PluginError> {
        self.calls.lock().push(MockCall::Initialize {
            config: req.config,
            external_service_url: req.external_service_url,
        });
        if let Some(reason) = &self.fail_init {
            return Err(PluginError::Initialize(reason.clone()));
        }
        tracing::debug!("[mock] {} initialized", self.metadata.name);
        Ok(())
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse, PluginError> {
        let action = req.action.clone();
        self.calls.lock().push(MockCall::Execute {
            action: req.action,
            params: req.params,
        });

        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.fail_execute {
            return Err(PluginError::Execute(reason.clone()));
        }

        match self.responses.lock().get(&action) {
            Some(response) => Ok(response.clone()),
            None => ExecuteResponse::json(&serde_json::json!({
                "plugin": self.metadata.name,
                "action": action,
            })),
        }
    }

    async fn stream_events(
        &self,
        _token: CancellationToken,
    ) -> Result<Option<mpsc::Receiver<Event>>, PluginError> {
        self.calls.lock().push(MockCall::StreamEvents);
        if self.no_stream {
            return Ok(None);
        }
        Ok(self.events.take_receiver())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.calls.lock().push(MockCall::Shutdown);
        self.events.close();
        match &self.fail_shutdown {
            Some(reason) => Err(PluginError::Shutdown(reason.clone())),
            None => Ok(()),
        }
    }
}
