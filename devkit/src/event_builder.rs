/*!
Construction d'événements de test

Le payload est assemblé champ par champ puis sérialisé à `build()`.
*/

use costwatch_sdk::Event;
use serde_json::{Map, Value};

pub struct EventBuilder {
    event_type: String,
    topic: String,
    source: String,
    payload: Map<String, Value>,
}

impl EventBuilder {
    /// Événement sur `topic`, type dérivé du topic
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            event_type: topic.clone(),
            topic,
            source: "devkit".to_string(),
            payload: Map::new(),
        }
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Event {
        let payload = Value::Object(self.payload);
        // Value -> RawValue ne peut pas échouer
        match Event::new(self.event_type, self.topic, self.source, &payload) {
            Ok(event) => event,
            Err(e) => panic!("devkit event serialization: {}", e),
        }
    }

    /// Alerte budgétaire telle que l'émet le plugin budgets
    pub fn budget_warning(namespace: &str, utilization: f64) -> Event {
        Self::new("budget.warning")
            .source("budgets")
            .field("namespace", namespace)
            .field("utilization", utilization)
            .field("status", "warning")
            .build()
    }
}
