//! Enveloppe d'événement publiée sur l'Event Hub.
//!
//! Le payload est déjà sérialisé (JSON brut) : le hub ne l'interprète jamais,
//! il l'intègre tel quel dans le message WebSocket.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use time::OffsetDateTime;

pub const TOPIC_COST_ALLOCATION: &str = "cost.allocation";
pub const TOPIC_COST_IDLE: &str = "cost.idle.detected";
pub const TOPIC_COST_COLLECTION: &str = "cost.collection";
pub const TOPIC_BUDGET_WARNING: &str = "budget.warning";
pub const TOPIC_BUDGET_EXCEEDED: &str = "budget.exceeded";
pub const TOPIC_CLUSTER_CHANGE: &str = "cluster.change";
pub const TOPIC_PLUGIN_STATUS: &str = "plugin.status";
pub const TOPIC_SYSTEM: &str = "system";

/// Événement immuable : type, topic, horodatage, émetteur et payload JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: String,
    topic: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    source: String,
    payload: Box<RawValue>,
}

impl Event {
    /// Sérialise `payload` et horodate l'événement maintenant (UTC)
    pub fn new<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::value::to_raw_value(payload)?;
        Ok(Self::assemble(event_type, topic, source, payload))
    }

    /// Construit un événement depuis des octets JSON déjà sérialisés.
    /// Un payload vide devient `null`.
    pub fn from_raw(
        event_type: impl Into<String>,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self, serde_json::Error> {
        let text = if payload.is_empty() {
            "null".to_string()
        } else {
            String::from_utf8(payload).map_err(<serde_json::Error as serde::de::Error>::custom)?
        };
        let payload = RawValue::from_string(text)?;
        Ok(Self::assemble(event_type, topic, source, payload))
    }

    fn assemble(
        event_type: impl Into<String>,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Box<RawValue>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            topic: topic.into(),
            timestamp: OffsetDateTime::now_utc(),
            source: source.into(),
            payload,
        }
    }

    /// Remplace l'horodatage (événements rejoués ou produits en amont)
    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    /// Désérialise le payload dans le type attendu par le consommateur
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }
}
