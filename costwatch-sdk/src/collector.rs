//! Contrat des collecteurs de coûts (un par type de source).

use async_trait::async_trait;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::models::{CostRecord, CostSource, CostSourceType};

/// Profondeur de collecte pour une source jamais collectée
pub const DEFAULT_LOOKBACK: Duration = Duration::hours(24);

/// Fenêtre de collecte `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeWindow {
    /// Fenêtre incrémentale depuis le curseur, ou `now - 24h` sans curseur
    pub fn since(last_collected_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        Self {
            start: last_collected_at.unwrap_or(now - DEFAULT_LOOKBACK),
            end: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_type(&self) -> CostSourceType;

    /// Vérifie la configuration d'une source avant son enregistrement
    fn validate(&self, config: &serde_json::Value) -> Result<(), CollectError>;

    async fn collect(
        &self,
        source: &CostSource,
        window: TimeWindow,
    ) -> Result<Vec<CostRecord>, CollectError>;
}
