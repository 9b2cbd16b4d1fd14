/*!
Collecteur simulé pour tester le scheduler sans API de facturation

Les résultats sont consommés dans l'ordre où ils ont été scriptés ; une fois
le script épuisé, chaque collecte renvoie une liste vide.
*/

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use costwatch_sdk::collector::{CollectError, Collector, TimeWindow};
use costwatch_sdk::models::{CostRecord, CostSource, CostSourceType};
use parking_lot::Mutex;

#[derive(Clone)]
pub struct MockCollector {
    source_type: CostSourceType,
    script: Arc<Mutex<VecDeque<Result<Vec<CostRecord>, String>>>>,
    windows: Arc<Mutex<Vec<(String, TimeWindow)>>>,
    reject_config: Option<String>,
    delay: Option<Duration>,
}

impl MockCollector {
    pub fn new(source_type: CostSourceType) -> Self {
        Self {
            source_type,
            script: Arc::new(Mutex::new(VecDeque::new())),
            windows: Arc::new(Mutex::new(Vec::new())),
            reject_config: None,
            delay: None,
        }
    }

    /// `validate()` refusera toute configuration
    pub fn rejecting_config(mut self, reason: impl Into<String>) -> Self {
        self.reject_config = Some(reason.into());
        self
    }

    /// Chaque collecte attend `delay` avant de rendre son résultat
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_records(&self, records: Vec<CostRecord>) {
        self.script.lock().push_back(Ok(records));
    }

    pub fn push_error(&self, error: impl Into<String>) {
        self.script.lock().push_back(Err(error.into()));
    }

    /// Couples (source id, fenêtre) reçus, dans l'ordre des appels
    pub fn windows(&self) -> Vec<(String, TimeWindow)> {
        self.windows.lock().clone()
    }

    pub fn collected_sources(&self) -> Vec<String> {
        self.windows.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl Collector for MockCollector {
    fn source_type(&self) -> CostSourceType {
        self.source_type
    }

    fn validate(&self, _config: &serde_json::Value) -> Result<(), CollectError> {
        match &self.reject_config {
            Some(reason) => Err(CollectError::InvalidConfig(reason.clone())),
            None => Ok(()),
        }
    }

    async fn collect(
        &self,
        source: &CostSource,
        window: TimeWindow,
    ) -> Result<Vec<CostRecord>, CollectError> {
        self.windows.lock().push((source.id.clone(), window));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().pop_front() {
            Some(Ok(records)) => Ok(records),
            Some(Err(e)) => Err(CollectError::Upstream(e)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::cost_source;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let collector = MockCollector::new(CostSourceType::Kubernetes);
        collector.push_error("opencost down");

        let source = cost_source("src", "proj", CostSourceType::Kubernetes);
        let window = TimeWindow::since(None, OffsetDateTime::now_utc());

        assert!(collector.collect(&source, window).await.is_err());
        assert!(collector.collect(&source, window).await.unwrap().is_empty());
        assert_eq!(collector.collected_sources(), vec!["src", "src"]);
    }
}
