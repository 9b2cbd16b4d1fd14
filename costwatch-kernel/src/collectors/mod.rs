/**
 * COLLECTOR REGISTRY - Catalogue des collecteurs par type de source
 *
 * RÔLE :
 * Associe chaque type de source (aws_account, azure_subscription, gcp_project,
 * kubernetes, plugin) au collecteur qui sait en extraire les coûts.
 *
 * FONCTIONNEMENT :
 * - Un collecteur par type, le dernier enregistré remplace le précédent
 * - Le scheduler consulte le registre à chaque collecte
 * - L'API valide la configuration d'une source via le collecteur de son type
 */

pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;

use costwatch_sdk::collector::Collector;
use costwatch_sdk::models::CostSourceType;
use parking_lot::RwLock;
use tracing::{info, warn};

pub use kubernetes::KubernetesCollector;

#[derive(Default)]
pub struct CollectorRegistry {
    collectors: RwLock<HashMap<CostSourceType, Arc<dyn Collector>>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre `collector` sous son propre type de source
    pub fn register(&self, collector: Arc<dyn Collector>) {
        let source_type = collector.source_type();
        if self.collectors.write().insert(source_type, collector).is_some() {
            warn!(source_type = %source_type, "[collectors] collector replaced");
        } else {
            info!(source_type = %source_type, "[collectors] collector registered");
        }
    }

    pub fn get(&self, source_type: CostSourceType) -> Option<Arc<dyn Collector>> {
        self.collectors.read().get(&source_type).cloned()
    }

    /// Types couverts, triés
    pub fn types(&self) -> Vec<CostSourceType> {
        let mut types: Vec<CostSourceType> = self.collectors.read().keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costwatch_devkit::MockCollector;

    #[test]
    fn test_last_registration_wins() {
        let registry = CollectorRegistry::new();
        registry.register(Arc::new(MockCollector::new(CostSourceType::Kubernetes)));
        registry.register(Arc::new(
            MockCollector::new(CostSourceType::Kubernetes).rejecting_config("replaced"),
        ));

        let collector = registry.get(CostSourceType::Kubernetes).unwrap();
        let err = collector.validate(&serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("replaced"));
        assert_eq!(registry.types(), vec![CostSourceType::Kubernetes]);
    }

    #[test]
    fn test_types_are_sorted() {
        let registry = CollectorRegistry::new();
        registry.register(Arc::new(MockCollector::new(CostSourceType::Plugin)));
        registry.register(Arc::new(MockCollector::new(CostSourceType::Aws)));
        registry.register(Arc::new(MockCollector::new(CostSourceType::Kubernetes)));

        assert_eq!(
            registry.types(),
            vec![CostSourceType::Aws, CostSourceType::Kubernetes, CostSourceType::Plugin]
        );
        assert!(registry.get(CostSourceType::Gcp).is_none());
    }
}
