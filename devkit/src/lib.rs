/*!
# Costwatch DevKit - Doubles de test pour plugins et collecteurs

Bibliothèque facilitant le test du kernel et des extensions Costwatch avec:
- Plugin simulé (réponses programmées, échec d'initialisation, émission d'événements)
- Collecteur simulé (résultats scriptés, fenêtres enregistrées)
- Constructeur d'événements et fixtures du modèle de coûts
*/

pub mod event_builder;
pub mod fixtures;
pub mod mock_collector;
pub mod mock_plugin;

pub use event_builder::EventBuilder;
pub use fixtures::{cost_record, cost_source};
pub use mock_collector::MockCollector;
pub use mock_plugin::{MockCall, MockPlugin};
