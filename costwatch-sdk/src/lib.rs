/*!
# Costwatch SDK - Contrats partagés entre le kernel et ses extensions

Bibliothèque commune au kernel, aux plugins compilés et aux collecteurs de coûts:
- Enveloppe d'événement typée et topics connus
- Capacité `Plugin` (métadonnées, initialisation, exécution, flux d'événements, arrêt)
- Capacité `Collector` et fenêtre de collecte
- Modèle normalisé des projets, sources et enregistrements de coûts
*/

pub mod collector;
pub mod event;
pub mod models;
pub mod plugin;

pub use collector::{CollectError, Collector, TimeWindow};
pub use event::Event;
pub use models::{CostRecord, CostSource, CostSourceType, Project, RecordError};
pub use plugin::{
    EventChannel, ExecuteRequest, ExecuteResponse, InitRequest, Metadata, Plugin, PluginError,
    Route,
};
