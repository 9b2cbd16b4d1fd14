/**
 * STORE - Contrat de persistance consommé par le scheduler et l'API
 *
 * RÔLE :
 * Projets, sources de coûts (avec leur curseur `last_collected_at`) et
 * enregistrements normalisés. Le curseur est le seul état du scheduler qui
 * doit survivre à un redémarrage.
 *
 * GARANTIES :
 * - insert_cost_records est tout-ou-rien
 * - Sûr en accès concurrent (scheduler + handlers HTTP)
 */

pub mod memory;

use async_trait::async_trait;
use costwatch_sdk::models::{CostRecord, CostSource, CostSourceType, Project};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCostSource {
    #[serde(rename = "type")]
    pub source_type: CostSourceType,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn get_project(&self, id: &str) -> Result<Project, StoreError>;

    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError>;

    async fn list_cost_sources(&self, project_id: &str) -> Result<Vec<CostSource>, StoreError>;

    async fn create_cost_source(
        &self,
        project_id: &str,
        new: NewCostSource,
    ) -> Result<CostSource, StoreError>;

    /// Avance le curseur d'une source
    async fn update_cost_source_collected_at(
        &self,
        source_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Insère le lot entier ou rien ; retourne le nombre inséré
    async fn insert_cost_records(&self, records: Vec<CostRecord>) -> Result<usize, StoreError>;

    async fn list_cost_records(&self, project_id: &str) -> Result<Vec<CostRecord>, StoreError>;
}
