//! Fixtures du modèle de coûts pour les tests du kernel et des collecteurs.

use costwatch_sdk::models::{CostRecord, CostSource, CostSourceType};
use time::{Duration, OffsetDateTime};

/// Source activée, jamais collectée
pub fn cost_source(id: &str, project_id: &str, source_type: CostSourceType) -> CostSource {
    let now = OffsetDateTime::now_utc();
    CostSource {
        id: id.to_string(),
        project_id: project_id.to_string(),
        source_type,
        name: format!("{} source {}", source_type, id),
        config: serde_json::json!({}),
        enabled: true,
        last_collected_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Enregistrement d'une heure terminant maintenant
pub fn cost_record(source: &CostSource, cost: f64) -> CostRecord {
    let end = OffsetDateTime::now_utc();
    let start = end - Duration::hours(1);
    let mut record = CostRecord::new(source, source.source_type.as_str(), start, end);
    record.service = "compute".to_string();
    record.list_cost = cost;
    record.net_cost = cost;
    record.amortized_cost = cost;
    record.amortized_net_cost = cost;
    record
}
