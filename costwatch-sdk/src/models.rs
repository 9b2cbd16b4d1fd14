//! Modèle de données normalisé : projets, sources de coûts, enregistrements.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fournisseur d'une source de coûts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CostSourceType {
    #[serde(rename = "aws_account")]
    Aws,
    #[serde(rename = "azure_subscription")]
    Azure,
    #[serde(rename = "gcp_project")]
    Gcp,
    #[serde(rename = "kubernetes")]
    Kubernetes,
    #[serde(rename = "plugin")]
    Plugin,
}

impl CostSourceType {
    /// Fournisseurs cloud (cadence lente)
    pub const CSP: [CostSourceType; 3] = [Self::Aws, Self::Azure, Self::Gcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws_account",
            Self::Azure => "azure_subscription",
            Self::Gcp => "gcp_project",
            Self::Kubernetes => "kubernetes",
            Self::Plugin => "plugin",
        }
    }

    pub fn is_csp(&self) -> bool {
        Self::CSP.contains(self)
    }
}

impl fmt::Display for CostSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown cost source type: {0}")]
pub struct UnknownSourceType(pub String);

impl FromStr for CostSourceType {
    type Err = UnknownSourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws_account" => Ok(Self::Aws),
            "azure_subscription" => Ok(Self::Azure),
            "gcp_project" => Ok(Self::Gcp),
            "kubernetes" => Ok(Self::Kubernetes),
            "plugin" => Ok(Self::Plugin),
            other => Err(UnknownSourceType(other.to_string())),
        }
    }
}

/// Connexion configurée vers une origine de facturation, rattachée à un projet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSource {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub source_type: CostSourceType,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub enabled: bool,
    /// Curseur : borne haute de la dernière collecte réussie
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_collected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Ligne de coût indépendante du fournisseur, fenêtre `[start_time, end_time)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    #[serde(default)]
    pub id: String,
    pub project_id: String,
    pub cost_source_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_name: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub list_cost: f64,
    pub net_cost: f64,
    pub amortized_cost: f64,
    pub amortized_net_cost: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub kubernetes_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("empty or inverted window")]
    InvalidWindow,
}

impl CostRecord {
    /// Enregistrement vide couvrant la fenêtre donnée, coûts à zéro
    pub fn new(
        source: &CostSource,
        provider: impl Into<String>,
        start_time: OffsetDateTime,
        end_time: OffsetDateTime,
    ) -> Self {
        Self {
            id: String::new(),
            project_id: source.project_id.clone(),
            cost_source_id: source.id.clone(),
            provider: provider.into(),
            provider_id: String::new(),
            account_id: String::new(),
            account_name: String::new(),
            service: String::new(),
            category: String::new(),
            region: String::new(),
            availability_zone: String::new(),
            start_time,
            end_time,
            list_cost: 0.0,
            net_cost: 0.0,
            amortized_cost: 0.0,
            amortized_net_cost: 0.0,
            currency: DEFAULT_CURRENCY.to_string(),
            labels: BTreeMap::new(),
            kubernetes_percent: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.project_id.is_empty() {
            return Err(RecordError::MissingField("projectId"));
        }
        if self.cost_source_id.is_empty() {
            return Err(RecordError::MissingField("costSourceId"));
        }
        if self.provider.is_empty() {
            return Err(RecordError::MissingField("provider"));
        }
        if self.currency.is_empty() {
            return Err(RecordError::MissingField("currency"));
        }
        if self.start_time >= self.end_time {
            return Err(RecordError::InvalidWindow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn source() -> CostSource {
        CostSource {
            id: "src-1".into(),
            project_id: "proj-1".into(),
            source_type: CostSourceType::Kubernetes,
            name: "prod cluster".into(),
            config: serde_json::json!({"clusterName": "prod"}),
            enabled: true,
            last_collected_at: None,
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_source_type_names() {
        assert_eq!("aws_account".parse::<CostSourceType>().unwrap(), CostSourceType::Aws);
        assert_eq!(CostSourceType::Gcp.to_string(), "gcp_project");
        assert_eq!(
            serde_json::to_string(&CostSourceType::Azure).unwrap(),
            r#""azure_subscription""#
        );
        assert!("oracle".parse::<CostSourceType>().is_err());
        assert!(CostSourceType::Aws.is_csp());
        assert!(!CostSourceType::Kubernetes.is_csp());
    }

    #[test]
    fn test_source_without_cursor_deserializes() {
        let json = r#"{
            "id": "s", "projectId": "p", "type": "kubernetes", "name": "k8s",
            "config": {}, "enabled": false,
            "createdAt": "2026-01-01T00:00:00Z", "updatedAt": "2026-01-01T00:00:00Z"
        }"#;
        let src: CostSource = serde_json::from_str(json).unwrap();
        assert!(src.last_collected_at.is_none());
        assert!(!src.enabled);
    }

    #[test]
    fn test_record_validation() {
        let start = datetime!(2026-03-01 00:00 UTC);
        let end = datetime!(2026-03-02 00:00 UTC);
        let mut record = CostRecord::new(&source(), "kubernetes", start, end);
        assert_eq!(record.validate(), Ok(()));

        record.currency.clear();
        assert_eq!(record.validate(), Err(RecordError::MissingField("currency")));

        let inverted = CostRecord::new(&source(), "kubernetes", end, start);
        assert_eq!(inverted.validate(), Err(RecordError::InvalidWindow));

        let anonymous = CostRecord::new(&source(), "", start, end);
        assert_eq!(anonymous.validate(), Err(RecordError::MissingField("provider")));
    }
}
