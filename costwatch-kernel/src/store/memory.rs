//! Store en mémoire avec persistance optionnelle sur deux fichiers.
//!
//! - `<fichier>.json` : catalogue (projets, sources et leur curseur), réécrit
//!   atomiquement à chaque mutation ; une mutation refusée ou un échec
//!   d'écriture laisse l'état inchangé.
//! - `<fichier>.records.jsonl` : un enregistrement de coût par ligne, en ajout
//!   seul ; une insertion n'écrit que son propre lot.
//!
//! Les enregistrements restent tous en mémoire et sont relus en entier à
//! l'ouverture : la taille du store est bornée par la RAM disponible.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use costwatch_sdk::models::{CostRecord, CostSource, Project};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{NewCostSource, NewProject, Store, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    sources: Vec<CostSource>,
    /// Ancien format où les records vivaient dans le catalogue ; migrés à l'ouverture
    #[serde(default, skip_serializing)]
    records: Vec<CostRecord>,
}

#[derive(Default)]
struct State {
    catalog: Catalog,
    records: Vec<CostRecord>,
}

struct Files {
    catalog: PathBuf,
    records: PathBuf,
}

pub struct MemoryStore {
    data: RwLock<State>,
    files: Option<Files>,
}

/// `store.json` → `store.records.jsonl`
fn records_path(catalog: &Path) -> PathBuf {
    catalog.with_extension("records.jsonl")
}

impl MemoryStore {
    /// Store volatile, rien n'est écrit sur disque
    pub fn in_memory() -> Self {
        Self { data: RwLock::new(State::default()), files: None }
    }

    /// Charge `path` s'il existe, sinon démarre vide ; les mutations y sont écrites
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let catalog_file = path.into();
        let files = Files { records: records_path(&catalog_file), catalog: catalog_file };

        let mut catalog = load_catalog(&files.catalog).await?;
        let mut records = load_records(&files.records).await?;

        if !catalog.records.is_empty() {
            // une migration interrompue a pu déjà écrire une partie des lignes
            let loaded: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
            let legacy: Vec<CostRecord> = std::mem::take(&mut catalog.records)
                .into_iter()
                .filter(|r| r.id.is_empty() || !loaded.contains(r.id.as_str()))
                .collect();
            info!(records = legacy.len(), "[store] moving records out of the catalog file");
            append_records(&files.records, &legacy).await?;
            save_catalog(&files.catalog, &catalog).await?;
            records.extend(legacy);
        }

        info!(
            projects = catalog.projects.len(),
            sources = catalog.sources.len(),
            records = records.len(),
            file = %files.catalog.display(),
            "[store] loaded"
        );
        Ok(Self { data: RwLock::new(State { catalog, records }), files: Some(files) })
    }

    async fn mutate_catalog<T>(
        &self,
        apply: impl FnOnce(&mut Catalog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.data.write().await;
        match &self.files {
            None => apply(&mut guard.catalog),
            Some(files) => {
                let mut next = guard.catalog.clone();
                let out = apply(&mut next)?;
                save_catalog(&files.catalog, &next).await?;
                guard.catalog = next;
                Ok(out)
            }
        }
    }
}

async fn load_catalog(path: &Path) -> Result<Catalog, StoreError> {
    if !path.exists() {
        info!(file = %path.display(), "[store] no existing data file, starting fresh");
        return Ok(Catalog::default());
    }
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Catalog::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Une ligne illisible (écriture interrompue) est ignorée avec un warning
async fn load_records(path: &Path) -> Result<Vec<CostRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CostRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                file = %path.display(),
                line = n + 1,
                error = %e,
                "[store] skipping unreadable cost record"
            ),
        }
    }
    Ok(records)
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

async fn save_catalog(path: &Path, catalog: &Catalog) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let content = serde_json::to_string_pretty(catalog)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Le lot entier part en une seule écriture
async fn append_records(path: &Path, records: &[CostRecord]) -> Result<(), StoreError> {
    let mut batch = String::new();
    for record in records {
        batch.push_str(&serde_json::to_string(record)?);
        batch.push('\n');
    }
    ensure_parent(path).await?;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(batch.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.data.read().await.catalog.projects.clone())
    }

    async fn get_project(&self, id: &str) -> Result<Project, StoreError> {
        self.data
            .read()
            .await
            .catalog
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("project {}", id)))
    }

    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid("project name is required".into()));
        }
        let now = OffsetDateTime::now_utc();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        self.mutate_catalog(|data| {
            data.projects.push(project.clone());
            Ok(())
        })
        .await?;
        Ok(project)
    }

    async fn list_cost_sources(&self, project_id: &str) -> Result<Vec<CostSource>, StoreError> {
        Ok(self
            .data
            .read()
            .await
            .catalog
            .sources
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_cost_source(
        &self,
        project_id: &str,
        new: NewCostSource,
    ) -> Result<CostSource, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid("source name is required".into()));
        }
        let now = OffsetDateTime::now_utc();
        let source = CostSource {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            source_type: new.source_type,
            name: new.name,
            config: new.config,
            enabled: new.enabled,
            last_collected_at: None,
            created_at: now,
            updated_at: now,
        };
        self.mutate_catalog(|data| {
            if !data.projects.iter().any(|p| p.id == project_id) {
                return Err(StoreError::NotFound(format!("project {}", project_id)));
            }
            data.sources.push(source.clone());
            Ok(())
        })
        .await?;
        Ok(source)
    }

    async fn update_cost_source_collected_at(
        &self,
        source_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.mutate_catalog(|data| {
            let source = data
                .sources
                .iter_mut()
                .find(|s| s.id == source_id)
                .ok_or_else(|| StoreError::NotFound(format!("cost source {}", source_id)))?;
            source.last_collected_at = Some(at);
            source.updated_at = OffsetDateTime::now_utc();
            Ok(())
        })
        .await
    }

    async fn insert_cost_records(&self, records: Vec<CostRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut guard = self.data.write().await;
        {
            let known: HashSet<&str> =
                guard.catalog.sources.iter().map(|s| s.id.as_str()).collect();
            for record in &records {
                if !known.contains(record.cost_source_id.as_str()) {
                    let missing = format!("cost source {}", record.cost_source_id);
                    return Err(StoreError::NotFound(missing));
                }
                record
                    .validate()
                    .map_err(|e| StoreError::Invalid(format!("cost record: {}", e)))?;
            }
        }

        let records: Vec<CostRecord> = records
            .into_iter()
            .map(|mut r| {
                if r.id.is_empty() {
                    r.id = Uuid::new_v4().to_string();
                }
                r
            })
            .collect();
        if let Some(files) = &self.files {
            append_records(&files.records, &records).await?;
        }
        let count = records.len();
        guard.records.extend(records);
        Ok(count)
    }

    async fn list_cost_records(&self, project_id: &str) -> Result<Vec<CostRecord>, StoreError> {
        Ok(self
            .data
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }
}
