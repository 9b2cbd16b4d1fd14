/**
 * COLLECTION SCHEDULER - Collecte périodique et incrémentale des coûts
 *
 * RÔLE :
 * Interroge à intervalle régulier chaque source activée de chaque projet via le
 * collecteur de son type, persiste les enregistrements et publie la progression.
 *
 * FONCTIONNEMENT :
 * - Deux cadences indépendantes : fournisseurs cloud (1h) et Kubernetes (5 min)
 * - Une passe complète immédiate au démarrage
 * - Fenêtre `[last_collected_at ?? now - 24h, now)`
 * - Le curseur n'avance qu'après une collecte ET une écriture réussies
 * - Événements `collection.complete` / `collection.failed` sur `cost.collection`
 *
 * CONCURRENCE : sources traitées séquentiellement dans une passe, une même
 * source n'est jamais collectée par deux passes simultanées.
 */

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use costwatch_sdk::collector::TimeWindow;
use costwatch_sdk::event::TOPIC_COST_COLLECTION;
use costwatch_sdk::models::{CostRecord, CostSource, CostSourceType, DEFAULT_CURRENCY};
use costwatch_sdk::Event;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collectors::CollectorRegistry;
use crate::hub::EventHub;
use crate::store::Store;

pub const EVENT_COLLECTION_COMPLETE: &str = "collection.complete";
pub const EVENT_COLLECTION_FAILED: &str = "collection.failed";

const KUBERNETES_TYPES: [CostSourceType; 1] = [CostSourceType::Kubernetes];
const ALL_TYPES: [CostSourceType; 5] = [
    CostSourceType::Aws,
    CostSourceType::Azure,
    CostSourceType::Gcp,
    CostSourceType::Kubernetes,
    CostSourceType::Plugin,
];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub csp_interval: Duration,
    pub kubernetes_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            csp_interval: Duration::from_secs(3600),
            kubernetes_interval: Duration::from_secs(300),
        }
    }
}

/// Résultat de la collecte d'une source
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOutcome {
    /// Collecte et écriture réussies, curseur avancé
    Completed { records: usize },
    /// Erreur du collecteur, curseur inchangé
    CollectFailed(String),
    /// Écriture refusée par le store, curseur inchangé
    StoreFailed(String),
    /// Aucun collecteur pour ce type
    NoCollector,
    /// Déjà en cours dans une autre passe
    InFlight,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletePayload<'a> {
    source_id: &'a str,
    records: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedPayload<'a> {
    source_id: &'a str,
    error: &'a str,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<CollectorRegistry>,
    hub: Arc<EventHub>,
    config: SchedulerConfig,
    running: AtomicBool,
    /// Passe initiale terminée (sert à /readyz)
    warmed_up: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
}

enum Tick {
    Stop,
    Csp,
    Kubernetes,
    Reaped,
}

/// Libère la source à la fin de sa collecte, même en cas d'annulation
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<CollectorRegistry>,
        hub: Arc<EventHub>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            config,
            running: AtomicBool::new(false),
            warmed_up: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Boucle principale ; un second appel concurrent retourne immédiatement
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("[scheduler] already running");
            return;
        }
        info!(
            csp_interval_secs = self.config.csp_interval.as_secs(),
            kubernetes_interval_secs = self.config.kubernetes_interval.as_secs(),
            "[scheduler] started"
        );

        let mut passes = JoinSet::new();
        {
            let scheduler = self.clone();
            let token = token.clone();
            passes.spawn(async move {
                let outcomes = scheduler.collect_all(&ALL_TYPES, &token).await;
                scheduler.warmed_up.store(true, Ordering::SeqCst);
                info!(sources = outcomes.len(), "[scheduler] initial pass finished");
            });
        }

        let start = tokio::time::Instant::now();
        let csp_every = self.config.csp_interval;
        let kubernetes_every = self.config.kubernetes_interval;
        let mut csp = tokio::time::interval_at(start + csp_every, csp_every);
        let mut kubernetes = tokio::time::interval_at(start + kubernetes_every, kubernetes_every);

        loop {
            let tick = tokio::select! {
                _ = token.cancelled() => Tick::Stop,
                _ = csp.tick() => Tick::Csp,
                _ = kubernetes.tick() => Tick::Kubernetes,
                Some(_) = passes.join_next(), if !passes.is_empty() => Tick::Reaped,
            };
            match tick {
                Tick::Stop => break,
                Tick::Csp => self.spawn_pass(&mut passes, &token, "csp", &CostSourceType::CSP),
                Tick::Kubernetes => {
                    self.spawn_pass(&mut passes, &token, "kubernetes", &KUBERNETES_TYPES)
                }
                Tick::Reaped => {}
            }
        }

        // les passes en cours terminent leur source courante
        while passes.join_next().await.is_some() {}

        self.running.store(false, Ordering::SeqCst);
        info!("[scheduler] stopped");
    }

    pub fn initial_pass_done(&self) -> bool {
        self.warmed_up.load(Ordering::SeqCst)
    }

    fn spawn_pass(
        self: &Arc<Self>,
        passes: &mut JoinSet<()>,
        token: &CancellationToken,
        cadence: &'static str,
        types: &'static [CostSourceType],
    ) {
        let scheduler = self.clone();
        let token = token.clone();
        passes.spawn(async move {
            let outcomes = scheduler.collect_all(types, &token).await;
            debug!(cadence, sources = outcomes.len(), "[scheduler] pass finished");
        });
    }

    /// Une passe : toutes les sources activées dont le type est dans `types`.
    /// Une source commencée va jusqu'au bout ; `token` n'est consulté qu'entre
    /// deux sources. Retourne les résultats par source id.
    pub async fn collect_all(
        &self,
        types: &[CostSourceType],
        token: &CancellationToken,
    ) -> Vec<(String, CollectionOutcome)> {
        let projects = match self.store.list_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                error!(error = %e, "[scheduler] cannot list projects");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for project in projects {
            let sources = match self.store.list_cost_sources(&project.id).await {
                Ok(sources) => sources,
                Err(e) => {
                    error!(
                        project = %project.id,
                        error = %e,
                        "[scheduler] cannot list cost sources"
                    );
                    continue;
                }
            };

            for source in sources {
                if !source.enabled || !types.contains(&source.source_type) {
                    continue;
                }
                if token.is_cancelled() {
                    let collected = outcomes.len();
                    debug!(collected, "[scheduler] pass cancelled between sources");
                    return outcomes;
                }
                let outcome = self.collect_source(&source).await;
                outcomes.push((source.id.clone(), outcome));
            }
        }
        outcomes
    }

    /// Collecte d'une source ; les erreurs restent confinées à cette source
    pub async fn collect_source(&self, source: &CostSource) -> CollectionOutcome {
        let Some(_guard) = self.acquire(&source.id) else {
            debug!(source = %source.id, "[scheduler] collection already in flight");
            return CollectionOutcome::InFlight;
        };

        let Some(collector) = self.registry.get(source.source_type) else {
            warn!(
                source = %source.id,
                source_type = %source.source_type,
                "[scheduler] no collector registered, source skipped"
            );
            return CollectionOutcome::NoCollector;
        };

        let window = TimeWindow::since(source.last_collected_at, OffsetDateTime::now_utc());
        debug!(
            source = %source.id,
            start = %window.start,
            end = %window.end,
            "[scheduler] collecting"
        );

        let records = match collector.collect(source, window).await {
            Ok(records) => records,
            Err(e) => {
                let message = e.to_string();
                warn!(source = %source.id, error = %message, "[scheduler] collection failed");
                self.publish(
                    source,
                    EVENT_COLLECTION_FAILED,
                    &FailedPayload { source_id: &source.id, error: &message },
                );
                return CollectionOutcome::CollectFailed(message);
            }
        };

        let records = normalize_records(source, records);
        let count = records.len();
        if count > 0 {
            if let Err(e) = self.store.insert_cost_records(records).await {
                error!(source = %source.id, error = %e, "[scheduler] failed to store cost records");
                return CollectionOutcome::StoreFailed(e.to_string());
            }
        }

        if let Err(e) = self.store.update_cost_source_collected_at(&source.id, window.end).await {
            error!(source = %source.id, error = %e, "[scheduler] failed to advance cursor");
        }

        info!(source = %source.id, records = count, "[scheduler] collection complete");
        self.publish(
            source,
            EVENT_COLLECTION_COMPLETE,
            &CompletePayload { source_id: &source.id, records: count },
        );
        CollectionOutcome::Completed { records: count }
    }

    fn acquire(&self, source_id: &str) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(source_id.to_string()) {
            return None;
        }
        Some(InFlightGuard { set: &self.in_flight, id: source_id.to_string() })
    }

    fn publish<T: Serialize>(&self, source: &CostSource, event_type: &str, payload: &T) {
        match Event::new(event_type, TOPIC_COST_COLLECTION, source.name.clone(), payload) {
            Ok(event) => {
                self.hub.publish(&event);
            }
            Err(e) => error!(error = %e, "[scheduler] cannot build {} event", event_type),
        }
    }
}

/// Complète les champs par défaut et écarte les enregistrements invalides
fn normalize_records(source: &CostSource, records: Vec<CostRecord>) -> Vec<CostRecord> {
    records
        .into_iter()
        .filter_map(|mut record| {
            if record.currency.is_empty() {
                record.currency = DEFAULT_CURRENCY.to_string();
            }
            if record.project_id.is_empty() {
                record.project_id = source.project_id.clone();
            }
            if record.cost_source_id.is_empty() {
                record.cost_source_id = source.id.clone();
            }
            match record.validate() {
                Ok(()) => Some(record),
                Err(e) => {
                    warn!(
                        source = %source.id,
                        error = %e,
                        "[scheduler] dropping invalid cost record"
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewCostSource, NewProject};
    use costwatch_devkit::{cost_record, MockCollector};
    use time::macros::datetime;

    struct Fixture {
        store: Arc<MemoryStore>,
        hub: Arc<EventHub>,
        kubernetes: MockCollector,
        aws: MockCollector,
        scheduler: Arc<Scheduler>,
        root: CancellationToken,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::in_memory());
        let hub = Arc::new(EventHub::new(64));
        let registry = Arc::new(CollectorRegistry::new());
        let kubernetes = MockCollector::new(CostSourceType::Kubernetes);
        let aws = MockCollector::new(CostSourceType::Aws);
        registry.register(Arc::new(kubernetes.clone()));
        registry.register(Arc::new(aws.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry,
            hub.clone(),
            SchedulerConfig::default(),
        ));
        Fixture { store, hub, kubernetes, aws, scheduler, root: CancellationToken::new() }
    }

    async fn add_source(
        store: &MemoryStore,
        project_id: &str,
        source_type: CostSourceType,
        enabled: bool,
    ) -> CostSource {
        let new = NewCostSource {
            source_type,
            name: format!("{}-src", source_type),
            config: serde_json::json!({}),
            enabled,
        };
        store
            .create_cost_source(project_id, new)
            .await
            .unwrap()
    }

    async fn project(store: &MemoryStore) -> String {
        store
            .create_project(NewProject { name: "platform".into(), description: String::new() })
            .await
            .unwrap()
            .id
    }

    fn assert_close(a: OffsetDateTime, b: OffsetDateTime) {
        assert!((a - b).abs() < time::Duration::seconds(5), "{} vs {}", a, b);
    }

    #[tokio::test]
    async fn test_first_collection_looks_back_one_day() {
        let f = fixture();
        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;

        let outcome = f.scheduler.collect_source(&source).await;
        assert_eq!(outcome, CollectionOutcome::Completed { records: 0 });

        let (_, window) = f.kubernetes.windows()[0];
        let now = OffsetDateTime::now_utc();
        assert_close(window.end, now);
        assert_close(window.start, now - time::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_success_advances_cursor_and_publishes_count() {
        let f = fixture();
        let mut client = f.hub.register(&f.root);
        client.subscribe([TOPIC_COST_COLLECTION]);

        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        let cursor = datetime!(2026-01-01 00:00 UTC);
        f.store.update_cost_source_collected_at(&source.id, cursor).await.unwrap();
        let source = f.store.list_cost_sources(&pid).await.unwrap().remove(0);

        f.kubernetes.push_records(vec![cost_record(&source, 4.0), cost_record(&source, 6.0)]);
        let outcome = f.scheduler.collect_source(&source).await;
        assert_eq!(outcome, CollectionOutcome::Completed { records: 2 });

        let (_, window) = f.kubernetes.windows()[0];
        assert_eq!(window.start, cursor);

        let updated = f.store.list_cost_sources(&pid).await.unwrap().remove(0);
        let new_cursor = updated.last_collected_at.unwrap();
        assert_ne!(new_cursor, cursor);
        assert_close(new_cursor, OffsetDateTime::now_utc());
        assert_eq!(f.store.list_cost_records(&pid).await.unwrap().len(), 2);

        let msg = client.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(json["type"], EVENT_COLLECTION_COMPLETE);
        assert_eq!(json["topic"], TOPIC_COST_COLLECTION);
        assert_eq!(json["payload"]["sourceId"], source.id.as_str());
        assert_eq!(json["payload"]["records"], 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_cursor_and_publishes_failure() {
        let f = fixture();
        let mut client = f.hub.register(&f.root);

        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Aws, true).await;
        let cursor = datetime!(2026-02-01 00:00 UTC);
        f.store.update_cost_source_collected_at(&source.id, cursor).await.unwrap();
        let source = f.store.list_cost_sources(&pid).await.unwrap().remove(0);

        f.aws.push_error("athena query timed out");
        let outcome = f.scheduler.collect_source(&source).await;
        assert!(matches!(outcome, CollectionOutcome::CollectFailed(ref m) if m.contains("athena")));

        let after = f.store.list_cost_sources(&pid).await.unwrap().remove(0);
        assert_eq!(after.last_collected_at, Some(cursor));

        let json: serde_json::Value = serde_json::from_str(&client.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], EVENT_COLLECTION_FAILED);
        assert_eq!(json["payload"]["sourceId"], source.id.as_str());
        assert!(json["payload"]["error"].as_str().unwrap().contains("athena query timed out"));

        // la passe suivante reprend la même fenêtre
        f.scheduler.collect_source(&after).await;
        assert_eq!(f.aws.windows()[1].1.start, cursor);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_cursor() {
        let f = fixture();
        let mut client = f.hub.register(&f.root);
        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;

        let mut orphan = cost_record(&source, 1.0);
        orphan.cost_source_id = "deleted-source".into();
        f.kubernetes.push_records(vec![orphan]);

        let outcome = f.scheduler.collect_source(&source).await;
        assert!(matches!(outcome, CollectionOutcome::StoreFailed(_)));
        let after = f.store.list_cost_sources(&pid).await.unwrap().remove(0);
        assert!(after.last_collected_at.is_none());
        assert!(client.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_invalid_records_are_dropped_and_defaults_applied() {
        let f = fixture();
        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;

        let mut no_currency = cost_record(&source, 3.0);
        no_currency.currency.clear();
        no_currency.project_id.clear();
        let mut inverted = cost_record(&source, 9.0);
        std::mem::swap(&mut inverted.start_time, &mut inverted.end_time);
        f.kubernetes.push_records(vec![no_currency, inverted]);

        let outcome = f.scheduler.collect_source(&source).await;
        assert_eq!(outcome, CollectionOutcome::Completed { records: 1 });
        let stored = f.store.list_cost_records(&pid).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].currency, "USD");
        assert_eq!(stored[0].project_id, pid);
    }

    #[tokio::test]
    async fn test_pass_filters_disabled_and_other_cadence() {
        let f = fixture();
        let pid = project(&f.store).await;
        let k8s = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        let _disabled = add_source(&f.store, &pid, CostSourceType::Kubernetes, false).await;
        let aws = add_source(&f.store, &pid, CostSourceType::Aws, true).await;

        let outcomes = f.scheduler.collect_all(&KUBERNETES_TYPES, &f.root).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(f.kubernetes.collected_sources(), vec![k8s.id.clone()]);
        assert!(f.aws.collected_sources().is_empty());

        f.scheduler.collect_all(&CostSourceType::CSP, &f.root).await;
        assert_eq!(f.aws.collected_sources(), vec![aws.id]);
        assert_eq!(f.kubernetes.collected_sources().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failing_source_does_not_stop_siblings() {
        let f = fixture();
        let pid = project(&f.store).await;
        let first = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        let second = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        let gcp = add_source(&f.store, &pid, CostSourceType::Gcp, true).await;
        f.kubernetes.push_error("opencost unreachable");

        let outcomes = f.scheduler.collect_all(&ALL_TYPES, &f.root).await;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0].1, CollectionOutcome::CollectFailed(_)));
        assert_eq!(outcomes[1].1, CollectionOutcome::Completed { records: 0 });
        assert_eq!(outcomes[2], (gcp.id, CollectionOutcome::NoCollector));
        assert_eq!(f.kubernetes.collected_sources(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_in_flight_source_is_not_collected_twice() {
        let f = fixture();
        let pid = project(&f.store).await;
        let source = add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;

        let guard = f.scheduler.acquire(&source.id).unwrap();
        assert_eq!(f.scheduler.collect_source(&source).await, CollectionOutcome::InFlight);
        drop(guard);
        let outcome = f.scheduler.collect_source(&source).await;
        assert_eq!(outcome, CollectionOutcome::Completed { records: 0 });
    }

    #[tokio::test]
    async fn test_cancel_mid_pass_finishes_current_source_and_skips_the_rest() {
        let store = Arc::new(MemoryStore::in_memory());
        let registry = Arc::new(CollectorRegistry::new());
        let slow =
            MockCollector::new(CostSourceType::Kubernetes).with_delay(Duration::from_millis(150));
        registry.register(Arc::new(slow.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry,
            Arc::new(EventHub::new(8)),
            SchedulerConfig::default(),
        ));
        let pid = project(&store).await;
        let first = add_source(&store, &pid, CostSourceType::Kubernetes, true).await;
        let second = add_source(&store, &pid, CostSourceType::Kubernetes, true).await;
        slow.push_records(vec![cost_record(&first, 2.5)]);

        let token = CancellationToken::new();
        let pass = {
            let (scheduler, token) = (scheduler.clone(), token.clone());
            tokio::spawn(async move { scheduler.collect_all(&KUBERNETES_TYPES, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        token.cancel();

        let outcomes = tokio::time::timeout(Duration::from_secs(2), pass).await.unwrap().unwrap();
        assert_eq!(outcomes, vec![(first.id.clone(), CollectionOutcome::Completed { records: 1 })]);
        assert_eq!(slow.collected_sources(), vec![first.id.clone()]);

        // records et curseur avancent ensemble
        assert_eq!(store.list_cost_records(&pid).await.unwrap().len(), 1);
        let sources = store.list_cost_sources(&pid).await.unwrap();
        let cursor_of = |id: &str| sources.iter().find(|s| s.id == id).unwrap().last_collected_at;
        assert!(cursor_of(&first.id).is_some());
        assert!(cursor_of(&second.id).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_token_yields_empty_pass() {
        let f = fixture();
        let pid = project(&f.store).await;
        add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        f.root.cancel();

        assert!(f.scheduler.collect_all(&ALL_TYPES, &f.root).await.is_empty());
        assert!(f.kubernetes.windows().is_empty());
    }

    #[tokio::test]
    async fn test_run_performs_initial_pass_and_stops_on_cancel() {
        let f = fixture();
        let pid = project(&f.store).await;
        add_source(&f.store, &pid, CostSourceType::Kubernetes, true).await;
        add_source(&f.store, &pid, CostSourceType::Aws, true).await;

        assert!(!f.scheduler.initial_pass_done());
        let handle = tokio::spawn(f.scheduler.clone().run(f.root.clone()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.kubernetes.windows().is_empty() || f.aws.windows().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !f.scheduler.initial_pass_done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        f.root.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
