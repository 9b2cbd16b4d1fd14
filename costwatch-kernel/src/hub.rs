/**
 * EVENT HUB - Pub/sub en mémoire entre producteurs et clients connectés
 *
 * RÔLE :
 * Découple les producteurs (scheduler, plugins, système) des consommateurs
 * (clients WebSocket) avec filtrage par topic et livraison non bloquante.
 *
 * FONCTIONNEMENT :
 * - Chaque client possède une file bornée, un filtre de topics et un jeton d'annulation
 * - Filtre vide = reçoit tout (filtrage opt-out)
 * - Publish sérialise une seule fois puis tente un envoi non bloquant par client
 * - File pleine : l'événement est perdu pour ce client uniquement
 *
 * GARANTIES : au plus une fois par client, FIFO par client, aucun ordre entre clients.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use costwatch_sdk::Event;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CLIENT_BUFFER: usize = 256;

type TopicSet = Arc<RwLock<HashSet<String>>>;

struct ClientEntry {
    topics: TopicSet,
    sender: mpsc::Sender<Arc<str>>,
    token: CancellationToken,
}

/// Côté consommateur d'un abonnement : file de messages JSON sérialisés
pub struct HubClient {
    id: Uuid,
    topics: TopicSet,
    receiver: mpsc::Receiver<Arc<str>>,
    token: CancellationToken,
}

impl HubClient {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ajoute des topics au filtre ; protégé par le verrou propre au client
    pub fn subscribe<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.topics.write();
        set.extend(topics.into_iter().map(Into::into));
        debug!(client = %self.id, topics = ?set, "[hub] subscription updated");
    }

    /// `None` une fois le client désenregistré et sa file vidée
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.receiver.try_recv().ok()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

fn matches(topics: &TopicSet, topic: &str) -> bool {
    let set = topics.read();
    set.is_empty() || set.contains(topic)
}

pub struct EventHub {
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(client_buffer: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            capacity: client_buffer.max(1),
        }
    }

    /// Enregistre un client dont la durée de vie dérive de `parent`
    pub fn register(&self, parent: &CancellationToken) -> HubClient {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let topics: TopicSet = Arc::new(RwLock::new(HashSet::new()));
        let token = parent.child_token();

        let total = {
            let mut clients = self.clients.write();
            clients.insert(
                id,
                ClientEntry { topics: topics.clone(), sender, token: token.clone() },
            );
            clients.len()
        };
        info!(client = %id, total, "[hub] client registered");

        HubClient { id, topics, receiver, token }
    }

    /// Idempotent : un client absent est ignoré silencieusement
    pub fn unregister(&self, client: &HubClient) {
        let removed = self.clients.write().remove(&client.id);
        if let Some(entry) = removed {
            entry.token.cancel();
            // entry.sender est l'unique émetteur : la file se ferme ici
            drop(entry);
            info!(client = %client.id, total = self.len(), "[hub] client unregistered");
        }
    }

    pub fn publish(&self, event: &Event) -> usize {
        self.deliver(event, true)
    }

    /// Comme `publish` mais ignore les filtres
    pub fn broadcast(&self, event: &Event) -> usize {
        self.deliver(event, false)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    fn deliver(&self, event: &Event, filtered: bool) -> usize {
        let message: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(topic = %event.topic(), error = %e, "[hub] failed to serialize event");
                return 0;
            }
        };

        let clients = self.clients.read();
        let mut delivered = 0;
        for (id, entry) in clients.iter() {
            if filtered && !matches(&entry.topics, event.topic()) {
                continue;
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        client = %id,
                        topic = %event.topic(),
                        "[hub] client queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "[hub] client receiver gone");
                }
            }
        }
        delivered
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costwatch_devkit::EventBuilder;

    fn event(topic: &str) -> Event {
        EventBuilder::new(topic).field("n", 1).build()
    }

    #[test]
    fn test_empty_filter_receives_everything() {
        let hub = EventHub::new(8);
        let root = CancellationToken::new();
        let mut client = hub.register(&root);

        assert_eq!(hub.publish(&event("cost.allocation")), 1);
        assert_eq!(hub.publish(&event("budget.warning")), 1);
        assert!(client.try_recv().unwrap().contains(r#""topic":"cost.allocation""#));
        assert!(client.try_recv().unwrap().contains(r#""topic":"budget.warning""#));
    }

    #[test]
    fn test_topic_filtering_is_exact_match() {
        let hub = EventHub::new(8);
        let root = CancellationToken::new();
        let mut budgets = hub.register(&root);
        budgets.subscribe(["budget.warning"]);
        let mut everything = hub.register(&root);

        assert_eq!(hub.publish(&event("budget.warning")), 2);
        assert_eq!(hub.publish(&event("budget")), 1);
        assert_eq!(hub.publish(&event("budget.warning.extra")), 1);

        assert!(budgets.try_recv().is_some());
        assert!(budgets.try_recv().is_none());
        for _ in 0..3 {
            assert!(everything.try_recv().is_some());
        }
    }

    #[test]
    fn test_broadcast_ignores_filters() {
        let hub = EventHub::new(8);
        let root = CancellationToken::new();
        let mut client = hub.register(&root);
        client.subscribe(["budget.exceeded"]);

        assert_eq!(hub.publish(&event("system")), 0);
        assert_eq!(hub.broadcast(&event("system")), 1);
        assert!(client.try_recv().unwrap().contains(r#""topic":"system""#));
    }

    #[test]
    fn test_full_queue_drops_without_blocking_others() {
        let hub = EventHub::new(2);
        let root = CancellationToken::new();
        let mut slow = hub.register(&root);
        let mut fast = hub.register(&root);

        for i in 0..5 {
            let event = EventBuilder::new("cost.allocation").field("i", i).build();
            let delivered = hub.publish(&event);
            assert!(delivered >= 1);
            // le consommateur rapide vide sa file à chaque publication
            assert!(fast.try_recv().unwrap().contains(&format!(r#""i":{}"#, i)));
        }

        // FIFO préservé pour les événements acceptés
        assert!(slow.try_recv().unwrap().contains(r#""i":0"#));
        assert!(slow.try_recv().unwrap().contains(r#""i":1"#));
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let hub = EventHub::new(4);
        let root = CancellationToken::new();
        let mut client = hub.register(&root);
        let _other = hub.register(&root);
        assert_eq!(hub.len(), 2);

        hub.unregister(&client);
        hub.unregister(&client);
        assert_eq!(hub.len(), 1);
        assert!(client.token().is_cancelled());
        assert!(client.recv().await.is_none());
        assert_eq!(hub.publish(&event("system")), 1);
    }

    #[test]
    fn test_parent_cancellation_reaches_clients() {
        let hub = EventHub::new(4);
        let root = CancellationToken::new();
        let client = hub.register(&root);
        root.cancel();
        assert!(client.token().is_cancelled());
    }
}
