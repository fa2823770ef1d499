use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound half of a client connection; frames are serialized JSON text
pub type ClientTx = mpsc::Sender<String>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Server-assigned identity of one live client socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First live subscriber for the topic; the broker must be asked to subscribe
    FirstInterest,
    Added,
    AlreadySubscribed,
    UnknownConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Last live subscriber left; the broker subscription is no longer needed
    LastInterest,
    Removed,
    NotSubscribed,
}

/// Client connection information
struct ClientEntry {
    tx: ClientTx,
    topics: HashSet<String>,
}

/// Registry for managing client connections and their subscriptions.
///
/// `interest` is the reverse index of `clients`: a topic is present exactly while at
/// least one live connection is subscribed to it, and the size of its set is the
/// topic's reference count.
#[derive(Default)]
pub struct SubscriptionRegistry {
    clients: HashMap<ConnectionId, ClientEntry>,
    interest: HashMap<String, HashSet<ConnectionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client connection with an empty subscription set.
    ///
    /// Returns `false` without touching the existing entry if `id` is already registered.
    pub fn on_connect(&mut self, id: ConnectionId, tx: ClientTx) -> bool {
        if self.clients.contains_key(&id) {
            warn!("Client {} already registered", id);
            return false;
        }

        self.clients.insert(
            id,
            ClientEntry {
                tx,
                topics: HashSet::new(),
            },
        );
        info!("Client {} registered in registry", id);
        true
    }

    /// Remove a client and every topic membership it held.
    ///
    /// Returns the topics nobody is subscribed to anymore. Unknown ids are a no-op.
    pub fn on_disconnect(&mut self, id: ConnectionId) -> Vec<String> {
        let Some(entry) = self.clients.remove(&id) else {
            debug!("Client {} already absent from registry", id);
            return Vec::new();
        };

        let mut idle = Vec::new();
        for topic in entry.topics {
            if self.release_interest(&topic, id) {
                idle.push(topic);
            }
        }

        info!(
            "Client {} unregistered from registry ({} topic(s) now idle)",
            id,
            idle.len()
        );
        idle
    }

    pub fn subscribe(&mut self, id: ConnectionId, topic: &str) -> SubscribeOutcome {
        let Some(client) = self.clients.get_mut(&id) else {
            warn!("Attempted to subscribe unknown client {} to '{}'", id, topic);
            return SubscribeOutcome::UnknownConnection;
        };

        if !client.topics.insert(topic.to_string()) {
            debug!("Client {} already subscribed to '{}'", id, topic);
            return SubscribeOutcome::AlreadySubscribed;
        }

        let subscribers = self.interest.entry(topic.to_string()).or_default();
        subscribers.insert(id);
        info!("Client {} subscribed to '{}'", id, topic);

        if subscribers.len() == 1 {
            SubscribeOutcome::FirstInterest
        } else {
            SubscribeOutcome::Added
        }
    }

    pub fn unsubscribe(&mut self, id: ConnectionId, topic: &str) -> UnsubscribeOutcome {
        let removed = self
            .clients
            .get_mut(&id)
            .is_some_and(|client| client.topics.remove(topic));
        if !removed {
            return UnsubscribeOutcome::NotSubscribed;
        }

        info!("Client {} unsubscribed from '{}'", id, topic);
        if self.release_interest(topic, id) {
            UnsubscribeOutcome::LastInterest
        } else {
            UnsubscribeOutcome::Removed
        }
    }

    /// Every live connection subscribed to exactly `topic`, in no particular order
    pub fn matching<'a>(
        &'a self,
        topic: &str,
    ) -> impl Iterator<Item = (ConnectionId, &'a ClientTx)> + 'a {
        self.interest
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.clients.get(id).map(|client| (*id, &client.tx)))
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn is_subscribed(&self, id: ConnectionId, topic: &str) -> bool {
        self.clients
            .get(&id)
            .is_some_and(|client| client.topics.contains(topic))
    }

    pub fn subscription_count(&self, id: ConnectionId) -> Option<usize> {
        self.clients.get(&id).map(|client| client.topics.len())
    }

    /// Number of live connections subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.interest.get(topic).map_or(0, HashSet::len)
    }

    /// All topics with at least one live subscriber
    pub fn interested_topics(&self) -> impl Iterator<Item = &str> {
        self.interest.keys().map(String::as_str)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn topic_count(&self) -> usize {
        self.interest.len()
    }

    /// Drop `id` from the topic's interest set; true when that emptied it
    fn release_interest(&mut self, topic: &str, id: ConnectionId) -> bool {
        let Some(subscribers) = self.interest.get_mut(topic) else {
            return false;
        };
        subscribers.remove(&id);
        if subscribers.is_empty() {
            self.interest.remove(topic);
            true
        } else {
            false
        }
    }
}
