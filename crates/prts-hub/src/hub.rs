use prts_core::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Emitted exactly once per connection, when it leaves the live set.
    /// `node_id` is set only if the connection still held that identity when it closed.
    Closed {
        conn_id: String,
        node_id: Option<String>,
    },
    /// A live connection re-bound to another identity and gave up `node_id`.
    Released { conn_id: String, node_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    New,
    Unchanged,
    Takeover { previous: String },
    /// The connection already left the live set; nothing was bound.
    Gone,
}

/// Handle returned by [`Hub::register`]; the socket task drains `outbound` and watches `closed`.
pub struct Connection {
    pub id: String,
    pub outbound: mpsc::Receiver<Envelope>,
    pub closed: watch::Receiver<bool>,
}

struct ConnectionEntry {
    sender: mpsc::Sender<Envelope>,
    close: watch::Sender<bool>,
    node_id: Option<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, ConnectionEntry>,
    nodes: HashMap<String, String>,
}

impl Registry {
    /// The only place a connection is removed from the live set.
    fn detach(&mut self, conn_id: &str) -> Option<HubEvent> {
        let entry = self.connections.remove(conn_id)?;
        entry.close.send_replace(true);
        let node_id = entry.node_id.filter(|node_id| {
            if self.nodes.get(node_id).map(String::as_str) == Some(conn_id) {
                self.nodes.remove(node_id);
                true
            } else {
                false
            }
        });
        Some(HubEvent::Closed {
            conn_id: conn_id.to_string(),
            node_id,
        })
    }
}

pub struct Hub {
    registry: RwLock<Registry>,
    conn_counter: AtomicU64,
    queue_capacity: usize,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let hub = Self {
            registry: RwLock::new(Registry::default()),
            conn_counter: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
            events,
        };
        (hub, events_rx)
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn emit(&self, events: impl IntoIterator<Item = HubEvent>) {
        for event in events {
            match &event {
                HubEvent::Closed { conn_id, node_id } => info!(
                    event = "client_disconnected",
                    conn_id = %conn_id,
                    node_id = node_id.as_deref().unwrap_or_default()
                ),
                HubEvent::Released { conn_id, node_id } => {
                    info!(event = "node_released", conn_id = %conn_id, node_id = %node_id)
                }
            }
            if self.events.send(event).is_err() {
                debug!(event = "hub_event_dropped");
            }
        }
    }

    pub async fn register(&self) -> Connection {
        let id = self.next_conn_id();
        let (sender, outbound) = mpsc::channel(self.queue_capacity);
        let (close, closed) = watch::channel(false);
        self.registry.write().await.connections.insert(
            id.clone(),
            ConnectionEntry {
                sender,
                close,
                node_id: None,
            },
        );
        info!(event = "client_connected", conn_id = %id);
        Connection {
            id,
            outbound,
            closed,
        }
    }

    /// Idempotent; a second call for the same connection does nothing.
    pub async fn unregister(&self, conn_id: &str) {
        let event = self.registry.write().await.detach(conn_id);
        self.emit(event);
    }

    pub async fn bind_node(&self, node_id: &str, conn_id: &str) -> BindOutcome {
        let mut events = Vec::new();
        let outcome = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.connections.get_mut(conn_id) else {
                return BindOutcome::Gone;
            };
            let stale_claim = entry
                .node_id
                .replace(node_id.to_string())
                .filter(|claimed| claimed != node_id);

            if let Some(claimed) = stale_claim {
                warn!(event = "node_id_changed", conn_id = %conn_id, from = %claimed, to = %node_id);
                if registry.nodes.get(&claimed).map(String::as_str) == Some(conn_id) {
                    registry.nodes.remove(&claimed);
                    events.push(HubEvent::Released {
                        conn_id: conn_id.to_string(),
                        node_id: claimed,
                    });
                }
            }

            match registry
                .nodes
                .insert(node_id.to_string(), conn_id.to_string())
            {
                None => BindOutcome::New,
                Some(previous) if previous == conn_id => BindOutcome::Unchanged,
                Some(previous) => {
                    if let Some(old) = registry.connections.get_mut(&previous) {
                        old.node_id = None;
                    }
                    events.extend(registry.detach(&previous));
                    BindOutcome::Takeover { previous }
                }
            }
        };

        if let BindOutcome::Takeover { previous } = &outcome {
            info!(event = "node_takeover", node_id = %node_id, conn_id = %conn_id, previous = %previous);
        } else if outcome == BindOutcome::New {
            info!(event = "node_bound", node_id = %node_id, conn_id = %conn_id);
        }
        self.emit(events);
        outcome
    }

    /// Enqueues on every live connection; full or closed queues are evicted.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        self.fan_out(envelope, false).await
    }

    /// Like [`Hub::broadcast`], restricted to connections bound to a node.
    pub async fn broadcast_to_nodes(&self, envelope: &Envelope) -> usize {
        self.fan_out(envelope, true).await
    }

    async fn fan_out(&self, envelope: &Envelope, bound_only: bool) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        {
            let registry = self.registry.read().await;
            for (conn_id, entry) in &registry.connections {
                if bound_only && entry.node_id.is_none() {
                    continue;
                }
                match entry.sender.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => slow.push(conn_id.clone()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "slow_consumer", conn_id = %conn_id);
                        slow.push(conn_id.clone());
                    }
                }
            }
        }
        self.evict(slow).await;
        delivered
    }

    async fn evict(&self, conn_ids: Vec<String>) {
        if conn_ids.is_empty() {
            return;
        }
        let events = {
            let mut registry = self.registry.write().await;
            conn_ids
                .iter()
                .filter_map(|conn_id| registry.detach(conn_id))
                .collect::<Vec<_>>()
        };
        self.emit(events);
    }

    /// False when the node is unbound or its queue could not take the envelope.
    pub async fn send_to_node(&self, node_id: &str, envelope: Envelope) -> bool {
        let (conn_id, result) = {
            let registry = self.registry.read().await;
            let Some(conn_id) = registry.nodes.get(node_id) else {
                return false;
            };
            let Some(entry) = registry.connections.get(conn_id) else {
                return false;
            };
            (conn_id.clone(), entry.sender.try_send(envelope))
        };

        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.evict(vec![conn_id]).await;
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = %conn_id, node_id = %node_id);
                self.evict(vec![conn_id]).await;
                false
            }
        }
    }

    /// True while the connection is the current holder of a node identity.
    pub async fn is_active(&self, conn_id: &str) -> bool {
        let registry = self.registry.read().await;
        registry
            .connections
            .get(conn_id)
            .and_then(|entry| entry.node_id.as_ref())
            .and_then(|node_id| registry.nodes.get(node_id))
            .is_some_and(|holder| holder == conn_id)
    }

    pub async fn node_connection(&self, node_id: &str) -> Option<String> {
        self.registry.read().await.nodes.get(node_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn bound_count(&self) -> usize {
        self.registry.read().await.nodes.len()
    }

    /// Signals every live connection to close; used on shutdown.
    pub async fn close_all(&self) {
        let events = {
            let mut registry = self.registry.write().await;
            let ids = registry.connections.keys().cloned().collect::<Vec<_>>();
            ids.iter()
                .filter_map(|conn_id| registry.detach(conn_id))
                .collect::<Vec<_>>()
        };
        self.emit(events);
    }
}
