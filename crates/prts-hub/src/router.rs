use crate::clock::Clock;
use crate::hub::{BindOutcome, Hub, HubEvent};
use crate::sync::RuleSync;
use prts_core::wire::decode_envelope;
use prts_core::{Envelope, FrameError, NodeCommand, NodeLiveness, NodeStatus, Notification};
use prts_storage::{FleetStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_RESYNC_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("node not connected: {0}")]
    NotConnected(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Turns inbound envelopes into node state changes and the events viewers see.
pub struct MessageRouter {
    hub: Arc<Hub>,
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    rules: Arc<RuleSync>,
    resync_delay: Duration,
    max_frame_bytes: usize,
}

impl MessageRouter {
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        rules: Arc<RuleSync>,
        resync_delay: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            hub,
            store,
            clock,
            rules,
            resync_delay,
            max_frame_bytes,
        }
    }

    /// Decodes one inbound frame. Malformed and unknown envelopes are dropped.
    pub async fn handle_frame(&self, conn_id: &str, data: &[u8]) {
        match decode_envelope(data, self.max_frame_bytes) {
            Ok(envelope) => self.handle_envelope(conn_id, envelope).await,
            Err(FrameError::UnknownTag(tag)) => {
                debug!(event = "unknown_message", conn_id = %conn_id, r#type = %tag);
            }
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
            }
        }
    }

    pub async fn handle_envelope(&self, conn_id: &str, envelope: Envelope) {
        match envelope {
            Envelope::NodeReport(node) => self.handle_report(conn_id, node, false).await,
            Envelope::SyncComplete(node) => self.handle_report(conn_id, node, true).await,
            other => {
                debug!(event = "message_ignored", conn_id = %conn_id, r#type = %other.kind());
            }
        }
    }

    async fn handle_report(&self, conn_id: &str, mut node: NodeStatus, sync_complete: bool) {
        if node.id.trim().is_empty() {
            warn!(event = "report_without_id", conn_id = %conn_id);
            return;
        }
        node.status = NodeLiveness::Online;

        let binding = self.hub.bind_node(&node.id, conn_id).await;
        if binding == BindOutcome::Gone {
            debug!(event = "report_after_close", conn_id = %conn_id, node_id = %node.id);
            return;
        }

        let was_online = match self.store.get_node(&node.id) {
            Ok(previous) => previous.is_some_and(|previous| previous.is_online()),
            Err(err) => {
                warn!(event = "node_load_error", node_id = %node.id, error = %err);
                return;
            }
        };
        if let Err(err) = self.store.upsert_node(&node) {
            warn!(event = "node_store_error", node_id = %node.id, error = %err);
            return;
        }

        debug!(
            event = "node_report",
            node_id = %node.id,
            conn_id = %conn_id,
            sync_complete,
            load = node.load
        );

        let notification = (!was_online).then(|| Notification::node_online(&node, self.clock.now()));
        let node_id = node.id.clone();
        let update = if sync_complete {
            Envelope::NodeSyncComplete(node)
        } else {
            Envelope::NodeUpdate(node)
        };
        self.hub.broadcast(&update).await;

        if let Some(notification) = notification {
            info!(event = "node_online", node_id = %node_id);
            self.publish_notification(notification).await;
        }

        if matches!(binding, BindOutcome::New | BindOutcome::Takeover { .. }) {
            self.rules.publish_to_node(&node_id).await;
        }
    }

    /// Marks a node offline after its connection was lost without a takeover.
    ///
    /// A report that binds the node while the store write is in flight wins: the
    /// record is put back online and nothing is announced.
    pub async fn handle_disconnect(&self, node_id: &str) {
        if self.hub.node_connection(node_id).await.is_some() {
            debug!(event = "disconnect_superseded", node_id = %node_id);
            return;
        }
        let node = match self.store.mark_node_offline(node_id) {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(event = "disconnect_unknown_node", node_id = %node_id);
                return;
            }
            Err(err) => {
                warn!(event = "node_store_error", node_id = %node_id, error = %err);
                return;
            }
        };
        if self.hub.node_connection(node_id).await.is_some() {
            debug!(event = "disconnect_superseded", node_id = %node_id, restored = true);
            let node = NodeStatus {
                status: NodeLiveness::Online,
                ..node
            };
            if let Err(err) = self.store.upsert_node(&node) {
                warn!(event = "node_store_error", node_id = %node_id, error = %err);
            }
            return;
        }
        info!(event = "node_offline", node_id = %node_id);

        let notification = Notification::node_offline(&node, self.clock.now());
        self.hub.broadcast(&Envelope::NodeUpdate(node)).await;
        self.publish_notification(notification).await;
    }

    /// Routes an operator command to the node's current connection.
    pub async fn handle_command(
        self: &Arc<Self>,
        node_id: &str,
        command: NodeCommand,
    ) -> Result<(), RouterError> {
        if !self
            .hub
            .send_to_node(node_id, Envelope::Command(command))
            .await
        {
            return Err(RouterError::NotConnected(node_id.to_string()));
        }
        info!(event = "command_sent", node_id = %node_id, command = %command);

        if command == NodeCommand::EnableFirewall {
            let router = Arc::clone(self);
            let node_id = node_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(router.resync_delay).await;
                router.rules.publish_to_node(&node_id).await;
            });
        }
        Ok(())
    }

    /// Consumes hub events until the hub goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            if let Some(node_id) = Self::lost_node(event) {
                self.handle_disconnect(&node_id).await;
            }
        }
    }

    /// The node whose last connection went away, if the event carries one.
    fn lost_node(event: HubEvent) -> Option<String> {
        match event {
            HubEvent::Closed { node_id, .. } => node_id,
            HubEvent::Released { node_id, .. } => Some(node_id),
        }
    }

    async fn publish_notification(&self, notification: Notification) {
        if let Err(err) = self.store.insert_notification(&notification) {
            warn!(event = "notification_store_error", id = %notification.id, error = %err);
        }
        self.hub.broadcast(&Envelope::NewMessage(notification)).await;
    }
}
