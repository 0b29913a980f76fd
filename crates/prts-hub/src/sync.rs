use crate::clock::Clock;
use crate::hub::Hub;
use prts_core::{AccessControlRule, Envelope};
use prts_storage::{FleetStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub active: Vec<AccessControlRule>,
    pub expired: usize,
}

/// Expires rules against authoritative time and pushes the surviving set to probes.
pub struct RuleSync {
    hub: Arc<Hub>,
    store: Arc<dyn FleetStore>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl RuleSync {
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn FleetStore>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            hub,
            store,
            clock,
            period,
        }
    }

    /// Flips every active rule whose expiry is strictly in the past and returns the rest.
    pub fn sweep(&self) -> Result<SweepOutcome, StorageError> {
        let now = self.clock.now();
        let mut active = Vec::new();
        let mut expired = 0;
        for rule in self.store.active_rules()? {
            if rule.is_expired_at(now) {
                if self.store.expire_rule(&rule.id)? {
                    expired += 1;
                }
                info!(
                    event = "rule_expired",
                    rule_id = %rule.id,
                    ip = %rule.ip,
                    expire_time = %rule.expire_time,
                    now = %now.to_rfc3339()
                );
            } else {
                active.push(rule);
            }
        }
        Ok(SweepOutcome { active, expired })
    }

    /// Periodic variant: publishes only when something expired. Returns the delivery count.
    pub async fn run_periodic_once(&self) -> Option<usize> {
        let outcome = match self.sweep() {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(event = "rule_sweep_error", error = %err);
                return None;
            }
        };
        if outcome.expired == 0 {
            return None;
        }
        let delivered = self
            .hub
            .broadcast_to_nodes(&Envelope::SyncRules(outcome.active))
            .await;
        info!(event = "rules_published", reason = "expiry", expired = outcome.expired, delivered);
        Some(delivered)
    }

    /// Publishes to every bound node regardless of expiry. Returns the number of rules sent.
    pub async fn publish_all(&self) -> Result<usize, StorageError> {
        let outcome = self.sweep()?;
        let count = outcome.active.len();
        let delivered = self
            .hub
            .broadcast_to_nodes(&Envelope::SyncRules(outcome.active))
            .await;
        info!(event = "rules_published", reason = "on_demand", count, delivered);
        Ok(count)
    }

    pub async fn publish_to_node(&self, node_id: &str) -> bool {
        let outcome = match self.sweep() {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(event = "rule_sweep_error", node_id = %node_id, error = %err);
                return false;
            }
        };
        let count = outcome.active.len();
        let sent = self
            .hub
            .send_to_node(node_id, Envelope::SyncRules(outcome.active))
            .await;
        info!(event = "rules_published", reason = "targeted", node_id = %node_id, count, sent);
        sent
    }

    /// Runs the periodic sweep until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.period;
            let mut ticker = tokio::time::interval_at(start, self.period);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_periodic_once().await;
                    }
                }
            }
            info!(event = "rule_sync_stop");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{DateTime, Utc};
    use prts_core::{RuleKind, RuleStatus};
    use prts_storage::SqliteStore;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn rule(id: &str, expire_time: &str) -> AccessControlRule {
        AccessControlRule {
            id: id.to_string(),
            ip: format!("203.0.113.{}", id.len()),
            kind: RuleKind::Blacklist,
            reason: "scanner".to_string(),
            source: "PRTS".to_string(),
            expire_time: expire_time.to_string(),
            add_time: "2019/06/01 00:00:00".to_string(),
            status: RuleStatus::Active,
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<SqliteStore>,
        clock: Arc<FixedClock>,
        sync: Arc<RuleSync>,
    }

    fn fixture(now: &str) -> Fixture {
        let (hub, _events) = Hub::new(16);
        let hub = Arc::new(hub);
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        let clock = Arc::new(FixedClock::new(at(now)));
        let sync = Arc::new(RuleSync::new(
            hub.clone(),
            store.clone(),
            clock.clone(),
            DEFAULT_SWEEP_INTERVAL,
        ));
        Fixture {
            hub,
            store,
            clock,
            sync,
        }
    }

    #[tokio::test]
    async fn expired_rule_is_flipped_and_left_out_of_next_push() {
        let fx = fixture("2024-01-01T00:00:00Z");
        fx.store
            .insert_rule(&rule("AC-old", "2020-01-01 00:00:00"))
            .expect("insert old");
        fx.store.insert_rule(&rule("AC-keep", "")).expect("insert keep");
        let mut probe = fx.hub.register().await;
        fx.hub.bind_node("P1", &probe.id).await;

        assert_eq!(fx.sync.run_periodic_once().await, Some(1));

        let stored = fx.store.list_rules().expect("list");
        assert_eq!(stored[0].status, RuleStatus::Expired);
        match probe.outbound.recv().await {
            Some(Envelope::SyncRules(rules)) => {
                assert_eq!(
                    rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
                    vec!["AC-keep"]
                );
            }
            other => panic!("expected SYNC_RULES, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_sweep_without_changes_does_not_publish() {
        let fx = fixture("2024-01-01T00:00:00Z");
        fx.store
            .insert_rule(&rule("AC-old", "2020/01/01 00:00:00"))
            .expect("insert");
        let mut probe = fx.hub.register().await;
        fx.hub.bind_node("P1", &probe.id).await;

        assert_eq!(fx.sync.run_periodic_once().await, Some(1));
        assert_eq!(fx.sync.run_periodic_once().await, None);

        assert!(matches!(
            probe.outbound.recv().await,
            Some(Envelope::SyncRules(_))
        ));
        assert!(probe.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn never_sentinels_survive_any_elapsed_time() {
        let fx = fixture("2024-01-01T00:00:00Z");
        for (idx, sentinel) in ["", "Permanent", "永久", "never", "not a date"]
            .iter()
            .enumerate()
        {
            fx.store
                .insert_rule(&rule(&format!("AC-{idx}"), sentinel))
                .expect("insert");
        }
        fx.clock.set(at("2999-12-31T00:00:00Z"));

        let outcome = fx.sync.sweep().expect("sweep");
        assert_eq!(outcome.expired, 0);
        assert_eq!(outcome.active.len(), 5);
    }

    #[tokio::test]
    async fn expiry_follows_authoritative_time() {
        let fx = fixture("2024-06-01T00:00:00Z");
        fx.store
            .insert_rule(&rule("AC-soon", "2024-06-01T00:10:00Z"))
            .expect("insert");

        assert_eq!(fx.sync.sweep().expect("first").expired, 0);
        fx.clock.advance(chrono::Duration::minutes(11));
        assert_eq!(fx.sync.sweep().expect("second").expired, 1);
    }

    #[tokio::test]
    async fn on_demand_publish_always_sends_to_bound_nodes_only() {
        let fx = fixture("2024-01-01T00:00:00Z");
        fx.store.insert_rule(&rule("AC-keep", "")).expect("insert");
        let mut probe = fx.hub.register().await;
        let mut viewer = fx.hub.register().await;
        fx.hub.bind_node("P1", &probe.id).await;

        assert_eq!(fx.sync.publish_all().await.expect("publish"), 1);
        assert!(matches!(
            probe.outbound.recv().await,
            Some(Envelope::SyncRules(rules)) if rules.len() == 1
        ));
        assert!(viewer.outbound.try_recv().is_err());

        assert!(fx.sync.publish_to_node("P1").await);
        assert!(!fx.sync.publish_to_node("ghost-node").await);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_stops_on_shutdown() {
        let fx = fixture("2024-01-01T00:00:00Z");
        fx.store
            .insert_rule(&rule("AC-old", "2020-01-01 00:00:00"))
            .expect("insert");
        let mut probe = fx.hub.register().await;
        fx.hub.bind_node("P1", &probe.id).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = fx.sync.clone().spawn(shutdown_rx);

        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_millis(10)).await;
        assert!(matches!(
            probe.outbound.recv().await,
            Some(Envelope::SyncRules(rules)) if rules.is_empty()
        ));

        shutdown_tx.send_replace(true);
        task.await.expect("sync task joins");
    }
}
