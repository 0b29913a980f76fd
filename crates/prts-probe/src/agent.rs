use crate::firewall::{is_missing_group, FirewallProvider};
use crate::metrics::{format_uptime, node_template, synthetic_temperature, MetricsSource};
use chrono::Utc;
use prts_core::{
    AccessControlRule, Envelope, FirewallStatus, LoadHistory, NodeCommand, NodeLiveness,
    NodeStatus, RuleKind,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub const ENABLED_INFO: &str = "PRTS Firewall Protection Enabled";
pub const DISABLED_INFO: &str = "PRTS Firewall Protection Disabled (Rules preserved)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeIdentity {
    pub id: String,
    pub name: String,
    pub region: String,
}

/// What the connection loop should do after an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    None,
    Reply(Envelope),
    Exit(NodeCommand),
}

#[derive(Debug)]
struct FirewallState {
    enabled: bool,
    last_error: String,
    last_info: String,
}

impl FirewallState {
    fn append_info(&mut self, message: String) {
        if self.last_info.is_empty() {
            self.last_info = message;
        } else {
            self.last_info = format!("{}; {message}", self.last_info);
        }
    }
}

/// Probe-side state: the local protection toggle, the last provider outcome and
/// the sample history. Knows nothing about the socket.
///
/// Every method takes `&self` so reports can be produced while an inbound
/// envelope is still waiting on the provider. Locks are never held across an await.
pub struct ProbeAgent<P, S> {
    identity: ProbeIdentity,
    provider: P,
    metrics: Mutex<S>,
    firewall: Mutex<FirewallState>,
    history: Mutex<LoadHistory>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P, S> ProbeAgent<P, S>
where
    P: FirewallProvider,
    S: MetricsSource,
{
    pub fn new(identity: ProbeIdentity, provider: P, metrics: S) -> Self {
        Self {
            identity,
            provider,
            metrics: Mutex::new(metrics),
            firewall: Mutex::new(FirewallState {
                enabled: true,
                last_error: String::new(),
                last_info: String::new(),
            }),
            history: Mutex::new(LoadHistory::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.firewall).enabled
    }

    pub fn last_error(&self) -> String {
        lock(&self.firewall).last_error.clone()
    }

    pub fn last_info(&self) -> String {
        lock(&self.firewall).last_info.clone()
    }

    pub async fn report(&self) -> Envelope {
        Envelope::NodeReport(self.snapshot().await)
    }

    pub async fn handle(&self, envelope: Envelope) -> AgentAction {
        match envelope {
            Envelope::Command(command) => self.handle_command(command).await,
            Envelope::SyncRules(rules) => {
                info!(event = "rules_received", count = rules.len());
                self.apply_rules(&rules).await;
                AgentAction::Reply(Envelope::SyncComplete(self.snapshot().await))
            }
            other => {
                debug!(event = "envelope_ignored", kind = %other.kind());
                AgentAction::None
            }
        }
    }

    async fn handle_command(&self, command: NodeCommand) -> AgentAction {
        info!(event = "command_received", command = %command);
        match command {
            NodeCommand::Stop | NodeCommand::Restart => AgentAction::Exit(command),
            NodeCommand::EnableFirewall => {
                self.set_enabled(true).await;
                AgentAction::Reply(Envelope::SyncComplete(self.snapshot().await))
            }
            NodeCommand::DisableFirewall => {
                self.set_enabled(false).await;
                AgentAction::Reply(Envelope::SyncComplete(self.snapshot().await))
            }
        }
    }

    async fn set_enabled(&self, enabled: bool) {
        {
            let mut firewall = lock(&self.firewall);
            firewall.enabled = enabled;
            firewall.last_error.clear();
            firewall.last_info = if enabled { ENABLED_INFO } else { DISABLED_INFO }.to_string();
        }
        let result = if enabled {
            self.provider.enable_group().await
        } else {
            self.provider.disable_group().await
        };
        if let Err(output) = result {
            if is_missing_group(&output) {
                debug!(event = "firewall_group_missing", enabled);
            } else {
                warn!(event = "firewall_toggle_error", enabled, error = %output.trim());
                lock(&self.firewall).last_error = output.trim().to_string();
            }
        }
    }

    /// Replaces the managed group with `rules`. A no-op while protection is off.
    pub async fn apply_rules(&self, rules: &[AccessControlRule]) {
        {
            let mut firewall = lock(&self.firewall);
            if !firewall.enabled {
                info!(event = "rules_skipped", reason = "firewall_disabled");
                return;
            }
            firewall.last_error.clear();
            firewall.last_info.clear();
        }

        let mut deny = Vec::new();
        let mut allow = Vec::new();
        for rule in rules.iter().filter(|rule| rule.is_active()) {
            let Some(target) = rule.target() else {
                continue;
            };
            match rule.kind {
                RuleKind::Whitelist => allow.push(target.to_string()),
                _ => deny.push(target.to_string()),
            }
        }
        info!(
            event = "rules_apply",
            provider = self.provider.name(),
            deny = deny.len(),
            allow = allow.len()
        );

        if let Err(err) = self.provider.clear_group().await {
            debug!(event = "firewall_clear_error", error = %err.trim());
        }

        if !deny.is_empty() {
            let result = self.provider.apply_deny(&deny).await;
            let mut firewall = lock(&self.firewall);
            match result {
                Ok(()) => {
                    firewall.append_info(format!("Successfully added block rule for {} IPs", deny.len()))
                }
                Err(err) => {
                    warn!(event = "firewall_apply_error", verdict = "deny", error = %err.trim());
                    firewall.last_error = err.trim().to_string();
                }
            }
        }
        if !allow.is_empty() {
            let result = self.provider.apply_allow(&allow).await;
            let mut firewall = lock(&self.firewall);
            match result {
                Ok(()) => firewall
                    .append_info(format!("Successfully added allow rule for {} IPs", allow.len())),
                Err(err) => {
                    warn!(event = "firewall_apply_error", verdict = "allow", error = %err.trim());
                    if firewall.last_error.is_empty() {
                        firewall.last_error = err.trim().to_string();
                    }
                }
            }
        }
    }

    async fn firewall_status(&self) -> (FirewallStatus, String, String) {
        let access = self.provider.check_access().await;
        let firewall = lock(&self.firewall);
        let info = firewall.last_info.clone();
        if let Err(err) = access {
            return (FirewallStatus::Error, err, info);
        }
        if !firewall.enabled {
            return (FirewallStatus::Inactive, firewall.last_error.clone(), info);
        }
        if !firewall.last_error.is_empty() {
            return (FirewallStatus::Error, firewall.last_error.clone(), info);
        }
        (FirewallStatus::Active, String::new(), info)
    }

    pub async fn snapshot(&self) -> NodeStatus {
        let sample = lock(&self.metrics).sample();
        let load_history = {
            let mut history = lock(&self.history);
            history.push(sample.load);
            history.to_vec()
        };
        let temperature = sample
            .temperature
            .filter(|value| *value > 0.0)
            .unwrap_or_else(|| synthetic_temperature(sample.load, Utc::now().timestamp()));
        let (firewall_status, firewall_error, firewall_info) = self.firewall_status().await;

        NodeStatus {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            region: self.identity.region.clone(),
            status: NodeLiveness::Online,
            load: sample.load,
            memory_usage: sample.memory_usage,
            memory_total: sample.memory_total_mb,
            temperature,
            net_up: sample.net_up,
            net_down: sample.net_down,
            ip: sample.ip,
            template: node_template(&sample.os).to_string(),
            os: sample.os,
            load_history,
            uptime: format_uptime(sample.uptime),
            version: format!("v1.2.0-{}", sample.kernel),
            interface: sample.interface,
            mac: sample.mac,
            firewall_status,
            firewall_error,
            firewall_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSample;
    use prts_core::RuleStatus;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeState {
        calls: Vec<String>,
        fail_enable: Option<String>,
        fail_deny: Option<String>,
        fail_allow: Option<String>,
        fail_access: Option<String>,
    }

    #[derive(Clone, Default)]
    struct FakeProvider {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<String> {
            self.state.lock().expect("state").calls.clone()
        }

        fn record(&self, call: String) {
            self.state.lock().expect("state").calls.push(call);
        }

        fn with(&self, f: impl FnOnce(&mut FakeState)) {
            f(&mut self.state.lock().expect("state"));
        }
    }

    impl FirewallProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn check_access(&self) -> Result<(), String> {
            match self.state.lock().expect("state").fail_access.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn enable_group(&self) -> Result<(), String> {
            self.record("enable".to_string());
            match self.state.lock().expect("state").fail_enable.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn disable_group(&self) -> Result<(), String> {
            self.record("disable".to_string());
            Ok(())
        }

        async fn clear_group(&self) -> Result<(), String> {
            self.record("clear".to_string());
            Err("ObjectNotFound".to_string())
        }

        async fn apply_deny(&self, targets: &[String]) -> Result<(), String> {
            self.record(format!("deny {}", targets.join(",")));
            match self.state.lock().expect("state").fail_deny.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn apply_allow(&self, targets: &[String]) -> Result<(), String> {
            self.record(format!("allow {}", targets.join(",")));
            match self.state.lock().expect("state").fail_allow.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    struct FakeMetrics {
        loads: Vec<u32>,
        temperature: Option<f64>,
    }

    impl MetricsSource for FakeMetrics {
        fn sample(&mut self) -> MetricsSample {
            let load = if self.loads.is_empty() {
                0
            } else {
                self.loads.remove(0)
            };
            MetricsSample {
                load,
                memory_usage: 40,
                memory_total_mb: 8_192,
                temperature: self.temperature,
                net_up: 0.5,
                net_down: 1.5,
                ip: "10.0.0.7".to_string(),
                mac: "02:42:ac:11:00:02".to_string(),
                interface: "eth0".to_string(),
                os: "linux".to_string(),
                kernel: "6.1.0".to_string(),
                uptime: Duration::from_secs(3_660),
            }
        }
    }

    fn agent(provider: FakeProvider) -> ProbeAgent<FakeProvider, FakeMetrics> {
        ProbeAgent::new(
            ProbeIdentity {
                id: "P1".to_string(),
                name: "Lungmen-01".to_string(),
                region: "CN-SH".to_string(),
            },
            provider,
            FakeMetrics {
                loads: Vec::new(),
                temperature: Some(42.0),
            },
        )
    }

    fn rule(ip: &str, kind: RuleKind, status: RuleStatus) -> AccessControlRule {
        AccessControlRule {
            id: format!("AC-{ip}"),
            ip: ip.to_string(),
            kind,
            reason: "test".to_string(),
            source: "PRTS".to_string(),
            expire_time: String::new(),
            add_time: "2024/01/01 00:00:00".to_string(),
            status,
        }
    }

    fn synced(action: AgentAction) -> NodeStatus {
        match action {
            AgentAction::Reply(Envelope::SyncComplete(status)) => status,
            other => panic!("expected SYNC_COMPLETE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn report_carries_identity_and_formatted_fields() {
        let agent = agent(FakeProvider::default());
        let status = match agent.report().await {
            Envelope::NodeReport(status) => status,
            other => panic!("expected NODE_REPORT, got {other:?}"),
        };
        assert_eq!(status.id, "P1");
        assert_eq!(status.region, "CN-SH");
        assert!(status.is_online());
        assert_eq!(status.uptime, "0d 01h 01m");
        assert_eq!(status.version, "v1.2.0-6.1.0");
        assert_eq!(status.template, "Standard Linux Node");
        assert_eq!(status.temperature, 42.0);
        assert_eq!(status.firewall_status, FirewallStatus::Active);
    }

    #[tokio::test]
    async fn load_history_keeps_the_last_twenty_samples() {
        let agent = ProbeAgent::new(
            ProbeIdentity {
                id: "P1".to_string(),
                name: "n".to_string(),
                region: "r".to_string(),
            },
            FakeProvider::default(),
            FakeMetrics {
                loads: (1..=25).collect(),
                temperature: None,
            },
        );
        for _ in 0..24 {
            agent.snapshot().await;
        }
        let last = agent.snapshot().await;
        assert_eq!(last.load_history, (6..=25).collect::<Vec<u32>>());
        assert!(last.temperature >= 35.0 + 25.0 * 0.4);
        assert!(last.temperature < 35.0 + 25.0 * 0.4 + 1.0);
    }

    #[tokio::test]
    async fn sync_rules_clears_then_applies_combined_lists() {
        let provider = FakeProvider::default();
        let agent = agent(provider.clone());
        let rules = vec![
            rule("203.0.113.7", RuleKind::Blacklist, RuleStatus::Active),
            rule("10.0.0.1", RuleKind::Whitelist, RuleStatus::Active),
            rule("198.51.100.0/24", RuleKind::Blacklist, RuleStatus::Active),
            rule("192.0.2.9", RuleKind::Blacklist, RuleStatus::Expired),
            rule("   ", RuleKind::Blacklist, RuleStatus::Active),
        ];

        let status = synced(agent.handle(Envelope::SyncRules(rules)).await);

        assert_eq!(
            provider.calls(),
            vec![
                "clear",
                "deny 203.0.113.7,198.51.100.0/24",
                "allow 10.0.0.1"
            ]
        );
        assert_eq!(
            status.firewall_info,
            "Successfully added block rule for 2 IPs; Successfully added allow rule for 1 IPs"
        );
        assert_eq!(status.firewall_status, FirewallStatus::Active);
    }

    #[tokio::test]
    async fn deny_failure_wins_over_allow_failure() {
        let provider = FakeProvider::default();
        provider.with(|state| {
            state.fail_deny = Some("Access is denied.\n".to_string());
            state.fail_allow = Some("allow broke".to_string());
        });
        let agent = agent(provider.clone());
        let rules = vec![
            rule("203.0.113.7", RuleKind::Blacklist, RuleStatus::Active),
            rule("10.0.0.1", RuleKind::Whitelist, RuleStatus::Active),
        ];

        let status = synced(agent.handle(Envelope::SyncRules(rules)).await);

        assert_eq!(status.firewall_status, FirewallStatus::Error);
        assert_eq!(status.firewall_error, "Access is denied.");
        assert_eq!(status.firewall_info, "");
    }

    #[tokio::test]
    async fn disabled_agent_skips_rules_but_still_acknowledges() {
        let provider = FakeProvider::default();
        let agent = agent(provider.clone());

        let status = synced(
            agent
                .handle(Envelope::Command(NodeCommand::DisableFirewall))
                .await,
        );
        assert_eq!(status.firewall_status, FirewallStatus::Inactive);
        assert_eq!(status.firewall_info, DISABLED_INFO);

        let status = synced(
            agent
                .handle(Envelope::SyncRules(vec![rule(
                    "203.0.113.7",
                    RuleKind::Blacklist,
                    RuleStatus::Active,
                )]))
                .await,
        );
        assert_eq!(provider.calls(), vec!["disable"]);
        assert_eq!(status.firewall_status, FirewallStatus::Inactive);
        assert!(!agent.is_enabled());
    }

    #[tokio::test]
    async fn missing_group_on_enable_is_not_an_error() {
        let provider = FakeProvider::default();
        provider.with(|state| {
            state.fail_enable = Some("No MSFT_NetFirewallRule objects found: ObjectNotFound".to_string())
        });
        let agent = agent(provider.clone());

        let status = synced(
            agent
                .handle(Envelope::Command(NodeCommand::EnableFirewall))
                .await,
        );
        assert_eq!(status.firewall_status, FirewallStatus::Active);
        assert_eq!(status.firewall_info, ENABLED_INFO);
        assert_eq!(agent.last_error(), "");

        provider.with(|state| state.fail_enable = Some("Access is denied.".to_string()));
        let status = synced(
            agent
                .handle(Envelope::Command(NodeCommand::EnableFirewall))
                .await,
        );
        assert_eq!(status.firewall_status, FirewallStatus::Error);
        assert_eq!(status.firewall_error, "Access is denied.");
    }

    #[tokio::test]
    async fn access_check_failure_reports_error() {
        let provider = FakeProvider::default();
        provider.with(|state| state.fail_access = Some("Admin privileges required".to_string()));
        let agent = agent(provider);

        let status = agent.snapshot().await;
        assert_eq!(status.firewall_status, FirewallStatus::Error);
        assert_eq!(status.firewall_error, "Admin privileges required");
    }

    #[tokio::test]
    async fn stop_and_restart_exit_and_broadcasts_are_ignored() {
        let agent = agent(FakeProvider::default());
        assert_eq!(
            agent.handle(Envelope::Command(NodeCommand::Stop)).await,
            AgentAction::Exit(NodeCommand::Stop)
        );
        assert_eq!(
            agent.handle(Envelope::Command(NodeCommand::Restart)).await,
            AgentAction::Exit(NodeCommand::Restart)
        );
        let update = Envelope::NodeUpdate(NodeStatus::default());
        assert_eq!(agent.handle(update).await, AgentAction::None);
    }
}
