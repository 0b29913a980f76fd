pub mod agent;
pub mod firewall;
pub mod metrics;
pub mod session;

pub use agent::{AgentAction, ProbeAgent, ProbeIdentity};
pub use firewall::{
    FirewallProvider, HostFirewall, IptablesProvider, NoopProvider, PowerShellProvider,
    ProviderKind,
};
pub use metrics::{MetricsSample, MetricsSource, SystemMetrics};
pub use session::{connect_with_backoff, hub_url, run_session, SessionEnd};
