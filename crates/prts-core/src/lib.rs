use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod rules;
pub mod wire;

pub use rules::{AccessControlRule, Expiry, RuleKind, RuleStatus};
pub use wire::{Envelope, EnvelopeKind, FrameError};

pub const LOAD_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeLiveness {
    Online,
    #[default]
    Offline,
}

impl NodeLiveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLiveness::Online => "online",
            NodeLiveness::Offline => "offline",
        }
    }
}

impl fmt::Display for NodeLiveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeLiveness {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "online" => Ok(NodeLiveness::Online),
            "offline" => Ok(NodeLiveness::Offline),
            other => Err(format!("Unknown node status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirewallStatus {
    Active,
    #[default]
    Inactive,
    Error,
}

impl FirewallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallStatus::Active => "active",
            FirewallStatus::Inactive => "inactive",
            FirewallStatus::Error => "error",
        }
    }
}

impl fmt::Display for FirewallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirewallStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(FirewallStatus::Active),
            "inactive" | "" => Ok(FirewallStatus::Inactive),
            "error" => Ok(FirewallStatus::Error),
            other => Err(format!("Unknown firewall status: {other}")),
        }
    }
}

/// Full status snapshot of one probe, as reported over the wire and stored by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: NodeLiveness,
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub memory_usage: u32,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub net_up: f64,
    #[serde(default)]
    pub net_down: f64,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub template: String,
    #[serde(
        default,
        rename = "trafficHistory",
        serialize_with = "serialize_history",
        deserialize_with = "deserialize_history"
    )]
    pub load_history: Vec<u32>,
    #[serde(default)]
    pub uptime: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub firewall_status: FirewallStatus,
    #[serde(default)]
    pub firewall_error: String,
    #[serde(default)]
    pub firewall_info: String,
}

impl NodeStatus {
    pub fn is_online(&self) -> bool {
        self.status == NodeLiveness::Online
    }

    /// JSON text of the load history, the form the dashboard and the store keep it in.
    pub fn history_json(&self) -> String {
        serde_json::to_string(&self.load_history).unwrap_or_else(|_| "[]".to_string())
    }
}

/// The dashboard reads `trafficHistory` as a JSON-encoded string.
fn serialize_history<S>(history: &[u32], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = serde_json::to_string(history).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&text)
}

/// Accepts the JSON-string form, a plain array, or null.
fn deserialize_history<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        serde_json::Value::String(s) => parse_history(&s).map_err(serde::de::Error::custom),
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| item.as_u64())
            .filter_map(|n| u32::try_from(n).ok())
            .collect()),
        _ => Err(serde::de::Error::custom(
            "expected string or array for trafficHistory",
        )),
    }
}

pub fn parse_history(text: &str) -> Result<Vec<u32>, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text)
}

/// Fixed-capacity ring of recent load samples; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct LoadHistory {
    samples: VecDeque<u32>,
    capacity: usize,
}

impl LoadHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: u32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LoadHistory {
    fn default() -> Self {
        Self::new(LOAD_HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCommand {
    Stop,
    Restart,
    EnableFirewall,
    DisableFirewall,
}

impl NodeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCommand::Stop => "STOP",
            NodeCommand::Restart => "RESTART",
            NodeCommand::EnableFirewall => "ENABLE_FIREWALL",
            NodeCommand::DisableFirewall => "DISABLE_FIREWALL",
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeCommand {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "STOP" => Ok(NodeCommand::Stop),
            "RESTART" => Ok(NodeCommand::Restart),
            "ENABLE_FIREWALL" => Ok(NodeCommand::EnableFirewall),
            "DISABLE_FIREWALL" => Ok(NodeCommand::DisableFirewall),
            other => Err(format!("Unknown command: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    System,
    Security,
    Report,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::System => "system",
            NotificationKind::Security => "security",
            NotificationKind::Report => "report",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "system" => Ok(NotificationKind::System),
            "security" => Ok(NotificationKind::Security),
            "report" => Ok(NotificationKind::Report),
            other => Err(format!("Unknown notification type: {other}")),
        }
    }
}

/// One-shot notification record shown in the dashboard message center.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub content: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn node_online(node: &NodeStatus, time: DateTime<Utc>) -> Self {
        Self {
            id: next_notification_id(),
            title: "msg_node_online_title".to_string(),
            content: format!(
                "msg_node_online_content|name:{},id:{}",
                node.name, node.id
            ),
            time,
            kind: NotificationKind::System,
            read: false,
        }
    }

    pub fn node_offline(node: &NodeStatus, time: DateTime<Utc>) -> Self {
        Self {
            id: next_notification_id(),
            title: "msg_node_offline_title".to_string(),
            content: format!(
                "msg_node_offline_content|name:{},id:{}",
                node.name, node.id
            ),
            time,
            kind: NotificationKind::Security,
            read: false,
        }
    }
}

fn next_notification_id() -> String {
    format!("msg-{}", Uuid::new_v4().simple())
}
