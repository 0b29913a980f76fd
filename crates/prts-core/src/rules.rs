use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Layout used by the dashboard when it writes rule timestamps.
pub const RULE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const NAIVE_FORMATS: [&str; 2] = [RULE_TIME_FORMAT, "%Y-%m-%d %H:%M:%S"];
const NEVER_SENTINELS: [&str; 3] = ["permanent", "永久", "never"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[default]
    Blacklist,
    Whitelist,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Blacklist => "blacklist",
            RuleKind::Whitelist => "whitelist",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "blacklist" | "deny" | "block" => Ok(RuleKind::Blacklist),
            "whitelist" | "allow" => Ok(RuleKind::Whitelist),
            other => Err(format!("Unknown rule type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Active,
    Expired,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(RuleStatus::Active),
            "expired" => Ok(RuleStatus::Expired),
            other => Err(format!("Unknown rule status: {other}")),
        }
    }
}

/// An access-control entry distributed to every probe.
///
/// Timestamps stay in the textual form the operator entered; [`AccessControlRule::expiry`]
/// interprets `expire_time`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlRule {
    pub id: String,
    pub ip: String,
    #[serde(rename = "type", default)]
    pub kind: RuleKind,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub expire_time: String,
    #[serde(default)]
    pub add_time: String,
    #[serde(default)]
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    At(DateTime<Utc>),
}

impl AccessControlRule {
    pub fn expiry(&self) -> Expiry {
        parse_expiry(&self.expire_time)
    }

    /// True only for a parseable, non-sentinel expiry strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry() {
            Expiry::Never => false,
            Expiry::At(at) => at < now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Trimmed target address, `None` when blank.
    pub fn target(&self) -> Option<&str> {
        let target = self.ip.trim();
        if target.is_empty() {
            None
        } else {
            Some(target)
        }
    }
}

/// Unparseable values fall back to [`Expiry::Never`] so protection stays in place.
pub fn parse_expiry(raw: &str) -> Expiry {
    let value = raw.trim();
    if value.is_empty() || NEVER_SENTINELS.contains(&value.to_lowercase().as_str()) {
        return Expiry::Never;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Expiry::At(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Expiry::At(local.with_timezone(&Utc));
            }
        }
    }
    Expiry::Never
}

pub fn format_rule_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(RULE_TIME_FORMAT).to_string()
}

pub fn next_rule_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("AC-{}", &id[..12])
}
