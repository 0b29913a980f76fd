use chrono::{DateTime, Utc};
use prts_core::{
    parse_history, AccessControlRule, NodeLiveness, NodeStatus, Notification, RuleStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const FLEET_SCHEMA_VERSION: i64 = 1;

pub const SETTING_TIME_OFFSET: &str = "time_offset";
pub const SETTING_LAST_SYNC_TIME: &str = "last_sync_time";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Persistence used by the hub for nodes, rules, notifications and settings.
///
/// Node writes have overwrite semantics: every stored field is replaced by the snapshot.
pub trait FleetStore: Send + Sync {
    fn get_node(&self, id: &str) -> Result<Option<NodeStatus>, StorageError>;
    fn upsert_node(&self, node: &NodeStatus) -> Result<(), StorageError>;
    fn list_nodes(&self) -> Result<Vec<NodeStatus>, StorageError>;
    /// Flips one node to offline and returns the updated record, `None` if unknown.
    fn mark_node_offline(&self, id: &str) -> Result<Option<NodeStatus>, StorageError>;
    fn mark_all_nodes_offline(&self) -> Result<usize, StorageError>;

    fn insert_rule(&self, rule: &AccessControlRule) -> Result<(), StorageError>;
    fn delete_rule(&self, id: &str) -> Result<bool, StorageError>;
    fn list_rules(&self) -> Result<Vec<AccessControlRule>, StorageError>;
    fn active_rules(&self) -> Result<Vec<AccessControlRule>, StorageError>;
    fn expire_rule(&self, id: &str) -> Result<bool, StorageError>;

    fn insert_notification(&self, notification: &Notification) -> Result<(), StorageError>;
    fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, StorageError>;

    fn setting(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > FLEET_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: FLEET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn()?;
            conn.execute_batch(include_str!("../migrations/0001_fleet_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

const NODE_COLUMNS: &str = "
    id, name, region, status, load, memory_usage, memory_total, temperature, net_up,
    net_down, ip, os, template, traffic_history, uptime, version, interface, mac,
    firewall_status, firewall_error, firewall_info
";

const RULE_COLUMNS: &str = "id, ip, kind, reason, source, expire_time, add_time, status";

fn select_node(conn: &Connection, id: &str) -> Result<Option<NodeStatus>, StorageError> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            [id],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

impl FleetStore for SqliteStore {
    fn get_node(&self, id: &str) -> Result<Option<NodeStatus>, StorageError> {
        let conn = self.conn()?;
        select_node(&conn, id)
    }

    fn upsert_node(&self, node: &NodeStatus) -> Result<(), StorageError> {
        let history = serde_json::to_string(&node.load_history)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO nodes (
                id, name, region, status, load, memory_usage, memory_total, temperature,
                net_up, net_down, ip, os, template, traffic_history, uptime, version,
                interface, mac, firewall_status, firewall_error, firewall_info, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                region=excluded.region,
                status=excluded.status,
                load=excluded.load,
                memory_usage=excluded.memory_usage,
                memory_total=excluded.memory_total,
                temperature=excluded.temperature,
                net_up=excluded.net_up,
                net_down=excluded.net_down,
                ip=excluded.ip,
                os=excluded.os,
                template=excluded.template,
                traffic_history=excluded.traffic_history,
                uptime=excluded.uptime,
                version=excluded.version,
                interface=excluded.interface,
                mac=excluded.mac,
                firewall_status=excluded.firewall_status,
                firewall_error=excluded.firewall_error,
                firewall_info=excluded.firewall_info,
                updated_at=excluded.updated_at
            ",
            params![
                node.id,
                node.name,
                node.region,
                node.status.as_str(),
                node.load,
                node.memory_usage,
                node.memory_total as i64,
                node.temperature,
                node.net_up,
                node.net_down,
                node.ip,
                node.os,
                node.template,
                history,
                node.uptime,
                node.version,
                node.interface,
                node.mac,
                node.firewall_status.as_str(),
                node.firewall_error,
                node.firewall_info,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list_nodes(&self) -> Result<Vec<NodeStatus>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
        let rows = stmt.query_map([], node_from_row)?;
        let mut nodes = Vec::new();
        for node in rows {
            nodes.push(node?);
        }
        Ok(nodes)
    }

    fn mark_node_offline(&self, id: &str) -> Result<Option<NodeStatus>, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![NodeLiveness::Offline.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if changes == 0 {
            return Ok(None);
        }
        select_node(&conn, id)
    }

    fn mark_all_nodes_offline(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "UPDATE nodes SET status = ?1 WHERE status != ?1",
            [NodeLiveness::Offline.as_str()],
        )?;
        Ok(changes)
    }

    fn insert_rule(&self, rule: &AccessControlRule) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO access_rules ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                rule.id,
                rule.ip,
                rule.kind.as_str(),
                rule.reason,
                rule.source,
                rule.expire_time,
                rule.add_time,
                rule.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn delete_rule(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute("DELETE FROM access_rules WHERE id = ?1", [id])?;
        Ok(changes > 0)
    }

    fn list_rules(&self) -> Result<Vec<AccessControlRule>, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {RULE_COLUMNS} FROM access_rules ORDER BY rowid"))?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for rule in rows {
            rules.push(rule?);
        }
        Ok(rules)
    }

    fn active_rules(&self) -> Result<Vec<AccessControlRule>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM access_rules WHERE status = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([RuleStatus::Active.as_str()], rule_from_row)?;
        let mut rules = Vec::new();
        for rule in rows {
            rules.push(rule?);
        }
        Ok(rules)
    }

    fn expire_rule(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "UPDATE access_rules SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![RuleStatus::Expired.as_str(), id, RuleStatus::Active.as_str()],
        )?;
        Ok(changes > 0)
    }

    fn insert_notification(&self, notification: &Notification) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO notifications (id, title, content, time, kind, read)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                notification.id,
                notification.title,
                notification.content,
                notification.time.to_rfc3339(),
                notification.kind.as_str(),
                notification.read,
            ],
        )?;
        Ok(())
    }

    fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, title, content, time, kind, read
            FROM notifications
            ORDER BY time DESC, rowid DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut notifications = Vec::new();
        for row in rows {
            let (id, title, content, time, kind, read) = row?;
            notifications.push(Notification {
                id,
                title,
                content,
                time: parse_timestamp(time)?,
                kind: kind.parse().map_err(StorageError::Serialization)?,
                read,
            });
        }
        Ok(notifications)
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            ",
            params![key, value],
        )?;
        Ok(())
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeStatus> {
    let history: String = row.get(13)?;
    let load_history = parse_history(&history).map_err(|err| conversion_failure(13, err))?;
    Ok(NodeStatus {
        id: row.get(0)?,
        name: row.get(1)?,
        region: row.get(2)?,
        status: text_enum(row, 3)?,
        load: row.get(4)?,
        memory_usage: row.get(5)?,
        memory_total: row.get::<_, i64>(6)?.max(0) as u64,
        temperature: row.get(7)?,
        net_up: row.get(8)?,
        net_down: row.get(9)?,
        ip: row.get(10)?,
        os: row.get(11)?,
        template: row.get(12)?,
        load_history,
        uptime: row.get(14)?,
        version: row.get(15)?,
        interface: row.get(16)?,
        mac: row.get(17)?,
        firewall_status: text_enum(row, 18)?,
        firewall_error: row.get(19)?,
        firewall_info: row.get(20)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AccessControlRule> {
    Ok(AccessControlRule {
        id: row.get(0)?,
        ip: row.get(1)?,
        kind: text_enum(row, 2)?,
        reason: row.get(3)?,
        source: row.get(4)?,
        expire_time: row.get(5)?,
        add_time: row.get(6)?,
        status: text_enum(row, 7)?,
    })
}

fn text_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let value: String = row.get(idx)?;
    value
        .parse()
        .map_err(|err: String| conversion_failure(idx, err))
}

fn conversion_failure(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use prts_core::{FirewallStatus, NotificationKind, RuleKind};
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 6, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn sample_node(id: &str) -> NodeStatus {
        NodeStatus {
            id: id.to_string(),
            name: "Lungmen-01".to_string(),
            region: "CN-SH".to_string(),
            status: NodeLiveness::Online,
            load: 10,
            memory_usage: 55,
            memory_total: 32_768,
            temperature: 39.2,
            net_up: 0.125,
            net_down: 2.5,
            ip: "10.0.0.7".to_string(),
            os: "linux".to_string(),
            template: "Standard Linux Node".to_string(),
            load_history: vec![4, 8, 10],
            uptime: "0d 00h 05m".to_string(),
            version: "v1.2.0-6.1.0".to_string(),
            interface: "eth0".to_string(),
            mac: "02:42:ac:11:00:02".to_string(),
            firewall_status: FirewallStatus::Error,
            firewall_error: "access denied".to_string(),
            firewall_info: String::new(),
        }
    }

    fn sample_rule(id: &str, expire_time: &str) -> AccessControlRule {
        AccessControlRule {
            id: id.to_string(),
            ip: "192.168.1.100".to_string(),
            kind: RuleKind::Blacklist,
            reason: "Brute force".to_string(),
            source: "PRTS".to_string(),
            expire_time: expire_time.to_string(),
            add_time: "2025/12/06 10:00:00".to_string(),
            status: RuleStatus::Active,
        }
    }

    #[test]
    fn migration_creates_fleet_tables() {
        let store = SqliteStore::open_in_memory().expect("open db");
        for table in ["nodes", "access_rules", "notifications", "settings"] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            FLEET_SCHEMA_VERSION
        );
    }

    #[test]
    fn node_roundtrip_preserves_every_field() {
        let store = SqliteStore::open_in_memory().expect("open db");
        let node = sample_node("probe-01");
        store.upsert_node(&node).expect("upsert");
        assert_eq!(store.get_node("probe-01").expect("get"), Some(node));
        assert_eq!(store.get_node("ghost").expect("get ghost"), None);
    }

    #[test]
    fn upsert_overwrites_instead_of_merging() {
        let store = SqliteStore::open_in_memory().expect("open db");
        store.upsert_node(&sample_node("probe-01")).expect("first");

        let sparse = NodeStatus {
            id: "probe-01".to_string(),
            load: 20,
            ..NodeStatus::default()
        };
        store.upsert_node(&sparse).expect("second");

        let stored = store.get_node("probe-01").expect("get").expect("exists");
        assert_eq!(stored, sparse);
        assert_eq!(store.list_nodes().expect("list").len(), 1);
    }

    #[test]
    fn offline_marking_reports_updated_node() {
        let store = SqliteStore::open_in_memory().expect("open db");
        store.upsert_node(&sample_node("probe-01")).expect("upsert a");
        store.upsert_node(&sample_node("probe-02")).expect("upsert b");

        let updated = store
            .mark_node_offline("probe-01")
            .expect("mark")
            .expect("known node");
        assert_eq!(updated.status, NodeLiveness::Offline);
        assert_eq!(updated.load, 10);
        assert_eq!(store.mark_node_offline("ghost").expect("mark ghost"), None);

        assert_eq!(store.mark_all_nodes_offline().expect("reset"), 1);
        assert!(store
            .list_nodes()
            .expect("list")
            .iter()
            .all(|node| !node.is_online()));
    }

    #[test]
    fn rule_expiry_only_touches_active_rules() {
        let store = SqliteStore::open_in_memory().expect("open db");
        store
            .insert_rule(&sample_rule("AC-001", "2020-01-01 00:00:00"))
            .expect("insert 1");
        store.insert_rule(&sample_rule("AC-002", "")).expect("insert 2");

        assert!(store.expire_rule("AC-001").expect("expire"));
        assert!(!store.expire_rule("AC-001").expect("expire again"));

        let active = store.active_rules().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "AC-002");

        let all = store.list_rules().expect("list");
        assert_eq!(all[0].status, RuleStatus::Expired);

        assert!(store.delete_rule("AC-002").expect("delete"));
        assert!(!store.delete_rule("AC-002").expect("delete twice"));
        assert!(store.active_rules().expect("active").is_empty());
    }

    #[test]
    fn notifications_list_newest_first() {
        let store = SqliteStore::open_in_memory().expect("open db");
        let node = sample_node("probe-01");
        let online = Notification::node_online(&node, ts());
        let offline = Notification::node_offline(&node, ts() + chrono::Duration::seconds(5));
        store.insert_notification(&online).expect("insert online");
        store.insert_notification(&offline).expect("insert offline");

        let listed = store.list_notifications(10).expect("list");
        assert_eq!(listed, vec![offline.clone(), online]);
        assert_eq!(listed[0].kind, NotificationKind::Security);
        assert_eq!(store.list_notifications(1).expect("limited").len(), 1);
    }

    #[test]
    fn settings_persist_across_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = SqliteStore::open(file.path()).expect("open");
            store
                .put_setting(SETTING_TIME_OFFSET, "1500000000")
                .expect("put");
            store.put_setting(SETTING_TIME_OFFSET, "-250").expect("overwrite");
        }
        let reopened = SqliteStore::open(file.path()).expect("reopen");
        assert_eq!(
            reopened.setting(SETTING_TIME_OFFSET).expect("get"),
            Some("-250".to_string())
        );
        assert_eq!(reopened.setting(SETTING_LAST_SYNC_TIME).expect("get"), None);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("raw open");
            conn.execute("PRAGMA user_version = 99", []).expect("bump");
        }
        match SqliteStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, FLEET_SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("newer schema should be rejected"),
        }
    }
}
