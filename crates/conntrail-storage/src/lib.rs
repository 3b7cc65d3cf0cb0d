use chrono::{DateTime, Duration, Utc};
use conntrail_core::{Action, ConnectionEvent, NodeRecord, RuleOperator, RuleRecord};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, ToSql};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const SCHEMA_VERSION: i64 = 2;

/// Native `ON CONFLICT ... DO UPDATE` requires this sqlite release.
const UPSERT_MIN_VERSION: i32 = 3_024_000;

static MEMORY_STORE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("native upsert requires sqlite 3.24+, found {0}")]
    UpsertUnsupported(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
}

/// Where the store lives: an ephemeral in-memory database or a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Replace,
    Ignore,
}

impl OnConflict {
    fn as_sql(&self) -> &'static str {
        match self {
            OnConflict::Replace => "REPLACE",
            OnConflict::Ignore => "IGNORE",
        }
    }
}

/// Result of a retention purge. `Skipped` means there was not enough stored
/// data to judge the time span, or the span has not yet reached the
/// retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Deleted(usize),
    Skipped,
}

/// Aggregate hit-count tables, all shaped `(what TEXT PRIMARY KEY, hits INTEGER)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTable {
    Hosts,
    Procs,
    Addrs,
    Ports,
    Users,
}

impl HitTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            HitTable::Hosts => "hosts",
            HitTable::Procs => "procs",
            HitTable::Addrs => "addrs",
            HitTable::Ports => "ports",
            HitTable::Users => "users",
        }
    }
}

const CONNECTION_COLUMNS: &[&str] = &[
    "time",
    "node",
    "action",
    "protocol",
    "src_ip",
    "src_port",
    "dst_ip",
    "dst_host",
    "dst_port",
    "uid",
    "pid",
    "process",
    "process_args",
    "process_cwd",
    "rule",
];

const RULE_COLUMNS: &[&str] = &[
    "time",
    "node",
    "name",
    "enabled",
    "precedence",
    "action",
    "duration",
    "operator_type",
    "operator_sensitive",
    "operator_operand",
    "operator_data",
    "description",
    "nolog",
];

const NODE_COLUMNS: &[&str] = &[
    "addr",
    "hostname",
    "daemon_version",
    "daemon_uptime",
    "daemon_rules",
    "cons",
    "cons_dropped",
    "version",
    "status",
    "last_connection",
];

const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS connections (
    time text,
    node text,
    action text,
    protocol text,
    src_ip text,
    src_port text,
    dst_ip text,
    dst_host text,
    dst_port text,
    uid text,
    pid text,
    process text,
    process_args text,
    process_cwd text,
    rule text,
    UNIQUE(node, action, protocol, src_ip, src_port, dst_ip, dst_port, uid, pid, process, process_args)
);
CREATE INDEX IF NOT EXISTS time_index ON connections (time);
CREATE INDEX IF NOT EXISTS action_index ON connections (action);
CREATE INDEX IF NOT EXISTS protocol_index ON connections (protocol);
CREATE INDEX IF NOT EXISTS dst_host_index ON connections (dst_host);
CREATE INDEX IF NOT EXISTS process_index ON connections (process);
CREATE INDEX IF NOT EXISTS dst_ip_index ON connections (dst_ip);
CREATE INDEX IF NOT EXISTS dst_port_index ON connections (dst_port);
CREATE INDEX IF NOT EXISTS rule_index ON connections (rule);
CREATE INDEX IF NOT EXISTS node_index ON connections (node);
CREATE INDEX IF NOT EXISTS details_query_index ON connections (process, process_args, uid, pid, dst_ip, dst_host, dst_port, action, node, protocol);
CREATE TABLE IF NOT EXISTS rules (
    time text,
    node text,
    name text,
    enabled text,
    precedence text,
    action text,
    duration text,
    operator_type text,
    operator_sensitive text,
    operator_operand text,
    operator_data text,
    description text,
    nolog text,
    UNIQUE(node, name)
);
CREATE INDEX IF NOT EXISTS rules_time_index ON rules (time);
CREATE INDEX IF NOT EXISTS rules_name_index ON rules (name);
CREATE TABLE IF NOT EXISTS hosts (what text primary key, hits integer);
CREATE TABLE IF NOT EXISTS procs (what text primary key, hits integer);
CREATE TABLE IF NOT EXISTS addrs (what text primary key, hits integer);
CREATE TABLE IF NOT EXISTS ports (what text primary key, hits integer);
CREATE TABLE IF NOT EXISTS users (what text primary key, hits integer);
CREATE TABLE IF NOT EXISTS nodes (
    addr text primary key,
    hostname text,
    daemon_version text,
    daemon_uptime text,
    daemon_rules text,
    cons text,
    cons_dropped text,
    version text,
    status text,
    last_connection text
);
";

#[derive(Debug)]
enum Backing {
    Memory { uri: String },
    File { path: PathBuf },
}

/// Durable, versioned event store. One instance per process, owned by the
/// composition root and passed by reference to whoever needs it. Writers are
/// serialized through the internal connection lock; readers obtain their own
/// connections via [`Store::reader`] and are never blocked by that lock.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    backing: Backing,
    upsert_supported: bool,
}

impl Store {
    pub fn open(target: StoreTarget, schema_target: i64) -> Result<Self, StoreError> {
        let (conn, backing, is_new) = match target {
            StoreTarget::Memory => {
                let seq = MEMORY_STORE_SEQ.fetch_add(1, Ordering::Relaxed);
                let uri = format!("file:conntrail_mem_{seq}?mode=memory&cache=shared");
                let conn = Connection::open(&uri)?;
                (conn, Backing::Memory { uri }, true)
            }
            StoreTarget::File(path) => {
                let is_new = !path.exists();
                let conn = Connection::open(&path)?;
                (conn, Backing::File { path }, is_new)
            }
        };

        Self::integrity_check_on(&conn)?;

        if is_new {
            // Fresh target: stamp it with the target version right away, no
            // migrations needed.
            Self::set_schema_version(&conn, schema_target)?;
        }

        Self::apply_tuning(&conn, matches!(backing, Backing::Memory { .. }));
        conn.execute_batch(CREATE_TABLES_SQL)?;

        let stored = Self::schema_version_of(&conn)?;
        if stored > schema_target {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: stored,
                supported: schema_target,
            });
        }
        if stored < schema_target {
            Self::run_upgrades(&conn, stored, schema_target);
        }

        Ok(Self {
            conn: Mutex::new(conn),
            backing,
            upsert_supported: rusqlite::version_number() >= UPSERT_MIN_VERSION,
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(StoreTarget::Memory, SCHEMA_VERSION)
    }

    pub fn close(self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| {
            error!("store close failed: {err}");
            StoreError::from(err)
        })
    }

    /// An independent read connection against the same target, for windowed
    /// cursors. Reads through it are not serialized by the writer lock.
    pub fn reader(&self) -> Result<Connection, StoreError> {
        match &self.backing {
            Backing::Memory { uri } => {
                let conn = Connection::open(uri)?;
                // Shared-cache readers would otherwise block on the writer's
                // table locks mid-ingest; no snapshot isolation is promised.
                conn.pragma_update(None, "read_uncommitted", true)?;
                Ok(conn)
            }
            Backing::File { path } => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                Ok(conn)
            }
        }
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Self::schema_version_of(&self.writer())
    }

    pub fn upsert_supported(&self) -> bool {
        self.upsert_supported
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StoreError> {
        let conn = self.writer();
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Canonical read query the windowed cursor binds; callers append their
    /// own WHERE/ORDER BY clauses.
    pub fn query_for(table: &str, fields: &str) -> String {
        format!("SELECT {fields} FROM {table}")
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lightweight consistency check; any non-"ok" row is a fatal
    /// [`StoreError::Integrity`].
    pub fn integrity_check(&self) -> Result<(), StoreError> {
        Self::integrity_check_on(&self.writer())
    }

    fn integrity_check_on(conn: &Connection) -> Result<(), StoreError> {
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::Integrity(result));
        }
        Ok(())
    }

    fn apply_tuning(conn: &Connection, is_memory: bool) {
        let pragmas: &[(&str, &str)] = if is_memory {
            &[
                ("journal_mode", "OFF"),
                ("synchronous", "OFF"),
                ("cache_size", "10000"),
            ]
        } else {
            &[("journal_mode", "WAL"), ("synchronous", "NORMAL")]
        };
        for (name, value) in pragmas {
            if let Err(err) = conn.pragma_update(None, name, value) {
                warn!("pragma {name}={value} not applied: {err}");
            }
        }
        if let Err(err) = conn.busy_timeout(std::time::Duration::from_secs(5)) {
            warn!("busy_timeout not applied: {err}");
        }
    }

    fn schema_version_of(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn set_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
        conn.execute(&format!("PRAGMA user_version = {version}"), [])?;
        Ok(())
    }

    fn upgrade_script(version: i64) -> Option<&'static str> {
        match version {
            1 => Some(include_str!("../migrations/upgrade_1.sql")),
            2 => Some(include_str!("../migrations/upgrade_2.sql")),
            _ => None,
        }
    }

    /// Applies `upgrade_{stored+1}` through `upgrade_{target}` in order. A
    /// failing statement is logged and skipped, and the version counter still
    /// advances past it; the caller accepts a possibly-incomplete schema over
    /// an aborted open.
    fn run_upgrades(conn: &Connection, stored: i64, target: i64) {
        let mut version = stored;
        while version < target {
            version += 1;
            match Self::upgrade_script(version) {
                Some(script) => {
                    debug!("applying schema upgrade {version}");
                    Self::apply_upgrade(conn, version, script);
                }
                None => warn!("no upgrade script for schema version {version}"),
            }
        }
        if let Err(err) = Self::set_schema_version(conn, version) {
            error!("could not stamp schema version {version}: {err}");
        }
    }

    fn apply_upgrade(conn: &Connection, version: i64, script: &str) {
        for line in script.lines() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }
            if let Err(err) = conn.execute(statement, []) {
                warn!("upgrade_{version} statement skipped: {err} ({statement})");
            }
        }
    }

    fn execute_logged(conn: &Connection, sql: &str, values: &[&dyn ToSql]) -> Result<usize, StoreError> {
        match conn.execute(sql, params_from_iter(values.iter())) {
            Ok(changed) => Ok(changed),
            Err(err) => {
                error!("statement failed: {err} ({sql})");
                Err(err.into())
            }
        }
    }

    pub fn insert(
        &self,
        table: &str,
        columns: &[&str],
        values: &[&dyn ToSql],
        on_conflict: OnConflict,
    ) -> Result<(), StoreError> {
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT OR {} INTO {} ({}) VALUES ({})",
            on_conflict.as_sql(),
            table,
            columns.join(", "),
            placeholders
        );
        let conn = self.writer();
        Self::execute_logged(&conn, &sql, values).map(|_| ())
    }

    /// `INSERT ... ON CONFLICT(target) DO UPDATE`. The write strategy is
    /// chosen once at open time: on engines predating native upsert this
    /// reports failure instead of silently degrading to replace semantics.
    pub fn upsert(
        &self,
        table: &str,
        columns: &[&str],
        values: &[&dyn ToSql],
        conflict_target: &str,
        update_columns: &[&str],
    ) -> Result<(), StoreError> {
        if !self.upsert_supported {
            warn!("native upsert unavailable on sqlite {}", rusqlite::version());
            return Err(StoreError::UpsertUnsupported(
                rusqlite::version().to_string(),
            ));
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let assignments = update_columns
            .iter()
            .map(|column| format!("{column}=excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            table,
            columns.join(", "),
            placeholders,
            conflict_target,
            assignments
        );
        let conn = self.writer();
        Self::execute_logged(&conn, &sql, values).map(|_| ())
    }

    /// Insert-or-increment counters: one multi-row bound statement when the
    /// engine supports it, otherwise (or when the batch fails) a per-row
    /// update/insert loop. Both paths yield the same final aggregates.
    pub fn insert_or_increment(
        &self,
        table: &str,
        key_column: &str,
        value_column: &str,
        entries: &[(String, i64)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let conn = self.writer();
        if self.upsert_supported {
            match Self::increment_batch(&conn, table, key_column, value_column, entries) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("batch increment on {table} failed, using per-row fallback: {err}");
                }
            }
        }
        Self::increment_fallback(&conn, table, key_column, value_column, entries)
    }

    fn increment_batch(
        conn: &Connection,
        table: &str,
        key_column: &str,
        value_column: &str,
        entries: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let rows = vec!["(?, ?)"; entries.len()].join(", ");
        let sql = format!(
            "INSERT INTO {table} ({key_column}, {value_column}) VALUES {rows} \
             ON CONFLICT({key_column}) DO UPDATE SET {value_column} = {value_column} + excluded.{value_column}"
        );
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(entries.len() * 2);
        for (key, delta) in entries {
            values.push(key);
            values.push(delta);
        }
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn increment_fallback(
        conn: &Connection,
        table: &str,
        key_column: &str,
        value_column: &str,
        entries: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let update_sql =
            format!("UPDATE {table} SET {value_column} = {value_column} + ?1 WHERE {key_column} = ?2");
        let insert_sql =
            format!("INSERT OR IGNORE INTO {table} ({key_column}, {value_column}) VALUES (?1, ?2)");
        for (key, delta) in entries {
            let updated = Self::execute_logged(conn, &update_sql, &[delta, key])?;
            if updated == 0 {
                Self::execute_logged(conn, &insert_sql, &[key, delta])?;
            }
        }
        Ok(())
    }

    /// Deletes connection rows strictly older than `now - retention_days`,
    /// but only once the stored span (oldest to newest event) has reached the
    /// retention window.
    pub fn purge_older_than(&self, retention_days: i64) -> Result<PurgeOutcome, StoreError> {
        let conn = self.writer();
        let oldest = Self::bound_timestamp(&conn, "ASC")?;
        let newest = Self::bound_timestamp(&conn, "DESC")?;
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return Ok(PurgeOutcome::Skipped);
        };
        let span = newest.signed_duration_since(oldest);
        if span.num_days() < retention_days {
            return Ok(PurgeOutcome::Skipped);
        }
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let deleted = Self::execute_logged(
            &conn,
            "DELETE FROM connections WHERE time < ?1",
            &[&cutoff],
        )?;
        debug!("retention purge removed {deleted} connection rows");
        Ok(PurgeOutcome::Deleted(deleted))
    }

    fn bound_timestamp(conn: &Connection, order: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!("SELECT time FROM connections ORDER BY time {order} LIMIT 1");
        let raw: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        raw.map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|time| time.with_timezone(&Utc))
                .map_err(|err| StoreError::Timestamp(err.to_string()))
        })
        .transpose()
    }

    /// Deletes rows where `field` equals any of `values`, in one statement.
    /// An empty match set is a successful no-op.
    pub fn delete_by_field(
        &self,
        table: &str,
        field: &str,
        values: &[&str],
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!("DELETE FROM {table} WHERE {field} IN ({placeholders})");
        let conn = self.writer();
        match conn.execute(&sql, params_from_iter(values.iter())) {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("statement failed: {err} ({sql})");
                Err(err.into())
            }
        }
    }

    pub fn delete_rule(&self, name: &str, node: Option<&str>) -> Result<(), StoreError> {
        let conn = self.writer();
        match node {
            Some(node) => Self::execute_logged(
                &conn,
                "DELETE FROM rules WHERE name = ?1 AND node = ?2",
                &[&name, &node],
            ),
            None => Self::execute_logged(&conn, "DELETE FROM rules WHERE name = ?1", &[&name]),
        }
        .map(|_| ())
    }

    /// Drops the connection events a rule produced, leaving the rule itself.
    pub fn purge_rule_events(&self, rule_name: &str) -> Result<(), StoreError> {
        let conn = self.writer();
        Self::execute_logged(
            &conn,
            "DELETE FROM connections WHERE rule = ?1",
            &[&rule_name],
        )
        .map(|_| ())
    }

    pub fn clean(&self, table: &str) -> Result<(), StoreError> {
        let conn = self.writer();
        Self::execute_logged(&conn, &format!("DELETE FROM {table}"), &[]).map(|_| ())
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        conn.execute("VACUUM", [])?;
        Ok(())
    }

    pub fn optimize(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }

    pub fn insert_connection(&self, event: &ConnectionEvent) -> Result<(), StoreError> {
        let time = event.time.to_rfc3339();
        let action = event.action.as_str();
        self.insert(
            "connections",
            CONNECTION_COLUMNS,
            &[
                &time,
                &event.node,
                &action,
                &event.protocol,
                &event.src_ip,
                &event.src_port,
                &event.dst_ip,
                &event.dst_host,
                &event.dst_port,
                &event.uid,
                &event.pid,
                &event.process,
                &event.process_args,
                &event.process_cwd,
                &event.rule,
            ],
            OnConflict::Replace,
        )
    }

    pub fn insert_rule(&self, rule: &RuleRecord) -> Result<(), StoreError> {
        let time = rule.time.to_rfc3339();
        let action = rule.action.as_str();
        let enabled = bool_str(rule.enabled);
        let precedence = bool_str(rule.precedence);
        let sensitive = bool_str(rule.operator.sensitive);
        let nolog = bool_str(rule.nolog);
        self.insert(
            "rules",
            RULE_COLUMNS,
            &[
                &time,
                &rule.node,
                &rule.name,
                &enabled,
                &precedence,
                &action,
                &rule.duration,
                &rule.operator.kind,
                &sensitive,
                &rule.operator.operand,
                &rule.operator.data,
                &rule.description,
                &nolog,
            ],
            OnConflict::Ignore,
        )
    }

    pub fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let status = node.status.as_str();
        let last_connection = node.last_connection.to_rfc3339();
        self.upsert(
            "nodes",
            NODE_COLUMNS,
            &[
                &node.addr,
                &node.hostname,
                &node.daemon_version,
                &node.daemon_uptime,
                &node.daemon_rules,
                &node.cons,
                &node.cons_dropped,
                &node.version,
                &status,
                &last_connection,
            ],
            "addr",
            &NODE_COLUMNS[1..],
        )
    }

    pub fn increment_hits(
        &self,
        table: HitTable,
        entries: &[(String, i64)],
    ) -> Result<(), StoreError> {
        self.insert_or_increment(table.table_name(), "what", "hits", entries)
    }

    pub fn get_rule(
        &self,
        name: &str,
        node: Option<&str>,
    ) -> Result<Option<RuleRecord>, StoreError> {
        let fields = RULE_COLUMNS.join(", ");
        let conn = self.writer();
        let rule = match node {
            Some(node) => conn
                .query_row(
                    &format!("SELECT {fields} FROM rules WHERE name = ?1 AND node = ?2"),
                    params![name, node],
                    map_rule_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!("SELECT {fields} FROM rules WHERE name = ?1"),
                    params![name],
                    map_rule_row,
                )
                .optional()?,
        };
        Ok(rule)
    }

    pub fn get_rules(&self, node: &str) -> Result<Vec<RuleRecord>, StoreError> {
        let fields = RULE_COLUMNS.join(", ");
        let conn = self.writer();
        let mut statement = conn.prepare(&format!(
            "SELECT {fields} FROM rules WHERE node = ?1 ORDER BY name ASC"
        ))?;
        let rows = statement.query_map([node], map_rule_row)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    pub fn connection_count(&self) -> Result<i64, StoreError> {
        let conn = self.writer();
        Ok(conn.query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))?)
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn parse_bool(value: &str) -> bool {
    value == "true"
}

fn map_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRecord> {
    let time = parse_row_timestamp(row, 0)?;
    let action_raw: String = row.get(5)?;
    let action = action_raw.parse::<Action>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;

    Ok(RuleRecord {
        time,
        node: row.get(1)?,
        name: row.get(2)?,
        enabled: parse_bool(&row.get::<_, String>(3)?),
        precedence: parse_bool(&row.get::<_, String>(4)?),
        action,
        duration: row.get(6)?,
        operator: RuleOperator {
            kind: row.get(7)?,
            sensitive: parse_bool(&row.get::<_, String>(8)?),
            operand: row.get(9)?,
            data: row.get(10)?,
        },
        // pre-v1/v2 rows may hold NULL in the migrated columns
        description: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        nolog: row
            .get::<_, Option<String>>(12)?
            .map(|value| parse_bool(&value))
            .unwrap_or(false),
    })
}

fn parse_row_timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use conntrail_core::NodeStatus;
    use tempfile::tempdir;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        let base = Utc
            .with_ymd_and_hms(2026, 3, 5, 10, 0, 0)
            .single()
            .expect("valid timestamp");
        base + Duration::seconds(offset_secs)
    }

    fn sample_connection(index: usize, time: DateTime<Utc>) -> ConnectionEvent {
        ConnectionEvent {
            time,
            node: "127.0.0.1:50051".to_string(),
            action: Action::Allow,
            protocol: "tcp".to_string(),
            src_ip: "10.0.0.2".to_string(),
            src_port: format!("{}", 40_000 + index),
            dst_ip: "93.184.216.34".to_string(),
            dst_host: "example.org".to_string(),
            dst_port: "443".to_string(),
            uid: "1000".to_string(),
            pid: format!("{}", 2_000 + index),
            process: "/usr/bin/curl".to_string(),
            process_args: format!("curl https://example.org/{index}"),
            process_cwd: "/home/user".to_string(),
            rule: "allow-curl".to_string(),
        }
    }

    fn sample_rule(name: &str, node: &str) -> RuleRecord {
        RuleRecord {
            time: ts(0),
            node: node.to_string(),
            name: name.to_string(),
            enabled: true,
            precedence: false,
            action: Action::Allow,
            duration: "always".to_string(),
            operator: RuleOperator {
                kind: "simple".to_string(),
                sensitive: false,
                operand: "process.path".to_string(),
                data: "/usr/bin/curl".to_string(),
            },
            description: "allow curl".to_string(),
            nolog: false,
        }
    }

    fn sample_node(addr: &str) -> NodeRecord {
        NodeRecord {
            addr: addr.to_string(),
            hostname: "workstation".to_string(),
            daemon_version: "1.6.0".to_string(),
            daemon_uptime: "3600".to_string(),
            daemon_rules: 12,
            cons: 100,
            cons_dropped: 4,
            version: "0.1.0".to_string(),
            status: NodeStatus::Online,
            last_connection: ts(0),
        }
    }

    fn hits_of(store: &Store, table: HitTable) -> Vec<(String, i64)> {
        let conn = store.writer();
        let mut statement = conn
            .prepare(&format!(
                "SELECT what, hits FROM {} ORDER BY what",
                table.table_name()
            ))
            .expect("prepare");
        let rows = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .expect("query");
        rows.collect::<Result<Vec<_>, _>>().expect("collect")
    }

    #[test]
    fn open_in_memory_creates_schema_and_stamps_version() {
        let store = Store::in_memory().expect("open store");
        for table in [
            "connections",
            "rules",
            "hosts",
            "procs",
            "addrs",
            "ports",
            "users",
            "nodes",
        ] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn fresh_file_store_stamps_target_without_migrations() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        let store =
            Store::open(StoreTarget::File(path.clone()), SCHEMA_VERSION).expect("open store");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        store.close().expect("close");
    }

    #[test]
    fn migration_ladder_upgrades_old_schema_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        {
            let conn = Connection::open(&path).expect("raw open");
            conn.execute_batch(
                "CREATE TABLE rules (
                    time text, node text, name text, enabled text, precedence text,
                    action text, duration text, operator_type text, operator_sensitive text,
                    operator_operand text, operator_data text, UNIQUE(node, name));
                 INSERT INTO rules VALUES ('2026-03-05T10:00:00+00:00', 'n1', 'legacy-rule',
                    'true', 'false', 'deny', 'always', 'simple', 'false', 'process.path', '/bin/nc');",
            )
            .expect("create old schema");
            conn.execute("PRAGMA user_version = 0", []).expect("stamp");
            conn.close().map_err(|(_, err)| err).expect("close raw");
        }

        let store = Store::open(StoreTarget::File(path), SCHEMA_VERSION).expect("open store");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);

        let rule = store
            .get_rule("legacy-rule", Some("n1"))
            .expect("get rule")
            .expect("rule survives migration");
        assert_eq!(rule.action, Action::Deny);
        assert_eq!(rule.description, "");
        assert!(!rule.nolog);
    }

    #[test]
    fn migration_skips_failing_statement_and_still_advances() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        {
            // Full current schema but stamped v1: upgrade_2's ALTER will fail
            // on the already-present column and must be skipped.
            let conn = Connection::open(&path).expect("raw open");
            conn.execute_batch(CREATE_TABLES_SQL).expect("create");
            conn.execute("PRAGMA user_version = 1", []).expect("stamp");
            conn.close().map_err(|(_, err)| err).expect("close raw");
        }

        let store = Store::open(StoreTarget::File(path), SCHEMA_VERSION).expect("open store");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn reopening_at_target_version_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        {
            let store =
                Store::open(StoreTarget::File(path.clone()), SCHEMA_VERSION).expect("open store");
            for index in 0..3 {
                store
                    .insert_connection(&sample_connection(index, ts(index as i64)))
                    .expect("insert");
            }
            store.close().expect("close");
        }

        let store = Store::open(StoreTarget::File(path), SCHEMA_VERSION).expect("reopen store");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        assert_eq!(store.connection_count().expect("count"), 3);
    }

    #[test]
    fn newer_schema_than_target_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        {
            let conn = Connection::open(&path).expect("raw open");
            conn.execute("PRAGMA user_version = 99", []).expect("stamp");
            conn.close().map_err(|(_, err)| err).expect("close raw");
        }
        let err = Store::open(StoreTarget::File(path), SCHEMA_VERSION).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn duplicate_connection_identity_replaces_instead_of_growing() {
        let store = Store::in_memory().expect("open store");
        let event = sample_connection(1, ts(0));
        store.insert_connection(&event).expect("first insert");

        // same identity tuple, later time: OR REPLACE keeps one row
        let mut repeat = event.clone();
        repeat.time = ts(5);
        store.insert_connection(&repeat).expect("second insert");

        assert_eq!(store.connection_count().expect("count"), 1);
    }

    #[test]
    fn upsert_node_updates_in_place() {
        let store = Store::in_memory().expect("open store");
        assert!(store.upsert_supported());

        let mut node = sample_node("127.0.0.1:50051");
        store.upsert_node(&node).expect("first upsert");
        node.status = NodeStatus::Offline;
        node.cons = 250;
        store.upsert_node(&node).expect("second upsert");

        let conn = store.writer();
        let (count, status, cons): (i64, String, String) = conn
            .query_row(
                "SELECT COUNT(*), status, cons FROM nodes WHERE addr = ?1",
                ["127.0.0.1:50051"],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("node row");
        assert_eq!(count, 1);
        assert_eq!(status, "offline");
        assert_eq!(cons, "250");
    }

    #[test]
    fn increment_hits_accumulates_across_calls() {
        let store = Store::in_memory().expect("open store");
        store
            .increment_hits(
                HitTable::Hosts,
                &[("example.org".to_string(), 2), ("github.com".to_string(), 1)],
            )
            .expect("first batch");
        store
            .increment_hits(HitTable::Hosts, &[("example.org".to_string(), 3)])
            .expect("second batch");

        assert_eq!(
            hits_of(&store, HitTable::Hosts),
            vec![
                ("example.org".to_string(), 5),
                ("github.com".to_string(), 1)
            ]
        );
    }

    #[test]
    fn increment_fallback_matches_batch_aggregates() {
        let entries = vec![
            ("curl".to_string(), 2),
            ("firefox".to_string(), 1),
            ("curl".to_string(), 4),
        ];

        let batch_store = Store::in_memory().expect("open batch store");
        batch_store
            .increment_hits(HitTable::Procs, &entries)
            .expect("batch path");

        let fallback_store = Store::in_memory().expect("open fallback store");
        {
            let conn = fallback_store.writer();
            Store::increment_fallback(&conn, "procs", "what", "hits", &entries)
                .expect("fallback path");
        }

        assert_eq!(
            hits_of(&batch_store, HitTable::Procs),
            hits_of(&fallback_store, HitTable::Procs)
        );
    }

    #[test]
    fn purge_skips_when_store_is_empty() {
        let store = Store::in_memory().expect("open store");
        assert_eq!(
            store.purge_older_than(0).expect("purge"),
            PurgeOutcome::Skipped
        );
    }

    #[test]
    fn purge_skips_when_span_below_retention() {
        let store = Store::in_memory().expect("open store");
        let now = Utc::now();
        for index in 0..5 {
            store
                .insert_connection(&sample_connection(
                    index,
                    now - Duration::minutes(index as i64),
                ))
                .expect("insert");
        }
        assert_eq!(
            store.purge_older_than(30).expect("purge"),
            PurgeOutcome::Skipped
        );
        assert_eq!(store.connection_count().expect("count"), 5);
    }

    #[test]
    fn purge_deletes_only_rows_older_than_cutoff() {
        let store = Store::in_memory().expect("open store");
        let now = Utc::now();
        for index in 0..4 {
            store
                .insert_connection(&sample_connection(index, now - Duration::days(10)))
                .expect("insert old");
        }
        for index in 4..10 {
            store
                .insert_connection(&sample_connection(index, now - Duration::hours(1)))
                .expect("insert recent");
        }

        assert_eq!(
            store.purge_older_than(7).expect("purge"),
            PurgeOutcome::Deleted(4)
        );
        assert_eq!(store.connection_count().expect("count"), 6);
    }

    #[test]
    fn purge_with_zero_retention_drops_everything() {
        let store = Store::in_memory().expect("open store");
        let now = Utc::now();
        for index in 0..250 {
            store
                .insert_connection(&sample_connection(
                    index,
                    now - Duration::seconds(250 - index as i64),
                ))
                .expect("insert");
        }
        assert_eq!(store.connection_count().expect("count"), 250);

        assert_eq!(
            store.purge_older_than(0).expect("purge"),
            PurgeOutcome::Deleted(250)
        );
        assert_eq!(store.connection_count().expect("count"), 0);
    }

    #[test]
    fn delete_by_field_matches_any_value() {
        let store = Store::in_memory().expect("open store");
        store.insert_rule(&sample_rule("a", "n1")).expect("rule a");
        store.insert_rule(&sample_rule("b", "n1")).expect("rule b");
        store.insert_rule(&sample_rule("c", "n2")).expect("rule c");

        store
            .delete_by_field("rules", "name", &["a", "c"])
            .expect("delete");

        assert!(store.get_rule("a", None).expect("get a").is_none());
        assert!(store.get_rule("b", None).expect("get b").is_some());
        assert!(store.get_rule("c", None).expect("get c").is_none());
    }

    #[test]
    fn delete_by_field_with_no_values_is_a_noop() {
        let store = Store::in_memory().expect("open store");
        store.insert_rule(&sample_rule("a", "n1")).expect("rule a");
        store
            .delete_by_field("rules", "name", &[])
            .expect("empty delete");
        assert!(store.get_rule("a", None).expect("get a").is_some());
    }

    #[test]
    fn delete_rule_is_scoped_to_node_when_given() {
        let store = Store::in_memory().expect("open store");
        store.insert_rule(&sample_rule("shared", "n1")).expect("n1");
        store.insert_rule(&sample_rule("shared", "n2")).expect("n2");

        store
            .delete_rule("shared", Some("n1"))
            .expect("scoped delete");
        assert!(store.get_rules("n1").expect("n1 rules").is_empty());
        assert_eq!(store.get_rules("n2").expect("n2 rules").len(), 1);

        store.delete_rule("shared", None).expect("global delete");
        assert!(store.get_rules("n2").expect("n2 rules").is_empty());
    }

    #[test]
    fn purge_rule_events_drops_matching_connections_only() {
        let store = Store::in_memory().expect("open store");
        for index in 0..3 {
            let mut event = sample_connection(index, ts(index as i64));
            event.rule = "noisy-rule".to_string();
            store.insert_connection(&event).expect("insert noisy");
        }
        store
            .insert_connection(&sample_connection(10, ts(10)))
            .expect("insert other");

        store.purge_rule_events("noisy-rule").expect("purge rule");
        assert_eq!(store.connection_count().expect("count"), 1);
    }

    #[test]
    fn rule_roundtrip_preserves_fields_and_ignores_duplicates() {
        let store = Store::in_memory().expect("open store");
        let rule = sample_rule("allow-curl", "n1");
        store.insert_rule(&rule).expect("insert");

        // (node, name) identity: OR IGNORE keeps the first version
        let mut changed = rule.clone();
        changed.description = "changed".to_string();
        store.insert_rule(&changed).expect("duplicate insert");

        let loaded = store
            .get_rule("allow-curl", Some("n1"))
            .expect("get rule")
            .expect("rule present");
        assert_eq!(loaded, rule);

        let all = store.get_rules("n1").expect("get rules");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "allow-curl");
    }

    #[test]
    fn clean_truncates_a_table() {
        let store = Store::in_memory().expect("open store");
        for index in 0..5 {
            store
                .insert_connection(&sample_connection(index, ts(index as i64)))
                .expect("insert");
        }
        store.clean("connections").expect("clean");
        assert_eq!(store.connection_count().expect("count"), 0);
    }

    #[test]
    fn reader_sees_committed_writes() {
        let store = Store::in_memory().expect("open store");
        store
            .insert_connection(&sample_connection(0, ts(0)))
            .expect("insert");

        let reader = store.reader().expect("reader");
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))
            .expect("count via reader");
        assert_eq!(count, 1);
    }

    #[test]
    fn query_for_builds_select_text() {
        assert_eq!(
            Store::query_for("connections", "time, node"),
            "SELECT time, node FROM connections"
        );
    }
}
