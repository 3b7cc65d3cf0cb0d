use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod row;

pub use row::{KeyedRow, Row};

/// Verdict the daemon applied to a connection, or the verdict a rule carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Reject => "reject",
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::Deny
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            "reject" => Ok(Action::Reject),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// One connection event reported by a node's daemon. Identity is the full
/// tuple of fields minus `time` and `rule`; there is no synthetic key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub time: DateTime<Utc>,
    pub node: String,
    pub action: Action,
    pub protocol: String,
    pub src_ip: String,
    pub src_port: String,
    pub dst_ip: String,
    pub dst_host: String,
    pub dst_port: String,
    pub uid: String,
    pub pid: String,
    pub process: String,
    pub process_args: String,
    pub process_cwd: String,
    pub rule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOperator {
    pub kind: String,
    pub sensitive: bool,
    pub operand: String,
    pub data: String,
}

/// A rule as persisted per node; (node, name) is the unique identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub time: DateTime<Utc>,
    pub node: String,
    pub name: String,
    pub enabled: bool,
    pub precedence: bool,
    pub action: Action,
    pub duration: String,
    pub operator: RuleOperator,
    pub description: String,
    pub nolog: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// Liveness and bookkeeping for one daemon node, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub addr: String,
    pub hostname: String,
    pub daemon_version: String,
    pub daemon_uptime: String,
    pub daemon_rules: i64,
    pub cons: i64,
    pub cons_dropped: i64,
    pub version: String,
    pub status: NodeStatus,
    pub last_connection: DateTime<Utc>,
}
