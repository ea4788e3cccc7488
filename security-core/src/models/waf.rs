//! Firewall artifacts: block log and IP blacklist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Threat families, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    FileInclusion,
    CommandInjection,
    DangerousProtocol,
    BadBot,
    Blacklisted,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::Xss => "xss",
            ThreatKind::FileInclusion => "file_inclusion",
            ThreatKind::CommandInjection => "command_injection",
            ThreatKind::DangerousProtocol => "dangerous_protocol",
            ThreatKind::BadBot => "bad_bot",
            ThreatKind::Blacklisted => "blacklisted_ip",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WafLogEntry {
    pub threat: ThreatKind,
    /// Where the match was found, e.g. `uri`, `post:comment`, `header:referer`.
    pub source: String,
    pub ip_address: String,
    pub uri: String,
    pub method: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlacklistEntry {
    pub ip_address: String,
    pub reason: String,
    /// `None` = permanent.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IpBlacklistEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}
