//! Replication Events
//!
//! State changes reported by the replication subsystem, either parsed from
//! `drbdsetup events2` lines or synthesized from a status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::tree::volume::VolumeNumber;

// =============================================================================
// States
// =============================================================================

/// Role of a replicated resource on this node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRole {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

impl ReplicationRole {
    pub fn parse(value: &str) -> Self {
        match value {
            "Primary" => ReplicationRole::Primary,
            "Secondary" => ReplicationRole::Secondary,
            _ => ReplicationRole::Unknown,
        }
    }
}

/// Local disk state of one replicated volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    Diskless,
    Attaching,
    Detaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    Consistent,
    UpToDate,
    #[default]
    Unknown,
}

impl DiskState {
    pub fn parse(value: &str) -> Self {
        match value {
            "Diskless" => DiskState::Diskless,
            "Attaching" => DiskState::Attaching,
            "Detaching" => DiskState::Detaching,
            "Failed" => DiskState::Failed,
            "Negotiating" => DiskState::Negotiating,
            "Inconsistent" => DiskState::Inconsistent,
            "Outdated" => DiskState::Outdated,
            "Consistent" => DiskState::Consistent,
            "UpToDate" => DiskState::UpToDate,
            _ => DiskState::Unknown,
        }
    }
}

/// State of the connection to one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Connecting,
    Connected,
    #[default]
    Unknown,
}

impl ConnectionState {
    pub fn parse(value: &str) -> Self {
        match value {
            "StandAlone" => ConnectionState::StandAlone,
            "Disconnecting" => ConnectionState::Disconnecting,
            "Unconnected" => ConnectionState::Unconnected,
            "Connecting" => ConnectionState::Connecting,
            "Connected" => ConnectionState::Connected,
            _ => ConnectionState::Unknown,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// What changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationEventKind {
    /// Role or I/O suspension of the resource changed
    ResourceChanged {
        role: ReplicationRole,
        suspended: bool,
    },

    /// Local disk state of a volume changed
    DiskStateChanged {
        volume: VolumeNumber,
        disk_state: DiskState,
    },

    /// Connection to a peer changed
    ConnectionChanged {
        peer: String,
        state: ConnectionState,
    },

    /// The resource is no longer known to the kernel
    ResourceDestroyed,
}

/// One replication state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub resource: String,
    pub kind: ReplicationEventKind,
    pub timestamp: DateTime<Utc>,
}

impl ReplicationEvent {
    pub fn new(resource: impl Into<String>, kind: ReplicationEventKind) -> Self {
        Self {
            resource: resource.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Parse one line of `drbdsetup events2` output.
    ///
    /// Lines for objects or actions the engine does not track yield `None`.
    pub fn parse_events2(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace().peekable();
        // optional leading timestamp (--timestamps)
        if let Some(first) = tokens.peek() {
            if !is_action(first) {
                tokens.next();
            }
        }
        let action = tokens.next()?;
        if !is_action(action) {
            return None;
        }
        let object = tokens.next()?;
        let fields: HashMap<&str, &str> = tokens.filter_map(|t| t.split_once(':')).collect();
        let resource = fields.get("name")?.to_string();

        let kind = match (action, object) {
            ("destroy", "resource") => ReplicationEventKind::ResourceDestroyed,
            (_, "resource") => ReplicationEventKind::ResourceChanged {
                role: ReplicationRole::parse(fields.get("role").copied().unwrap_or_default()),
                suspended: fields.get("suspended").map_or(false, |s| *s != "no"),
            },
            ("destroy", _) => return None,
            (_, "device") => ReplicationEventKind::DiskStateChanged {
                volume: fields.get("volume")?.parse().ok()?,
                disk_state: DiskState::parse(fields.get("disk")?),
            },
            (_, "connection") => ReplicationEventKind::ConnectionChanged {
                peer: fields
                    .get("conn-name")
                    .or_else(|| fields.get("peer-node-id"))?
                    .to_string(),
                state: ConnectionState::parse(fields.get("connection")?),
            },
            _ => return None,
        };
        Some(Self::new(resource, kind))
    }
}

fn is_action(token: &str) -> bool {
    matches!(token, "exists" | "create" | "change" | "destroy")
}

impl fmt::Display for ReplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReplicationEventKind::ResourceChanged { role, suspended } => write!(
                f,
                "{}: role {:?}, suspended {}",
                self.resource, role, suspended
            ),
            ReplicationEventKind::DiskStateChanged { volume, disk_state } => {
                write!(f, "{}/{}: disk {:?}", self.resource, volume, disk_state)
            }
            ReplicationEventKind::ConnectionChanged { peer, state } => {
                write!(f, "{} -> {}: {:?}", self.resource, peer, state)
            }
            ReplicationEventKind::ResourceDestroyed => write!(f, "{}: destroyed", self.resource),
        }
    }
}
