/// Records exchanged with the coordination service
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

pub type GroupId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    Replica,
}

/// One backend server of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendServer {
    pub addr: String,
    pub role: ServerRole,
}

impl BackendServer {
    pub fn master<S: Into<String>>(addr: S) -> Self {
        Self {
            addr: addr.into(),
            role: ServerRole::Master,
        }
    }

    pub fn replica<S: Into<String>>(addr: S) -> Self {
        Self {
            addr: addr.into(),
            role: ServerRole::Replica,
        }
    }
}

/// A shard: an ordered set of servers, masters serving traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: GroupId,
    pub servers: Vec<BackendServer>,
}

impl ServerGroup {
    pub fn new(id: GroupId, servers: Vec<BackendServer>) -> Self {
        Self { id, servers }
    }

    /// Master addresses in group order
    pub fn masters(&self) -> impl Iterator<Item = &str> {
        self.servers
            .iter()
            .filter(|s| s.role == ServerRole::Master)
            .map(|s| s.addr.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Online,
    PreMigrate,
    Migrating,
    Offline,
}

/// Owner of a single slot as published by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub slot: usize,
    pub group_id: GroupId,
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_from: Option<GroupId>,
}

impl SlotAssignment {
    pub fn online(slot: usize, group_id: GroupId) -> Self {
        Self {
            slot,
            group_id,
            status: SlotStatus::Online,
            migrate_from: None,
        }
    }
}

/// A contiguous slot range bound to a group, as written in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRangeAssignment {
    pub lo: usize,
    pub hi: usize,
    pub group_id: GroupId,
}

/// Full cluster view read during a resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub slot_count: usize,
    pub groups: Vec<ServerGroup>,
    pub slots: Vec<SlotAssignment>,
}

impl TopologySnapshot {
    /// Build a snapshot from range assignments; every slot must be covered
    /// exactly once by a range naming a known group
    pub fn from_ranges(
        slot_count: usize,
        groups: Vec<ServerGroup>,
        ranges: &[SlotRangeAssignment],
    ) -> ProxyResult<Self> {
        let mut owners: Vec<Option<GroupId>> = vec![None; slot_count];
        for range in ranges {
            if range.lo > range.hi || range.hi >= slot_count {
                return Err(ProxyError::InvalidSlot {
                    slot: range.hi,
                    slot_count,
                });
            }
            if !groups.iter().any(|g| g.id == range.group_id) {
                return Err(ProxyError::internal(format!(
                    "slot range {}-{} names unknown group {}",
                    range.lo, range.hi, range.group_id
                )));
            }
            for owner in &mut owners[range.lo..=range.hi] {
                if owner.is_some() {
                    return Err(ProxyError::internal(format!(
                        "slot range {}-{} overlaps another range",
                        range.lo, range.hi
                    )));
                }
                *owner = Some(range.group_id);
            }
        }

        let mut slots = Vec::with_capacity(slot_count);
        for (slot, owner) in owners.into_iter().enumerate() {
            match owner {
                Some(group_id) => slots.push(SlotAssignment::online(slot, group_id)),
                None => {
                    return Err(ProxyError::internal(format!(
                        "slot {} is not assigned to any group",
                        slot
                    )))
                }
            }
        }

        Ok(Self {
            slot_count,
            groups,
            slots,
        })
    }

    /// Split `slot_count` slots evenly over `groups`, in order
    pub fn evenly_split(slot_count: usize, groups: Vec<ServerGroup>) -> ProxyResult<Self> {
        if groups.is_empty() {
            return Err(ProxyError::internal("no server groups"));
        }
        let per_group = slot_count.div_ceil(groups.len());
        let ranges: Vec<SlotRangeAssignment> = groups
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                let lo = i * per_group;
                if lo >= slot_count {
                    return None;
                }
                Some(SlotRangeAssignment {
                    lo,
                    hi: ((i + 1) * per_group).min(slot_count) - 1,
                    group_id: g.id,
                })
            })
            .collect();
        Self::from_ranges(slot_count, groups, &ranges)
    }

    pub fn group(&self, id: GroupId) -> Option<&ServerGroup> {
        self.groups.iter().find(|g| g.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Registering,
    Online,
    MarkOffline,
    Offline,
}

impl ProxyState {
    /// Whether the proxy should accept new client connections
    pub fn accepts_clients(self) -> bool {
        self == ProxyState::Online
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::Registering => "registering",
            ProxyState::Online => "online",
            ProxyState::MarkOffline => "mark_offline",
            ProxyState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The proxy's registration in the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub addr: String,
    pub admin_addr: String,
    pub state: ProxyState,
    pub pid: u32,
    /// Start time, milliseconds since the Unix epoch
    pub start_at: u64,
}

/// One entry of the append-only action log
///
/// The payload is kept raw so that entries this proxy cannot decode can be
/// skipped without stalling the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub seq: u64,
    pub payload: String,
}

/// Decoded action log payloads
///
/// Every action is either absolute or a request to re-read authoritative
/// state, so applying an entry twice has the same effect as once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Re-read the assignment of one slot
    SlotChanged { slot: usize },
    /// Bind a contiguous range to a group
    SlotRangeSet {
        lo: usize,
        hi: usize,
        group_id: GroupId,
        status: SlotStatus,
    },
    /// Slot starts moving from `from` to `to`
    SlotMigrate {
        slot: usize,
        from: GroupId,
        to: GroupId,
    },
    /// Re-read a server group (created, changed or removed)
    GroupChanged { group_id: GroupId },
}

impl ActionLogEntry {
    pub fn new(seq: u64, action: &Action) -> ProxyResult<Self> {
        let payload = serde_json::to_string(action)
            .map_err(|e| ProxyError::internal(format!("encode action: {}", e)))?;
        Ok(Self { seq, payload })
    }

    pub fn decode(&self) -> ProxyResult<Action> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ProxyError::invalid_action(self.seq, e.to_string()))
    }
}
