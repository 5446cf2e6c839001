/// Slot table: which backend group owns each slot
///
/// Readers load an immutable [`SlotSnapshot`] without locking; writers build
/// a modified copy and swap it in, serialized by a writer mutex, so a reader
/// sees either the whole old table or the whole new one.
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::coordination::models::{GroupId, SlotAssignment, SlotStatus};
use crate::error::{ProxyError, ProxyResult};
use crate::utils::{crc32, extract_hash_tag};

/// Default number of slots
pub const DEFAULT_SLOT_COUNT: usize = 1024;

/// Slot index of `key` in a table of `slot_count` slots
pub fn slot_for_key(key: &[u8], slot_count: usize) -> usize {
    crc32(extract_hash_tag(key)) as usize % slot_count
}

/// Owner and migration status of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotOwner {
    pub group_id: GroupId,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate_from: Option<GroupId>,
}

impl SlotOwner {
    pub fn online(group_id: GroupId) -> Self {
        Self {
            group_id,
            status: SlotStatus::Online,
            migrate_from: None,
        }
    }

    /// Owner of a slot never assigned by the control plane
    pub fn unassigned() -> Self {
        Self {
            group_id: 0,
            status: SlotStatus::Offline,
            migrate_from: None,
        }
    }
}

impl From<&SlotAssignment> for SlotOwner {
    fn from(a: &SlotAssignment) -> Self {
        Self {
            group_id: a.group_id,
            status: a.status,
            migrate_from: a.migrate_from,
        }
    }
}

/// Represents a contiguous range of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotRange {
    pub start: usize,
    pub end: usize,
}

impl SlotRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Coverage statistics
#[derive(Debug, Clone, Serialize)]
pub struct SlotCoverage {
    pub total_slots: usize,
    pub online_slots: usize,
    pub migrating_slots: usize,
    pub offline_slots: usize,
    pub group_distribution: BTreeMap<GroupId, usize>,
}

/// Immutable view of the whole table
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    owners: Vec<SlotOwner>,
    version: u64,
}

impl SlotSnapshot {
    pub fn owner(&self, slot: usize) -> ProxyResult<SlotOwner> {
        self.owners.get(slot).copied().ok_or(ProxyError::InvalidSlot {
            slot,
            slot_count: self.owners.len(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.owners.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Runs of consecutive slots with the same owner
    pub fn ranges(&self) -> Vec<(SlotRange, SlotOwner)> {
        let mut ranges: Vec<(SlotRange, SlotOwner)> = Vec::new();
        for (slot, owner) in self.owners.iter().enumerate() {
            match ranges.last_mut() {
                Some((range, current)) if current == owner => range.end = slot,
                _ => ranges.push((SlotRange::new(slot, slot), *owner)),
            }
        }
        ranges
    }

    pub fn coverage(&self) -> SlotCoverage {
        let mut coverage = SlotCoverage {
            total_slots: self.owners.len(),
            online_slots: 0,
            migrating_slots: 0,
            offline_slots: 0,
            group_distribution: BTreeMap::new(),
        };
        for owner in &self.owners {
            match owner.status {
                SlotStatus::Online => coverage.online_slots += 1,
                SlotStatus::PreMigrate | SlotStatus::Migrating => coverage.migrating_slots += 1,
                SlotStatus::Offline => {
                    coverage.offline_slots += 1;
                    continue;
                }
            }
            *coverage.group_distribution.entry(owner.group_id).or_insert(0) += 1;
        }
        coverage
    }
}

pub struct SlotTable {
    current: ArcSwap<SlotSnapshot>,
    writer: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl SlotTable {
    /// Empty table: every slot unassigned until the first rebuild
    pub fn new(slot_count: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(SlotSnapshot {
                owners: vec![SlotOwner::unassigned(); slot_count],
                version: 0,
            }),
            writer: Mutex::new(()),
            changes,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.current.load().owners.len()
    }

    pub fn slot_for_key(&self, key: &[u8]) -> usize {
        slot_for_key(key, self.slot_count())
    }

    pub fn owner(&self, slot: usize) -> ProxyResult<SlotOwner> {
        self.current.load().owner(slot)
    }

    pub fn snapshot(&self) -> Arc<SlotSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Notified with the new version after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn coverage(&self) -> SlotCoverage {
        self.current.load().coverage()
    }

    /// Replace the whole table
    ///
    /// Slots missing from `assignments` become unassigned.
    pub fn rebuild(&self, assignments: &[SlotAssignment]) -> ProxyResult<()> {
        let _guard = self.writer.lock();
        let current = self.current.load();
        let slot_count = current.owners.len();

        let mut owners = vec![SlotOwner::unassigned(); slot_count];
        for assignment in assignments {
            let owner = owners.get_mut(assignment.slot).ok_or(ProxyError::InvalidSlot {
                slot: assignment.slot,
                slot_count,
            })?;
            *owner = SlotOwner::from(assignment);
        }

        let version = current.version + 1;
        self.current.store(Arc::new(SlotSnapshot { owners, version }));
        self.changes.send_replace(version);
        debug!(version, slot_count, "Slot table rebuilt");
        Ok(())
    }

    /// Set `lo..=hi` to `owner`; returns whether any slot changed
    pub fn apply_range_update(&self, lo: usize, hi: usize, owner: SlotOwner) -> ProxyResult<bool> {
        let _guard = self.writer.lock();
        let current = self.current.load();
        let slot_count = current.owners.len();
        if lo > hi || hi >= slot_count {
            return Err(ProxyError::InvalidSlot {
                slot: if lo >= slot_count { lo } else { hi },
                slot_count,
            });
        }
        if current.owners[lo..=hi].iter().all(|o| *o == owner) {
            return Ok(false);
        }

        let mut owners = current.owners.clone();
        owners[lo..=hi].fill(owner);
        let version = current.version + 1;
        self.current.store(Arc::new(SlotSnapshot { owners, version }));
        self.changes.send_replace(version);
        debug!(
            lo,
            hi,
            group_id = owner.group_id,
            status = ?owner.status,
            version,
            "Slot range updated"
        );
        Ok(true)
    }

    pub fn apply_assignment(&self, assignment: &SlotAssignment) -> ProxyResult<bool> {
        self.apply_range_update(assignment.slot, assignment.slot, SlotOwner::from(assignment))
    }
}
