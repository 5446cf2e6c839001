/// In-process coordination store
///
/// Backs the embedded standalone mode and the test suites. It keeps the
/// same contract as a remote store, including watch loss and outages,
/// which can be injected with [`MemoryStore::expire_watches`] and
/// [`MemoryStore::set_available`].
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::models::{
    Action, ActionLogEntry, GroupId, ProxyRecord, ProxyState, ServerGroup, SlotAssignment,
    SlotStatus, TopologySnapshot,
};
use super::{CoordinationStore, WatchPath, Watcher};
use crate::error::{ProxyError, ProxyResult};

struct Inner {
    topology: TopologySnapshot,
    proxies: HashMap<String, ProxyRecord>,
    actions: Vec<ActionLogEntry>,
    cursors: HashMap<String, u64>,
    acks: BTreeMap<u64, Vec<String>>,
    watches: HashMap<WatchPath, watch::Sender<u64>>,
}

impl Inner {
    fn notify(&mut self, path: WatchPath) {
        if let Some(tx) = self.watches.get(&path) {
            tx.send_modify(|version| *version += 1);
        }
    }

    fn next_seq(&self) -> u64 {
        self.actions.last().map(|e| e.seq).unwrap_or(0) + 1
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(topology: TopologySnapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                topology,
                proxies: HashMap::new(),
                actions: Vec::new(),
                cursors: HashMap::new(),
                acks: BTreeMap::new(),
                watches: HashMap::new(),
            }),
            available: AtomicBool::new(true),
        }
    }

    fn check_available(&self) -> ProxyResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProxyError::coordination("memory store unavailable"))
        }
    }

    /// Simulate an outage; every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Drop every active watch, as a session expiry would
    pub fn expire_watches(&self) {
        let mut inner = self.inner.lock();
        debug!(count = inner.watches.len(), "Expiring watches");
        inner.watches.clear();
    }

    /// Control-plane write of a proxy's state
    pub fn set_proxy_state(&self, proxy_id: &str, state: ProxyState) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .proxies
            .get_mut(proxy_id)
            .ok_or_else(|| ProxyError::coordination(format!("proxy {} not registered", proxy_id)))?;
        record.state = state;
        inner.notify(WatchPath::ProxyRecord(proxy_id.to_string()));
        Ok(())
    }

    pub fn append_action(&self, action: &Action) -> ProxyResult<u64> {
        let mut inner = self.inner.lock();
        let entry = ActionLogEntry::new(inner.next_seq(), action)?;
        let seq = entry.seq;
        inner.actions.push(entry);
        inner.notify(WatchPath::ActionLog);
        Ok(seq)
    }

    /// Append an entry with an arbitrary payload, decodable or not
    pub fn append_raw<S: Into<String>>(&self, payload: S) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        inner.actions.push(ActionLogEntry {
            seq,
            payload: payload.into(),
        });
        inner.notify(WatchPath::ActionLog);
        seq
    }

    /// Rewrite the assignment of `lo..=hi` without logging an action
    pub fn assign_slots(
        &self,
        lo: usize,
        hi: usize,
        group_id: GroupId,
        status: SlotStatus,
        migrate_from: Option<GroupId>,
    ) -> ProxyResult<()> {
        let mut inner = self.inner.lock();
        let slot_count = inner.topology.slot_count;
        if lo > hi || hi >= slot_count {
            return Err(ProxyError::InvalidSlot { slot: hi, slot_count });
        }
        for slot in lo..=hi {
            inner.topology.slots[slot] = SlotAssignment {
                slot,
                group_id,
                status,
                migrate_from,
            };
        }
        Ok(())
    }

    pub fn upsert_group(&self, group: ServerGroup) {
        let mut inner = self.inner.lock();
        let groups = &mut inner.topology.groups;
        match groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = group,
            None => groups.push(group),
        }
    }

    pub fn remove_group(&self, group_id: GroupId) {
        self.inner.lock().topology.groups.retain(|g| g.id != group_id);
    }

    /// Proxies that acknowledged entry `seq`
    pub fn acks(&self, seq: u64) -> Vec<String> {
        self.inner.lock().acks.get(&seq).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_proxy_record(&self, proxy_id: &str) -> ProxyResult<Option<ProxyRecord>> {
        self.check_available()?;
        Ok(self.inner.lock().proxies.get(proxy_id).cloned())
    }

    async fn put_proxy_record(&self, record: &ProxyRecord) -> ProxyResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.proxies.insert(record.id.clone(), record.clone());
        inner.notify(WatchPath::ProxyRecord(record.id.clone()));
        Ok(())
    }

    async fn topology(&self) -> ProxyResult<TopologySnapshot> {
        self.check_available()?;
        Ok(self.inner.lock().topology.clone())
    }

    async fn slot(&self, slot: usize) -> ProxyResult<SlotAssignment> {
        self.check_available()?;
        let inner = self.inner.lock();
        inner
            .topology
            .slots
            .get(slot)
            .copied()
            .ok_or(ProxyError::InvalidSlot {
                slot,
                slot_count: inner.topology.slot_count,
            })
    }

    async fn server_group(&self, group_id: GroupId) -> ProxyResult<Option<ServerGroup>> {
        self.check_available()?;
        Ok(self.inner.lock().topology.group(group_id).cloned())
    }

    async fn latest_action_seq(&self) -> ProxyResult<u64> {
        self.check_available()?;
        Ok(self.inner.lock().actions.last().map(|e| e.seq).unwrap_or(0))
    }

    async fn actions_after(&self, cursor: u64) -> ProxyResult<Vec<ActionLogEntry>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .actions
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect())
    }

    async fn ack_action(&self, seq: u64, proxy_id: &str) -> ProxyResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let acked = inner.acks.entry(seq).or_default();
        if !acked.iter().any(|p| p == proxy_id) {
            acked.push(proxy_id.to_string());
        }
        Ok(())
    }

    async fn load_cursor(&self, proxy_id: &str) -> ProxyResult<u64> {
        self.check_available()?;
        Ok(self.inner.lock().cursors.get(proxy_id).copied().unwrap_or(0))
    }

    async fn store_cursor(&self, proxy_id: &str, cursor: u64) -> ProxyResult<()> {
        self.check_available()?;
        self.inner.lock().cursors.insert(proxy_id.to_string(), cursor);
        Ok(())
    }

    async fn watch(&self, path: WatchPath) -> ProxyResult<Watcher> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let tx = inner
            .watches
            .entry(path)
            .or_insert_with(|| watch::channel(0).0);
        Ok(Watcher::new(tx.subscribe()))
    }
}
