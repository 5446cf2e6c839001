/// Interface to the external coordination service
///
/// The proxy never trusts a watch notification's content: a watch only says
/// "something under this path changed" (possibly more than once), and the
/// caller re-reads the authoritative state.
pub mod memory;
pub mod models;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{ProxyError, ProxyResult};

pub use memory::MemoryStore;
pub use models::{
    Action, ActionLogEntry, BackendServer, GroupId, ProxyRecord, ProxyState, ServerGroup,
    ServerRole, SlotAssignment, SlotRangeAssignment, SlotStatus, TopologySnapshot,
};

/// Paths a proxy watches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchPath {
    ProxyRecord(String),
    ActionLog,
}

/// Subscription to change notifications on one path
///
/// Notifications coalesce; `changed` resolves at least once after every
/// change. It fails with `CoordinationUnavailable` when the watch is lost
/// (session expiry, connection drop), after which the caller must resync
/// and watch again.
#[derive(Debug)]
pub struct Watcher {
    rx: watch::Receiver<u64>,
}

impl Watcher {
    pub fn new(rx: watch::Receiver<u64>) -> Self {
        Self { rx }
    }

    pub async fn changed(&mut self) -> ProxyResult<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| ProxyError::coordination("watch lost"))
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get_proxy_record(&self, proxy_id: &str) -> ProxyResult<Option<ProxyRecord>>;
    async fn put_proxy_record(&self, record: &ProxyRecord) -> ProxyResult<()>;

    /// Groups and every slot assignment, read consistently
    async fn topology(&self) -> ProxyResult<TopologySnapshot>;
    async fn slot(&self, slot: usize) -> ProxyResult<SlotAssignment>;
    async fn server_group(&self, group_id: GroupId) -> ProxyResult<Option<ServerGroup>>;

    /// Sequence number of the newest action log entry (0 when empty)
    async fn latest_action_seq(&self) -> ProxyResult<u64>;
    /// Entries with `seq > cursor`, in log order
    async fn actions_after(&self, cursor: u64) -> ProxyResult<Vec<ActionLogEntry>>;
    async fn ack_action(&self, seq: u64, proxy_id: &str) -> ProxyResult<()>;

    async fn load_cursor(&self, proxy_id: &str) -> ProxyResult<u64>;
    async fn store_cursor(&self, proxy_id: &str, cursor: u64) -> ProxyResult<()>;

    async fn watch(&self, path: WatchPath) -> ProxyResult<Watcher>;
}
