/// Proxy lifecycle against the coordination service
///
/// ```text
/// registering --(own write or control plane)--> online
/// online --(control plane writes mark_offline)--> mark_offline
/// mark_offline --(drain grace elapses)--> offline  => termination fires once
/// ```
///
/// The coordinator is the only writer of the local proxy state; everything
/// else observes it through [`LifecycleCoordinator::subscribe_state`]. Two
/// watch tasks keep the local view current: one on the proxy record, one on
/// the action log. Either resyncs the full topology after losing its watch.
pub mod backoff;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::coordination::models::{
    Action, ActionLogEntry, GroupId, ProxyRecord, ProxyState, SlotStatus,
};
use crate::coordination::{CoordinationStore, WatchPath};
use crate::error::{ProxyError, ProxyResult};
use crate::pool::PoolRegistry;
use crate::slots::{SlotOwner, SlotTable};
use crate::stats::ProxyStats;
use crate::utils::unix_millis;

pub use backoff::BackoffPolicy;

const OFFLINE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub proxy_id: String,
    /// Client address published in the proxy record
    pub addr: String,
    pub admin_addr: String,
    /// Write `online` after the initial resync instead of waiting for the
    /// control plane to do it
    pub auto_online: bool,
    pub drain_grace: Duration,
    pub backoff: BackoffPolicy,
}

/// Why the proxy reached offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Drain grace elapsed after mark-offline
    Drained,
    /// The control plane wrote `offline` directly
    SetOffline,
}

/// Owned by the composition root; yields the termination event
pub struct LifecycleHandle {
    termination: oneshot::Receiver<TerminationReason>,
    task: JoinHandle<()>,
}

impl LifecycleHandle {
    /// Resolves when the proxy goes offline; `None` if the coordinator went
    /// away without terminating
    pub async fn terminated(&mut self) -> Option<TerminationReason> {
        (&mut self.termination).await.ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct LifecycleCoordinator {
    config: LifecycleConfig,
    store: Arc<dyn CoordinationStore>,
    slots: Arc<SlotTable>,
    pools: Arc<PoolRegistry>,
    stats: Arc<ProxyStats>,
    state: watch::Sender<ProxyState>,
    /// Action log cursor; held while applying entries or resyncing
    cursor: Mutex<u64>,
    termination: parking_lot::Mutex<Option<oneshot::Sender<TerminationReason>>>,
    started: AtomicBool,
    draining: AtomicBool,
    started_at: u64,
}

impl LifecycleCoordinator {
    pub fn new(
        config: LifecycleConfig,
        store: Arc<dyn CoordinationStore>,
        slots: Arc<SlotTable>,
        pools: Arc<PoolRegistry>,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ProxyState::Registering);
        Arc::new(Self {
            config,
            store,
            slots,
            pools,
            stats,
            state,
            cursor: Mutex::new(0),
            termination: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            started_at: unix_millis(),
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.config.proxy_id
    }

    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    pub async fn cursor(&self) -> u64 {
        *self.cursor.lock().await
    }

    /// Register and start the watch tasks; may be called once
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> ProxyResult<LifecycleHandle> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::internal("lifecycle already started"));
        }
        let (tx, rx) = oneshot::channel();
        *self.termination.lock() = Some(tx);

        let span = info_span!("lifecycle", proxy_id = %self.config.proxy_id);
        let task = tokio::spawn(Arc::clone(self).run(shutdown).instrument(span));
        Ok(LifecycleHandle {
            termination: rx,
            task,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.register(&mut shutdown).await {
            return;
        }
        let proxy_watch = tokio::spawn(
            Arc::clone(&self)
                .proxy_watch_loop(shutdown.clone())
                .in_current_span(),
        );
        let action_watch = tokio::spawn(
            Arc::clone(&self)
                .action_watch_loop(shutdown.clone())
                .in_current_span(),
        );
        let _ = tokio::join!(proxy_watch, action_watch);
        debug!("Lifecycle watch tasks finished");
    }

    /// Retry registration until it succeeds; false on shutdown
    async fn register(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.try_register().await {
                Ok(()) => {
                    info!(state = %self.state(), "Proxy registered");
                    return true;
                }
                Err(e) => {
                    log_retry("Registration failed", &e, attempt);
                    if !self.backoff(attempt, shutdown).await {
                        return false;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn try_register(&self) -> ProxyResult<()> {
        self.put_record(ProxyState::Registering).await?;
        let persisted = self.store.load_cursor(&self.config.proxy_id).await?;
        {
            let mut cursor = self.cursor.lock().await;
            *cursor = (*cursor).max(persisted);
        }
        self.resync().await?;
        if self.config.auto_online {
            self.put_record(ProxyState::Online).await?;
            self.transition(ProxyState::Online);
        }
        Ok(())
    }

    /// Rebuild pools and the slot table from a full topology read
    ///
    /// Entries up to the log head read before the topology are reflected in
    /// it, so the cursor jumps there. Each skipped entry is still acked.
    pub async fn resync(&self) -> ProxyResult<u64> {
        let mut cursor = self.cursor.lock().await;
        let head = self.store.latest_action_seq().await?;
        let topology = self.store.topology().await?;
        if topology.slot_count != self.slots.slot_count() {
            return Err(ProxyError::coordination(format!(
                "topology has {} slots, proxy is configured for {}",
                topology.slot_count,
                self.slots.slot_count()
            )));
        }

        self.pools.reconcile(&topology.groups);
        self.slots.rebuild(&topology.slots)?;
        if head > *cursor {
            for entry in self.store.actions_after(*cursor).await? {
                if entry.seq > head {
                    break;
                }
                self.store.ack_action(entry.seq, &self.config.proxy_id).await?;
            }
            self.store.store_cursor(&self.config.proxy_id, head).await?;
            *cursor = head;
        }
        info!(
            groups = topology.groups.len(),
            version = self.slots.version(),
            cursor = *cursor,
            "Full resync complete"
        );
        Ok(*cursor)
    }

    /// Operator-initiated drain (signal or admin `OFFLINE`)
    ///
    /// Publishes `mark_offline` and starts draining locally even when the
    /// write fails, so a partitioned proxy can still be stopped.
    pub async fn request_offline(self: &Arc<Self>) -> ProxyResult<()> {
        info!("Requesting mark-offline");
        let published = self.put_record(ProxyState::MarkOffline).await;
        self.begin_drain();
        published
    }

    async fn put_record(&self, state: ProxyState) -> ProxyResult<()> {
        let record = ProxyRecord {
            id: self.config.proxy_id.clone(),
            addr: self.config.addr.clone(),
            admin_addr: self.config.admin_addr.clone(),
            state,
            pid: std::process::id(),
            start_at: self.started_at,
        };
        self.store.put_proxy_record(&record).await
    }

    /// Single writer of the local state; offline is terminal
    fn transition(&self, next: ProxyState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ProxyState::Offline {
                return false;
            }
            info!(from = %current, to = %next, "Proxy state changed");
            *current = next;
            true
        })
    }

    async fn backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.backoff.delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = shutdown.changed() => !(changed.is_err() || *shutdown.borrow()),
        }
    }

    async fn proxy_watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let path = WatchPath::ProxyRecord(self.config.proxy_id.clone());
        let mut attempt = 0u32;
        let mut lost = false;
        loop {
            match self.watch_proxy_record(&path, &mut shutdown, &mut attempt, &mut lost).await {
                Ok(()) => return,
                Err(e) => {
                    lost = true;
                    log_retry("Proxy record watch failed", &e, attempt);
                    if !self.backoff(attempt, &mut shutdown).await {
                        return;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn watch_proxy_record(
        self: &Arc<Self>,
        path: &WatchPath,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
        lost: &mut bool,
    ) -> ProxyResult<()> {
        let mut watcher = self.store.watch(path.clone()).await?;
        if *lost {
            self.resync().await?;
            *lost = false;
        }
        self.refresh_state().await?;
        *attempt = 0;

        loop {
            if self.state() == ProxyState::Offline {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                changed = watcher.changed() => {
                    changed?;
                    self.refresh_state().await?;
                }
            }
        }
    }

    /// Re-read the proxy record and follow control-plane transitions
    async fn refresh_state(self: &Arc<Self>) -> ProxyResult<()> {
        let record = match self.store.get_proxy_record(&self.config.proxy_id).await? {
            Some(record) => record,
            None => {
                warn!("Proxy record missing from coordination service");
                return Ok(());
            }
        };
        match (self.state(), record.state) {
            (ProxyState::Registering, ProxyState::Online) => {
                self.transition(ProxyState::Online);
            }
            (ProxyState::Registering | ProxyState::Online, ProxyState::MarkOffline) => {
                self.begin_drain();
            }
            (current, ProxyState::Offline) if current != ProxyState::Offline => {
                self.go_offline(TerminationReason::SetOffline).await;
            }
            _ => {}
        }
        Ok(())
    }

    fn begin_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transition(ProxyState::MarkOffline);
        let grace = self.config.drain_grace;
        info!(grace_ms = grace.as_millis() as u64, "Marked offline, draining");

        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::time::sleep(grace).await;
                this.go_offline(TerminationReason::Drained).await;
            }
            .in_current_span(),
        );
    }

    async fn go_offline(&self, reason: TerminationReason) {
        if !self.transition(ProxyState::Offline) {
            return;
        }
        match tokio::time::timeout(OFFLINE_WRITE_TIMEOUT, self.put_record(ProxyState::Offline)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to publish offline state"),
            Err(_) => warn!("Timed out publishing offline state"),
        }
        self.fire_termination(reason);
    }

    fn fire_termination(&self, reason: TerminationReason) {
        if let Some(tx) = self.termination.lock().take() {
            info!(?reason, "Proxy offline, requesting termination");
            let _ = tx.send(reason);
        }
    }

    async fn action_watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        let mut lost = false;
        loop {
            match self.watch_actions(&mut shutdown, &mut attempt, &mut lost).await {
                Ok(()) => return,
                Err(e) => {
                    lost = true;
                    log_retry("Action log watch failed", &e, attempt);
                    if !self.backoff(attempt, &mut shutdown).await {
                        return;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn watch_actions(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
        lost: &mut bool,
    ) -> ProxyResult<()> {
        let mut watcher = self.store.watch(WatchPath::ActionLog).await?;
        if *lost {
            self.resync().await?;
            *lost = false;
        }
        self.drain_actions().await?;
        *attempt = 0;

        loop {
            if self.state() == ProxyState::Offline {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                changed = watcher.changed() => {
                    changed?;
                    self.drain_actions().await?;
                }
            }
        }
    }

    /// Apply every entry past the cursor, in log order
    ///
    /// Entries that cannot be decoded or applied are skipped; the cursor
    /// still moves past them. Coordination failures stop the drain with the
    /// cursor at the last entry handled.
    pub async fn drain_actions(&self) -> ProxyResult<usize> {
        let mut cursor = self.cursor.lock().await;
        let entries = self.store.actions_after(*cursor).await?;
        let mut applied = 0;

        for entry in entries {
            if entry.seq <= *cursor {
                continue;
            }
            match self.apply_entry(&entry).await {
                Ok(()) => {
                    applied += 1;
                    self.stats.action_applied();
                    debug!(seq = entry.seq, "Action applied");
                }
                Err(e @ ProxyError::InvalidActionLogEntry { .. }) => {
                    self.stats.action_skipped();
                    warn!(seq = entry.seq, error = %e, "Skipping action log entry");
                }
                Err(e) => return Err(e),
            }
            self.store.ack_action(entry.seq, &self.config.proxy_id).await?;
            self.store.store_cursor(&self.config.proxy_id, entry.seq).await?;
            *cursor = entry.seq;
        }
        Ok(applied)
    }

    async fn apply_entry(&self, entry: &ActionLogEntry) -> ProxyResult<()> {
        let seq = entry.seq;
        let invalid = |e: ProxyError| match e {
            ProxyError::InvalidSlot { .. } => ProxyError::invalid_action(seq, e.to_string()),
            other => other,
        };

        match entry.decode()? {
            Action::SlotChanged { slot } => {
                let assignment = self.store.slot(slot).await.map_err(invalid)?;
                if assignment.status != SlotStatus::Offline {
                    self.ensure_group(seq, assignment.group_id).await?;
                }
                self.slots.apply_assignment(&assignment).map_err(invalid)?;
            }
            Action::SlotRangeSet {
                lo,
                hi,
                group_id,
                status,
            } => {
                if status != SlotStatus::Offline {
                    self.ensure_group(seq, group_id).await?;
                }
                let owner = SlotOwner {
                    group_id,
                    status,
                    migrate_from: None,
                };
                self.slots.apply_range_update(lo, hi, owner).map_err(invalid)?;
            }
            Action::SlotMigrate { slot, from, to } => {
                self.ensure_group(seq, from).await?;
                self.ensure_group(seq, to).await?;
                let owner = SlotOwner {
                    group_id: to,
                    status: SlotStatus::Migrating,
                    migrate_from: Some(from),
                };
                self.slots.apply_range_update(slot, slot, owner).map_err(invalid)?;
            }
            Action::GroupChanged { group_id } => match self.store.server_group(group_id).await? {
                Some(group) => self.pools.upsert_group(&group),
                None => self.pools.remove_group(group_id),
            },
        }
        Ok(())
    }

    async fn ensure_group(&self, seq: u64, group_id: GroupId) -> ProxyResult<()> {
        if self.pools.get(group_id).is_some() {
            return Ok(());
        }
        match self.store.server_group(group_id).await? {
            Some(group) => {
                self.pools.upsert_group(&group);
                Ok(())
            }
            None => Err(ProxyError::invalid_action(
                seq,
                format!("unknown group {}", group_id),
            )),
        }
    }
}

fn log_retry(message: &str, e: &ProxyError, attempt: u32) {
    if attempt < 3 && e.is_recoverable() {
        warn!(error = %e, attempt, "{}", message);
    } else {
        error!(error = %e, attempt, "{}", message);
    }
}
