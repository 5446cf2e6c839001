/// Backend connection pools, one per server group
///
/// A pool hands out at most `max_size` connections at a time; callers past
/// that wait up to `acquire_timeout` for a release. Connections that saw an
/// error are discarded, never pooled again. A server that fails
/// `failure_threshold` times in a row leaves the rotation until the health
/// checker re-admits it.
pub mod connection;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::coordination::models::{GroupId, ServerGroup};
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::RespValue;

pub use connection::BackendConnection;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections checked out of one group's pool at once
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Consecutive failures before a server leaves the rotation
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            acquire_timeout: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(1000),
            io_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct ServerEntry {
    addr: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl ServerEntry {
    fn new(addr: String) -> Self {
        Self {
            addr,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    connections_created: AtomicU64,
    acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub addr: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub group_id: GroupId,
    pub servers: Vec<ServerStats>,
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub connections_created: u64,
    pub acquired: u64,
    pub acquire_timeouts: u64,
    pub failures: u64,
}

pub struct BackendPool {
    group_id: GroupId,
    config: PoolConfig,
    servers: RwLock<Vec<Arc<ServerEntry>>>,
    idle: Mutex<VecDeque<BackendConnection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl BackendPool {
    /// Pool over `servers`, tried in order; the first healthy one serves
    pub fn new(group_id: GroupId, servers: Vec<String>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            group_id,
            servers: RwLock::new(servers.into_iter().map(|a| Arc::new(ServerEntry::new(a))).collect()),
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            permits,
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
            config,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Server new connections go to, if any is healthy
    pub fn current_target(&self) -> Option<String> {
        self.servers
            .read()
            .iter()
            .find(|s| s.is_healthy())
            .map(|s| s.addr.clone())
    }

    pub fn server_addrs(&self) -> Vec<String> {
        self.servers.read().iter().map(|s| s.addr.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check out a connection, waiting up to `acquire_timeout` for capacity
    pub async fn acquire(self: &Arc<Self>) -> ProxyResult<PooledConnection> {
        if self.is_closed() {
            return Err(ProxyError::backend_unavailable(format!(
                "group {} pool closed",
                self.group_id
            )));
        }
        let target = self.current_target().ok_or_else(|| {
            ProxyError::backend_unavailable(format!(
                "no healthy server in group {}",
                self.group_id
            ))
        })?;

        let permit = match timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ProxyError::backend_unavailable(format!(
                    "group {} pool closed",
                    self.group_id
                )))
            }
            Err(_) => {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::backend_unavailable(format!(
                    "group {} pool exhausted",
                    self.group_id
                )));
            }
        };

        let reused = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(conn) = idle.pop_front() {
                if conn.addr() == target {
                    found = Some(conn);
                    break;
                }
            }
            found
        };

        let conn = match reused {
            Some(conn) => conn,
            None => match BackendConnection::connect(&target, self.config.connect_timeout).await {
                Ok(conn) => {
                    self.counters.connections_created.fetch_add(1, Ordering::Relaxed);
                    conn
                }
                Err(e) => {
                    self.record_failure(&target);
                    return Err(ProxyError::backend_unavailable(format!(
                        "connect to {}: {}",
                        target, e
                    )));
                }
            },
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Return a connection; unhealthy ones are discarded and counted
    pub fn release(&self, mut pooled: PooledConnection, healthy: bool) {
        if let Some(conn) = pooled.conn.take() {
            if healthy {
                self.record_success(conn.addr());
                if !self.is_closed() && self.current_target().as_deref() == Some(conn.addr()) {
                    let mut idle = self.idle.lock();
                    if idle.len() < self.config.max_size {
                        idle.push_back(conn);
                    }
                }
            } else {
                self.record_failure(conn.addr());
            }
        }
        // the permit goes back only now, after the connection is idle
        drop(pooled);
    }

    fn entry(&self, addr: &str) -> Option<Arc<ServerEntry>> {
        self.servers.read().iter().find(|s| s.addr == addr).cloned()
    }

    fn record_success(&self, addr: &str) {
        if let Some(entry) = self.entry(addr) {
            entry.consecutive_failures.store(0, Ordering::Release);
        }
    }

    fn record_failure(&self, addr: &str) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let Some(entry) = self.entry(addr) else {
            return;
        };
        let failures = entry.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold && entry.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                group_id = self.group_id,
                addr = %addr,
                failures,
                "Backend server marked unhealthy"
            );
            self.idle.lock().retain(|c| c.addr() != addr);
        }
    }

    /// Put a server back into rotation after a successful health check
    pub fn mark_healthy(&self, addr: &str) {
        if let Some(entry) = self.entry(addr) {
            entry.consecutive_failures.store(0, Ordering::Release);
            if !entry.healthy.swap(true, Ordering::AcqRel) {
                info!(group_id = self.group_id, addr = %addr, "Backend server back in rotation");
            }
        }
    }

    /// Count a failed health check against a server
    pub fn mark_check_failed(&self, addr: &str) {
        self.record_failure(addr);
    }

    pub fn is_server_healthy(&self, addr: &str) -> Option<bool> {
        self.entry(addr).map(|e| e.is_healthy())
    }

    /// Retarget the pool at a new server list, keeping the health state of
    /// servers that stay
    pub fn update_servers(&self, addrs: Vec<String>) {
        {
            let mut servers = self.servers.write();
            if servers.iter().map(|s| s.addr.as_str()).eq(addrs.iter().map(|a| a.as_str())) {
                return;
            }
            let updated: Vec<Arc<ServerEntry>> = addrs
                .into_iter()
                .map(|addr| {
                    servers
                        .iter()
                        .find(|s| s.addr == addr)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(ServerEntry::new(addr)))
                })
                .collect();
            *servers = updated;
        }
        let target = self.current_target();
        self.idle.lock().retain(|c| Some(c.addr()) == target.as_deref());
        info!(group_id = self.group_id, servers = ?self.server_addrs(), "Pool retargeted");
    }

    /// Stop handing out connections; waiters fail immediately
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
            self.idle.lock().clear();
            debug!(group_id = self.group_id, "Pool closed");
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            group_id: self.group_id,
            servers: self
                .servers
                .read()
                .iter()
                .map(|s| ServerStats {
                    addr: s.addr.clone(),
                    healthy: s.is_healthy(),
                    consecutive_failures: s.consecutive_failures.load(Ordering::Acquire),
                })
                .collect(),
            max_size: self.config.max_size,
            in_use: self.config.max_size.saturating_sub(self.permits.available_permits()),
            idle: self.idle.lock().len(),
            connections_created: self.counters.connections_created.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out connection
///
/// Dropping it without [`BackendPool::release`] discards the connection
/// (its framing state is unknown) and frees the slot.
pub struct PooledConnection {
    conn: Option<BackendConnection>,
    pool: Arc<BackendPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn group_id(&self) -> GroupId {
        self.pool.group_id
    }

    pub fn addr(&self) -> &str {
        self.conn.as_ref().map(|c| c.addr()).unwrap_or_default()
    }

    pub async fn call(&mut self, request: &RespValue) -> ProxyResult<RespValue> {
        let io_timeout = self.pool.config.io_timeout;
        match self.conn.as_mut() {
            Some(conn) => conn.call(request, io_timeout).await,
            None => Err(ProxyError::internal("connection already released")),
        }
    }

    /// Return the connection to its pool
    pub fn release(self, healthy: bool) {
        let pool = Arc::clone(&self.pool);
        pool.release(self, healthy);
    }
}

/// All pools, keyed by group id
pub struct PoolRegistry {
    config: PoolConfig,
    pools: RwLock<FnvHashMap<GroupId, Arc<BackendPool>>>,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn get(&self, group_id: GroupId) -> Option<Arc<BackendPool>> {
        self.pools.read().get(&group_id).cloned()
    }

    pub async fn acquire(&self, group_id: GroupId) -> ProxyResult<PooledConnection> {
        let pool = self.get(group_id).ok_or_else(|| {
            ProxyError::backend_unavailable(format!("unknown group {}", group_id))
        })?;
        pool.acquire().await
    }

    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Create or retarget the pool of one group
    pub fn upsert_group(&self, group: &ServerGroup) {
        let masters: Vec<String> = group.masters().map(str::to_string).collect();
        if let Some(pool) = self.get(group.id) {
            pool.update_servers(masters);
            return;
        }
        let mut pools = self.pools.write();
        pools
            .entry(group.id)
            .or_insert_with(|| {
                info!(group_id = group.id, servers = ?masters, "Pool created");
                Arc::new(BackendPool::new(group.id, masters, self.config.clone()))
            });
    }

    pub fn remove_group(&self, group_id: GroupId) {
        if let Some(pool) = self.pools.write().remove(&group_id) {
            pool.close();
            info!(group_id, "Pool removed");
        }
    }

    /// Make the registry match `groups` exactly
    pub fn reconcile(&self, groups: &[ServerGroup]) {
        for group in groups {
            self.upsert_group(group);
        }
        let stale: Vec<GroupId> = self
            .pools
            .read()
            .keys()
            .filter(|id| !groups.iter().any(|g| g.id == **id))
            .copied()
            .collect();
        for group_id in stale {
            self.remove_group(group_id);
        }
    }

    pub fn pools(&self) -> Vec<Arc<BackendPool>> {
        let mut pools: Vec<Arc<BackendPool>> = self.pools.read().values().cloned().collect();
        pools.sort_by_key(|p| p.group_id());
        pools
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools().iter().map(|p| p.stats()).collect()
    }

    pub fn close_all(&self) {
        for pool in self.pools.write().drain().map(|(_, p)| p) {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::models::BackendServer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_secs(1),
            failure_threshold: 2,
        }
    }

    /// Accepts connections and answers every read with +PONG
    async fn pong_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(b"+PONG\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_single_connection_pool_serializes_acquires() {
        let addr = pong_server().await;
        let pool = Arc::new(BackendPool::new(1, vec![addr], config(1)));

        let first = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                let reply = conn.call(&RespValue::Array(Some(vec![RespValue::bulk("PING")]))).await;
                conn.release(true);
                reply
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().in_use, 1);

        first.release(true);
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".to_string()));
        assert_eq!(pool.stats().connections_created, 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let addr = pong_server().await;
        let mut config = config(1);
        config.acquire_timeout = Duration::from_millis(50);
        let pool = Arc::new(BackendPool::new(1, vec![addr], config));

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(ProxyError::BackendUnavailable { .. })));
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let addr = pong_server().await;
        let pool = Arc::new(BackendPool::new(1, vec![addr], config(2)));

        let conn = pool.acquire().await.unwrap();
        conn.release(false);
        assert_eq!(pool.stats().idle, 0);

        let conn = pool.acquire().await.unwrap();
        conn.release(true);
        assert_eq!(pool.stats().connections_created, 2);
    }

    #[tokio::test]
    async fn test_unhealthy_servers_fail_fast() {
        let dead = dead_addr().await;
        let pool = Arc::new(BackendPool::new(1, vec![dead.clone()], config(4)));

        for _ in 0..2 {
            assert!(pool.acquire().await.is_err());
        }
        assert_eq!(pool.is_server_healthy(&dead), Some(false));
        let err = pool.acquire().await.err().unwrap();
        assert!(err.to_string().contains("no healthy server"));

        pool.mark_healthy(&dead);
        assert_eq!(pool.current_target(), Some(dead));
    }

    #[tokio::test]
    async fn test_failover_to_next_master() {
        let dead = dead_addr().await;
        let live = pong_server().await;
        let pool = Arc::new(BackendPool::new(1, vec![dead, live.clone()], config(4)));

        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_err());

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.addr(), live);
        conn.release(true);
    }

    #[tokio::test]
    async fn test_registry_reconcile() {
        let registry = PoolRegistry::new(config(1));
        let groups = vec![
            ServerGroup::new(1, vec![BackendServer::master("127.0.0.1:7001")]),
            ServerGroup::new(
                2,
                vec![
                    BackendServer::master("127.0.0.1:7002"),
                    BackendServer::replica("127.0.0.1:7003"),
                ],
            ),
        ];
        registry.reconcile(&groups);
        assert_eq!(registry.pools().len(), 2);
        assert_eq!(registry.get(2).unwrap().server_addrs(), vec!["127.0.0.1:7002"]);

        let removed = registry.get(1).unwrap();
        registry.reconcile(&[ServerGroup::new(2, vec![BackendServer::master("127.0.0.1:7004")])]);
        assert!(registry.get(1).is_none());
        assert!(removed.is_closed());
        assert_eq!(registry.get(2).unwrap().current_target().as_deref(), Some("127.0.0.1:7004"));

        assert!(matches!(
            registry.acquire(9).await,
            Err(ProxyError::BackendUnavailable { .. })
        ));
    }
}
