/// Health checking for backend servers
///
/// Servers leave the rotation through request failures in the pool; this
/// module probes every pooled server periodically and re-admits the ones
/// that answer again.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pool::{BackendConnection, BackendPool, PoolRegistry};
use crate::protocol::{RespEncoder, RespValue};

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on one server
    async fn check_health(&self, addr: &str) -> HealthStatus;

    /// Get the check interval for this health checker
    fn check_interval(&self) -> Duration;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Sends PING on a fresh connection and expects PONG
pub struct PingChecker {
    check_interval: Duration,
    check_timeout: Duration,
}

impl PingChecker {
    pub fn new(check_interval: Duration, check_timeout: Duration) -> Self {
        Self {
            check_interval,
            check_timeout,
        }
    }
}

#[async_trait]
impl HealthChecker for PingChecker {
    async fn check_health(&self, addr: &str) -> HealthStatus {
        let mut conn = match BackendConnection::connect(addr, self.check_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: format!("Connection failed: {}", e),
                }
            }
        };

        let ping = RespEncoder::create_command("PING", &[]);
        match conn.call(&ping, self.check_timeout).await {
            Ok(RespValue::SimpleString(pong)) if pong == "PONG" => HealthStatus::Healthy,
            Ok(other) => HealthStatus::Unhealthy {
                reason: format!("Unexpected PING response: {:?}", other),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("PING failed: {}", e),
            },
        }
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// Periodic checks over every pool of a registry
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
    registry: Arc<PoolRegistry>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>, registry: Arc<PoolRegistry>) -> Self {
        Self { checker, registry }
    }

    /// Perform health check with timeout
    pub async fn check_server(&self, addr: &str) -> HealthStatus {
        match timeout(self.checker.check_timeout(), self.checker.check_health(addr)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Check every server of one pool and update its rotation
    pub async fn check_pool(&self, pool: &BackendPool) {
        for addr in pool.server_addrs() {
            let status = self.check_server(&addr).await;
            let was_healthy = pool.is_server_healthy(&addr).unwrap_or(false);
            match status {
                HealthStatus::Healthy => {
                    debug!(group_id = pool.group_id(), addr = %addr, "Backend is healthy");
                    pool.mark_healthy(&addr);
                }
                other => {
                    if was_healthy {
                        warn!(group_id = pool.group_id(), addr = %addr, status = %other, "Backend health check failed");
                    } else {
                        debug!(group_id = pool.group_id(), addr = %addr, status = %other, "Backend still unhealthy");
                    }
                    pool.mark_check_failed(&addr);
                }
            }
        }
    }

    pub async fn check_all(&self) {
        for pool in self.registry.pools() {
            self.check_pool(&pool).await;
        }
    }

    /// Run until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.checker.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.check_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Health checker stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct MockHealthChecker {
        should_pass: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HealthChecker for MockHealthChecker {
        async fn check_health(&self, _addr: &str) -> HealthStatus {
            if self.should_pass.load(Ordering::SeqCst) {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "Mock failure".to_string(),
                }
            }
        }

        fn check_interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn registry_with(addr: &str) -> Arc<PoolRegistry> {
        let registry = Arc::new(PoolRegistry::new(PoolConfig {
            failure_threshold: 1,
            ..PoolConfig::default()
        }));
        registry.upsert_group(&crate::coordination::ServerGroup::new(
            1,
            vec![crate::coordination::BackendServer::master(addr)],
        ));
        registry
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy { reason: "test".to_string() }.to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_check_then_readmission() {
        let should_pass = Arc::new(AtomicBool::new(false));
        let registry = registry_with("127.0.0.1:7001");
        let manager = HealthCheckManager::new(
            Box::new(MockHealthChecker {
                should_pass: Arc::clone(&should_pass),
            }),
            Arc::clone(&registry),
        );
        let pool = registry.get(1).unwrap();

        manager.check_all().await;
        assert_eq!(pool.is_server_healthy("127.0.0.1:7001"), Some(false));
        assert!(pool.current_target().is_none());

        should_pass.store(true, Ordering::SeqCst);
        manager.check_all().await;
        assert_eq!(pool.current_target().as_deref(), Some("127.0.0.1:7001"));
    }

    #[tokio::test]
    async fn test_ping_checker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"+PONG\r\n").await;
        });

        let checker = PingChecker::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(checker.check_health(&addr).await, HealthStatus::Healthy);

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);
        assert!(!checker.check_health(&closed_addr).await.is_healthy());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = registry_with("127.0.0.1:7001");
        let manager = HealthCheckManager::new(
            Box::new(MockHealthChecker {
                should_pass: Arc::new(AtomicBool::new(true)),
            }),
            registry,
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
