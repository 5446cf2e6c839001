/// Composition root: owns every shared component of one proxy and runs the
/// client and admin listeners until the lifecycle reaches offline
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::admin::AdminService;
use crate::config::Config;
use crate::coordination::{CoordinationStore, MemoryStore, ProxyState};
use crate::error::{ProxyError, ProxyResult};
use crate::health::{HealthCheckManager, PingChecker};
use crate::lifecycle::{LifecycleCoordinator, TerminationReason};
use crate::pool::PoolRegistry;
use crate::router::Router;
use crate::session::{Session, SessionConfig};
use crate::slots::SlotTable;
use crate::stats::ProxyStats;
use crate::utils::generate_id;

/// Pause after a failed accept, so descriptor exhaustion does not spin
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn accept_failed(listener: &str, e: &io::Error) {
    error!(listener, error = %e, "Accept error");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

/// Invoked exactly once when the proxy reaches offline
pub trait TerminationHook: Send + Sync {
    fn terminate(&self, reason: TerminationReason);
}

impl<F> TerminationHook for F
where
    F: Fn(TerminationReason) + Send + Sync,
{
    fn terminate(&self, reason: TerminationReason) {
        self(reason)
    }
}

/// Default hook: exit the process
pub struct ExitProcess;

impl TerminationHook for ExitProcess {
    fn terminate(&self, reason: TerminationReason) {
        info!(?reason, "Proxy offline, exiting");
        std::process::exit(0);
    }
}

/// Coordination store for `coordination.mode = "embedded"`
pub fn embedded_store(config: &Config) -> ProxyResult<Arc<MemoryStore>> {
    Ok(Arc::new(MemoryStore::new(config.topology()?)))
}

/// Everything one proxy shares between its tasks
pub struct ProxyInstance {
    config: Config,
    slots: Arc<SlotTable>,
    pools: Arc<PoolRegistry>,
    router: Arc<Router>,
    stats: Arc<ProxyStats>,
    lifecycle: Arc<LifecycleCoordinator>,
    admin: Arc<AdminService>,
    shutdown: watch::Sender<bool>,
}

impl ProxyInstance {
    fn new(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        addr: SocketAddr,
        admin_addr: SocketAddr,
    ) -> Self {
        let slots = Arc::new(SlotTable::new(config.proxy.slot_count));
        let pools = Arc::new(PoolRegistry::new(config.pool_config()));
        let stats = Arc::new(ProxyStats::default());
        let router = Arc::new(Router::new(
            Arc::clone(&slots),
            Arc::clone(&pools),
            Arc::clone(&stats),
            config.router_config(),
        ));

        let proxy_id = config
            .proxy
            .id
            .clone()
            .unwrap_or_else(|| generate_id("proxy"));
        let lifecycle = LifecycleCoordinator::new(
            config.lifecycle_config(proxy_id, addr.to_string(), admin_addr.to_string()),
            store,
            Arc::clone(&slots),
            Arc::clone(&pools),
            Arc::clone(&stats),
        );
        let admin = Arc::new(AdminService::new(
            Arc::clone(&lifecycle),
            Arc::clone(&slots),
            Arc::clone(&pools),
            Arc::clone(&stats),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            slots,
            pools,
            router,
            stats,
            lifecycle,
            admin,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleCoordinator> {
        &self.lifecycle
    }

    /// Stop every task without going through the lifecycle; the termination
    /// hook is not invoked
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Server {
    instance: Arc<ProxyInstance>,
    listener: TcpListener,
    admin_listener: TcpListener,
    hook: Box<dyn TerminationHook>,
}

impl Server {
    /// Bind the client and admin listeners and assemble the proxy
    pub async fn bind(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        hook: Box<dyn TerminationHook>,
    ) -> ProxyResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.server.listen_addr).await?;
        let admin_listener = TcpListener::bind(&config.server.admin_addr).await?;
        let addr = listener.local_addr()?;
        let admin_addr = admin_listener.local_addr()?;

        info!(
            listen_addr = %addr,
            admin_addr = %admin_addr,
            max_connections = config.server.max_connections,
            "Listeners bound"
        );

        Ok(Self {
            instance: Arc::new(ProxyInstance::new(config, store, addr, admin_addr)),
            listener,
            admin_listener,
            hook,
        })
    }

    pub fn instance(&self) -> Arc<ProxyInstance> {
        Arc::clone(&self.instance)
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn admin_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.admin_listener.local_addr()?)
    }

    /// Serve until the proxy goes offline or [`ProxyInstance::shutdown`]
    ///
    /// Returns the termination reason after the hook ran, or `None` for an
    /// external shutdown.
    pub async fn run(self) -> ProxyResult<Option<TerminationReason>> {
        let Server {
            instance,
            listener,
            admin_listener,
            hook,
        } = self;
        let mut shutdown = instance.shutdown.subscribe();

        let mut lifecycle = instance.lifecycle.start(shutdown.clone())?;
        info!(proxy_id = %instance.lifecycle.proxy_id(), "Proxy starting");

        tokio::spawn(
            Arc::clone(&instance.admin)
                .serve(admin_listener, shutdown.clone())
                .in_current_span(),
        );

        let health = &instance.config.health;
        if health.enabled {
            let checker = PingChecker::new(
                Duration::from_secs(health.interval_sec),
                Duration::from_secs(health.timeout_sec),
            );
            let manager = HealthCheckManager::new(Box::new(checker), Arc::clone(&instance.pools));
            tokio::spawn(manager.run(shutdown.clone()).in_current_span());
        }

        tokio::spawn(accept_loop(Arc::clone(&instance), listener).in_current_span());

        let outcome = tokio::select! {
            reason = lifecycle.terminated() => match reason {
                Some(reason) => Ok(Some(reason)),
                None => Err(ProxyError::internal("lifecycle stopped without terminating")),
            },
            _ = stopped(&mut shutdown) => {
                info!("Proxy shut down");
                Ok(None)
            }
        };
        if let Ok(None) = outcome {
            lifecycle.abort();
        }

        instance.shutdown();
        instance.pools.close_all();
        if let Ok(Some(reason)) = &outcome {
            hook.terminate(*reason);
        }
        outcome
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accept clients while the proxy is online
///
/// Waits out registration, then stops for good (dropping the listener) once
/// the proxy leaves the online state.
async fn accept_loop(instance: Arc<ProxyInstance>, listener: TcpListener) {
    let mut state = instance.lifecycle.subscribe_state();
    let current = match state.wait_for(|s| *s != ProxyState::Registering).await {
        Ok(current) => *current,
        Err(_) => return,
    };
    if !current.accepts_clients() {
        return;
    }

    let config = &instance.config.server;
    let session_config: SessionConfig = instance.config.session_config();
    let permits = Arc::new(Semaphore::new(config.max_connections));
    info!(listen_addr = %config.listen_addr, "Accepting client connections");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || !state.borrow().accepts_clients() {
                    info!("Stopped accepting client connections");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let permit = match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            instance.stats.connection_rejected();
                            warn!(peer = %peer, "Connection rejected: max connections reached");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    instance.stats.connection_opened();
                    let stats = Arc::clone(&instance.stats);
                    let session = Session::new(
                        stream,
                        peer.to_string(),
                        Arc::clone(&instance.router),
                        Arc::clone(&instance.stats),
                        session_config.clone(),
                        instance.shutdown.subscribe(),
                    );
                    tokio::spawn(
                        async move {
                            if let Err(e) = session.run().await {
                                debug!(error = %e, "Session ended with error");
                            }
                            stats.connection_closed();
                            drop(permit);
                        }
                        .instrument(info_span!("session", peer = %peer)),
                    );
                }
                Err(e) => accept_failed("client", &e).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinationConfig, GroupConfig};
    use crate::test_support::MockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(backend: &MockBackend) -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.server.admin_addr = "127.0.0.1:0".to_string();
        config.proxy.id = Some("server-test".to_string());
        config.lifecycle.drain_grace_ms = 100;
        config.lifecycle.retry_base_ms = 10;
        config.health.enabled = false;
        config.coordination = CoordinationConfig::Embedded {
            groups: vec![GroupConfig {
                id: 1,
                servers: vec![backend.addr.clone()],
                replicas: Vec::new(),
            }],
            slots: Vec::new(),
        };
        config
    }

    async fn wait_online(instance: &ProxyInstance) {
        let mut state = instance.lifecycle().subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|s| *s == ProxyState::Online),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn request(stream: &mut TcpStream, raw: &[u8], expected: &[u8]) {
        stream.write_all(raw).await.unwrap();
        let mut reply = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_pauses() {
        let started = tokio::time::Instant::now();
        let e = io::Error::new(io::ErrorKind::Other, "too many open files");
        accept_failed("admin", &e).await;
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_proxies_commands_end_to_end() {
        let backend = MockBackend::start().await;
        let config = test_config(&backend);
        let store = embedded_store(&config).unwrap();
        let server = Server::bind(config, store, Box::new(|_: TerminationReason| {})).await.unwrap();
        let addr = server.local_addr().unwrap();
        let instance = server.instance();
        let task = tokio::spawn(server.run());
        wait_online(&instance).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        request(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"+OK\r\n",
        )
        .await;
        request(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$3\r\nbar\r\n").await;
        assert_eq!(backend.value(b"foo").unwrap(), "bar");

        instance.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_rejects_beyond_max_connections() {
        let backend = MockBackend::start().await;
        let mut config = test_config(&backend);
        config.server.max_connections = 1;
        let store = embedded_store(&config).unwrap();
        let server = Server::bind(config, store, Box::new(|_: TerminationReason| {})).await.unwrap();
        let addr = server.local_addr().unwrap();
        let instance = server.instance();
        tokio::spawn(server.run());
        wait_online(&instance).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        request(&mut first, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(instance.stats().snapshot().connections_rejected, 1);
        instance.shutdown();
    }

    #[tokio::test]
    async fn test_mark_offline_runs_hook_once() {
        let backend = MockBackend::start().await;
        let config = test_config(&backend);
        let store = embedded_store(&config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let server = Server::bind(
            config,
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Box::new(move |_: TerminationReason| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let instance = server.instance();
        let task = tokio::spawn(server.run());
        wait_online(&instance).await;

        store
            .set_proxy_state("server-test", ProxyState::MarkOffline)
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Some(TerminationReason::Drained));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
