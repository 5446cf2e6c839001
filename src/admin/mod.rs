/// Admin endpoint: RESP request/response commands for operators
///
/// Reports are returned as JSON in a bulk string so they can be read with
/// any RESP client (`redis-cli -p <admin port> SLOTS`).
use std::sync::Arc;

use bytes::BytesMut;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, Instrument};

use crate::error::{ProxyError, ProxyResult};
use crate::lifecycle::LifecycleCoordinator;
use crate::pool::PoolRegistry;
use crate::protocol::{Command, RespEncoder, RespParser, RespValue};
use crate::server::accept_failed;
use crate::slots::SlotTable;
use crate::stats::ProxyStats;

pub struct AdminService {
    lifecycle: Arc<LifecycleCoordinator>,
    slots: Arc<SlotTable>,
    pools: Arc<PoolRegistry>,
    stats: Arc<ProxyStats>,
}

impl AdminService {
    pub fn new(
        lifecycle: Arc<LifecycleCoordinator>,
        slots: Arc<SlotTable>,
        pools: Arc<PoolRegistry>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            lifecycle,
            slots,
            pools,
            stats,
        }
    }

    /// Accept admin connections until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Admin listener stopping");
                        return;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self);
                        let span = tracing::info_span!("admin", peer = %peer);
                        tokio::spawn(
                            async move {
                                if let Err(e) = service.serve_connection(stream).await {
                                    debug!(error = %e, "Admin connection closed with error");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => accept_failed("admin", &e).await,
                },
            }
        }
    }

    /// One request, one reply, until the peer disconnects
    pub async fn serve_connection<S>(&self, mut stream: S) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            while let Some(request) = RespParser::parse_request(&mut buf)? {
                let reply = match Command::from_resp(request) {
                    Ok(Some(command)) => self.handle(&command).await,
                    Ok(None) => continue,
                    Err(e) => RespValue::Error(e.reply_message()),
                };
                stream.write_all(&RespEncoder::encode(&reply)).await?;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    pub async fn handle(&self, command: &Command) -> RespValue {
        match command.name.as_str() {
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "STATE" => RespValue::bulk(self.lifecycle.state().as_str()),
            "SLOTS" => json_reply(&self.slots_report()),
            "GROUPS" => json_reply(&self.pools.stats()),
            "STATS" => json_reply(&self.stats.snapshot()),
            "RESYNC" => match self.lifecycle.resync().await {
                Ok(cursor) => {
                    info!(cursor, "Resync requested by admin");
                    RespValue::Integer(cursor as i64)
                }
                Err(e) => RespValue::Error(format!("ERR resync failed: {}", e)),
            },
            "OFFLINE" => match self.lifecycle.request_offline().await {
                Ok(()) => RespValue::ok(),
                Err(e) => RespValue::Error(format!("ERR offline request failed: {}", e)),
            },
            other => RespValue::Error(format!("ERR unknown admin command '{}'", other)),
        }
    }

    fn slots_report(&self) -> serde_json::Value {
        let snapshot = self.slots.snapshot();
        let ranges: Vec<serde_json::Value> = snapshot
            .ranges()
            .into_iter()
            .map(|(range, owner)| {
                json!({
                    "start": range.start,
                    "end": range.end,
                    "group_id": owner.group_id,
                    "status": owner.status,
                    "migrate_from": owner.migrate_from,
                })
            })
            .collect();
        json!({
            "version": snapshot.version(),
            "slot_count": snapshot.slot_count(),
            "ranges": ranges,
            "coverage": snapshot.coverage(),
        })
    }
}

fn json_reply<T: serde::Serialize>(value: &T) -> RespValue {
    match serde_json::to_vec(value) {
        Ok(body) => RespValue::bulk(body),
        Err(e) => RespValue::Error(ProxyError::internal(e.to_string()).reply_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::models::{BackendServer, ServerGroup, TopologySnapshot};
    use crate::coordination::{CoordinationStore, MemoryStore};
    use crate::lifecycle::{BackoffPolicy, LifecycleConfig};
    use crate::pool::PoolConfig;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn service() -> (AdminService, Arc<MemoryStore>) {
        let groups = vec![
            ServerGroup::new(1, vec![BackendServer::master("127.0.0.1:7001")]),
            ServerGroup::new(2, vec![BackendServer::master("127.0.0.1:7002")]),
        ];
        let store = Arc::new(MemoryStore::new(
            TopologySnapshot::evenly_split(64, groups).unwrap(),
        ));
        let slots = Arc::new(SlotTable::new(64));
        let pools = Arc::new(PoolRegistry::new(PoolConfig::default()));
        let stats = Arc::new(ProxyStats::default());
        let lifecycle = LifecycleCoordinator::new(
            LifecycleConfig {
                proxy_id: "admin-test".to_string(),
                addr: "127.0.0.1:19000".to_string(),
                admin_addr: "127.0.0.1:11000".to_string(),
                auto_online: true,
                drain_grace: Duration::from_secs(1),
                backoff: BackoffPolicy::default(),
            },
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::clone(&slots),
            Arc::clone(&pools),
            Arc::clone(&stats),
        );
        (AdminService::new(lifecycle, slots, pools, stats), store)
    }

    fn command(parts: &[&str]) -> Command {
        let parts: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        Command::from_parts(&parts).unwrap()
    }

    fn json_body(reply: RespValue) -> serde_json::Value {
        serde_json::from_slice(reply.as_bytes().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_state_and_ping() {
        let (admin, _store) = service();
        assert_eq!(
            admin.handle(&command(&["PING"])).await,
            RespValue::SimpleString("PONG".to_string())
        );
        assert_eq!(
            admin.handle(&command(&["state"])).await,
            RespValue::bulk("registering")
        );
    }

    #[tokio::test]
    async fn test_resync_then_slots_report() {
        let (admin, _store) = service();
        assert_eq!(admin.handle(&command(&["RESYNC"])).await, RespValue::Integer(0));

        let report = json_body(admin.handle(&command(&["SLOTS"])).await);
        assert_eq!(report["slot_count"], 64);
        let ranges = report["ranges"].as_array().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0]["start"], 0);
        assert_eq!(ranges[0]["end"], 31);
        assert_eq!(ranges[0]["group_id"], 1);
        assert_eq!(ranges[1]["status"], "online");
        assert_eq!(report["coverage"]["online_slots"], 64);

        let groups = json_body(admin.handle(&command(&["GROUPS"])).await);
        assert_eq!(groups.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_request_writes_record() {
        let (admin, store) = service();
        assert_eq!(admin.handle(&command(&["OFFLINE"])).await, RespValue::ok());
        let record = store.get_proxy_record("admin-test").await.unwrap().unwrap();
        assert_eq!(record.state, crate::coordination::ProxyState::MarkOffline);
    }

    #[tokio::test]
    async fn test_resync_failure_is_reported() {
        let (admin, store) = service();
        store.set_available(false);
        let reply = admin.handle(&command(&["RESYNC"])).await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_serve_connection() {
        let (admin, _store) = service();
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .read(b"*1\r\n$5\r\nNOPE!\r\n")
            .write(b"-ERR unknown admin command 'NOPE!'\r\n")
            .build();
        admin.serve_connection(mock).await.unwrap();
    }
}
