/// Command routing: key → slot → owning group → pooled backend connection
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::coordination::models::{GroupId, SlotStatus};
use crate::error::{ErrorSeverity, ProxyError, ProxyResult};
use crate::pool::PoolRegistry;
use crate::protocol::{Command, CommandKind, KeySpec, RespEncoder, RespValue};
use crate::slots::{SlotOwner, SlotTable};
use crate::stats::ProxyStats;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a request for a pre-migrating slot waits for the table to move on
    pub premigrate_wait: Duration,
    /// Timeout handed to the source server for a single-key migration
    pub migrate_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            premigrate_wait: Duration::from_millis(1000),
            migrate_timeout_ms: 30,
        }
    }
}

/// Where a command is served
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Answered by the proxy without touching a backend
    Local(RespValue),
    /// Forwarded to the owner of `slot`
    Forward { slot: usize },
}

pub struct Router {
    slots: Arc<SlotTable>,
    pools: Arc<PoolRegistry>,
    stats: Arc<ProxyStats>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        slots: Arc<SlotTable>,
        pools: Arc<PoolRegistry>,
        stats: Arc<ProxyStats>,
        config: RouterConfig,
    ) -> Self {
        Self {
            slots,
            pools,
            stats,
            config,
        }
    }

    /// Route a command and produce its reply; failures become error replies
    pub async fn route(&self, command: &Command) -> RespValue {
        self.stats.command_routed();
        match self.dispatch(command).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, ProxyError::CrossSlot) {
                    self.stats.cross_slot_rejected();
                } else {
                    self.stats.command_failed();
                }
                match e.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::Error => {
                        error!(command = %command.name, error = %e, "Request failed")
                    }
                    ErrorSeverity::Warning => {
                        warn!(command = %command.name, error = %e, "Request failed")
                    }
                    ErrorSeverity::Info => {
                        debug!(command = %command.name, error = %e, "Request rejected")
                    }
                }
                RespValue::Error(e.reply_message())
            }
        }
    }

    pub async fn dispatch(&self, command: &Command) -> ProxyResult<RespValue> {
        match self.plan(command)? {
            RoutingDecision::Local(reply) => Ok(reply),
            RoutingDecision::Forward { slot } => {
                let owner = self.resolve_owner(slot).await?;
                if owner.status == SlotStatus::Migrating {
                    if let Some(from) = owner.migrate_from.filter(|from| *from != owner.group_id) {
                        for key in command.keys() {
                            self.migrate_key(slot, from, owner.group_id, key).await?;
                        }
                    }
                }
                self.forward(owner.group_id, &command.request).await
            }
        }
    }

    /// Decide where a command goes without suspending
    pub fn plan(&self, command: &Command) -> ProxyResult<RoutingDecision> {
        match command.kind() {
            CommandKind::Disallowed => Err(ProxyError::command(format!(
                "ERR command '{}' not supported by proxy",
                command.name
            ))),
            CommandKind::Keyless => Ok(RoutingDecision::Local(Self::local_reply(command))),
            CommandKind::Keyed => {
                let keys = command.keys();
                let first = match keys.first() {
                    Some(first) => first,
                    // a script with no keys has no slot to run on
                    None if command.key_spec() == KeySpec::NumKeys && command.args.len() > 2 => {
                        return Err(ProxyError::command(format!(
                            "ERR '{}' without keys not supported by proxy",
                            command.name
                        )))
                    }
                    None => {
                        return Err(ProxyError::command(format!(
                            "ERR wrong number of arguments for '{}' command",
                            command.name.to_ascii_lowercase()
                        )))
                    }
                };
                let slot = self.slots.slot_for_key(first);
                if keys[1..].iter().any(|k| self.slots.slot_for_key(k) != slot) {
                    return Err(ProxyError::CrossSlot);
                }
                Ok(RoutingDecision::Forward { slot })
            }
        }
    }

    /// Slot a command will be served from, if it reaches a backend
    pub fn routing_slot(&self, command: &Command) -> Option<usize> {
        match self.plan(command) {
            Ok(RoutingDecision::Forward { slot }) => Some(slot),
            _ => None,
        }
    }

    fn local_reply(command: &Command) -> RespValue {
        match command.name.as_str() {
            "PING" => match command.arg(1) {
                Some(message) => RespValue::bulk(Bytes::copy_from_slice(message)),
                None => RespValue::SimpleString("PONG".to_string()),
            },
            "ECHO" => match command.arg(1) {
                Some(message) => RespValue::bulk(Bytes::copy_from_slice(message)),
                None => RespValue::error("ERR wrong number of arguments for 'echo' command"),
            },
            "SELECT" => match command.arg(1) {
                Some(b"0") => RespValue::ok(),
                _ => RespValue::error("ERR invalid DB index"),
            },
            "AUTH" => RespValue::error("ERR Client sent AUTH, but no password is set"),
            "COMMAND" => RespValue::Array(Some(Vec::new())),
            _ => RespValue::ok(),
        }
    }

    /// Owner of `slot`, waiting out a pre-migrate phase
    async fn resolve_owner(&self, slot: usize) -> ProxyResult<SlotOwner> {
        let deadline = Instant::now() + self.config.premigrate_wait;
        let mut changes = self.slots.subscribe();
        loop {
            let owner = self.slots.owner(slot)?;
            match owner.status {
                SlotStatus::Online | SlotStatus::Migrating => return Ok(owner),
                SlotStatus::Offline => {
                    return Err(ProxyError::backend_unavailable(format!(
                        "slot {} is offline",
                        slot
                    )))
                }
                SlotStatus::PreMigrate => {
                    match tokio::time::timeout_at(deadline, changes.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(ProxyError::internal("slot table dropped")),
                        Err(_) => {
                            return Err(ProxyError::backend_unavailable(format!(
                                "slot {} is pre-migrating",
                                slot
                            )))
                        }
                    }
                }
            }
        }
    }

    /// Ask the source group to hand `key` (and its tag) over to `to`
    async fn migrate_key(&self, slot: usize, from: GroupId, to: GroupId, key: &[u8]) -> ProxyResult<()> {
        let target = self
            .pools
            .get(to)
            .and_then(|pool| pool.current_target())
            .ok_or_else(|| {
                ProxyError::backend_unavailable(format!("no healthy server in group {}", to))
            })?;
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::internal(format!("bad server address {}", target)))?;
        let timeout = self.config.migrate_timeout_ms.to_string();
        let request = RespEncoder::create_command(
            "SLOTSMGRTTAGONE",
            &[host.as_bytes(), port.as_bytes(), timeout.as_bytes(), key],
        );

        let mut conn = self.pools.acquire(from).await?;
        match conn.call(&request).await {
            Ok(RespValue::Error(message)) => {
                conn.release(true);
                warn!(slot, from, to, error = %message, "Key migration rejected");
                Err(ProxyError::backend_unavailable(format!(
                    "migrate slot {} from group {}: {}",
                    slot, from, message
                )))
            }
            Ok(_) => {
                conn.release(true);
                Ok(())
            }
            Err(e) => {
                conn.release(false);
                Err(ProxyError::backend_unavailable(format!(
                    "migrate slot {} from group {}: {}",
                    slot, from, e
                )))
            }
        }
    }

    async fn forward(&self, group_id: GroupId, request: &RespValue) -> ProxyResult<RespValue> {
        let mut conn = self.pools.acquire(group_id).await?;
        match conn.call(request).await {
            Ok(reply) => {
                conn.release(true);
                Ok(reply)
            }
            Err(e) => {
                warn!(group_id, addr = %conn.addr(), error = %e, "Backend request failed");
                conn.release(false);
                Err(ProxyError::backend_unavailable(format!("group {}: {}", group_id, e)))
            }
        }
    }
}
