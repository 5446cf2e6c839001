/// Process-wide counters reported by the admin `STATS` command
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ProxyStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_active: AtomicU64,
    commands_routed: AtomicU64,
    command_errors: AtomicU64,
    cross_slot_rejections: AtomicU64,
    protocol_errors: AtomicU64,
    actions_applied: AtomicU64,
    actions_skipped: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_active: u64,
    pub commands_routed: u64,
    pub command_errors: u64,
    pub cross_slot_rejections: u64,
    pub protocol_errors: u64,
    pub actions_applied: u64,
    pub actions_skipped: u64,
}

impl ProxyStats {
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn command_routed(&self) {
        self.commands_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cross_slot_rejected(&self) {
        self.cross_slot_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn action_applied(&self) {
        self.actions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn action_skipped(&self) {
        self.actions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            commands_routed: self.commands_routed.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            cross_slot_rejections: self.cross_slot_rejections.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            actions_skipped: self.actions_skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ProxyStats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_rejected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.connections_rejected, 1);
    }
}
