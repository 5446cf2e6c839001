/// Slotgate - slot-routing proxy for a sharded key-value cluster
///
/// Clients speak RESP to the proxy as if it were a single server. Every keyed
/// command is hashed to one of a fixed number of slots, and each slot is
/// owned by a server group. Slot ownership and proxy state live in an
/// external coordination service; the proxy follows its action log and
/// drains itself when the control plane marks it offline.
pub mod admin;
pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod slots;
pub mod stats;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{ProxyError, ProxyResult};
pub use server::{ExitProcess, ProxyInstance, Server, TerminationHook};
