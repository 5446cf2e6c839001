/// Client command representation and key-position rules

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use lazy_static::lazy_static;

use super::resp::{RespParseError, RespValue};
use crate::error::{ProxyError, ProxyResult};

/// Where the keys of a command sit in its argument list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// No key; answered by the proxy itself
    Keyless,
    /// Keys from `first` to the end, every `step` arguments
    Range { first: usize, step: usize },
    /// Keys at `first` and `second` (SMOVE, RPOPLPUSH, ...)
    Pair,
    /// EVAL-style: numkeys at index 2, keys follow
    NumKeys,
    /// ZUNIONSTORE-style: destination at 1, numkeys at 2, keys follow
    DestNumKeys,
}

lazy_static! {
    static ref KEY_SPECS: FnvHashMap<&'static str, KeySpec> = {
        let mut specs = FnvHashMap::default();
        for name in ["PING", "ECHO", "SELECT", "QUIT", "AUTH", "COMMAND", "READONLY", "READWRITE"] {
            specs.insert(name, KeySpec::Keyless);
        }
        for name in [
            "MGET", "DEL", "UNLINK", "EXISTS", "TOUCH", "SDIFF", "SDIFFSTORE", "SINTER",
            "SINTERSTORE", "SUNION", "SUNIONSTORE", "PFCOUNT", "PFMERGE",
        ] {
            specs.insert(name, KeySpec::Range { first: 1, step: 1 });
        }
        specs.insert("MSET", KeySpec::Range { first: 1, step: 2 });
        for name in ["SMOVE", "RPOPLPUSH", "LMOVE"] {
            specs.insert(name, KeySpec::Pair);
        }
        for name in ["EVAL", "EVALSHA"] {
            specs.insert(name, KeySpec::NumKeys);
        }
        for name in ["ZUNIONSTORE", "ZINTERSTORE"] {
            specs.insert(name, KeySpec::DestNumKeys);
        }
        specs
    };

    /// Commands that cannot be served correctly through a sharded proxy
    static ref DISALLOWED: FnvHashSet<&'static str> = [
        "KEYS", "MOVE", "OBJECT", "RENAME", "RENAMENX", "SCAN", "BITOP", "MSETNX", "MIGRATE",
        "RESTORE", "BGREWRITEAOF", "BGSAVE", "BLPOP", "BRPOP", "BRPOPLPUSH", "CLIENT", "CONFIG",
        "DBSIZE", "DEBUG", "DISCARD", "EXEC", "FLUSHALL", "FLUSHDB", "LASTSAVE", "MONITOR",
        "MULTI", "PSUBSCRIBE", "PUBLISH", "PUNSUBSCRIBE", "RANDOMKEY", "SAVE", "SCRIPT",
        "SHUTDOWN", "SLAVEOF", "REPLICAOF", "SLOWLOG", "SUBSCRIBE", "SYNC", "PSYNC", "TIME",
        "UNSUBSCRIBE", "UNWATCH", "WATCH", "SLOTSINFO", "SLOTSDEL", "SLOTSMGRTSLOT",
        "SLOTSMGRTONE", "SLOTSMGRTTAGSLOT", "SLOTSMGRTTAGONE", "SLOTSCHECK",
    ]
    .into_iter()
    .collect();
}

/// How the router should treat a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Keyless,
    Keyed,
    Disallowed,
}

/// A decoded client request
#[derive(Debug, Clone)]
pub struct Command {
    /// Upper-cased command name
    pub name: String,
    /// All arguments, the command name included at index 0
    pub args: Vec<Bytes>,
    /// The request as received, forwarded verbatim to the backend
    pub request: RespValue,
}

impl Command {
    /// Build a command from a decoded request
    ///
    /// Returns `Ok(None)` for an empty request, which clients may send as a
    /// bare inline newline.
    pub fn from_resp(request: RespValue) -> ProxyResult<Option<Command>> {
        let elements = match &request {
            RespValue::Array(Some(elements)) => elements,
            RespValue::Array(None) => return Ok(None),
            other => {
                return Err(ProxyError::ProtocolDecode(RespParseError::InvalidFormat(
                    format!("expected multi-bulk request, got {:?}", other),
                )))
            }
        };
        if elements.is_empty() {
            return Ok(None);
        }

        let mut args = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                RespValue::BulkString(Some(data)) => args.push(data.clone()),
                other => {
                    return Err(ProxyError::ProtocolDecode(RespParseError::InvalidFormat(
                        format!("expected bulk string argument, got {:?}", other),
                    )))
                }
            }
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        Ok(Some(Command {
            name,
            args,
            request,
        }))
    }

    /// Build a command from literal parts; used for proxy-issued requests
    pub fn from_parts(parts: &[&[u8]]) -> ProxyResult<Command> {
        let request = RespValue::Array(Some(
            parts
                .iter()
                .map(|p| RespValue::bulk(Bytes::copy_from_slice(p)))
                .collect(),
        ));
        Command::from_resp(request)?
            .ok_or_else(|| ProxyError::internal("empty command"))
    }

    pub fn key_spec(&self) -> KeySpec {
        KEY_SPECS
            .get(self.name.as_str())
            .copied()
            .unwrap_or(KeySpec::Range { first: 1, step: 0 })
    }

    pub fn kind(&self) -> CommandKind {
        if DISALLOWED.contains(self.name.as_str()) {
            CommandKind::Disallowed
        } else if self.key_spec() == KeySpec::Keyless {
            CommandKind::Keyless
        } else {
            CommandKind::Keyed
        }
    }

    /// Argument `index` as bytes (index 0 is the command name)
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|a| a.as_ref())
    }

    /// Keys named by this command, in argument order
    ///
    /// Commands not in the key table use the first argument as their key,
    /// which covers the single-key majority of the command set.
    pub fn keys(&self) -> Vec<&[u8]> {
        let argc = self.args.len();
        match self.key_spec() {
            KeySpec::Keyless => Vec::new(),
            KeySpec::Range { first, step: 0 } => self.arg(first).into_iter().collect(),
            KeySpec::Range { first, step } => (first..argc)
                .step_by(step)
                .map(|i| self.args[i].as_ref())
                .collect(),
            KeySpec::Pair => (1..argc.min(3)).map(|i| self.args[i].as_ref()).collect(),
            KeySpec::NumKeys => self.numkeys_at(2),
            KeySpec::DestNumKeys => {
                let mut keys: Vec<&[u8]> = self.arg(1).into_iter().collect();
                keys.extend(self.numkeys_at(2));
                keys
            }
        }
    }

    fn numkeys_at(&self, index: usize) -> Vec<&[u8]> {
        let count = self
            .arg(index)
            .and_then(|n| btoi::btoi::<usize>(n).ok())
            .unwrap_or(0);
        let end = (index + 1 + count).min(self.args.len());
        (index + 1..end).map(|i| self.args[i].as_ref()).collect()
    }
}
