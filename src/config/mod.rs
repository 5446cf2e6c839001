/// Configuration management for slotgate
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::coordination::models::{
    BackendServer, GroupId, ServerGroup, SlotRangeAssignment, TopologySnapshot,
};
use crate::lifecycle::{BackoffPolicy, LifecycleConfig};
use crate::pool::PoolConfig;
use crate::router::RouterConfig;
use crate::session::SessionConfig;
use crate::slots::DEFAULT_SLOT_COUNT;

/// Main slotgate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Proxy identity and routing
    pub proxy: ProxyConfig,
    /// Backend connection pools
    pub pool: PoolSettings,
    /// Registration and drain behaviour
    pub lifecycle: LifecycleSettings,
    /// Coordination service
    pub coordination: CoordinationConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Client listen address
    pub listen_addr: String,
    /// Admin listen address
    pub admin_addr: String,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Close idle client connections after this many seconds (0 disables)
    pub idle_timeout_sec: u64,
    /// Requests in flight per client connection
    pub max_pipeline: usize,
    /// Number of worker threads
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Stable proxy id; generated at startup when unset
    pub id: Option<String>,
    /// Number of hash slots; must match the coordination service
    pub slot_count: usize,
    /// Timeout passed to the source group when moving a key during migration
    pub migrate_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections per group
    pub max_size: usize,
    /// Wait for a free connection; also bounds the wait on pre-migrate slots
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Consecutive failures before a server is marked unhealthy
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Go online after registering without waiting for the control plane
    pub auto_online: bool,
    /// Time between mark-offline and self-termination
    pub drain_grace_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum CoordinationConfig {
    /// In-process store seeded from this file
    #[serde(rename = "embedded")]
    Embedded {
        groups: Vec<GroupConfig>,
        /// Slot ranges; an empty list splits slots evenly over the groups
        #[serde(default)]
        slots: Vec<SlotRangeAssignment>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: GroupId,
    /// Masters, in failover order
    pub servers: Vec<String>,
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:19000".to_string(),
                admin_addr: "0.0.0.0:11000".to_string(),
                max_connections: 10000,
                idle_timeout_sec: 300,
                max_pipeline: 128,
                worker_threads: None,
            },
            proxy: ProxyConfig {
                id: None,
                slot_count: DEFAULT_SLOT_COUNT,
                migrate_timeout_ms: 30,
            },
            pool: PoolSettings {
                max_size: 64,
                acquire_timeout_ms: 1000,
                connect_timeout_ms: 1000,
                io_timeout_ms: 5000,
                failure_threshold: 3,
            },
            lifecycle: LifecycleSettings {
                auto_online: true,
                drain_grace_ms: 5000,
                retry_base_ms: 100,
                retry_max_ms: 10_000,
            },
            coordination: CoordinationConfig::Embedded {
                groups: vec![GroupConfig {
                    id: 1,
                    servers: vec!["127.0.0.1:6379".to_string()],
                    replicas: Vec::new(),
                }],
                slots: Vec::new(),
            },
            health: HealthConfig {
                enabled: true,
                interval_sec: 10,
                timeout_sec: 2,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, addr) in [
            ("listen_addr", &self.server.listen_addr),
            ("admin_addr", &self.server.admin_addr),
        ] {
            addr.parse::<std::net::SocketAddr>().map_err(|_| {
                ConfigError::ValidationError(format!("Invalid {}: {}", name, addr))
            })?;
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.server.max_pipeline == 0 {
            return Err(ConfigError::ValidationError(
                "max_pipeline must be greater than 0".to_string(),
            ));
        }

        if self.proxy.slot_count == 0 {
            return Err(ConfigError::ValidationError(
                "slot_count must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool max_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "pool failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.retry_base_ms == 0
            || self.lifecycle.retry_base_ms > self.lifecycle.retry_max_ms
        {
            return Err(ConfigError::ValidationError(
                "retry_base_ms must be positive and not exceed retry_max_ms".to_string(),
            ));
        }

        let CoordinationConfig::Embedded { groups, .. } = &self.coordination;
        let mut seen = std::collections::HashSet::new();
        for group in groups {
            if group.id == 0 {
                return Err(ConfigError::ValidationError(
                    "group id 0 is reserved".to_string(),
                ));
            }
            if !seen.insert(group.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate group id {}",
                    group.id
                )));
            }
            if group.servers.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "group {} has no servers",
                    group.id
                )));
            }
            for server in group.servers.iter().chain(&group.replicas) {
                server.parse::<std::net::SocketAddr>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "Invalid server in group {}: {}",
                        group.id, server
                    ))
                })?;
            }
        }
        self.topology()?;

        if self.health.enabled {
            if self.health.interval_sec == 0 {
                return Err(ConfigError::ValidationError(
                    "health check interval_sec must be greater than 0".to_string(),
                ));
            }

            if self.health.timeout_sec == 0 || self.health.timeout_sec >= self.health.interval_sec
            {
                return Err(ConfigError::ValidationError(
                    "health check timeout_sec must be positive and less than interval_sec"
                        .to_string(),
                ));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Initial topology for the embedded coordination store
    pub fn topology(&self) -> Result<TopologySnapshot, ConfigError> {
        let CoordinationConfig::Embedded { groups, slots } = &self.coordination;
        let groups: Vec<ServerGroup> = groups
            .iter()
            .map(|g| {
                let servers = g
                    .servers
                    .iter()
                    .map(|s| BackendServer::master(s.as_str()))
                    .chain(g.replicas.iter().map(|s| BackendServer::replica(s.as_str())))
                    .collect();
                ServerGroup::new(g.id, servers)
            })
            .collect();

        let topology = if slots.is_empty() {
            TopologySnapshot::evenly_split(self.proxy.slot_count, groups)
        } else {
            TopologySnapshot::from_ranges(self.proxy.slot_count, groups, slots)
        };
        topology.map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool.max_size,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.pool.io_timeout_ms),
            failure_threshold: self.pool.failure_threshold,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            premigrate_wait: Duration::from_millis(self.pool.acquire_timeout_ms),
            migrate_timeout_ms: self.proxy.migrate_timeout_ms,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.server.idle_timeout_sec),
            max_pipeline: self.server.max_pipeline,
        }
    }

    /// Lifecycle settings for a proxy reachable at the given addresses
    pub fn lifecycle_config(
        &self,
        proxy_id: String,
        addr: String,
        admin_addr: String,
    ) -> LifecycleConfig {
        LifecycleConfig {
            proxy_id,
            addr,
            admin_addr,
            auto_online: self.lifecycle.auto_online,
            drain_grace: Duration::from_millis(self.lifecycle.drain_grace_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.lifecycle.retry_base_ms),
                max: Duration::from_millis(self.lifecycle.retry_max_ms),
                ..BackoffPolicy::default()
            },
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            coordination: CoordinationConfig::Embedded {
                groups: vec![
                    GroupConfig {
                        id: 1,
                        servers: vec!["10.0.1.20:6379".to_string()],
                        replicas: vec!["10.0.1.21:6379".to_string()],
                    },
                    GroupConfig {
                        id: 2,
                        servers: vec!["10.0.1.22:6379".to_string()],
                        replicas: vec!["10.0.1.23:6379".to_string()],
                    },
                ],
                slots: vec![
                    SlotRangeAssignment {
                        lo: 0,
                        hi: 511,
                        group_id: 1,
                    },
                    SlotRangeAssignment {
                        lo: 512,
                        hi: 1023,
                        group_id: 2,
                    },
                ],
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
