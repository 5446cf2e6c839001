//! Shared fixtures for integration tests: an in-process RESP backend and
//! helpers for driving a proxy over TCP
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use slotgate::config::{Config, CoordinationConfig, GroupConfig};
use slotgate::protocol::{RespEncoder, RespParser, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Keys starting with this are answered after `SLOW_DELAY`
pub const SLOW_PREFIX: &[u8] = b"slow";
pub const SLOW_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Default)]
pub struct TestBackend {
    pub addr: String,
    data: Arc<Mutex<HashMap<Vec<u8>, Bytes>>>,
}

impl TestBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Self {
            addr: listener.local_addr().unwrap().to_string(),
            data: Arc::default(),
        };
        let server = backend.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(server.clone().serve(stream));
            }
        });
        backend
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().unwrap().get(key).cloned()
    }

    async fn serve(self, mut stream: TcpStream) {
        let mut buf = BytesMut::new();
        loop {
            while let Ok(Some(request)) = RespParser::parse(&mut buf) {
                let reply = self.execute(request).await;
                if stream.write_all(&RespEncoder::encode(&reply)).await.is_err() {
                    return;
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    async fn execute(&self, request: RespValue) -> RespValue {
        let args: Vec<Bytes> = match request {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    RespValue::BulkString(Some(data)) => Some(data),
                    _ => None,
                })
                .collect(),
            _ => return RespValue::error("ERR bad request"),
        };
        if args.get(1).map_or(false, |k| k.starts_with(SLOW_PREFIX)) {
            tokio::time::sleep(SLOW_DELAY).await;
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match (name.as_str(), args.len()) {
            ("PING", _) => RespValue::SimpleString("PONG".to_string()),
            ("SET", 3) => {
                self.data
                    .lock()
                    .unwrap()
                    .insert(args[1].to_vec(), args[2].clone());
                RespValue::ok()
            }
            ("GET", 2) => RespValue::BulkString(self.get(&args[1])),
            _ => RespValue::error(format!("ERR unknown command '{}'", name)),
        }
    }
}

/// Proxy config on ephemeral ports with one group per entry of `groups`
pub fn proxy_config(proxy_id: &str, groups: Vec<Vec<String>>) -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.admin_addr = "127.0.0.1:0".to_string();
    config.proxy.id = Some(proxy_id.to_string());
    config.lifecycle.retry_base_ms = 10;
    config.lifecycle.retry_max_ms = 200;
    config.health.enabled = false;
    config.coordination = CoordinationConfig::Embedded {
        groups: groups
            .into_iter()
            .enumerate()
            .map(|(i, servers)| GroupConfig {
                id: i as u32 + 1,
                servers,
                replicas: Vec::new(),
            })
            .collect(),
        slots: Vec::new(),
    };
    config
}

/// Minimal RESP client
pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    pub async fn connect(addr: std::net::SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buf: BytesMut::new(),
        })
    }

    pub async fn send(&mut self, parts: &[&str]) {
        let args: Vec<&[u8]> = parts[1..].iter().map(|a| a.as_bytes()).collect();
        let request = RespEncoder::create_command(parts[0], &args);
        self.stream
            .write_all(&RespEncoder::encode(&request))
            .await
            .unwrap();
    }

    pub async fn reply(&mut self) -> RespValue {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = RespParser::parse(&mut self.buf).unwrap() {
                    return value;
                }
                let read = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(read > 0, "proxy closed the connection");
            }
        })
        .await
        .expect("reply in time")
    }

    pub async fn command(&mut self, parts: &[&str]) -> RespValue {
        self.send(parts).await;
        self.reply().await
    }
}
