//! In-process RESP backend for unit tests
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{RespEncoder, RespParser, RespValue};

/// Keys with this prefix make the backend answer slowly
pub const SLOW_PREFIX: &str = "slow";

#[derive(Clone)]
pub struct MockBackend {
    pub addr: String,
    data: Arc<Mutex<HashMap<Vec<u8>, Bytes>>>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Self {
            addr: listener.local_addr().unwrap().to_string(),
            data: Arc::default(),
            log: Arc::default(),
        };
        let server = backend.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(server.clone().serve(stream));
            }
        });
        backend
    }

    /// Every command received so far, as strings
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().get(key).cloned()
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
        self.log.lock().push(
            args.iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        );
        if args.get(1).map_or(false, |k| k.starts_with(SLOW_PREFIX.as_bytes())) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        match (name.as_str(), args.len()) {
            ("PING", _) => RespValue::SimpleString("PONG".to_string()),
            ("SET", 3) => {
                self.data.lock().insert(args[1].to_vec(), args[2].clone());
                RespValue::ok()
            }
            ("GET", 2) => RespValue::BulkString(self.data.lock().get(args[1].as_ref()).cloned()),
            ("SLOTSMGRTTAGONE", 5) => RespValue::Integer(0),
            _ => RespValue::error(format!("ERR unknown command '{}'", name)),
        }
    }
}
