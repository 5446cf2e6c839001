/// A single request/response connection to one backend server
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{RespEncoder, RespParser, RespValue};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct BackendConnection {
    addr: String,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl BackendConnection {
    /// Connect to a backend server
    pub async fn connect(addr: &str, connect_timeout: Duration) -> ProxyResult<Self> {
        debug!("Connecting to backend {}", addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to backend {}: {}", addr, e);
                return Err(ProxyError::Network(e));
            }
            Err(_) => {
                debug!("Timeout connecting to backend {}", addr);
                return Err(ProxyError::timeout(format!("connect to {}", addr)));
            }
        };

        if let Err(e) = Self::configure_stream(&stream) {
            warn!("Failed to configure backend stream {}: {}", addr, e);
        }

        Ok(Self {
            addr: addr.to_string(),
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::new(),
        })
    }

    fn configure_stream(stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and read exactly one reply
    ///
    /// Any error leaves the connection in an unknown framing state; the
    /// caller must discard it.
    pub async fn call(&mut self, request: &RespValue, io_timeout: Duration) -> ProxyResult<RespValue> {
        match timeout(io_timeout, self.roundtrip(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::timeout(format!("backend {} reply", self.addr))),
        }
    }

    async fn roundtrip(&mut self, request: &RespValue) -> ProxyResult<RespValue> {
        self.write_buf.clear();
        RespEncoder::encode_into(&mut self.write_buf, request);
        self.stream.write_all(&self.write_buf).await?;

        loop {
            if let Some(reply) = RespParser::parse(&mut self.read_buf)? {
                return Ok(reply);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ProxyError::Network(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("backend {} closed the connection", self.addr),
                )));
            }
        }
    }
}
