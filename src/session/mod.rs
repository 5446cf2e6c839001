/// Per-client connection loop
///
/// Requests are decoded as they arrive and routed concurrently, up to
/// `max_pipeline` in flight. Replies are written strictly in request order.
/// Requests that hash to the same slot also execute in arrival order, so a
/// pipelined `SET k v` / `GET k` pair observes its own write.
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fnv::FnvHashMap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Command, RespEncoder, RespParser, RespValue};
use crate::router::Router;
use crate::stats::ProxyStats;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close a connection with nothing in flight after this long; zero disables
    pub idle_timeout: Duration,
    /// Requests routed concurrently before reading pauses
    pub max_pipeline: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_pipeline: 128,
        }
    }
}

type PendingReply = BoxFuture<'static, RespValue>;

pub struct Session<S> {
    stream: S,
    peer: String,
    router: Arc<Router>,
    stats: Arc<ProxyStats>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: String,
        router: Arc<Router>,
        stats: Arc<ProxyStats>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            router,
            stats,
            config,
            shutdown,
        }
    }

    /// Serve the connection until the client leaves, a decode error, an idle
    /// timeout, or shutdown
    pub async fn run(self) -> ProxyResult<()> {
        let Session {
            stream,
            peer,
            router,
            stats,
            config,
            mut shutdown,
        } = self;
        let max_pipeline = config.max_pipeline.max(1);
        let (mut reader, mut writer) = tokio::io::split(stream);

        let mut input = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut output = BytesMut::new();
        let mut pending: FuturesOrdered<PendingReply> = FuturesOrdered::new();
        let mut slot_tails: FnvHashMap<usize, oneshot::Receiver<()>> = FnvHashMap::default();
        let mut outcome: ProxyResult<()> = Ok(());
        let mut closing = false;
        let mut shutdown_open = true;

        let idle = sleep(config.idle_timeout);
        tokio::pin!(idle);

        loop {
            while !closing && pending.len() < max_pipeline {
                let decoded = RespParser::parse_request(&mut input)
                    .map_err(ProxyError::from)
                    .and_then(|request| match request {
                        Some(request) => Command::from_resp(request).map(Some),
                        None => Ok(None),
                    });
                match decoded {
                    Ok(Some(Some(command))) => {
                        if command.name == "QUIT" {
                            pending.push_back(future::ready(RespValue::ok()).boxed());
                            closing = true;
                        } else {
                            pending.push_back(Self::schedule(&router, &mut slot_tails, command));
                        }
                    }
                    Ok(Some(None)) => {}
                    Ok(None) => break,
                    Err(e) if e.is_connection_fatal() => {
                        stats.protocol_error();
                        warn!(peer = %peer, error = %e, "Closing connection after protocol error");
                        pending.push_back(future::ready(RespValue::Error(e.reply_message())).boxed());
                        outcome = Err(e);
                        closing = true;
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Rejected request");
                        pending.push_back(future::ready(RespValue::Error(e.reply_message())).boxed());
                    }
                }
            }

            if pending.is_empty() {
                if closing {
                    break;
                }
                slot_tails.clear();
            }

            tokio::select! {
                biased;

                changed = shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) if *shutdown.borrow() => {
                        debug!(peer = %peer, in_flight = pending.len(), "Session cancelled by shutdown");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                },

                Some(reply) = pending.next(), if !pending.is_empty() => {
                    RespEncoder::encode_into(&mut output, &reply);
                    while let Some(Some(reply)) = pending.next().now_or_never() {
                        RespEncoder::encode_into(&mut output, &reply);
                    }
                    tokio::select! {
                        written = writer.write_all(&output) => written?,
                        _ = stopped(&mut shutdown), if shutdown_open => {
                            debug!(peer = %peer, "Session cancelled by shutdown while writing");
                            break;
                        }
                    }
                    output.clear();
                    idle.as_mut().reset(Instant::now() + config.idle_timeout);
                }

                read = reader.read_buf(&mut input), if !closing && pending.len() < max_pipeline => {
                    if read? == 0 {
                        debug!(peer = %peer, "Client closed connection");
                        closing = true;
                    }
                    idle.as_mut().reset(Instant::now() + config.idle_timeout);
                }

                _ = &mut idle, if pending.is_empty() && !config.idle_timeout.is_zero() => {
                    debug!(peer = %peer, "Closing idle connection");
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        outcome
    }

    /// Wrap a command in a future that waits for the previous request on the
    /// same slot before routing
    fn schedule(
        router: &Arc<Router>,
        slot_tails: &mut FnvHashMap<usize, oneshot::Receiver<()>>,
        command: Command,
    ) -> PendingReply {
        let router = Arc::clone(router);
        match router.routing_slot(&command) {
            Some(slot) => {
                let (done_tx, done_rx) = oneshot::channel::<()>();
                let previous = slot_tails.insert(slot, done_rx);
                async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let reply = router.route(&command).await;
                    drop(done_tx);
                    reply
                }
                .boxed()
            }
            None => async move { router.route(&command).await }.boxed(),
        }
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        future::pending::<()>().await;
    }
}
