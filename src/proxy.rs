//! Per-connection pump, accept loops, and connection registry.
//!
//! Each accepted client gets one fresh upstream connection and two
//! [`Splitter`]s, one per direction. The directions run concurrently and
//! share nothing but a cancellation token: any fatal framing, policy, or
//! transport error cancels the token, the peer direction exits at its next
//! suspension point, and both sockets are closed together.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use n0_error::{Result, stack_error};
use n0_future::time::Instant;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, UnixListener},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, info, trace, warn};

use crate::{
    IoStream,
    split::{SplitError, Splitter, SplitterOpts},
    upstream::Upstream,
};

mod events;

pub use self::events::ConnectionEvents;
use self::events::DynConnectionEvents;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-unique identifier of one proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("conn-{_0}")]
pub struct ConnId(u64);

/// Options for a [`JsonRpcProxy`].
#[derive(derive_more::Debug, Default, Clone)]
pub struct ProxyOpts {
    /// Splitter configuration applied to both directions of every connection.
    pub splitter: SplitterOpts,
    #[debug("{:?}", events.as_ref().map(|_| "DynConnectionEvents"))]
    events: Option<Arc<DynConnectionEvents<'static>>>,
}

impl ProxyOpts {
    /// Sets the splitter configuration for both directions.
    pub fn splitter(mut self, opts: SplitterOpts) -> Self {
        self.splitter = opts;
        self
    }

    /// Installs an observer for connection lifecycle and forwarded values.
    pub fn events(mut self, events: impl ConnectionEvents + 'static) -> Self {
        self.events = Some(DynConnectionEvents::new_arc(events));
        self
    }
}

/// Fatal errors of one proxied connection.
#[stack_error(derive)]
#[non_exhaustive]
pub enum ProxyError {
    /// Dialing the upstream failed; the client is dropped without a pump.
    #[error("failed to dial upstream")]
    Dial {
        #[error(source, std_err)]
        source: std::io::Error,
    },

    /// The client-to-upstream direction failed.
    #[error("client to upstream direction failed")]
    ClientToUpstream {
        #[error(source)]
        source: SplitError,
    },

    /// The upstream-to-client direction failed.
    #[error("upstream to client direction failed")]
    UpstreamToClient {
        #[error(source)]
        source: SplitError,
    },
}

#[derive(Debug, Default)]
struct DirectionStats {
    values: AtomicU64,
    bytes: AtomicU64,
}

impl DirectionStats {
    fn record(&self, bytes: usize) {
        self.values.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.values.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Registry entry for one active proxied connection.
///
/// The splitters themselves are owned exclusively by their direction tasks;
/// the registry holds only identity and atomic forwarding counters.
#[derive(Debug)]
pub struct ProxyConn {
    id: ConnId,
    peer: String,
    created_at: Instant,
    client_to_upstream: DirectionStats,
    upstream_to_client: DirectionStats,
}

impl ProxyConn {
    /// Connection identifier.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Peer description of the client socket.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Values and bytes forwarded from the client to the upstream.
    pub fn requests_forwarded(&self) -> (u64, u64) {
        self.client_to_upstream.snapshot()
    }

    /// Values and bytes forwarded from the upstream to the client.
    pub fn responses_forwarded(&self) -> (u64, u64) {
        self.upstream_to_client.snapshot()
    }
}

/// Reverse proxy forwarding framed JSON-RPC values between local clients and
/// a single upstream endpoint.
///
/// Cheap to clone; all clones share the same registry and shutdown scope.
#[derive(Debug, Clone)]
pub struct JsonRpcProxy {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    upstream: Upstream,
    opts: ProxyOpts,
    conn_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    active: Mutex<HashMap<ConnId, Arc<ProxyConn>>>,
    active_count: AtomicU64,
}

impl JsonRpcProxy {
    /// Creates a proxy forwarding to the given upstream.
    pub fn new(upstream: Upstream, opts: ProxyOpts) -> Self {
        Self {
            inner: Arc::new(Shared {
                upstream,
                opts,
                conn_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                active: Mutex::new(HashMap::new()),
                active_count: AtomicU64::new(0),
            }),
        }
    }

    /// Accepts client connections on a Unix socket listener and pumps each
    /// in a new task. Runs until the listener errors or [`Self::shutdown`].
    pub async fn serve_unix_listener(&self, listener: UnixListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                res = listener.accept() => {
                    let (stream, addr) = res?;
                    debug!(?addr, "accepted unix connection");
                    self.spawn_connection(stream, format!("{addr:?}"));
                }
            }
        }
    }

    /// Accepts client connections on a TCP listener and pumps each in a new
    /// task. Runs until the listener errors or [`Self::shutdown`].
    pub async fn serve_tcp_listener(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                res = listener.accept() => {
                    let (stream, addr) = res?;
                    debug!(%addr, "accepted tcp connection");
                    self.spawn_connection(stream, addr.to_string());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: impl IoStream + 'static, peer: String) {
        let id = ConnId(self.inner.conn_id.fetch_add(1, Ordering::SeqCst));
        let this = self.clone();
        self.inner.tasks.spawn(
            async move {
                match this.pump(stream, id, peer).await {
                    Ok(()) => debug!("connection closed"),
                    Err(err) => warn!("connection closed with error: {err:#}"),
                }
            }
            .instrument(error_span!("conn", %id)),
        );
    }

    /// Pumps a single already-accepted client connection to completion.
    pub async fn handle_connection(
        &self,
        client: impl IoStream,
        peer: String,
    ) -> Result<(), ProxyError> {
        let id = ConnId(self.inner.conn_id.fetch_add(1, Ordering::SeqCst));
        self.pump(client, id, peer)
            .instrument(error_span!("conn", %id))
            .await
    }

    async fn pump(
        &self,
        client: impl IoStream,
        id: ConnId,
        peer: String,
    ) -> Result<(), ProxyError> {
        let upstream = match self.inner.upstream.connect().await {
            Ok(upstream) => upstream,
            Err(source) => return Err(ProxyError::Dial { source }),
        };
        debug!("dialed upstream");

        let conn = Arc::new(ProxyConn {
            id,
            peer,
            created_at: Instant::now(),
            client_to_upstream: DirectionStats::default(),
            upstream_to_client: DirectionStats::default(),
        });
        self.register(conn.clone());
        if let Some(events) = &self.inner.opts.events {
            let (events, conn) = (events.clone(), conn.clone());
            tokio::spawn(async move { events.on_connect(id, conn).await });
        }

        let start = Instant::now();
        let cancel = self.inner.shutdown.child_token();
        let events = self.inner.opts.events.clone();
        let (client_read, mut client_write) = tokio::io::split(client);
        let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
        let mut client_splitter =
            Splitter::with_opts(client_read, self.inner.opts.splitter.clone());
        let mut upstream_splitter =
            Splitter::with_opts(upstream_read, self.inner.opts.splitter.clone());

        let (to_upstream, to_client) = tokio::join!(
            async {
                let res = client_splitter
                    .decode_all(
                        async move |value: &[u8]| {
                            upstream_write.write_all(value).await?;
                            upstream_write.write_all(b"\n").await?;
                            conn.client_to_upstream.record(value.len() + 1);
                            trace!(size = value.len(), "forwarded request");
                            if let Some(events) = &events {
                                let (events, conn) = (events.clone(), conn.clone());
                                let body = Bytes::copy_from_slice(value);
                                tokio::spawn(
                                    async move { events.on_request(id, conn, body).await },
                                );
                            }
                            Ok(())
                        },
                        &cancel,
                    )
                    .await;
                if res.is_err() {
                    cancel.cancel();
                }
                upstream_write.shutdown().await.ok();
                res
            },
            async {
                let res = upstream_splitter
                    .decode_all(
                        async move |value: &[u8]| {
                            client_write.write_all(value).await?;
                            client_write.write_all(b"\n").await?;
                            conn.upstream_to_client.record(value.len() + 1);
                            trace!(size = value.len(), "forwarded response");
                            if let Some(events) = &events {
                                let (events, conn) = (events.clone(), conn.clone());
                                let body = Bytes::copy_from_slice(value);
                                tokio::spawn(
                                    async move { events.on_response(id, conn, body).await },
                                );
                            }
                            Ok(())
                        },
                        &cancel,
                    )
                    .await;
                if res.is_err() {
                    cancel.cancel();
                }
                client_write.shutdown().await.ok();
                res
            },
        );
        trace!(elapsed = ?start.elapsed(), "pump finished");

        self.deregister(id);
        if let Some(events) = &self.inner.opts.events {
            let (events, conn) = (events.clone(), conn.clone());
            tokio::spawn(async move { events.on_disconnect(id, conn).await });
        }

        to_upstream.map_err(|source| ProxyError::ClientToUpstream { source })?;
        to_client.map_err(|source| ProxyError::UpstreamToClient { source })?;
        Ok(())
    }

    fn register(&self, conn: Arc<ProxyConn>) {
        self.inner
            .active
            .lock()
            .expect("lock poisoned")
            .insert(conn.id, conn);
        self.inner.active_count.fetch_add(1, Ordering::SeqCst);
    }

    fn deregister(&self, id: ConnId) {
        self.inner.active.lock().expect("lock poisoned").remove(&id);
        self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of currently active proxied connections.
    pub fn active_connections(&self) -> usize {
        self.inner.active_count.load(Ordering::SeqCst) as usize
    }

    /// Logs identity, age, and forwarding counters of every active
    /// connection.
    pub fn dump_debug_info(&self) {
        let conns: Vec<_> = self
            .inner
            .active
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        info!(active_connections = conns.len(), "proxy debug info");
        for conn in conns {
            let (requests, request_bytes) = conn.requests_forwarded();
            let (responses, response_bytes) = conn.responses_forwarded();
            info!(
                id = %conn.id(),
                peer = %conn.peer(),
                age = ?conn.age(),
                requests,
                request_bytes,
                responses,
                response_bytes,
                "active connection"
            );
        }
    }

    /// Cancels all listeners and in-flight connections, then waits briefly
    /// for their tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        debug!("shutting down ({} pending connections)", self.inner.tasks.len());
        match self
            .inner
            .tasks
            .wait()
            .timeout(GRACEFUL_SHUTDOWN_TIMEOUT)
            .await
        {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => debug!(
                remaining = self.inner.tasks.len(),
                "not all connections closed in time"
            ),
        }
    }
}
