//! Utilities for proxying JSON-RPC over stream sockets.
//!
//! The proxy sits between local clients and a single upstream JSON-RPC
//! endpoint, both reachable over Unix domain sockets (or TCP). It frames the
//! byte stream in each direction into discrete top-level JSON values without
//! parsing their interior, and forwards every value to the opposite peer
//! followed by a single newline.
//!
//! The crate is built from three layers:
//!
//! - [`scan`]: byte-range scanner primitives with an optional AVX2 fast path.
//! - [`split`]: the [`Splitter`], a bounded-memory streaming separator that
//!   turns a socket's byte stream into borrowed value ranges.
//! - [`proxy`]: the per-connection pump that drives one splitter per
//!   direction, plus the accept loops and connection registry.
//!
//! Upstream connections are produced on demand through the [`Dialer`] seam in
//! [`upstream`], one fresh connection per accepted client.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod proxy;
pub mod scan;
pub mod split;
pub mod upstream;

pub use proxy::{ConnId, ConnectionEvents, JsonRpcProxy, ProxyConn, ProxyError, ProxyOpts};
pub use scan::Scanner;
pub use split::{Limits, NextValue, SplitError, Splitter, SplitterOpts};
pub use upstream::{Dialer, TcpDialer, UnixDialer, Upstream};

/// Transport requirements for proxied streams.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Boxed transport as returned by upstream dialers.
pub type BoxedIo = Box<dyn IoStream>;

#[cfg(test)]
mod tests;
