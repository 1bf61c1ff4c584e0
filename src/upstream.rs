//! Upstream connection factory.
//!
//! The pump dials one fresh upstream connection per accepted client through
//! the [`Dialer`] seam. Pooled or multiplexed variants can be layered on top
//! by providing a custom dialer.

use std::{future::Future, io, path::PathBuf, sync::Arc};

use dynosaur::dynosaur;
use tokio::net::{TcpStream, UnixStream};

use crate::BoxedIo;

#[dynosaur(pub(crate) DynDialer = dyn(box) Dialer)]
/// Produces fresh upstream connections on demand.
pub trait Dialer: Send + Sync {
    /// Opens a new connection to the upstream endpoint.
    fn dial<'a>(&'a self) -> impl Future<Output = io::Result<BoxedIo>> + Send + 'a;
}

/// Dials a fixed Unix domain socket path.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    /// Creates a dialer for the given socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Dialer for UnixDialer {
    async fn dial(&self) -> io::Result<BoxedIo> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }
}

/// Dials a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    /// Creates a dialer for the given `host:port` address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedIo> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(stream))
    }
}

/// Handle to the upstream endpoint used by the proxy.
#[derive(derive_more::Debug, Clone)]
pub struct Upstream {
    #[debug("Arc<dyn Dialer>")]
    dialer: Arc<DynDialer<'static>>,
}

impl Upstream {
    /// Creates an upstream from a custom dialer.
    pub fn new(dialer: impl Dialer + 'static) -> Self {
        Self {
            dialer: DynDialer::new_arc(dialer),
        }
    }

    /// Creates an upstream dialing a Unix domain socket path.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(UnixDialer::new(path))
    }

    /// Creates an upstream dialing a TCP address.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(TcpDialer::new(addr))
    }

    /// Opens a fresh upstream connection.
    pub async fn connect(&self) -> io::Result<BoxedIo> {
        self.dialer.dial().await
    }
}
