use std::{future::Future, sync::Arc};

use bytes::Bytes;
use dynosaur::dynosaur;

use crate::proxy::{ConnId, ProxyConn};

#[dynosaur(pub(crate) DynConnectionEvents = dyn(box) ConnectionEvents)]
/// Observer for connection lifecycle and forwarded values.
///
/// Every callback runs on its own task, outside the forwarding path, and
/// receives owned byte copies: a slow observer cannot stall the pump or
/// alias its buffers. No ordering is guaranteed relative to forwarding.
pub trait ConnectionEvents: Send + Sync {
    /// A client connection was accepted and its upstream dialed.
    fn on_connect<'a>(
        &'a self,
        id: ConnId,
        conn: Arc<ProxyConn>,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let _ = (id, conn);
        }
    }

    /// Both directions of a connection have terminated.
    fn on_disconnect<'a>(
        &'a self,
        id: ConnId,
        conn: Arc<ProxyConn>,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let _ = (id, conn);
        }
    }

    /// A value was forwarded from the client to the upstream.
    fn on_request<'a>(
        &'a self,
        id: ConnId,
        conn: Arc<ProxyConn>,
        body: Bytes,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let _ = (id, conn, body);
        }
    }

    /// A value was forwarded from the upstream to the client.
    fn on_response<'a>(
        &'a self,
        id: ConnId,
        conn: Arc<ProxyConn>,
        body: Bytes,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let _ = (id, conn, body);
        }
    }
}
