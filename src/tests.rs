use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    sync::{mpsc, oneshot},
};
use tokio_util::time::FutureExt;

use crate::{
    proxy::{ConnId, ConnectionEvents, JsonRpcProxy, ProxyConn, ProxyOpts},
    upstream::Upstream,
};

// -- Test helpers --

static SOCKET_SEQ: AtomicU32 = AtomicU32::new(0);

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "jsonrpc-proxy-{}-{}-{}.sock",
        name,
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::SeqCst)
    ))
}

/// Spawns an upstream on a fresh Unix socket that echoes every byte back.
fn spawn_echo_upstream() -> Result<(PathBuf, AbortOnDropHandle<()>)> {
    let path = socket_path("upstream");
    let listener = UnixListener::bind(&path)?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((path, AbortOnDropHandle::new(task)))
}

/// Spawns a proxy listening on a fresh Unix socket, dialing `upstream_path`
/// for every accepted client.
async fn spawn_proxy(
    upstream_path: &Path,
    opts: ProxyOpts,
) -> Result<(JsonRpcProxy, PathBuf, AbortOnDropHandle<Result<()>>)> {
    let listen_path = socket_path("listen");
    let listener = UnixListener::bind(&listen_path)?;
    let proxy = JsonRpcProxy::new(Upstream::unix(upstream_path), opts);
    let serve = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.serve_unix_listener(listener).await })
    };
    Ok((proxy, listen_path, AbortOnDropHandle::new(serve)))
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..250 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyerr!("condition not reached in time"))
}

// -- Tests --

/// A request flows to the upstream and its response back to the client, each
/// framed with exactly one trailing newline.
#[tokio::test]
#[traced_test]
async fn proxies_request_and_response() -> Result {
    let request = r#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
    let response = r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#;

    let upstream_path = socket_path("upstream");
    let upstream_listener = UnixListener::bind(&upstream_path)?;
    let (seen_tx, seen_rx) = oneshot::channel();
    let _upstream_task = AbortOnDropHandle::new(tokio::spawn(async move {
        let (mut stream, _) = upstream_listener.accept().await.unwrap();
        let mut buf = vec![0u8; request.len() + 1];
        stream.read_exact(&mut buf).await.unwrap();
        seen_tx.send(buf).unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
    }));

    let (proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;
    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(request.as_bytes()).await?;

    let seen = seen_rx
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()?
        .anyerr()?;
    assert_eq!(seen, [request.as_bytes(), b"\n"].concat());

    let mut reply = vec![0u8; response.len() + 1];
    client
        .read_exact(&mut reply)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(reply, [response.as_bytes(), b"\n"].concat());

    proxy.shutdown().await;
    Ok(())
}

/// Several values in one write are forwarded as separate framed values.
#[tokio::test]
#[traced_test]
async fn splits_concatenated_values() -> Result {
    let (upstream_path, _upstream_task) = spawn_echo_upstream()?;
    let (_proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;

    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(br#"{"a":1}{"b":2}"#).await?;

    let expected: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
    let mut reply = vec![0u8; expected.len()];
    client
        .read_exact(&mut reply)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(reply, expected);
    Ok(())
}

/// Malformed client input tears both halves of the connection down.
#[tokio::test]
#[traced_test]
async fn malformed_input_closes_connection() -> Result {
    let (upstream_path, _upstream_task) = spawn_echo_upstream()?;
    let (proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;

    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(b"bogus").await?;

    let mut buf = Vec::new();
    let n = client
        .read_to_end(&mut buf)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(n, 0);
    wait_for(|| proxy.active_connections() == 0).await?;
    Ok(())
}

/// A client that half-closes after one request still gets the value
/// delivered, and the upstream connection is released.
#[tokio::test]
#[traced_test]
async fn client_eof_tears_down_upstream() -> Result {
    let value = r#"{"jsonrpc":"2.0","method":"shutdown","id":2}"#;

    let upstream_path = socket_path("upstream");
    let upstream_listener = UnixListener::bind(&upstream_path)?;
    let (done_tx, done_rx) = oneshot::channel();
    let _upstream_task = AbortOnDropHandle::new(tokio::spawn(async move {
        let (mut stream, _) = upstream_listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        done_tx.send(buf).unwrap();
    }));

    let (proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;
    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(value.as_bytes()).await?;
    client.shutdown().await?;

    let received = done_rx
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()?
        .anyerr()?;
    assert_eq!(received, [value.as_bytes(), b"\n"].concat());

    wait_for(|| proxy.active_connections() == 0).await?;
    Ok(())
}

/// When the upstream cannot be dialed the client is dropped without a pump,
/// and the proxy keeps serving.
#[tokio::test]
#[traced_test]
async fn dial_failure_drops_client() -> Result {
    let missing = socket_path("missing");
    let (proxy, client_path, _serve) = spawn_proxy(&missing, ProxyOpts::default()).await?;

    for _ in 0..2 {
        let mut client = UnixStream::connect(&client_path).await?;
        let mut buf = Vec::new();
        let n = client
            .read_to_end(&mut buf)
            .timeout(Duration::from_secs(5))
            .await
            .anyerr()??;
        assert_eq!(n, 0);
    }
    assert_eq!(proxy.active_connections(), 0);
    Ok(())
}

/// Concurrent clients each get their own upstream connection and replies.
#[tokio::test]
#[traced_test]
async fn concurrent_clients() -> Result {
    let (upstream_path, _upstream_task) = spawn_echo_upstream()?;
    let (_proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let client_path = client_path.clone();
        handles.push(tokio::spawn(async move {
            let value = format!(r#"{{"jsonrpc":"2.0","method":"echo","id":{i}}}"#);
            let mut client = UnixStream::connect(&client_path).await?;
            client.write_all(value.as_bytes()).await?;
            let mut reply = vec![0u8; value.len() + 1];
            client.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>((value, reply))
        }));
    }
    for handle in handles {
        let (value, reply) = handle
            .timeout(Duration::from_secs(5))
            .await
            .anyerr()?
            .anyerr()??;
        assert_eq!(reply, [value.as_bytes(), b"\n"].concat());
    }
    Ok(())
}

/// The TCP listener and dialer variants forward the same way.
#[tokio::test]
#[traced_test]
async fn proxies_over_tcp() -> Result {
    let upstream_listener = TcpListener::bind("localhost:0").await?;
    let upstream_addr = upstream_listener.local_addr()?;
    let _upstream_task = AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = upstream_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    }));

    let client_listener = TcpListener::bind("localhost:0").await?;
    let client_addr = client_listener.local_addr()?;
    let proxy = JsonRpcProxy::new(
        Upstream::tcp(upstream_addr.to_string()),
        ProxyOpts::default(),
    );
    let _serve = AbortOnDropHandle::new(tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve_tcp_listener(client_listener).await }
    }));

    let value = r#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
    let mut client = TcpStream::connect(client_addr).await?;
    client.write_all(value.as_bytes()).await?;
    let mut reply = vec![0u8; value.len() + 1];
    client
        .read_exact(&mut reply)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(reply, [value.as_bytes(), b"\n"].concat());

    proxy.shutdown().await;
    Ok(())
}

/// Shutdown closes active client connections and empties the registry.
#[tokio::test]
#[traced_test]
async fn shutdown_closes_connections() -> Result {
    let (upstream_path, _upstream_task) = spawn_echo_upstream()?;
    let (proxy, client_path, _serve) = spawn_proxy(&upstream_path, ProxyOpts::default()).await?;

    let value = r#"{"a":1}"#;
    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(value.as_bytes()).await?;
    let mut reply = vec![0u8; value.len() + 1];
    client
        .read_exact(&mut reply)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;

    wait_for(|| proxy.active_connections() == 1).await?;
    proxy.dump_debug_info();
    proxy.shutdown().await;

    let mut buf = Vec::new();
    let n = client
        .read_to_end(&mut buf)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(n, 0);
    wait_for(|| proxy.active_connections() == 0).await?;
    Ok(())
}

// -- Events --

#[derive(Debug)]
enum Event {
    Connect(ConnId),
    Disconnect(ConnId),
    Request(ConnId, Bytes),
    Response(ConnId, Bytes),
}

struct RecordingEvents {
    tx: mpsc::UnboundedSender<Event>,
}

impl ConnectionEvents for RecordingEvents {
    async fn on_connect<'a>(&'a self, id: ConnId, _conn: Arc<ProxyConn>) {
        self.tx.send(Event::Connect(id)).ok();
    }

    async fn on_disconnect<'a>(&'a self, id: ConnId, _conn: Arc<ProxyConn>) {
        self.tx.send(Event::Disconnect(id)).ok();
    }

    async fn on_request<'a>(&'a self, id: ConnId, _conn: Arc<ProxyConn>, body: Bytes) {
        self.tx.send(Event::Request(id, body)).ok();
    }

    async fn on_response<'a>(&'a self, id: ConnId, _conn: Arc<ProxyConn>, body: Bytes) {
        self.tx.send(Event::Response(id, body)).ok();
    }
}

/// Observers see the full connection lifecycle with copies of the forwarded
/// values, without participating in the forwarding path.
#[tokio::test]
#[traced_test]
async fn events_observe_lifecycle_and_values() -> Result {
    let request = r#"{"jsonrpc":"2.0","method":"ping","id":1}"#;

    let (upstream_path, _upstream_task) = spawn_echo_upstream()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = ProxyOpts::default().events(RecordingEvents { tx });
    let (_proxy, client_path, _serve) = spawn_proxy(&upstream_path, opts).await?;

    let mut client = UnixStream::connect(&client_path).await?;
    client.write_all(request.as_bytes()).await?;
    let mut reply = vec![0u8; request.len() + 1];
    client
        .read_exact(&mut reply)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    client.shutdown().await?;

    let mut events = Vec::new();
    while events.len() < 4 {
        let event = rx
            .recv()
            .timeout(Duration::from_secs(5))
            .await
            .anyerr()?
            .context("events channel closed")?;
        events.push(event);
    }

    let mut ids = Vec::new();
    let mut requests = Vec::new();
    let mut responses = Vec::new();
    let (mut connects, mut disconnects) = (0, 0);
    for event in &events {
        match event {
            Event::Connect(id) => {
                connects += 1;
                ids.push(*id);
            }
            Event::Disconnect(id) => {
                disconnects += 1;
                ids.push(*id);
            }
            Event::Request(id, body) => {
                requests.push(body.clone());
                ids.push(*id);
            }
            Event::Response(id, body) => {
                responses.push(body.clone());
                ids.push(*id);
            }
        }
    }
    assert_eq!(connects, 1);
    assert_eq!(disconnects, 1);
    assert_eq!(requests, vec![Bytes::copy_from_slice(request.as_bytes())]);
    assert_eq!(responses, vec![Bytes::copy_from_slice(request.as_bytes())]);
    assert!(ids.iter().all(|id| *id == ids[0]));
    Ok(())
}
