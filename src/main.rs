use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use clap::Parser;
use jsonrpc_proxy::{
    proxy::{JsonRpcProxy, ProxyOpts},
    split::{Limits, SplitterOpts},
    upstream::Upstream,
};
use n0_error::Result;
use tokio::{
    net::UnixListener,
    signal::unix::{SignalKind, signal},
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Reverse proxy for JSON-RPC over Unix domain sockets.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Unix socket path to listen on. May be given multiple times.
    #[clap(short, long, default_value = "/tmp/rpc-proxy.sock")]
    listen: Vec<PathBuf>,

    /// Unix socket path of the upstream JSON-RPC endpoint.
    #[clap(short, long)]
    upstream: PathBuf,

    /// Listen socket permissions in octal (e.g. 0666).
    #[clap(long, default_value = "0666")]
    socket_perms: String,

    /// Initial buffer capacity per stream direction, in bytes.
    #[clap(long, default_value_t = 16384)]
    buffer: usize,

    /// Maximum bytes per read from either socket.
    #[clap(long, default_value_t = 4096)]
    max_read: usize,

    /// Log level filter (trace, debug, info, warn, error).
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|err| {
        eprintln!("invalid log level {:?} ({err}), using \"info\"", cli.log_level);
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let socket_mode = match u32::from_str_radix(&cli.socket_perms, 8) {
        Ok(mode) => mode,
        Err(err) => {
            warn!(perms = %cli.socket_perms, "invalid socket permissions ({err}), using 0666");
            0o666
        }
    };

    let opts = ProxyOpts::default().splitter(SplitterOpts {
        initial_capacity: cli.buffer,
        max_read_chunk: cli.max_read,
        limits: Limits::default(),
    });
    let proxy = JsonRpcProxy::new(Upstream::unix(&cli.upstream), opts);

    for path in &cli.listen {
        // A previous run may have left its socket file behind.
        if path.exists() {
            fs::remove_file(path)?;
            debug!(socket = %path.display(), "removed existing socket file");
        }
        let listener = UnixListener::bind(path)?;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(socket_mode)) {
            warn!(socket = %path.display(), "failed to set socket permissions: {err}");
        }
        let proxy = proxy.clone();
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = proxy.serve_unix_listener(listener).await {
                warn!(socket = %path.display(), "listener failed: {err:#}");
            }
        });
    }
    info!(
        listen = ?cli.listen,
        upstream = %cli.upstream.display(),
        buffer = cli.buffer,
        max_read = cli.max_read,
        "proxy started"
    );

    let mut debug_signal = signal(SignalKind::user_defined1())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = debug_signal.recv() => {
                info!("received SIGUSR1, dumping debug info");
                proxy.dump_debug_info();
            }
            _ = terminate.recv() => break,
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    info!("shutting down");
    proxy.shutdown().await;
    for path in &cli.listen {
        if let Err(err) = fs::remove_file(path) {
            warn!(socket = %path.display(), "failed to remove socket file: {err}");
        }
    }
    Ok(())
}
