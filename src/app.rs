use std::{future::Future, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::{
    config::{self, Config, ExposeConfig, RelayConfig},
    logging, net,
    reverse::{
        BoxedStream, Dialer, Listener, TcpStreamListener,
        transport::{AcceptBackoff, is_temporary},
    },
};

/// What the binary was asked to run. `None` fields keep the config value.
#[derive(Debug, Clone)]
pub enum Mode {
    Relay {
        tunnel_addr: Option<String>,
        public_addr: Option<String>,
    },
    Expose {
        relay_addr: Option<String>,
        local_addr: Option<String>,
        workers: Option<usize>,
    },
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let mut cfg = match &config_path {
        Some(p) => config::load_config(p).with_context(|| format!("load config: {}", p.display()))?,
        None => Config::default(),
    };

    let _logging = logging::init(&cfg.logging)?;

    if let Some(p) = &config_path {
        tracing::info!(config = %p.display(), "revnet: config loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("revnet: shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                tracing::warn!(err = %err, "revnet: cannot listen for ctrl-c");
                // Keep the sender alive so runners are not stopped by its drop.
                std::future::pending::<()>().await;
            }
        }
    });

    match mode {
        Mode::Relay {
            tunnel_addr,
            public_addr,
        } => {
            if let Some(a) = tunnel_addr {
                cfg.relay.tunnel_addr = a;
            }
            if let Some(a) = public_addr {
                cfg.relay.public_addr = a;
            }
            run_relay(cfg.relay, shutdown_rx).await
        }
        Mode::Expose {
            relay_addr,
            local_addr,
            workers,
        } => {
            if let Some(a) = relay_addr {
                cfg.expose.relay_addr = a;
            }
            if let Some(a) = local_addr {
                cfg.expose.local_addr = a;
            }
            if let Some(n) = workers {
                cfg.expose.workers = n.max(1);
            }
            run_expose(cfg.expose, shutdown_rx).await
        }
    }
}

/// Public side: every client on `public_addr` is spliced onto a reversed
/// connection claimed from the pool on `tunnel_addr`.
pub async fn run_relay(cfg: RelayConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let tunnel_addr = net::bind_addr(&cfg.tunnel_addr).into_owned();
    let public_addr = net::bind_addr(&cfg.public_addr).into_owned();

    let ln = TcpStreamListener::bind(&tunnel_addr)
        .await
        .with_context(|| format!("relay: bind tunnel {tunnel_addr}"))?;
    let dialer = Arc::new(Dialer::new(ln, cfg.dialer.clone()));
    let public = TcpListener::bind(&public_addr)
        .await
        .with_context(|| format!("relay: bind public {public_addr}"))?;

    tracing::info!(
        tunnel = ?dialer.local_addr(),
        public = ?public.local_addr().ok(),
        handshake = cfg.dialer.handshake,
        heartbeat = %humantime::format_duration(cfg.dialer.heartbeat),
        "relay: listening"
    );

    let mut serve = JoinSet::new();
    {
        let dialer = dialer.clone();
        serve.spawn(async move { dialer.serve().await });
    }

    let mut backoff = AcceptBackoff::default();
    let result = loop {
        tokio::select! {
            r = shutdown.changed() => {
                if r.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
            Some(res) = serve.join_next() => {
                break match res {
                    Ok(Err(err)) if !err.is_closed() => {
                        Err(anyhow::Error::new(err).context("relay: tunnel accept loop"))
                    }
                    Err(err) => Err(anyhow::Error::new(err).context("relay: tunnel accept loop")),
                    _ => Ok(()),
                };
            }
            accepted = accept_retrying(|| public.accept(), &mut backoff) => {
                match accepted {
                    Ok((client, peer)) => {
                        tokio::spawn(relay_client(dialer.clone(), client, peer, shutdown.clone()));
                    }
                    Err(err) => {
                        break Err(anyhow::Error::new(err).context("relay: public accept"));
                    }
                }
            }
        }
    };

    let _ = dialer.close();
    serve.shutdown().await;
    tracing::info!("relay: stopped");
    result
}

async fn relay_client(
    dialer: Arc<Dialer>,
    mut client: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let dialed = tokio::select! {
        r = dialer.dial_context(shutdown) => r,
        _ = hung_up(&client) => {
            tracing::debug!(client = %peer, "relay: client left before pairing");
            return;
        }
    };
    let mut up = match dialed {
        Ok(up) => up,
        Err(err) => {
            tracing::warn!(client = %peer, err = %err, "relay: no reversed connection");
            return;
        }
    };
    tracing::debug!(client = %peer, "relay: client paired");
    match net::splice(&mut client, &mut up).await {
        Ok((tx, rx)) => tracing::debug!(client = %peer, tx, rx, "relay: client done"),
        Err(err) => tracing::debug!(client = %peer, err = %err, "relay: client ended"),
    }
}

/// Runs `accept` until it succeeds, sleeping through temporary errors.
/// Permanent errors are returned.
async fn accept_retrying<T, F, Fut>(mut accept: F, backoff: &mut AcceptBackoff) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(v) => {
                backoff.reset();
                return Ok(v);
            }
            Err(err) if is_temporary(&err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    err = %err,
                    backoff = %humantime::format_duration(delay),
                    "relay: public accept error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Resolves once the client hangs up without sending anything. A client that
/// already sent bytes is kept until it is paired.
async fn hung_up(client: &TcpStream) {
    let mut buf = [0u8; 1];
    match client.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Private side: keeps `workers` accepts outstanding against the relay and
/// splices each accepted connection onto `local_addr`.
pub async fn run_expose(cfg: ExposeConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    if cfg.relay_addr.trim().is_empty() {
        anyhow::bail!("expose: relay_addr is required");
    }
    if cfg.local_addr.trim().is_empty() {
        anyhow::bail!("expose: local_addr is required");
    }

    let listener = Arc::new(Listener::new(cfg.relay_addr.trim(), cfg.listener_options()));
    let local: Arc<str> = Arc::from(cfg.local_addr.trim());

    tracing::info!(
        relay = %listener.addr(),
        local = %local,
        workers = cfg.workers,
        handshake = cfg.handshake,
        "expose: started"
    );

    let mut workers = JoinSet::new();
    for id in 0..cfg.workers.max(1) {
        workers.spawn(expose_worker(
            id,
            listener.clone(),
            local.clone(),
            shutdown.clone(),
        ));
    }

    loop {
        tokio::select! {
            r = shutdown.changed() => {
                if r.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            None = workers.join_next() => break,
        }
    }

    let _ = listener.close();
    while workers.join_next().await.is_some() {}
    tracing::info!("expose: stopped");
    Ok(())
}

async fn expose_worker(
    id: usize,
    listener: Arc<Listener>,
    local: Arc<str>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::ZERO;
    loop {
        match listener.accept().await {
            Ok(conn) => {
                backoff = Duration::ZERO;
                tokio::spawn(forward_local(conn, local.clone()));
            }
            Err(err) if err.is_closed() => return,
            Err(err) => {
                backoff = if backoff.is_zero() {
                    Duration::from_secs(1)
                } else {
                    (backoff * 2).min(Duration::from_secs(10))
                };
                tracing::warn!(
                    worker = id,
                    relay = %listener.addr(),
                    err = %err,
                    backoff = %humantime::format_duration(backoff),
                    "expose: accept failed; retrying"
                );
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

async fn forward_local(mut conn: BoxedStream, local: Arc<str>) {
    let mut up = match TcpStream::connect(&*local).await {
        Ok(up) => up,
        Err(err) => {
            tracing::warn!(local = %local, err = %err, "expose: local dial failed");
            return;
        }
    };
    match net::splice(&mut conn, &mut up).await {
        Ok((tx, rx)) => tracing::debug!(local = %local, tx, rx, "expose: connection done"),
        Err(err) => tracing::debug!(local = %local, err = %err, "expose: connection ended"),
    }
}
