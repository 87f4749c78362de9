use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{Notify, oneshot, watch},
    time::Instant,
};

use crate::error::{Component, Error, Result};
use crate::reverse::{
    bounded,
    options::DialerOptions,
    protocol::{DatagramStream, Event},
    transport::{AcceptBackoff, BoxedStream, StreamListener, cancelled, is_temporary},
};

type PooledStream = DatagramStream<BoxedStream>;
type Waiter = oneshot::Sender<PooledStream>;

/// Relay side of a reversed connection.
///
/// `serve` accepts the connections reversed listeners dial in and keeps them
/// alive with heartbeats; `dial` claims one of them and completes the
/// handshake. Dropping the dialer closes it.
pub struct Dialer {
    shared: Arc<Shared>,
}

struct Shared {
    opts: DialerOptions,
    local_addr: Option<SocketAddr>,

    // Guards the close transition and owns our handle to the socket.
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    done: AtomicBool,
    close_tx: watch::Sender<bool>,

    // Dial requests waiting for a connection. Abandoned entries are pruned
    // on every push, so the queue only grows with live requests.
    waiters: Mutex<VecDeque<Waiter>>,
    waiter_ready: Notify,

    conn_seq: AtomicU64,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("local_addr", &self.shared.local_addr)
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl Dialer {
    pub fn new<L>(listener: L, opts: DialerOptions) -> Self
    where
        L: StreamListener + 'static,
    {
        let local_addr = listener.local_addr();
        let (close_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                opts,
                local_addr,
                listener: Mutex::new(Some(Arc::new(listener))),
                done: AtomicBool::new(false),
                close_tx,
                waiters: Mutex::new(VecDeque::new()),
                waiter_ready: Notify::new(),
                conn_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Address of the socket reversed listeners should dial.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the dialer and releases the listening socket.
    ///
    /// Only the first call succeeds; later calls return the closed error.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Accept loop. Runs until the dialer is closed or the listener fails
    /// with a non-temporary error.
    pub async fn serve(&self) -> Result<()> {
        let ln = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Closed(Component::Dialer))?;

        let closed = cancelled(self.shared.close_tx.subscribe());
        tokio::pin!(closed);

        let mut backoff = AcceptBackoff::default();
        loop {
            let accepted = tokio::select! {
                _ = &mut closed => return Err(Error::Closed(Component::Dialer)),
                r = ln.accept() => r,
            };

            match accepted {
                Ok(conn) => {
                    backoff.reset();
                    let id = self.shared.conn_seq.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(conn = id, "reverse: connection pooled");
                    tokio::spawn(offer(self.shared.clone(), id, conn));
                }
                Err(err) => {
                    if self.shared.is_closed() {
                        return Err(Error::Closed(Component::Dialer));
                    }
                    if !is_temporary(&err) {
                        tracing::warn!(err = %err, "reverse: accept failed");
                        return Err(err.into());
                    }

                    let delay = backoff.next_delay();
                    tracing::warn!(
                        err = %err,
                        backoff = %humantime::format_duration(delay),
                        "reverse: accept error; retrying"
                    );
                    tokio::select! {
                        _ = &mut closed => return Err(Error::Closed(Component::Dialer)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Claims a pooled connection, waiting until one is available.
    pub async fn dial(&self) -> Result<BoxedStream> {
        let (_tx, ctx) = watch::channel(false);
        self.dial_context(ctx).await
    }

    /// Like [`Dialer::dial`], but gives up with [`Error::Canceled`] once `ctx`
    /// flips to `true`.
    pub async fn dial_context(&self, ctx: watch::Receiver<bool>) -> Result<BoxedStream> {
        if *ctx.borrow() {
            return Err(Error::Canceled);
        }
        if self.shared.is_closed() {
            return Err(Error::Closed(Component::Dialer));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.push_waiter(tx);

        let closed = cancelled(self.shared.close_tx.subscribe());
        tokio::pin!(closed);
        let canceled = cancelled(ctx);
        tokio::pin!(canceled);

        let claimed = tokio::select! {
            _ = &mut canceled => Err(Error::Canceled),
            _ = &mut closed => Err(Error::Closed(Component::Dialer)),
            r = rx => r.map_err(|_| Error::Closed(Component::Dialer)),
        };
        let mut stream = match claimed {
            Ok(stream) => stream,
            Err(err) => {
                // Our receiver is gone; drop the dead entry now rather than on
                // the next push.
                self.shared.prune_waiters();
                return Err(err);
            }
        };

        if self.shared.opts.handshake {
            let res = tokio::select! {
                _ = &mut canceled => Err(Error::Canceled),
                _ = &mut closed => Err(Error::Closed(Component::Dialer)),
                r = bounded(self.shared.opts.timeout, initiate(&mut stream)) => r,
            };
            if let Err(err) = res {
                tracing::debug!(err = %err, "reverse: initiator handshake failed");
                return Err(err);
            }
        }
        Ok(stream.into_inner())
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if !self.is_closed() {
            let mut ln = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_closed() {
                self.close_tx.send_replace(true);
                ln.take();
                self.waiters.lock().unwrap_or_else(|e| e.into_inner()).clear();
                self.done.store(true, Ordering::Release);
                tracing::debug!(addr = ?self.local_addr, "reverse: dialer closed");
                return Ok(());
            }
        }
        Err(Error::Closed(Component::Dialer))
    }

    fn push_waiter(&self, w: Waiter) {
        {
            let mut q = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            q.retain(|w| !w.is_closed());
            q.push_back(w);
        }
        self.waiter_ready.notify_waiters();
    }

    fn prune_waiters(&self) {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| !w.is_closed());
    }

    fn pop_waiter(&self) -> Option<Waiter> {
        let mut q = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(w) = q.pop_front() {
            if !w.is_closed() {
                return Some(w);
            }
        }
        None
    }

    /// Next dial request still waiting for a connection.
    async fn next_waiter(&self) -> Waiter {
        loop {
            // Register before checking the queue so a push in between wakes us.
            let ready = self.waiter_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            if let Some(w) = self.pop_waiter() {
                return w;
            }
            ready.await;
        }
    }

    async fn send_heart(&self, stream: &mut PooledStream) -> Result<()> {
        bounded(self.opts.heartbeat_timeout, stream.send(Event::Heart)).await
    }
}

/// Keeps one accepted connection on offer until a dial request takes it.
async fn offer(shared: Arc<Shared>, id: u64, conn: BoxedStream) {
    let mut stream = DatagramStream::new(conn);
    let heartbeat = shared.opts.heartbeat;

    let closed = cancelled(shared.close_tx.subscribe());
    tokio::pin!(closed);
    let timer = tokio::time::sleep(heartbeat);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut closed => {
                tracing::debug!(conn = id, "reverse: dialer closed; dropping pooled connection");
                return;
            }
            _ = &mut timer, if !heartbeat.is_zero() => {
                let sent = tokio::select! {
                    _ = &mut closed => Err(Error::Closed(Component::Dialer)),
                    r = shared.send_heart(&mut stream) => r,
                };
                if let Err(err) = sent {
                    tracing::debug!(conn = id, err = %err, "reverse: heartbeat failed; dropping pooled connection");
                    return;
                }
                timer.as_mut().reset(Instant::now() + heartbeat);
            }
            waiter = shared.next_waiter() => {
                match waiter.send(stream) {
                    Ok(()) => {
                        tracing::debug!(conn = id, "reverse: pooled connection claimed");
                        return;
                    }
                    // The dial request gave up between being queued and now.
                    Err(back) => stream = back,
                }
            }
        }
    }
}

async fn initiate(stream: &mut PooledStream) -> Result<()> {
    stream.send(Event::Syn).await?;
    stream.recv(&[Event::SynAck]).await?;
    stream.send(Event::Ack).await
}
