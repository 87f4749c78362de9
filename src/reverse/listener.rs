use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{oneshot, watch};

use crate::error::{Component, Error, Result};
use crate::reverse::{
    bounded,
    options::ListenerOptions,
    protocol::{DatagramStream, Event},
    transport::{BoxedStream, cancelled},
};

/// Private side of a reversed connection.
///
/// Every [`Listener::accept`] dials the relay once and waits for the relay to
/// claim that connection. Dropping the listener closes it.
pub struct Listener {
    shared: Arc<Shared>,
}

struct Shared {
    opts: ListenerOptions,
    addr: String,

    m: Mutex<()>,
    done: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.shared.addr)
            .field("opts", &self.shared.opts)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Listener {
    /// Creates a listener that dials `addr`. Nothing is dialed until `accept`.
    pub fn new(addr: impl Into<String>, opts: ListenerOptions) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                opts,
                addr: addr.into(),
                m: Mutex::new(()),
                done: AtomicBool::new(false),
                close_tx,
            }),
        }
    }

    /// The remote address being dialed.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits for and returns the next connection to the listener.
    pub async fn accept(&self) -> Result<BoxedStream> {
        if self.shared.is_closed() {
            return Err(Error::Closed(Component::Listener));
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(attempt(self.shared.clone(), tx));

        tokio::select! {
            r = rx => r.unwrap_or(Err(Error::Closed(Component::Listener))),
            _ = cancelled(self.shared.close_tx.subscribe()) => Err(Error::Closed(Component::Listener)),
        }
    }

    /// Closes the listener. Blocked `accept` calls return the closed error and
    /// connections still in their handshake are dropped.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

/// One dial + handshake on behalf of a single `accept` call.
async fn attempt(shared: Arc<Shared>, tx: oneshot::Sender<Result<BoxedStream>>) {
    let res = tokio::select! {
        _ = cancelled(shared.close_tx.subscribe()) => {
            tracing::debug!(addr = %shared.addr, "reverse: listener closed; dial abandoned");
            return;
        }
        r = shared.dial() => r,
    };
    if let Err(err) = &res {
        tracing::debug!(addr = %shared.addr, err = %err, "reverse: dial attempt failed");
    }
    // The accept side is gone; a live connection is dropped here.
    if let Err(Ok(_conn)) = tx.send(res) {
        tracing::debug!(addr = %shared.addr, "reverse: accept gone; dropping connection");
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if !self.is_closed() {
            let _guard = self.m.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_closed() {
                self.close_tx.send_replace(true);
                self.done.store(true, Ordering::Release);
                tracing::debug!(addr = %self.addr, "reverse: listener closed");
                return Ok(());
            }
        }
        Err(Error::Closed(Component::Listener))
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let conn = self
            .opts
            .connector
            .connect(self.close_tx.subscribe(), &self.addr)
            .await?;
        if self.is_closed() {
            return Err(Error::Closed(Component::Listener));
        }
        if !self.opts.handshake {
            return Ok(conn);
        }

        let mut stream = DatagramStream::new(conn);
        self.recv_syn(&mut stream).await?;
        bounded(self.opts.timeout, respond(&mut stream)).await?;
        Ok(stream.into_inner())
    }

    /// Waits for Syn, tolerating heartbeats. Each Heart restarts the
    /// inactivity deadline.
    async fn recv_syn(&self, stream: &mut DatagramStream<BoxedStream>) -> Result<()> {
        loop {
            let ev = bounded(
                self.opts.heartbeat_timeout,
                stream.recv(&[Event::Heart, Event::Syn]),
            )
            .await?;
            if ev == Event::Syn {
                return Ok(());
            }
            tracing::trace!(addr = %self.addr, "reverse: heart");
        }
    }
}

async fn respond(stream: &mut DatagramStream<BoxedStream>) -> Result<()> {
    stream.send(Event::SynAck).await?;
    stream.recv(&[Event::Ack]).await?;
    Ok(())
}
