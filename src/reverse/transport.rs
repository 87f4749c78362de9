use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Source of raw inbound connections for the pooling side.
///
/// The listening socket is released when the last handle to it is dropped.
#[async_trait]
pub trait StreamListener: Send + Sync {
    async fn accept(&self) -> io::Result<BoxedStream>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[derive(Debug)]
pub struct TcpStreamListener {
    ln: TcpListener,
}

impl TcpStreamListener {
    pub fn new(ln: TcpListener) -> Self {
        Self { ln }
    }

    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    async fn accept(&self) -> io::Result<BoxedStream> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        tracing::trace!(peer = %peer, "reverse: raw connection accepted");
        Ok(Box::new(c))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

/// Outbound dial capability for the reversed listener.
///
/// `ctx` flips to `true` when the listener closes; implementations may use it
/// to abandon a connect in flight.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, ctx: watch::Receiver<bool>, addr: &str) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, ctx: watch::Receiver<bool>, addr: &str) -> io::Result<BoxedStream> {
        let c = tokio::select! {
            c = TcpStream::connect(addr) => c?,
            _ = cancelled(ctx) => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "dial canceled"));
            }
        };
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

type DialFn = dyn Fn(String) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync;
type DialContextFn =
    dyn Fn(watch::Receiver<bool>, String) -> BoxFuture<'static, io::Result<BoxedStream>>
        + Send
        + Sync;

/// Adapts a plain dial closure. The closure never sees the listener's
/// lifetime, so a connection it returns after close is discarded by the caller.
pub struct FnConnector(Arc<DialFn>);

impl FnConnector {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        Self(Arc::new(move |addr| -> BoxFuture<'static, io::Result<BoxedStream>> {
            Box::pin(f(addr))
        }))
    }
}

impl fmt::Debug for FnConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for FnConnector {
    async fn connect(&self, _ctx: watch::Receiver<bool>, addr: &str) -> io::Result<BoxedStream> {
        (self.0)(addr.to_string()).await
    }
}

/// Adapts a dial closure that receives the listener's lifetime signal.
pub struct FnContextConnector(Arc<DialContextFn>);

impl FnContextConnector {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(watch::Receiver<bool>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        Self(Arc::new(
            move |ctx, addr| -> BoxFuture<'static, io::Result<BoxedStream>> {
                Box::pin(f(ctx, addr))
            },
        ))
    }
}

impl fmt::Debug for FnContextConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnContextConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for FnContextConnector {
    async fn connect(&self, ctx: watch::Receiver<bool>, addr: &str) -> io::Result<BoxedStream> {
        (self.0)(ctx, addr.to_string()).await
    }
}

/// Resolves once `ctx` flips to `true`. A dropped sender never cancels.
pub async fn cancelled(mut ctx: watch::Receiver<bool>) {
    let sender_gone = ctx.wait_for(|done| *done).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

// EMFILE, ENFILE, ENOBUFS, ENOMEM. ENOBUFS differs between platforms.
#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: &[i32] = &[24, 23, 105, 12];
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
const RESOURCE_ERRNOS: &[i32] = &[24, 23, 55, 12];
// WSAEMFILE, WSAENOBUFS.
#[cfg(windows)]
const RESOURCE_ERRNOS: &[i32] = &[10024, 10055];
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
const RESOURCE_ERRNOS: &[i32] = &[];

/// Accept errors worth retrying after a short sleep.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    err.raw_os_error()
        .is_some_and(|code| RESOURCE_ERRNOS.contains(&code))
}

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Sleep schedule for temporary accept failures: 5ms doubling up to 1s.
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            ACCEPT_BACKOFF_BASE
        } else {
            (self.delay * 2).min(ACCEPT_BACKOFF_MAX)
        };
        self.delay
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}
