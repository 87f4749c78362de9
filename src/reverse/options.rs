use std::{fmt, future::Future, io, sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::reverse::transport::{
    BoxedStream, Connector, FnConnector, FnContextConnector, TcpConnector,
};

/// Pooling-side settings. A zero duration disables the corresponding timer.
#[derive(Debug, Clone)]
pub struct DialerOptions {
    /// Run the Syn/SynAck/Ack exchange before handing a connection out.
    pub handshake: bool,
    /// Upper bound for the whole initiator handshake.
    pub timeout: Duration,
    /// Heartbeat interval while a connection waits to be claimed.
    pub heartbeat: Duration,
    /// Upper bound for a single heartbeat write.
    pub heartbeat_timeout: Duration,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            handshake: true,
            timeout: Duration::from_secs(75),
            heartbeat: Duration::from_secs(50),
            heartbeat_timeout: Duration::from_secs(25),
        }
    }
}

impl DialerOptions {
    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

/// Reversed-listener settings. A zero duration disables the corresponding timer.
#[derive(Clone)]
pub struct ListenerOptions {
    /// How the listener reaches the pool. Defaults to a plain TCP connect.
    pub connector: Arc<dyn Connector>,
    pub handshake: bool,
    /// Upper bound for the SynAck/Ack round trip once Syn was seen.
    pub timeout: Duration,
    /// Longest silence tolerated before Syn; every Heart restarts it.
    pub heartbeat_timeout: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            connector: Arc::new(TcpConnector),
            handshake: true,
            timeout: Duration::from_secs(75),
            heartbeat_timeout: Duration::from_secs(75),
        }
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("handshake", &self.handshake)
            .field("timeout", &self.timeout)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish_non_exhaustive()
    }
}

impl ListenerOptions {
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Dial with a plain closure taking the remote address.
    pub fn with_dial<F, Fut>(self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        self.with_connector(Arc::new(FnConnector::new(f)))
    }

    /// Dial with a closure that also receives the listener's lifetime signal.
    pub fn with_dial_context<F, Fut>(self, f: F) -> Self
    where
        F: Fn(watch::Receiver<bool>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        self.with_connector(Arc::new(FnContextConnector::new(f)))
    }

    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}
