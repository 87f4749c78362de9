//! Reversed connections.
//!
//! A peer without a public address runs a [`Listener`] that dials out to a
//! relay. The relay pools those connections in a [`Dialer`] and hands one to
//! every local `dial` call, so the relay side "dials" and the private side
//! "accepts" even though the TCP connection went the other way.

pub mod dialer;
pub mod listener;
pub mod options;
pub mod protocol;
pub mod transport;

use std::{future::Future, time::Duration};

pub use dialer::Dialer;
pub use listener::Listener;
pub use options::{DialerOptions, ListenerOptions};
pub use protocol::{DatagramStream, Event, ProtocolError};
pub use transport::{BoxedStream, Connector, StreamListener, TcpConnector, TcpStreamListener};

use crate::error::Result;

/// Runs `fut` under `limit`; a zero limit means no deadline.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if limit.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(limit, fut).await?
    }
}
