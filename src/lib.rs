//! revnet - expose a server that has no public address by reversing who dials.
//!
//! The library lives in [`reverse`]: a relay runs a [`reverse::Dialer`] on a
//! public socket, the private peer runs a [`reverse::Listener`] pointed at it,
//! and every `dial` on the relay pairs with one `accept` on the peer.
//!
//! The remaining modules back the `revnet` binary.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod reverse;

pub use error::{Error, ErrorKind, Result};
