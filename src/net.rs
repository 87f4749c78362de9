use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncWrite};

/// Expands the `":PORT"` shorthand accepted in config and flags to
/// `"0.0.0.0:PORT"`, which tokio's bind can parse.
pub fn bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(addr),
    }
}

/// Copies bytes both ways until either side closes.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(a, b).await
}
