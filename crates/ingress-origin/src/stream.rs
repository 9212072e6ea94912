//! Bidirectional byte copying between a tunnel stream and an origin

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Duplex byte stream handed over by the tunnel dispatcher.
///
/// The origin side only borrows it; closing it is up to the caller.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized {}

/// Which copy finished first in [`pipe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reading from the first stream hit EOF or failed
    AToB,
    /// Reading from the second stream hit EOF or failed
    BToA,
}

/// Copy `a -> b` and `b -> a` concurrently until either direction ends.
///
/// Returns as soon as one copy finishes, without waiting for the other. The
/// other copy is dropped when this returns, so nothing keeps running against
/// the streams afterwards. I/O errors end the copy like EOF does; they are
/// only logged. Neither stream is shut down or closed here.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> Direction
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
    let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

    tokio::select! {
        result = a_to_b => {
            match result {
                Ok(bytes) => debug!(bytes = bytes, "Copy a -> b finished"),
                Err(e) => debug!("Copy a -> b ended with error: {}", e),
            }
            Direction::AToB
        }
        result = b_to_a => {
            match result {
                Ok(bytes) => debug!(bytes = bytes, "Copy b -> a finished"),
                Err(e) => debug!("Copy b -> a ended with error: {}", e),
            }
            Direction::BToA
        }
    }
}
