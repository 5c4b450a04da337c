//! In-memory duplex transport, used in place of a real socket by tests (and
//! by the transport integrity test in §8) so the framing and session layer
//! can be exercised without a listening daemon process.

use async_trait::async_trait;
use tokio::io::duplex;
use vsearch_common::Result;

use crate::session::BoxedStream;

/// Default buffer size for the in-memory duplex pipe. Smaller than the
/// largest payloads the transport integrity test sends (up to 96 MiB), but
/// that's fine as long as a concurrent reader task keeps draining it.
pub const LOOPBACK_BUFFER: usize = 4 * 1024 * 1024;

pub fn loopback_pair() -> (BoxedStream, BoxedStream) {
    let (a, b) = duplex(LOOPBACK_BUFFER);
    (Box::new(a), Box::new(b))
}

/// Adapts a closure into a [`Connector`](crate::registry::Connector), handing
/// back one side of a fresh loopback pair while a caller-supplied handler
/// drives the other side (typically a spawned daemon dispatch loop).
pub struct FnConnector<F> {
    make: F,
}

impl<F> FnConnector<F>
where
    F: Fn(u32, BoxedStream) + Send + Sync,
{
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

#[async_trait]
impl<F> crate::registry::Connector for FnConnector<F>
where
    F: Fn(u32, BoxedStream) + Send + Sync,
{
    async fn connect(&self, device: u32) -> Result<BoxedStream> {
        let (host_side, daemon_side) = loopback_pair();
        (self.make)(device, daemon_side);
        Ok(host_side)
    }
}
