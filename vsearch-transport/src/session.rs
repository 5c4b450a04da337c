//! One session per (host, device) pair: a reliable, framed request/response
//! channel plus the zero-copy fast-receive bulk path (§4.1).

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use vsearch_common::wire::{Command, FastRecvChunk, FastRecvCtrl, FastRecvSignal};
use vsearch_common::{Error, Result};

use crate::framing::{decode_payload, encode_payload, read_frame, write_frame};

/// A boxed, type-erased duplex byte stream. Lets `Session` work the same
/// way over a real `TcpStream` or an in-memory loopback pair used in
/// tests.
pub type BoxedStream = Box<dyn DuplexByteStream>;

pub trait DuplexByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexByteStream for T {}

/// Not thread-safe to multiplex: `send_and_receive` takes the session-wide
/// mutex for its entire request/response round trip, so two callers on the
/// same session serialize rather than interleave frames.
pub struct Session {
    device: u32,
    stream: AsyncMutex<BoxedStream>,
}

impl Session {
    pub fn new(device: u32, stream: BoxedStream) -> Self {
        Self {
            device,
            stream: AsyncMutex::new(stream),
        }
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    /// Serializes `request`, sends one framed message tagged `command`,
    /// and reads exactly one framed response, deserialized as `Resp`.
    pub async fn send_and_receive<Req, Resp>(&self, command: Command, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload(request)?;
        let mut stream = self.stream.lock().await;
        debug!(device = self.device, command = ?command, bytes = payload.len(), "rpc send");
        write_frame(&mut *stream, command.to_u32(), &payload).await?;
        let (got_command, resp_payload) = read_frame(&mut *stream).await?;
        if got_command != command.to_u32() {
            return Err(Error::transport(format!(
                "response command mismatch: sent {:?}, got {got_command}",
                command
            )));
        }
        decode_payload(&resp_payload)
    }

    /// Opens the fast-receive bulk path for one export call. The returned
    /// handle keeps the session locked until released, since the daemon
    /// streams a sequence of chunks that must be drained in order.
    pub async fn fast_recv(&self) -> FastRecvGuard<'_> {
        FastRecvGuard { session: self }
    }
}

/// Scope of one fast-receive bulk transfer. The daemon pushes
/// [`FastRecvChunk`]s; the host drains them with [`recv_chunk`], round-tripping
/// a signal whenever `ctrl.channel_last` is set.
///
/// [`recv_chunk`]: FastRecvGuard::recv_chunk
pub struct FastRecvGuard<'a> {
    session: &'a Session,
}

impl<'a> FastRecvGuard<'a> {
    /// Reads the next chunk on `channel_index`. In this design there is a
    /// single physical stream standing in for the ring of channels; the
    /// logical channel index is carried for bookkeeping/ordering by the
    /// caller, not as a separate physical path.
    pub async fn recv_chunk(&mut self, channel_index: u32) -> Result<FastRecvChunk> {
        let mut stream = self.session.stream.lock().await;
        let (command, payload) = read_frame(&mut *stream).await?;
        if command != Command::IndexSQFastGetBase.to_u32() {
            return Err(Error::transport(format!(
                "unexpected command {command} on fast-recv channel {channel_index}"
            )));
        }
        decode_payload(&payload)
    }

    /// Round-trips an acknowledgement; required after any chunk whose
    /// `channel_last` flag was set before the daemon will send more.
    pub async fn send_recv_signal(&mut self) -> Result<()> {
        let mut stream = self.session.stream.lock().await;
        let payload = encode_payload(&FastRecvSignal)?;
        write_frame(&mut *stream, Command::IndexSQFastGetBase.to_u32(), &payload).await
    }

    /// Ends the bulk transfer. A no-op beyond dropping the guard today, but
    /// kept as an explicit call so the RAII-vs-explicit-release symmetry
    /// matches the rest of this workspace's resource handles.
    pub fn release(self) {}
}

/// Checks whether a received chunk means the stream must pause for a
/// round-trip before more data arrives.
pub fn needs_signal(ctrl: &FastRecvCtrl) -> bool {
    ctrl.channel_last && !ctrl.list_last
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use vsearch_common::wire::{AddRequest, AddResponse, StatusHeader};

    fn pair() -> (Session, Session) {
        let (a, b) = duplex(1 << 20);
        (Session::new(0, Box::new(a)), Session::new(0, Box::new(b)))
    }

    #[tokio::test]
    async fn send_and_receive_matches_echoing_peer() {
        let (host, daemon) = pair();
        let server = tokio::spawn(async move {
            let mut stream = daemon.stream.lock().await;
            let (command, payload) = read_frame(&mut *stream).await.unwrap();
            let req: AddRequest = decode_payload(&payload).unwrap();
            let resp = AddResponse {
                status: StatusHeader::ok(),
                ntotal: req.n as u64,
            };
            let resp_payload = encode_payload(&resp).unwrap();
            write_frame(&mut *stream, command, &resp_payload)
                .await
                .unwrap();
        });

        let req = AddRequest {
            index_id: 1,
            n: 3,
            vectors: vec![0u8; 12],
            ids: None,
        };
        let resp: AddResponse = host
            .send_and_receive(Command::IndexFlatAdd, &req)
            .await
            .unwrap();
        assert_eq!(resp.ntotal, 3);
        server.await.unwrap();
    }
}
