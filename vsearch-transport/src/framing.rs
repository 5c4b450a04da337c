//! Length-prefixed framing: `[u32 length | u32 command | payload]`, all
//! integers little-endian, `length` covering the command tag plus the
//! payload (§4.1, §6).

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vsearch_common::{Error, Result};

/// Largest frame we will read off the wire. A peer asking for more than
/// this is treated as a transport error rather than an unbounded
/// allocation.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    command: u32,
    payload: &[u8],
) -> Result<()> {
    let length = (4 + payload.len()) as u32;
    w.write_all(&length.to_le_bytes()).await?;
    w.write_all(&command.to_le_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u32, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let length = u32::from_le_bytes(len_buf);
    if length < 4 || length > MAX_FRAME_BYTES {
        return Err(Error::transport(format!("invalid frame length {length}")));
    }
    let mut cmd_buf = [0u8; 4];
    r.read_exact(&mut cmd_buf).await?;
    let command = u32::from_le_bytes(cmd_buf);

    let payload_len = (length - 4) as usize;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    Ok((command, payload))
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Error::from)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_roundtrips() {
        let (mut a, mut b) = duplex(4096);
        let payload = vec![1u8, 2, 3, 4, 5];
        write_frame(&mut a, 42, &payload).await.unwrap();
        let (cmd, got) = read_frame(&mut b).await.unwrap();
        assert_eq!(cmd, 42);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = duplex(4096);
        a.write_all(&(MAX_FRAME_BYTES + 1).to_le_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
