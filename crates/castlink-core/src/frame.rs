//! Length-prefixed frame encoding/decoding
//!
//! Wire format:
//! ```text
//! ┌────────────────────┬────────────────────────┐
//! │ Length (4B BE u32) │ Envelope (Length bytes) │
//! └────────────────────┴────────────────────────┘
//! ```
//!
//! There is no framing beyond the length prefix. The payload is one
//! serialized [`CastMessage`](crate::CastMessage).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frame header size: the u32 length prefix.
pub const HEADER_SIZE: usize = 4;

/// Default maximum frame payload: 64 MiB.
///
/// The protocol imposes no cap; this is a sanity limit against corrupt
/// length prefixes.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Encode one frame into `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer and returns the
/// payload.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
    if len > max_frame {
        return Err(Error::FrameTooLarge {
            size: len,
            max: max_frame,
        });
    }

    if src.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Read exactly one frame from `reader`.
///
/// Used for the synchronous phase of the handshake, before the channel's
/// reader task owns the stream. Short reads loop until the full payload has
/// arrived; end-of-stream mid-frame fails with
/// [`Error::IncompleteFrame`].
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut read = 0;
    while read < HEADER_SIZE {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            return Err(Error::IncompleteFrame {
                read,
                expected: HEADER_SIZE,
            });
        }
        read += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame {
        return Err(Error::FrameTooLarge {
            size: len,
            max: max_frame,
        });
    }

    let mut payload = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = reader.read(&mut payload[read..]).await?;
        if n == 0 {
            return Err(Error::IncompleteFrame {
                read,
                expected: len,
            });
        }
        read += n;
    }

    Ok(Bytes::from(payload))
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_frame(payload, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
