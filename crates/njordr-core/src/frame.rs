//! Length-prefixed framing over async byte streams
//!
//! Each frame is a 4-byte big-endian body length, a 1-byte serializer tag,
//! then the body.

use crate::message::Serializer;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix plus tag byte
pub const FRAME_HEADER_LEN: usize = 5;

/// Default frame size limit (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a value into a complete frame
pub fn encode_frame<T: Serialize>(value: &T, serializer: Serializer) -> Result<Bytes> {
    let body = serializer.serialize(value)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32(len);
    buf.put_u8(serializer.tag());
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, value: &T, serializer: Serializer) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value, serializer)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R, T>(reader: &mut R, max_size: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > max_size {
        return Err(Error::FrameTooLarge {
            size: len,
            limit: max_size,
        });
    }

    let serializer = Serializer::from_tag(header[4])
        .ok_or_else(|| Error::Protocol(format!("unknown frame tag {}", header[4])))?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Io(e)
        }
    })?;

    serializer.deserialize(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClientMessage;
    use crate::worker::WorkerId;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let first = ClientMessage::Register {
            worker_id: WorkerId::from("w1"),
        };
        let second = ClientMessage::Heartbeat {
            worker_id: WorkerId::from("w1"),
        };
        write_frame(&mut client, &first, Serializer::MessagePack).await.unwrap();
        write_frame(&mut client, &second, Serializer::Json).await.unwrap();
        drop(client);

        let got: Option<ClientMessage> = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(got, Some(first));
        let got: Option<ClientMessage> = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(got, Some(second));
        let got: Option<ClientMessage> = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = ClientMessage::Submit {
            job: "echo".into(),
            payload: serde_json::json!({"blob": "x".repeat(512)}),
        };
        write_frame(&mut client, &msg, Serializer::Json).await.unwrap();

        let result: Result<Option<ClientMessage>> = read_frame(&mut server, 64).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { limit: 64, .. })));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 2, 9, b'{', b'}']).await.unwrap();

        let result: Result<Option<ClientMessage>> =
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_connection_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, b'{']).await.unwrap();
        drop(client);

        let result: Result<Option<ClientMessage>> =
            read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
