//! Reading and writing [`FogMessage`] frames over any async byte stream.
//!
//! TCP (and TLS on top of it) delivers a byte stream, not messages, so one
//! `read` may return half a frame or three frames at once.  [`FrameReader`]
//! keeps the unread bytes between calls and only hands out complete frames.

use std::io;

use fog_core::protocol::{decode_message, encode_message, FogMessage, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Buffers bytes from `inner` and yields one decoded message at a time.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the next complete message, or `None` when the peer closed the
    /// stream on a frame boundary.
    ///
    /// A stream that ends part-way through a frame is an `UnexpectedEof`
    /// error.  Any decode error other than "need more bytes" is returned as
    /// is; the stream cannot be resynchronised after one.
    pub async fn next_message(&mut self) -> Result<Option<FogMessage>, FrameError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if !self.buf.is_empty() {
                match decode_message(&self.buf) {
                    Ok((msg, consumed)) => {
                        self.buf.drain(..consumed);
                        return Ok(Some(msg));
                    }
                    Err(ProtocolError::InsufficientData { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {} bytes of a partial frame", self.buf.len()),
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Encodes `msg` and writes the whole frame to `writer`.
pub async fn write_message<W>(writer: &mut W, msg: &FogMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fog_core::protocol::LinkContract;
    use fog_core::{DeviceId, InterfaceType};

    #[tokio::test]
    async fn test_reads_back_to_back_frames_from_one_write() {
        // Arrange
        let (mut client, server) = tokio::io::duplex(1024);
        let first = FogMessage::LinkRelay(vec![1, 2, 3]);
        let second = FogMessage::ok();
        let mut bytes = encode_message(&first).unwrap();
        bytes.extend(encode_message(&second).unwrap());
        client.write_all(&bytes).await.unwrap();
        drop(client);

        // Act
        let mut reader = FrameReader::new(server);

        // Assert
        assert_eq!(reader.next_message().await.unwrap(), Some(first));
        assert_eq!(reader.next_message().await.unwrap(), Some(second));
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reassembles_frame_split_across_reads() {
        // Arrange: the header arrives in one read, the rest in another
        let msg = FogMessage::LinkRequest(LinkContract::request(
            InterfaceType::Lorawan,
            DeviceId::new("AA"),
        ));
        let bytes = encode_message(&msg).unwrap();
        let (head, tail) = bytes.split_at(5);
        let stream = tokio_test::io::Builder::new().read(head).read(tail).build();

        // Act
        let mut reader = FrameReader::new(stream);

        // Assert
        assert_eq!(reader.next_message().await.unwrap(), Some(msg));
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let bytes = encode_message(&FogMessage::LinkRelay(vec![9; 10])).unwrap();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        let err = reader.next_message().await.unwrap_err();

        assert!(matches!(err, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_unknown_fport_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[1, 42, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let mut reader = FrameReader::new(server);
        let err = reader.next_message().await.unwrap_err();

        assert!(matches!(err, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_message_produces_decodable_frame() {
        let (mut client, server) = tokio::io::duplex(64);

        write_message(&mut client, &FogMessage::rejected()).await.unwrap();

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.next_message().await.unwrap(), Some(FogMessage::rejected()));
    }
}
