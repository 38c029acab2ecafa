//! Codec for encoding/decoding protocol messages
//!
//! Format: `[length: u32 big-endian][payload: bincode serialized Message]`

use crate::messages::Message;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

impl CodecError {
    /// True when the peer closed the stream cleanly between two messages
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Length-delimited bincode codec for [`Message`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_payload(msg: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }
        Ok(payload)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = Self::encode_payload(&msg)?;
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length header
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);
        let msg: Message = bincode::deserialize(&payload)?;

        Ok(Some(msg))
    }
}

/// Read exactly one message from a raw stream
///
/// Never consumes bytes past the end of the message, so the stream can be
/// handed over for raw data transfer afterwards.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = reader.read_u32().await? as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(bincode::deserialize(&payload)?)
}

/// Write one message to a raw stream and flush it
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = MessageCodec::encode_payload(msg)?;

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
