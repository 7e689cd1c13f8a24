//! Length-delimited message framing.
//!
//! Each message on the wire is preceded by a protobuf varint holding the
//! encoded length. This is the standard delimited protobuf framing, so a
//! worker written against any protobuf runtime can speak it directly.
//!
//! Reads are bounded: the length prefix is validated against
//! [`MAX_MESSAGE_SIZE`] before any allocation happens, so a corrupt or
//! hostile length prefix cannot exhaust memory.

use std::io;

use bytes::BytesMut;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message, validated before allocation.
pub const MAX_MESSAGE_SIZE: u64 = 512 * 1024 * 1024;

/// Errors produced while framing or deframing messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The underlying stream failed.
    #[error("I/O error on worker stream: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a message.
    #[error("stream ended mid-message: expected {expected} more bytes")]
    Truncated {
        /// Bytes still owed by the stream when it ended.
        expected: u64,
    },

    /// The length prefix claims a message larger than [`MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Claimed message size.
        size: u64,
        /// The enforced limit.
        max: u64,
    },

    /// The length prefix itself is malformed.
    #[error("malformed varint length prefix")]
    MalformedLength,

    /// The message bytes did not decode as the expected type.
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Writes one length-delimited message and flushes the stream.
///
/// # Errors
///
/// Returns [`WireError::Io`] if the write or flush fails; a worker that has
/// quit typically surfaces here as a broken pipe.
pub async fn write_delimited<M, W>(mut writer: W, message: &M) -> Result<(), WireError>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(message.encoded_len() + 10);
    message
        .encode_length_delimited(&mut buf)
        .expect("BytesMut grows on demand");
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-delimited message.
///
/// Returns `Ok(None)` when the stream is already at EOF, i.e. not a single
/// byte of the length prefix could be read. EOF anywhere later is an error:
/// the peer died mid-message.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] on mid-message EOF,
/// [`WireError::MessageTooLarge`] if the prefix exceeds the limit, and
/// [`WireError::Decode`] if the payload is not a valid message.
pub async fn read_delimited<M, R>(reader: &mut R) -> Result<Option<M>, WireError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let Some(length) = read_length_prefix(reader).await? else {
        return Ok(None);
    };

    if length > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)] // Validated against MAX_MESSAGE_SIZE above.
    let mut payload = vec![0u8; length as usize];
    if let Err(error) = reader.read_exact(&mut payload).await {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            return Err(WireError::Truncated { expected: length });
        }
        return Err(error.into());
    }

    Ok(Some(M::decode(payload.as_slice())?))
}

/// Reads the varint length prefix, or `None` if the stream is at EOF.
async fn read_length_prefix<R>(reader: &mut R) -> Result<Option<u64>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    let mut shift = 0u32;

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                if shift == 0 {
                    return Ok(None);
                }
                return Err(WireError::MalformedLength);
            },
            Err(error) => return Err(error.into()),
        };

        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }

        shift += 7;
        if shift >= 64 {
            return Err(WireError::MalformedLength);
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::{WorkRequest, WorkResponse};

    fn sample_request() -> WorkRequest {
        WorkRequest {
            arguments: vec!["--opt".to_string(), "value".to_string()],
            inputs: Vec::new(),
            request_id: 0,
        }
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let request = sample_request();

        let mut wire = Vec::new();
        write_delimited(std::io::Cursor::new(&mut wire), &request)
            .await
            .unwrap();

        let mut reader = wire.as_slice();
        let decoded: WorkRequest = read_delimited(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, request);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_eof_before_prefix_is_none() {
        let mut reader: &[u8] = &[];
        let decoded: Option<WorkResponse> = read_delimited(&mut reader).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_truncated() {
        let response = WorkResponse {
            exit_code: 0,
            output: b"partial".to_vec(),
            request_id: 0,
        };
        let wire = response.encode_length_delimited_to_vec();

        let mut reader = &wire[..wire.len() - 3];
        let result: Result<Option<WorkResponse>, _> = read_delimited(&mut reader).await;
        assert!(matches!(result, Err(WireError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_two_messages_back_to_back() {
        let first = sample_request();
        let second = WorkRequest {
            arguments: vec!["other".to_string()],
            ..WorkRequest::default()
        };

        let mut wire = first.encode_length_delimited_to_vec();
        wire.extend(second.encode_length_delimited_to_vec());

        let mut reader = wire.as_slice();
        let one: WorkRequest = read_delimited(&mut reader).await.unwrap().unwrap();
        let two: WorkRequest = read_delimited(&mut reader).await.unwrap().unwrap();
        assert_eq!(one, first);
        assert_eq!(two, second);
    }

    #[tokio::test]
    async fn test_multi_byte_length_prefix() {
        // An output larger than 127 bytes forces a two-byte varint prefix.
        let response = WorkResponse {
            exit_code: 1,
            output: vec![b'x'; 300],
            request_id: 0,
        };
        let wire = response.encode_length_delimited_to_vec();
        assert!(wire[0] & 0x80 != 0);

        let mut reader = wire.as_slice();
        let decoded: WorkResponse = read_delimited(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected_before_allocation() {
        // Varint encoding of 2^40, far beyond MAX_MESSAGE_SIZE.
        let wire = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x20];
        let mut reader = wire.as_slice();
        let result: Result<Option<WorkResponse>, _> = read_delimited(&mut reader).await;
        assert!(matches!(result, Err(WireError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_decode_error() {
        // Length 4, then four bytes with an invalid field tag.
        let wire = [4u8, 0x00, 0x00, 0x00, 0x00];
        let mut reader = wire.as_slice();
        let result: Result<Option<WorkResponse>, _> = read_delimited(&mut reader).await;
        assert!(matches!(result, Err(WireError::Decode(_))));
    }
}
