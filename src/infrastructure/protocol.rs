//! Binary wire format for requests and responses.
//!
//! Every integer is big-endian and signed. Frames carry no outer length;
//! they are delimited by the length prefixes of their own fields.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default bound on a single message payload (1 MiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Hard bound on the topic-name field of a frame. Anything larger cannot be
/// a usable topic and is treated as a corrupt frame.
pub const MAX_TOPIC_FIELD_BYTES: usize = 64 * 1024;

/// Request types understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Produce,
    Consume,
    CreateTopic,
    /// Any other code; carried so the frame can still be read in full and
    /// rejected at dispatch.
    Unknown(u8),
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Produce => 0x01,
            MessageType::Consume => 0x02,
            MessageType::CreateTopic => 0x03,
            MessageType::Unknown(code) => code,
        }
    }
}

impl From<u8> for MessageType {
    fn from(code: u8) -> Self {
        match code {
            0x01 => MessageType::Produce,
            0x02 => MessageType::Consume,
            0x03 => MessageType::CreateTopic,
            other => MessageType::Unknown(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Produce => write!(f, "PRODUCE"),
            MessageType::Consume => write!(f, "CONSUME"),
            MessageType::CreateTopic => write!(f, "CREATE_TOPIC"),
            MessageType::Unknown(code) => write!(f, "UNKNOWN(0x{:02x})", code),
        }
    }
}

/// Error codes sent in the single byte of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidRequest = 1,
    InvalidMessageType = 2,
    MessageTooLarge = 3,
    TopicNotFound = 4,
    TopicAlreadyExists = 5,
    InvalidOffset = 6,
    InternalError = 7,
    NetworkError = 8,
    ResourceExhausted = 9,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::InvalidRequest),
            2 => Ok(ErrorCode::InvalidMessageType),
            3 => Ok(ErrorCode::MessageTooLarge),
            4 => Ok(ErrorCode::TopicNotFound),
            5 => Ok(ErrorCode::TopicAlreadyExists),
            6 => Ok(ErrorCode::InvalidOffset),
            7 => Ok(ErrorCode::InternalError),
            8 => Ok(ErrorCode::NetworkError),
            9 => Ok(ErrorCode::ResourceExhausted),
            other => Err(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::TopicNotFound => "TOPIC_NOT_FOUND",
            ErrorCode::TopicAlreadyExists => "TOPIC_ALREADY_EXISTS",
            ErrorCode::InvalidOffset => "INVALID_OFFSET",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        };
        f.write_str(name)
    }
}

/// Failures while reading a frame off the wire
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream ended in the middle of a frame.
    #[error("Stream ended mid-frame")]
    Truncated,

    /// The frame is structurally invalid; the stream can no longer be trusted.
    #[error("Malformed frame (correlation_id {correlation_id}): {reason}")]
    Malformed { correlation_id: i32, reason: String },

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(err)
        }
    }
}

/// Payload of a decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(Bytes),
    /// Advertised length exceeded the limit; the bytes were drained from the
    /// stream without being buffered.
    Skipped { len: usize },
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Skipped { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub correlation_id: i32,
    pub message_type: MessageType,
    pub topic: String,
    pub timestamp: i64,
    /// Present only for CONSUME.
    pub offset: Option<i32>,
    pub payload: Payload,
}

impl RequestFrame {
    pub fn create_topic(correlation_id: i32, topic: impl Into<String>, timestamp: i64) -> Self {
        Self {
            correlation_id,
            message_type: MessageType::CreateTopic,
            topic: topic.into(),
            timestamp,
            offset: None,
            payload: Payload::Inline(Bytes::new()),
        }
    }

    pub fn produce(
        correlation_id: i32,
        topic: impl Into<String>,
        timestamp: i64,
        payload: Bytes,
    ) -> Self {
        Self {
            correlation_id,
            message_type: MessageType::Produce,
            topic: topic.into(),
            timestamp,
            offset: None,
            payload: Payload::Inline(payload),
        }
    }

    pub fn consume(correlation_id: i32, topic: impl Into<String>, timestamp: i64, offset: i32) -> Self {
        Self {
            correlation_id,
            message_type: MessageType::Consume,
            topic: topic.into(),
            timestamp,
            offset: Some(offset),
            payload: Payload::Inline(Bytes::new()),
        }
    }
}

/// A response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CreateTopic {
        correlation_id: i32,
        timestamp: i64,
        topic: String,
    },
    Produce {
        correlation_id: i32,
        timestamp: i64,
        offset: i32,
    },
    Consume {
        correlation_id: i32,
        timestamp: i64,
        next_offset: i32,
        payload: Bytes,
    },
    Error {
        correlation_id: i32,
        code: ErrorCode,
    },
}

impl Response {
    pub fn error(correlation_id: i32, code: ErrorCode) -> Self {
        Response::Error {
            correlation_id,
            code,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            Response::CreateTopic { correlation_id, .. }
            | Response::Produce { correlation_id, .. }
            | Response::Consume { correlation_id, .. }
            | Response::Error { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Error { .. })
    }
}

/// Trait for writing frames in wire format
pub trait WireEncodable {
    fn encode(&self, buf: &mut BytesMut) -> io::Result<()>;
}

// Helper functions for encoding primitive types

pub fn encode_i8(buf: &mut BytesMut, value: i8) {
    buf.put_i8(value);
}

pub fn encode_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

pub fn encode_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64(value);
}

/// Write an int32 length prefix followed by the bytes
pub fn encode_bytes(buf: &mut BytesMut, value: &[u8]) -> io::Result<()> {
    let len = i32::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Field too long"))?;
    encode_i32(buf, len);
    buf.put_slice(value);
    Ok(())
}

impl WireEncodable for RequestFrame {
    fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        let Payload::Inline(payload) = &self.payload else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot encode a skipped payload",
            ));
        };

        encode_i32(buf, self.correlation_id);
        encode_i8(buf, self.message_type.code() as i8);
        encode_bytes(buf, self.topic.as_bytes())?;
        encode_i64(buf, self.timestamp);
        if self.message_type == MessageType::Consume {
            encode_i32(buf, self.offset.unwrap_or_default());
        }
        encode_bytes(buf, payload)?;
        Ok(())
    }
}

impl WireEncodable for Response {
    fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        encode_i32(buf, self.correlation_id());
        match self {
            Response::CreateTopic {
                timestamp, topic, ..
            } => {
                encode_i8(buf, 1);
                encode_i64(buf, *timestamp);
                encode_bytes(buf, topic.as_bytes())?;
            }
            Response::Produce {
                timestamp, offset, ..
            } => {
                encode_i8(buf, 1);
                encode_i64(buf, *timestamp);
                encode_i32(buf, *offset);
            }
            Response::Consume {
                timestamp,
                next_offset,
                payload,
                ..
            } => {
                encode_i8(buf, 1);
                encode_i64(buf, *timestamp);
                encode_i32(buf, *next_offset);
                encode_bytes(buf, payload)?;
            }
            Response::Error { code, .. } => {
                encode_i8(buf, 0);
                encode_i8(buf, code.code() as i8);
            }
        }
        Ok(())
    }
}

/// Read one request frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of
/// a frame. Payloads longer than `max_payload_bytes` are drained and
/// reported as [`Payload::Skipped`].
pub async fn read_request<R>(
    reader: &mut R,
    max_payload_bytes: usize,
) -> Result<Option<RequestFrame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    let n = reader.read(&mut head).await.map_err(CodecError::Io)?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut head[n..]).await?;
    let correlation_id = i32::from_be_bytes(head);

    let message_type = MessageType::from(reader.read_u8().await?);

    let topic_len = read_length(reader, correlation_id, "topic name").await?;
    if topic_len > MAX_TOPIC_FIELD_BYTES {
        return Err(CodecError::Malformed {
            correlation_id,
            reason: format!("topic name field of {} bytes", topic_len),
        });
    }
    let mut topic = vec![0u8; topic_len];
    reader.read_exact(&mut topic).await?;
    let topic = String::from_utf8_lossy(&topic).into_owned();

    let timestamp = reader.read_i64().await?;
    let offset = if message_type == MessageType::Consume {
        Some(reader.read_i32().await?)
    } else {
        None
    };

    let payload_len = read_length(reader, correlation_id, "payload").await?;
    let payload = if payload_len > max_payload_bytes {
        discard(reader, payload_len).await?;
        Payload::Skipped { len: payload_len }
    } else {
        let mut payload = BytesMut::zeroed(payload_len);
        reader.read_exact(&mut payload).await?;
        Payload::Inline(payload.freeze())
    };

    Ok(Some(RequestFrame {
        correlation_id,
        message_type,
        topic,
        timestamp,
        offset,
        payload,
    }))
}

/// Read the response to a request of type `expected`.
///
/// Success bodies are not self-describing, so the caller has to say what it
/// asked for.
pub async fn read_response<R>(
    reader: &mut R,
    expected: MessageType,
    max_payload_bytes: usize,
) -> Result<Response, CodecError>
where
    R: AsyncRead + Unpin,
{
    let correlation_id = reader.read_i32().await?;
    let success = reader.read_u8().await?;

    if success == 0 {
        let raw = reader.read_u8().await?;
        let code = ErrorCode::try_from(raw).map_err(|raw| CodecError::Malformed {
            correlation_id,
            reason: format!("unknown error code {}", raw),
        })?;
        return Ok(Response::Error {
            correlation_id,
            code,
        });
    }

    let timestamp = reader.read_i64().await?;
    match expected {
        MessageType::CreateTopic => {
            let len = read_length(reader, correlation_id, "topic name").await?;
            if len > MAX_TOPIC_FIELD_BYTES {
                return Err(CodecError::Malformed {
                    correlation_id,
                    reason: format!("topic name field of {} bytes", len),
                });
            }
            let mut topic = vec![0u8; len];
            reader.read_exact(&mut topic).await?;
            Ok(Response::CreateTopic {
                correlation_id,
                timestamp,
                topic: String::from_utf8_lossy(&topic).into_owned(),
            })
        }
        MessageType::Produce => {
            let offset = reader.read_i32().await?;
            Ok(Response::Produce {
                correlation_id,
                timestamp,
                offset,
            })
        }
        MessageType::Consume => {
            let next_offset = reader.read_i32().await?;
            let len = read_length(reader, correlation_id, "payload").await?;
            if len > max_payload_bytes {
                return Err(CodecError::Malformed {
                    correlation_id,
                    reason: format!("payload of {} bytes exceeds {}", len, max_payload_bytes),
                });
            }
            let mut payload = BytesMut::zeroed(len);
            reader.read_exact(&mut payload).await?;
            Ok(Response::Consume {
                correlation_id,
                timestamp,
                next_offset,
                payload: payload.freeze(),
            })
        }
        MessageType::Unknown(code) => Err(CodecError::Malformed {
            correlation_id,
            reason: format!("success response to unknown message type 0x{:02x}", code),
        }),
    }
}

async fn read_length<R>(reader: &mut R, correlation_id: i32, field: &str) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    usize::try_from(len).map_err(|_| CodecError::Malformed {
        correlation_id,
        reason: format!("negative {} length {}", field, len),
    })
}

async fn discard<R>(reader: &mut R, len: usize) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut limited = AsyncReadExt::take(&mut *reader, len as u64);
    let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if drained < len as u64 {
        return Err(CodecError::Truncated);
    }
    Ok(())
}
