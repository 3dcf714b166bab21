use bytes::{Bytes, BytesMut};
use log::debug;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::protocol::{
    read_response, CodecError, ErrorCode, RequestFrame, Response, WireEncodable,
    DEFAULT_MAX_MESSAGE_BYTES,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Broker returned {0}")]
    Broker(ErrorCode),

    #[error("Response correlation_id {received} does not match request {expected}")]
    CorrelationMismatch { expected: i32, received: i32 },

    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(Box<Response>),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The broker's error code, if the broker answered with one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Broker(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTopic {
    pub topic: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced {
    pub offset: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumed {
    pub payload: Bytes,
    pub timestamp: i64,
    /// Offset to ask for next.
    pub next_offset: i32,
}

/// A blocking-style client: one request in flight at a time, correlation
/// ids assigned sequentially.
pub struct BrokerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_correlation_id: i32,
    max_payload_bytes: usize,
}

impl BrokerClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            next_correlation_id: 1,
            max_payload_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        })
    }

    pub async fn create_topic(&mut self, topic: &str) -> Result<CreatedTopic, ClientError> {
        let request = RequestFrame::create_topic(self.correlation_id(), topic, now_millis());
        match self.send(request).await? {
            Response::CreateTopic {
                topic, timestamp, ..
            } => Ok(CreatedTopic { topic, timestamp }),
            other => Err(unexpected(other)),
        }
    }

    /// Produce a message stamped with the current wall-clock time
    pub async fn produce(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Produced, ClientError> {
        self.produce_at(topic, payload, now_millis()).await
    }

    pub async fn produce_at(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        timestamp: i64,
    ) -> Result<Produced, ClientError> {
        let request =
            RequestFrame::produce(self.correlation_id(), topic, timestamp, payload.into());
        match self.send(request).await? {
            Response::Produce {
                offset, timestamp, ..
            } => Ok(Produced { offset, timestamp }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn consume(&mut self, topic: &str, offset: i32) -> Result<Consumed, ClientError> {
        let request = RequestFrame::consume(self.correlation_id(), topic, now_millis(), offset);
        match self.send(request).await? {
            Response::Consume {
                payload,
                timestamp,
                next_offset,
                ..
            } => Ok(Consumed {
                payload,
                timestamp,
                next_offset,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Send a raw request and wait for its response.
    ///
    /// Error responses are turned into [`ClientError::Broker`].
    pub async fn send(&mut self, request: RequestFrame) -> Result<Response, ClientError> {
        let expected_id = request.correlation_id;
        let expected_type = request.message_type;

        let mut buf = BytesMut::new();
        request.encode(&mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        debug!(
            "Sent {} request (correlation_id: {}, {} bytes)",
            expected_type,
            expected_id,
            buf.len()
        );

        let response = read_response(&mut self.reader, expected_type, self.max_payload_bytes).await?;
        if response.correlation_id() != expected_id {
            return Err(ClientError::CorrelationMismatch {
                expected: expected_id,
                received: response.correlation_id(),
            });
        }

        match response {
            Response::Error { code, .. } => Err(ClientError::Broker(code)),
            response => Ok(response),
        }
    }

    fn correlation_id(&mut self) -> i32 {
        let id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
        id
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::UnexpectedResponse(Box::new(response))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
