use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};

use crate::{
    config::BrokerConfig,
    domain::{errors::DomainError, services::Broker},
    infrastructure::protocol::{
        read_request, CodecError, ErrorCode, MessageType, Payload, RequestFrame, Response,
        WireEncodable, DEFAULT_MAX_MESSAGE_BYTES,
    },
};

/// Default time a connection may sit without delivering a complete frame
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that end a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No complete frame received within {0:?}")]
    IdleTimeout(Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl From<&DomainError> for ErrorCode {
    fn from(err: &DomainError) -> Self {
        match err {
            DomainError::InvalidTopicName(_) => ErrorCode::InvalidRequest,
            DomainError::TopicAlreadyExists(_) => ErrorCode::TopicAlreadyExists,
            DomainError::TopicNotFound(_) => ErrorCode::TopicNotFound,
            DomainError::CapacityExceeded { .. } => ErrorCode::ResourceExhausted,
            DomainError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Main broker server that accepts TCP connections.
///
/// Each connection is served by one task. At most `worker_pool_size` tasks
/// run at a time: the accept loop takes a worker permit *before* accepting,
/// so surplus clients wait in the listen backlog instead of piling up here.
pub struct BrokerServer {
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: ConnectionSettings,
    workers: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl BrokerServer {
    /// Bind the listening socket described by `config`
    pub async fn bind(config: &BrokerConfig, broker: Arc<Broker>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!(
            "mega-broker listening on {} ({} workers)",
            listener.local_addr()?,
            config.worker_pool_size
        );

        Ok(Self {
            listener,
            broker,
            settings: config.connection_settings(),
            workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a handle to signal shutdown
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Accept connections until shutdown is signaled
    pub async fn run(self) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = self.shutdown.notified() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                () = self.shutdown.notified() => break,
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }

            let handler = ConnectionHandler::new(
                stream,
                peer.to_string(),
                Arc::clone(&self.broker),
                self.settings,
            );
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.run().await {
                    warn!("Connection with {} terminated: {}", peer, e);
                }
            });
        }

        info!(
            "mega-broker shutting down ({} topics in memory)",
            self.broker.topic_count()
        );
    }
}

/// Serves the request/response loop of a single client connection
pub struct ConnectionHandler<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    broker: Arc<Broker>,
    settings: ConnectionSettings,
    peer: String,
    closed: bool,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        broker: Arc<Broker>,
        settings: ConnectionSettings,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            broker,
            settings,
            peer: peer.into(),
            closed: false,
        }
    }

    /// Serve requests until the client disconnects or the stream fails.
    ///
    /// A clean disconnect between frames is `Ok`; timeouts, corrupt frames
    /// and I/O failures are returned after the connection is closed.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!("Client connected: {}", self.peer);
        let result = self.serve().await;
        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            let read = tokio::time::timeout(
                self.settings.idle_timeout,
                read_request(&mut self.reader, self.settings.max_message_bytes),
            )
            .await;

            let request = match read {
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => {
                    info!("Client disconnected: {}", self.peer);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    let (correlation_id, code) = match &e {
                        CodecError::Malformed { correlation_id, .. } => {
                            (*correlation_id, ErrorCode::InvalidRequest)
                        }
                        _ => (0, ErrorCode::NetworkError),
                    };
                    warn!("Network error with client {}: {}", self.peer, e);
                    self.notify(Response::error(correlation_id, code)).await;
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(
                        "Client {} idle for more than {:?}",
                        self.peer, self.settings.idle_timeout
                    );
                    self.notify(Response::error(0, ErrorCode::NetworkError)).await;
                    return Err(ConnectionError::IdleTimeout(self.settings.idle_timeout));
                }
            };

            debug!(
                "Processing {} request from {} (correlation_id: {}, topic: {})",
                request.message_type, self.peer, request.correlation_id, request.topic
            );

            let response = handle_request(&self.broker, request);
            self.send(&response).await?;
        }
    }

    /// Write one response frame and flush it
    async fn send(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::new();
        response.encode(&mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        if let Response::Error {
            correlation_id,
            code,
        } = response
        {
            debug!(
                "Sent {} to {} (correlation_id: {})",
                code, self.peer, correlation_id
            );
        }
        Ok(())
    }

    /// Best-effort final response before the connection is dropped
    async fn notify(&mut self, response: Response) {
        if let Err(e) = self.send(&response).await {
            debug!("Could not notify client {}: {}", self.peer, e);
        }
    }

    /// Flush and shut down the write side. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        info!("Closing connection for client: {}", self.peer);
        if let Err(e) = self.writer.shutdown().await {
            warn!("Error closing connection for client {}: {}", self.peer, e);
        }
    }
}

/// Turn one request into exactly one response.
///
/// This is the only place broker failures become wire error codes. A panic
/// while dispatching is reported as `INTERNAL_ERROR` instead of tearing
/// down the connection.
pub fn handle_request(broker: &Broker, request: RequestFrame) -> Response {
    let correlation_id = request.correlation_id;
    match panic::catch_unwind(AssertUnwindSafe(|| dispatch(broker, request))) {
        Ok(response) => response,
        Err(_) => {
            error!("Dispatch panicked (correlation_id: {})", correlation_id);
            Response::error(correlation_id, ErrorCode::InternalError)
        }
    }
}

fn dispatch(broker: &Broker, request: RequestFrame) -> Response {
    let RequestFrame {
        correlation_id,
        message_type,
        topic,
        timestamp,
        offset,
        payload,
    } = request;

    let payload = match payload {
        Payload::Inline(payload) => payload,
        Payload::Skipped { len } => {
            warn!(
                "Rejecting {} byte payload for topic {} (correlation_id: {})",
                len, topic, correlation_id
            );
            return Response::error(correlation_id, ErrorCode::MessageTooLarge);
        }
    };

    match message_type {
        MessageType::CreateTopic => match broker.create_topic(&topic) {
            Ok(()) => Response::CreateTopic {
                correlation_id,
                timestamp,
                topic,
            },
            Err(e) => failure(correlation_id, &e),
        },
        MessageType::Produce => {
            let produced = broker.produce(&topic, payload, timestamp).and_then(|offset| {
                i32::try_from(offset.value()).map_err(|_| {
                    DomainError::Internal(format!("offset {} does not fit the wire format", offset))
                })
            });
            match produced {
                Ok(offset) => Response::Produce {
                    correlation_id,
                    timestamp,
                    offset,
                },
                Err(e) => failure(correlation_id, &e),
            }
        }
        MessageType::Consume => {
            let offset = offset.unwrap_or_default();
            match broker.consume(&topic, i64::from(offset)) {
                Ok(Some(message)) => Response::Consume {
                    correlation_id,
                    timestamp: message.timestamp,
                    // Stored offsets stay below i32::MAX, so this cannot wrap.
                    next_offset: offset + 1,
                    payload: message.payload.clone(),
                },
                Ok(None) => Response::error(correlation_id, ErrorCode::InvalidOffset),
                Err(e) => failure(correlation_id, &e),
            }
        }
        MessageType::Unknown(code) => {
            warn!(
                "Unknown message type 0x{:02x} (correlation_id: {})",
                code, correlation_id
            );
            Response::error(correlation_id, ErrorCode::InvalidMessageType)
        }
    }
}

fn failure(correlation_id: i32, err: &DomainError) -> Response {
    let code = ErrorCode::from(err);
    match code {
        ErrorCode::InternalError => error!("Request {} failed: {}", correlation_id, err),
        _ => debug!("Request {} rejected: {}", correlation_id, err),
    }
    Response::error(correlation_id, code)
}
