//! End-to-end tests for the connection engine and TCP server

use bytes::{Bytes, BytesMut};
use mega_broker::infrastructure::protocol::{
    encode_bytes, encode_i32, encode_i64, encode_i8, read_response, WireEncodable,
};
use mega_broker::infrastructure::server::ConnectionError;
use mega_broker::{
    Broker, BrokerClient, BrokerConfig, BrokerServer, ConnectionHandler, ConnectionSettings,
    ErrorCode, InMemoryTopicRepository, MessageType, RequestFrame, Response,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    broker: Arc<Broker>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

async fn start_server(config: BrokerConfig) -> TestServer {
    let broker = Arc::new(Broker::new(
        Arc::new(InMemoryTopicRepository::new()),
        config.topic_limits(),
    ));
    let server = BrokerServer::bind(&config, Arc::clone(&broker))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());
    TestServer {
        addr,
        broker,
        shutdown,
        task,
    }
}

fn test_config() -> BrokerConfig {
    BrokerConfig {
        port: 0,
        ..BrokerConfig::default()
    }
}

fn encode<T: WireEncodable>(frame: &T) -> BytesMut {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf).unwrap();
    buf
}

/// The create/produce/consume walk-through from the protocol description
#[tokio::test]
async fn test_orders_scenario() {
    let server = start_server(test_config()).await;
    let mut client = BrokerClient::connect(server.addr).await.unwrap();

    let created = client.create_topic("orders").await.unwrap();
    assert_eq!(created.topic, "orders");

    let a = client.produce_at("orders", &b"A"[..], 1000).await.unwrap();
    assert_eq!((a.offset, a.timestamp), (0, 1000));
    let b = client.produce_at("orders", &b"B"[..], 1001).await.unwrap();
    assert_eq!((b.offset, b.timestamp), (1, 1001));

    let first = client.consume("orders", 0).await.unwrap();
    assert_eq!(first.payload, Bytes::from_static(b"A"));
    assert_eq!(first.timestamp, 1000);
    assert_eq!(first.next_offset, 1);

    let second = client.consume("orders", 1).await.unwrap();
    assert_eq!(second.payload, Bytes::from_static(b"B"));
    assert_eq!(second.next_offset, 2);

    let err = client.consume("orders", 2).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidOffset));
}

/// Errors are answered in-band and the connection keeps serving
#[tokio::test]
async fn test_errors_keep_connection_open() {
    let server = start_server(test_config()).await;
    let mut client = BrokerClient::connect(server.addr).await.unwrap();

    let err = client.consume("missing", 0).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::TopicNotFound));

    let err = client.produce("missing", "x").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::TopicNotFound));

    let err = client.create_topic("not valid!").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidRequest));

    client.create_topic("present").await.unwrap();
    let err = client.create_topic("present").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::TopicAlreadyExists));

    let produced = client.produce("present", "still here").await.unwrap();
    assert_eq!(produced.offset, 0);
}

/// Full topics answer RESOURCE_EXHAUSTED
#[tokio::test]
async fn test_full_topic_is_resource_exhausted() {
    let server = start_server(BrokerConfig {
        max_messages_per_topic: 2,
        ..test_config()
    })
    .await;
    let mut client = BrokerClient::connect(server.addr).await.unwrap();
    client.create_topic("tiny").await.unwrap();
    client.produce("tiny", "1").await.unwrap();
    client.produce("tiny", "2").await.unwrap();

    let err = client.produce("tiny", "3").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ResourceExhausted));
    assert_eq!(server.broker.topic_len("tiny").unwrap(), 2);
}

/// An oversized payload is rejected and the next frame still parses
#[tokio::test]
async fn test_oversized_payload_rejected() {
    let server = start_server(BrokerConfig {
        max_message_bytes: 16,
        ..test_config()
    })
    .await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut frames = BytesMut::new();
    RequestFrame::create_topic(1, "big", 0)
        .encode(&mut frames)
        .unwrap();
    RequestFrame::produce(2, "big", 0, Bytes::from(vec![7u8; 64]))
        .encode(&mut frames)
        .unwrap();
    RequestFrame::produce(3, "big", 0, Bytes::from(vec![7u8; 16]))
        .encode(&mut frames)
        .unwrap();
    stream.write_all(&frames).await.unwrap();

    let created = read_response(&mut stream, MessageType::CreateTopic, 1024)
        .await
        .unwrap();
    assert!(created.is_success());

    let too_large = read_response(&mut stream, MessageType::Produce, 1024)
        .await
        .unwrap();
    assert_eq!(too_large, Response::error(2, ErrorCode::MessageTooLarge));

    let fits = read_response(&mut stream, MessageType::Produce, 1024)
        .await
        .unwrap();
    assert!(matches!(
        fits,
        Response::Produce {
            correlation_id: 3,
            offset: 0,
            ..
        }
    ));
    assert_eq!(server.broker.topic_len("big").unwrap(), 1);
}

/// Unknown type codes are read in full and rejected in-band
#[tokio::test]
async fn test_unknown_message_type() {
    let server = start_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut frame = BytesMut::new();
    encode_i32(&mut frame, 77);
    encode_i8(&mut frame, 0x04);
    encode_bytes(&mut frame, b"whatever").unwrap();
    encode_i64(&mut frame, 0);
    encode_bytes(&mut frame, b"payload").unwrap();
    frame.extend_from_slice(&encode(&RequestFrame::create_topic(78, "after", 0)));
    stream.write_all(&frame).await.unwrap();

    // Error bodies are the same for every request type.
    let rejected = read_response(&mut stream, MessageType::Produce, 1024)
        .await
        .unwrap();
    assert_eq!(rejected, Response::error(77, ErrorCode::InvalidMessageType));

    let created = read_response(&mut stream, MessageType::CreateTopic, 1024)
        .await
        .unwrap();
    assert_eq!(created.correlation_id(), 78);
    assert!(created.is_success());
}

/// Pipelined requests get one response each, in request order
#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = start_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let requests = vec![
        RequestFrame::create_topic(10, "pipe", 0),
        RequestFrame::produce(11, "pipe", 5, Bytes::from_static(b"one")),
        RequestFrame::produce(12, "pipe", 6, Bytes::from_static(b"two")),
        RequestFrame::consume(13, "pipe", 0, 1),
        RequestFrame::consume(14, "nope", 0, 0),
    ];
    let mut frames = BytesMut::new();
    for request in &requests {
        request.encode(&mut frames).unwrap();
    }
    stream.write_all(&frames).await.unwrap();

    let mut responses = Vec::new();
    for request in &requests {
        let response = timeout(
            WAIT,
            read_response(&mut stream, request.message_type, 1024),
        )
        .await
        .unwrap()
        .unwrap();
        responses.push(response);
    }

    let ids: Vec<i32> = responses.iter().map(Response::correlation_id).collect();
    assert_eq!(ids, vec![10, 11, 12, 13, 14]);
    assert_eq!(
        responses[3],
        Response::Consume {
            correlation_id: 13,
            timestamp: 6,
            next_offset: 2,
            payload: Bytes::from_static(b"two"),
        }
    );
    assert_eq!(responses[4], Response::error(14, ErrorCode::TopicNotFound));
}

/// Several clients producing at once get distinct, gap-free offsets
#[tokio::test]
async fn test_concurrent_clients_share_offsets() {
    let server = start_server(test_config()).await;
    BrokerClient::connect(server.addr)
        .await
        .unwrap()
        .create_topic("shared")
        .await
        .unwrap();

    let clients = 4;
    let per_client = 25;
    let mut tasks = Vec::new();
    for c in 0..clients {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = BrokerClient::connect(addr).await.unwrap();
            let mut offsets = Vec::new();
            for i in 0..per_client {
                let produced = client
                    .produce("shared", format!("{c}-{i}"))
                    .await
                    .unwrap();
                offsets.push(produced.offset);
            }
            offsets
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    assert_eq!(all.len(), clients * per_client);
    assert_eq!(
        all.into_iter().collect::<HashSet<_>>(),
        (0..(clients * per_client) as i32).collect::<HashSet<_>>()
    );
}

/// With one worker, a second connection waits until the first one leaves
#[tokio::test]
async fn test_worker_pool_applies_backpressure() {
    let server = start_server(BrokerConfig {
        worker_pool_size: 1,
        ..test_config()
    })
    .await;

    let mut first = BrokerClient::connect(server.addr).await.unwrap();
    first.create_topic("first").await.unwrap();

    let mut second = TcpStream::connect(server.addr).await.unwrap();
    second
        .write_all(&encode(&RequestFrame::create_topic(1, "second", 0)))
        .await
        .unwrap();

    let waiting = timeout(Duration::from_millis(300), second.read_u8()).await;
    assert!(waiting.is_err(), "second connection served while pool was full");

    drop(first);

    let response = timeout(
        WAIT,
        read_response(&mut second, MessageType::CreateTopic, 1024),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(response.is_success());
    assert_eq!(server.broker.topic_count(), 2);
}

/// The accept loop stops when shutdown is signaled
#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let server = start_server(test_config()).await;
    server.shutdown.notify_one();
    timeout(WAIT, server.task).await.unwrap().unwrap();
}

fn handler_settings(idle_timeout: Duration) -> ConnectionSettings {
    ConnectionSettings {
        idle_timeout,
        ..ConnectionSettings::default()
    }
}

fn test_broker() -> Arc<Broker> {
    Arc::new(Broker::new(
        Arc::new(InMemoryTopicRepository::new()),
        Default::default(),
    ))
}

/// A silent peer is told NETWORK_ERROR and disconnected
#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let handler = ConnectionHandler::new(
        server_side,
        "duplex",
        test_broker(),
        handler_settings(Duration::from_millis(50)),
    );
    let task = tokio::spawn(handler.run());

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ConnectionError::IdleTimeout(_))));

    let notice = read_response(&mut client, MessageType::Produce, 1024)
        .await
        .unwrap();
    assert_eq!(notice, Response::error(0, ErrorCode::NetworkError));

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

/// The idle timer restarts for every frame
#[tokio::test]
async fn test_activity_resets_idle_timer() {
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let handler = ConnectionHandler::new(
        server_side,
        "duplex",
        test_broker(),
        handler_settings(Duration::from_millis(400)),
    );
    let task = tokio::spawn(handler.run());

    client
        .write_all(&encode(&RequestFrame::create_topic(1, "slow", 0)))
        .await
        .unwrap();
    for i in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        client
            .write_all(&encode(&RequestFrame::consume(2 + i, "slow", 0, 0)))
            .await
            .unwrap();
    }

    let created = read_response(&mut client, MessageType::CreateTopic, 1024)
        .await
        .unwrap();
    assert!(created.is_success());
    for i in 0..3 {
        let response = read_response(&mut client, MessageType::Consume, 1024)
            .await
            .unwrap();
        assert_eq!(response, Response::error(2 + i, ErrorCode::InvalidOffset));
    }

    drop(client);
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// Closing the stream between frames is a normal end
#[tokio::test]
async fn test_clean_disconnect() {
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let broker = test_broker();
    let handler = ConnectionHandler::new(
        server_side,
        "duplex",
        Arc::clone(&broker),
        ConnectionSettings::default(),
    );
    let task = tokio::spawn(handler.run());

    client
        .write_all(&encode(&RequestFrame::create_topic(1, "bye", 0)))
        .await
        .unwrap();
    let created = read_response(&mut client, MessageType::CreateTopic, 1024)
        .await
        .unwrap();
    assert!(created.is_success());
    drop(client);

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(broker.topic_count(), 1);
}

/// A frame cut short by the peer is a transport error
#[tokio::test]
async fn test_truncated_frame_is_transport_error() {
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let handler = ConnectionHandler::new(
        server_side,
        "duplex",
        test_broker(),
        ConnectionSettings::default(),
    );
    let task = tokio::spawn(handler.run());

    let frame = encode(&RequestFrame::produce(5, "t", 0, Bytes::from_static(b"abcdef")));
    client.write_all(&frame[..frame.len() - 3]).await.unwrap();
    client.shutdown().await.unwrap();

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ConnectionError::Codec(_))));
}

/// A negative length field gets INVALID_REQUEST and ends the connection
#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);
    let handler = ConnectionHandler::new(
        server_side,
        "duplex",
        test_broker(),
        ConnectionSettings::default(),
    );
    let task = tokio::spawn(handler.run());

    let mut frame = BytesMut::new();
    encode_i32(&mut frame, 31);
    encode_i8(&mut frame, MessageType::Produce.code() as i8);
    encode_i32(&mut frame, -1);
    client.write_all(&frame).await.unwrap();

    let response = read_response(&mut client, MessageType::Produce, 1024)
        .await
        .unwrap();
    assert_eq!(response, Response::error(31, ErrorCode::InvalidRequest));

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ConnectionError::Codec(_))));
}
