//! Clients talking to a live broker over TCP, in both server modes.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vireo_broker::{Broker, ClientConnection, Connector, Multiplexer, PacketServer, ServerMode, TransportEndpoint, TransportError};
use vireo_core::config::NetworkConfig;
use vireo_core::protocol::queries::{
    AcknowledgeMode, AcknowledgeQuery, BrowserFetchQuery, CloseBrowserQuery, CloseSessionQuery, CommitQuery,
    CreateBrowserQuery, CreateSessionQuery, GetQuery, PutQuery, QueueSizeQuery, RollbackMessageQuery, RollbackQuery,
};
use vireo_core::protocol::{PacketKind, PROTOCOL_VERSION};
use vireo_core::{DestinationDescriptor, DestinationRef, ErrorCode, Message, MessageBuilder, TransportSettings};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    _dir: TempDir,
    broker: Arc<Broker>,
    server: PacketServer,
    settings: TransportSettings,
}

impl Fixture {
    fn start(mode: ServerMode) -> Self {
        let dir = TempDir::new().unwrap();
        let descriptors = [("orders", true), ("audit", false)].map(|(name, use_journal)| DestinationDescriptor {
            block_size: 128,
            initial_block_count: 32,
            use_journal,
            ..DestinationDescriptor::new(name, dir.path().join(name))
        });
        let broker = Arc::new(Broker::with_destinations(descriptors).unwrap());
        let settings =
            TransportSettings { use_multiplexer: mode == ServerMode::Multiplexed, ..TransportSettings::default() };
        let network = NetworkConfig { bind_address: "127.0.0.1:0".parse().unwrap(), max_connections: 16 };
        let server = PacketServer::bind(&network, &settings, Arc::clone(&broker)).unwrap();
        assert_eq!(server.mode(), mode);
        Self { _dir: dir, broker, server, settings }
    }

    fn connect(&self) -> ClientConnection {
        Connector::new(self.settings.clone())
            .with_client_id("e2e")
            .connect(self.server.local_address())
            .unwrap()
    }

    fn stop(self) {
        self.server.shutdown();
        self.broker.close().unwrap();
    }
}

fn request(endpoint: &TransportEndpoint, query: impl Into<PacketKind>) -> PacketKind {
    endpoint.blocking_request(query, TIMEOUT).unwrap().kind
}

fn orders() -> DestinationRef {
    DestinationRef::queue("orders")
}

fn message(body: &'static str) -> Message {
    MessageBuilder::new(orders()).with_body(body).build()
}

fn open_session(endpoint: &TransportEndpoint, session_id: i32, transacted: bool, mode: AcknowledgeMode) {
    let kind = request(endpoint, CreateSessionQuery { session_id, transacted, acknowledge_mode: mode });
    assert!(matches!(kind, PacketKind::CreateSessionResponse(_)), "{kind:?}");
}

fn put(endpoint: &TransportEndpoint, session_id: i32, body: &'static str) {
    let kind = request(endpoint, PutQuery { session_id, message: message(body) });
    assert!(matches!(kind, PacketKind::PutResponse(_)), "{kind:?}");
}

fn get(endpoint: &TransportEndpoint, session_id: i32) -> Option<Message> {
    match request(endpoint, GetQuery { session_id, consumer_id: 1, destination: orders() }) {
        PacketKind::GetResponse(response) => response.message,
        other => panic!("unexpected {other:?}"),
    }
}

fn queue_size(endpoint: &TransportEndpoint) -> i32 {
    match request(endpoint, QueueSizeQuery { destination: orders() }) {
        PacketKind::QueueSizeResponse(response) => response.size,
        other => panic!("unexpected {other:?}"),
    }
}

fn body(message: &Message) -> &[u8] {
    message.body.as_deref().unwrap_or_default()
}

fn auto_ack_flow(mode: ServerMode) {
    let fixture = Fixture::start(mode);
    let connection = fixture.connect();
    assert_eq!(connection.protocol_version(), PROTOCOL_VERSION);
    let endpoint = connection.create_endpoint();

    open_session(&endpoint, 1, false, AcknowledgeMode::Auto);
    put(&endpoint, 1, "first");
    put(&endpoint, 1, "second");
    assert_eq!(queue_size(&endpoint), 2);

    assert_eq!(body(&get(&endpoint, 1).unwrap()), b"first");
    assert_eq!(body(&get(&endpoint, 1).unwrap()), b"second");
    assert!(get(&endpoint, 1).is_none());
    assert_eq!(queue_size(&endpoint), 0);

    request(&endpoint, CloseSessionQuery { session_id: 1 });
    connection.close();
    fixture.stop();
}

fn transacted_flow(mode: ServerMode) {
    let fixture = Fixture::start(mode);
    let connection = fixture.connect();
    let producer = connection.create_endpoint();
    let consumer = connection.create_endpoint();

    open_session(&producer, 1, true, AcknowledgeMode::Auto);
    open_session(&consumer, 2, true, AcknowledgeMode::Auto);
    put(&producer, 1, "txn");
    assert_eq!(queue_size(&producer), 0);
    assert!(get(&consumer, 2).is_none());

    assert!(matches!(request(&producer, CommitQuery { session_id: 1 }), PacketKind::CommitResponse(_)));
    assert_eq!(queue_size(&producer), 1);

    let delivered = get(&consumer, 2).unwrap();
    assert!(matches!(request(&consumer, RollbackQuery { session_id: 2 }), PacketKind::RollbackResponse(_)));
    let again = get(&consumer, 2).unwrap();
    assert_eq!(again.id, delivered.id);

    request(&consumer, CommitQuery { session_id: 2 });
    assert_eq!(queue_size(&consumer), 0);

    connection.close();
    fixture.stop();
}

#[test]
fn test_auto_ack_blocking() {
    auto_ack_flow(ServerMode::Blocking);
}

#[test]
fn test_auto_ack_multiplexed() {
    auto_ack_flow(ServerMode::Multiplexed);
}

#[test]
fn test_transacted_blocking() {
    transacted_flow(ServerMode::Blocking);
}

#[test]
fn test_transacted_multiplexed() {
    transacted_flow(ServerMode::Multiplexed);
}

#[test]
fn test_client_acknowledge_and_single_rollback() {
    let fixture = Fixture::start(ServerMode::Blocking);
    let connection = fixture.connect();
    let endpoint = connection.create_endpoint();
    open_session(&endpoint, 1, false, AcknowledgeMode::Client);
    put(&endpoint, 1, "a");
    put(&endpoint, 1, "b");

    let a = get(&endpoint, 1).unwrap();
    let b = get(&endpoint, 1).unwrap();
    let kind = request(&endpoint, AcknowledgeQuery { session_id: 1, destination: orders(), message_ids: vec![a.id] });
    assert!(matches!(kind, PacketKind::AcknowledgeResponse(_)));
    assert_eq!(queue_size(&endpoint), 1);

    // Fire and forget: the next request on the same connection is ordered after it.
    endpoint.send_async(RollbackMessageQuery { session_id: 1, destination: orders(), message_id: b.id.clone() }).unwrap();
    let redelivered = get(&endpoint, 1).unwrap();
    assert_eq!(redelivered.id, b.id);

    connection.close();
    fixture.stop();
}

#[test]
fn test_browser_over_multiplexed_client() {
    let fixture = Fixture::start(ServerMode::Blocking);
    let multiplexer = Multiplexer::start(fixture.settings.clone(), None).unwrap();
    let connection = Connector::new(fixture.settings.clone())
        .with_multiplexer(Arc::clone(&multiplexer))
        .connect(fixture.server.local_address())
        .unwrap();
    let endpoint = connection.create_endpoint();
    open_session(&endpoint, 4, false, AcknowledgeMode::Auto);
    put(&endpoint, 4, "one");
    put(&endpoint, 4, "two");

    let kind = request(&endpoint, CreateBrowserQuery { session_id: 4, browser_id: 1, destination: orders() });
    assert!(matches!(kind, PacketKind::CreateBrowserResponse(_)));
    let mut seen = Vec::new();
    loop {
        match request(&endpoint, BrowserFetchQuery { session_id: 4, browser_id: 1 }) {
            PacketKind::BrowserFetchResponse(response) => match response.message {
                Some(message) => seen.push(body(&message).to_vec()),
                None => break,
            },
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(queue_size(&endpoint), 2);
    request(&endpoint, CloseBrowserQuery { session_id: 4, browser_id: 1 });

    connection.close();
    multiplexer.shutdown();
    fixture.stop();
}

#[test]
fn test_errors_are_reported_to_client() {
    let fixture = Fixture::start(ServerMode::Multiplexed);
    let connection = fixture.connect();
    let endpoint = connection.create_endpoint();

    let err = endpoint.blocking_request(GetQuery { session_id: 9, consumer_id: 1, destination: orders() }, TIMEOUT).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    open_session(&endpoint, 1, false, AcknowledgeMode::Auto);
    let err = endpoint.blocking_request(QueueSizeQuery { destination: DestinationRef::queue("nowhere") }, TIMEOUT).unwrap_err();
    assert!(matches!(err, TransportError::Remote { .. }));
    assert_eq!(err.code(), ErrorCode::InvalidDescriptor);

    let err = endpoint.blocking_request(CommitQuery { session_id: 1 }, TIMEOUT).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    connection.close();
    fixture.stop();
}

#[test]
fn test_disconnect_rolls_back_sessions() {
    let fixture = Fixture::start(ServerMode::Blocking);
    let first = fixture.connect();
    let endpoint = first.create_endpoint();
    open_session(&endpoint, 1, true, AcknowledgeMode::Auto);
    open_session(&endpoint, 2, false, AcknowledgeMode::Auto);
    put(&endpoint, 2, "kept");
    assert!(get(&endpoint, 1).is_some());
    assert_eq!(fixture.broker.stats().sessions, 2);

    first.close();
    for _ in 0..200 {
        if fixture.server.connection_count() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fixture.server.connection_count(), 0);
    assert_eq!(fixture.broker.stats().sessions, 0);

    let second = fixture.connect();
    let endpoint = second.create_endpoint();
    open_session(&endpoint, 1, false, AcknowledgeMode::Auto);
    assert_eq!(body(&get(&endpoint, 1).unwrap()), b"kept");

    second.close();
    fixture.stop();
}
