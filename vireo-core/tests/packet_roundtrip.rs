//! Property tests: every packet variant survives serialize/unserialize and
//! framing unchanged, for minimal and fully populated instances.

use bytes::{Bytes, BytesMut};
use proptest::collection::{btree_map, vec};
use proptest::option;
use proptest::prelude::*;

use vireo_core::message::{DeliveryMode, DestinationRef, Message, PropertyValue};
use vireo_core::protocol::notifications::MessageNotification;
use vireo_core::protocol::queries::*;
use vireo_core::protocol::responses::*;
use vireo_core::protocol::{
    encode_frame, Packet, PacketDecoder, PacketKind, PacketSerializer, DEFAULT_MAX_PACKET_SIZE,
};

fn destination() -> impl Strategy<Value = DestinationRef> {
    ("[a-z][a-z0-9.]{0,20}", any::<bool>()).prop_map(|(name, queue)| {
        if queue {
            DestinationRef::queue(name)
        } else {
            DestinationRef::topic(name)
        }
    })
}

fn property() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        any::<bool>().prop_map(PropertyValue::Bool),
        any::<i8>().prop_map(PropertyValue::Byte),
        any::<i16>().prop_map(PropertyValue::Short),
        any::<i32>().prop_map(PropertyValue::Int),
        any::<i64>().prop_map(PropertyValue::Long),
        (-1.0e6f32..1.0e6).prop_map(PropertyValue::Float),
        (-1.0e12f64..1.0e12).prop_map(PropertyValue::Double),
        ".{0,16}".prop_map(PropertyValue::String),
    ]
}

fn message() -> impl Strategy<Value = Message> {
    (
        "ID:[a-f0-9-]{1,36}",
        destination(),
        option::of(".{0,12}"),
        option::of(destination()),
        option::of("[A-Za-z]{0,8}"),
        0u8..=9,
        any::<bool>(),
        any::<i64>(),
        any::<i64>(),
        any::<bool>(),
        btree_map("[a-z]{1,8}", property(), 0..4),
        option::of(vec(any::<u8>(), 0..256)),
    )
        .prop_map(
            |(id, dest, corr, reply, ty, priority, persistent, ts, exp, redelivered, props, body)| {
                Message {
                    id,
                    destination: dest,
                    correlation_id: corr,
                    reply_to: reply,
                    message_type: ty,
                    priority,
                    delivery_mode: if persistent {
                        DeliveryMode::Persistent
                    } else {
                        DeliveryMode::NonPersistent
                    },
                    timestamp: ts,
                    expiration: exp,
                    redelivered,
                    properties: props,
                    body: body.map(Bytes::from),
                }
            },
        )
}

fn ack_mode() -> impl Strategy<Value = AcknowledgeMode> {
    prop_oneof![
        Just(AcknowledgeMode::Auto),
        Just(AcknowledgeMode::Client),
        Just(AcknowledgeMode::DupsOk)
    ]
}

fn query() -> impl Strategy<Value = PacketKind> {
    prop_oneof![
        (option::of(".{0,8}"), option::of(".{0,8}"), option::of(".{0,8}")).prop_map(
            |(user_name, password, client_id)| PacketKind::from(OpenConnectionQuery { user_name, password, client_id })
        ),
        Just(PacketKind::from(PingQuery)),
        (any::<i32>(), any::<bool>(), ack_mode()).prop_map(|(session_id, transacted, acknowledge_mode)| {
            PacketKind::from(CreateSessionQuery { session_id, transacted, acknowledge_mode })
        }),
        any::<i32>().prop_map(|session_id| PacketKind::from(CloseSessionQuery { session_id })),
        (any::<i32>(), message()).prop_map(|(session_id, message)| PacketKind::from(PutQuery { session_id, message })),
        (any::<i32>(), any::<i32>(), destination()).prop_map(|(session_id, consumer_id, destination)| {
            PacketKind::from(GetQuery { session_id, consumer_id, destination })
        }),
        (any::<i32>(), destination(), vec("ID:[0-9]{1,6}", 0..8)).prop_map(
            |(session_id, destination, message_ids)| {
                PacketKind::from(AcknowledgeQuery { session_id, destination, message_ids })
            }
        ),
        any::<i32>().prop_map(|session_id| PacketKind::from(CommitQuery { session_id })),
        any::<i32>().prop_map(|session_id| PacketKind::from(RollbackQuery { session_id })),
        (any::<i32>(), destination(), "ID:[0-9]{1,6}").prop_map(|(session_id, destination, message_id)| {
            PacketKind::from(RollbackMessageQuery { session_id, destination, message_id })
        }),
        (any::<i32>(), any::<i32>(), destination()).prop_map(|(session_id, browser_id, destination)| {
            PacketKind::from(CreateBrowserQuery { session_id, browser_id, destination })
        }),
        (any::<i32>(), any::<i32>())
            .prop_map(|(session_id, browser_id)| PacketKind::from(BrowserFetchQuery { session_id, browser_id })),
        (any::<i32>(), any::<i32>())
            .prop_map(|(session_id, browser_id)| PacketKind::from(CloseBrowserQuery { session_id, browser_id })),
        destination().prop_map(|destination| PacketKind::from(QueueSizeQuery { destination })),
    ]
}

fn response() -> impl Strategy<Value = PacketKind> {
    prop_oneof![
        any::<i32>().prop_map(|protocol_version| PacketKind::from(OpenConnectionResponse { protocol_version })),
        Just(PacketKind::from(PingResponse)),
        Just(PacketKind::from(CreateSessionResponse)),
        Just(PacketKind::from(CloseSessionResponse)),
        Just(PacketKind::from(PutResponse)),
        option::of(message()).prop_map(|message| PacketKind::from(GetResponse { message })),
        Just(PacketKind::from(AcknowledgeResponse)),
        Just(PacketKind::from(CommitResponse)),
        Just(PacketKind::from(RollbackResponse)),
        Just(PacketKind::from(CreateBrowserResponse)),
        option::of(message()).prop_map(|message| PacketKind::from(BrowserFetchResponse { message })),
        Just(PacketKind::from(CloseBrowserResponse)),
        any::<i32>().prop_map(|size| PacketKind::from(QueueSizeResponse { size })),
        ("[A-Z_]{1,24}", ".{0,40}").prop_map(|(code, message)| PacketKind::from(ErrorResponse { code, message })),
        (any::<i32>(), any::<i32>(), message()).prop_map(|(session_id, consumer_id, message)| {
            PacketKind::from(MessageNotification { session_id, consumer_id, message })
        }),
    ]
}

fn packet() -> impl Strategy<Value = Packet> {
    (any::<i32>(), any::<i32>(), prop_oneof![query(), response()])
        .prop_map(|(endpoint_id, correlation_id, kind)| Packet { endpoint_id, correlation_id, kind })
}

proptest! {
    #[test]
    fn test_serializer_roundtrip(packet in packet()) {
        let bytes = PacketSerializer::to_bytes(&packet).unwrap();
        prop_assert_eq!(PacketSerializer::unserialize(bytes).unwrap(), packet);
    }

    #[test]
    fn test_framed_stream_roundtrip(packets in vec(packet(), 1..6), split in 1usize..64) {
        let mut wire = BytesMut::new();
        for p in &packets {
            wire.extend_from_slice(&encode_frame(p, DEFAULT_MAX_PACKET_SIZE).unwrap());
        }

        let mut decoder = PacketDecoder::default();
        let mut input = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(split) {
            input.extend_from_slice(chunk);
            while let Some(p) = decoder.decode(&mut input).unwrap() {
                decoded.push(p);
            }
        }
        prop_assert_eq!(decoded, packets);
    }
}

#[test]
fn test_minimal_and_maximal_messages() {
    let minimal = Message {
        id: "ID:1".into(),
        destination: DestinationRef::queue("q"),
        correlation_id: None,
        reply_to: None,
        message_type: None,
        priority: 0,
        delivery_mode: DeliveryMode::NonPersistent,
        timestamp: 0,
        expiration: 0,
        redelivered: false,
        properties: Default::default(),
        body: None,
    };
    let mut maximal = minimal.clone();
    maximal.correlation_id = Some("corr".into());
    maximal.reply_to = Some(DestinationRef::topic("replies"));
    maximal.message_type = Some("order".into());
    maximal.priority = 9;
    maximal.body = Some(Bytes::from_static(b"payload"));
    maximal.properties.insert("k".into(), PropertyValue::Long(-1));

    for message in [minimal, maximal] {
        let packet = Packet::new(GetResponse { message: Some(message) });
        let bytes = PacketSerializer::to_bytes(&packet).unwrap();
        assert_eq!(PacketSerializer::unserialize(bytes).unwrap(), packet);
    }
}
