//! Decoders fed in arbitrary chunks.
//!
//! Sockets hand over bytes in whatever pieces they like. These tests encode a
//! known sequence of items, split the byte stream at random (seeded) points
//! and check that both codecs reproduce the original sequence.

use bytes::{Bytes, BytesMut};
use iridium_mq::amqp::{AmqpCodec, AmqpFrame, BasicProperties, ContentHeader, Method};
use iridium_mq::stomp::{Frame, StompCodec, StompItem};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::codec::{Decoder, Encoder};

/// Split `data` into chunks of 1..=`max` bytes.
fn chunks(data: &[u8], rng: &mut StdRng, max: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let n = rng.gen_range(1..=max).min(data.len() - pos);
        out.push(data[pos..pos + n].to_vec());
        pos += n;
    }
    out
}

/// Feed `pieces` one at a time, decoding everything available after each.
fn feed<D>(codec: &mut D, pieces: Vec<Vec<u8>>) -> Vec<D::Item>
where
    D: Decoder,
    D::Error: std::fmt::Debug,
{
    let mut buf = BytesMut::new();
    let mut items = Vec::new();
    for piece in pieces {
        buf.extend_from_slice(&piece);
        while let Some(item) = codec.decode(&mut buf).expect("decode failed") {
            items.push(item);
        }
    }
    assert!(buf.is_empty(), "undecoded bytes left: {:02x?}", &buf[..]);
    items
}

// ============================================================================
// STOMP
// ============================================================================

fn stomp_items() -> Vec<StompItem> {
    vec![
        StompItem::Frame(Frame::send("/queue/orders", "first").header("content-type", "text/plain")),
        StompItem::Heartbeat,
        StompItem::Frame(Frame::send("/topic/bin", vec![0u8, 1, 0, 2, 0])),
        StompItem::Frame(Frame::send("/queue/esc", "").header("note", "a:b\nc")),
        StompItem::Heartbeat,
        StompItem::Heartbeat,
        StompItem::Frame(Frame::new("DISCONNECT").receipt("disconnect-1")),
    ]
}

/// Encoded form; binary bodies come back with the `content-length` header the
/// encoder added.
fn stomp_expected(items: &[StompItem], wire: &[u8]) -> Vec<StompItem> {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(wire);
    let mut decoded = Vec::new();
    while let Some(item) = codec.decode(&mut buf).unwrap() {
        decoded.push(item);
    }
    assert_eq!(decoded.len(), items.len());
    decoded
}

#[test]
fn stomp_random_chunks() {
    let items = stomp_items();
    let mut wire = BytesMut::new();
    let mut codec = StompCodec::new();
    for item in items.clone() {
        codec.encode(item, &mut wire).unwrap();
    }
    let expected = stomp_expected(&items, &wire);
    match &expected[2] {
        StompItem::Frame(f) => assert_eq!(f.body, vec![0u8, 1, 0, 2, 0]),
        other => panic!("expected binary frame, got {:?}", other),
    }

    let mut rng = StdRng::seed_from_u64(0x5707);
    for _ in 0..200 {
        let pieces = chunks(&wire, &mut rng, 9);
        assert_eq!(feed(&mut StompCodec::new(), pieces), expected);
    }
}

#[test]
fn stomp_replay_of_split_send_frames() {
    // frames split mid-command and mid-body
    let pieces: Vec<Vec<u8>> = vec![
        b"SE".to_vec(),
        b"ND\n\nproducer-0-".to_vec(),
        b"msg-0\0".to_vec(),
        b"SEND\n\nproducer-1".to_vec(),
        b"-msg-0\0SEN".to_vec(),
        b"D\n\nproducer-2-msg-1\0".to_vec(),
    ];
    let items = feed(&mut StompCodec::new(), pieces);
    let bodies: Vec<Vec<u8>> = items
        .into_iter()
        .map(|item| match item {
            StompItem::Frame(f) => f.body,
            other => panic!("expected frame, got {:?}", other),
        })
        .collect();
    assert_eq!(
        bodies,
        vec![
            b"producer-0-msg-0".to_vec(),
            b"producer-1-msg-0".to_vec(),
            b"producer-2-msg-1".to_vec(),
        ]
    );
}

// ============================================================================
// AMQP
// ============================================================================

fn amqp_frames() -> Vec<AmqpFrame> {
    vec![
        AmqpFrame::Method(0, Method::ConnectionOpen {
            virtual_host: "/".into(),
        }),
        AmqpFrame::Heartbeat,
        AmqpFrame::Method(1, Method::BasicPublish {
            exchange: "amq.topic".into(),
            routing_key: "prices.eur".into(),
            mandatory: false,
            immediate: false,
        }),
        AmqpFrame::Header(1, ContentHeader {
            class_id: 60,
            body_size: 11,
            properties: BasicProperties {
                content_type: Some("text/plain".into()),
                delivery_mode: Some(2),
                expiration: Some("60000".into()),
                ..Default::default()
            },
        }),
        AmqpFrame::Body(1, Bytes::from_static(b"hello ")),
        AmqpFrame::Body(1, Bytes::from_static(b"world")),
        AmqpFrame::Method(1, Method::ChannelClose {
            reply_code: 200,
            reply_text: "Normal shutdown".into(),
            class_id: 0,
            method_id: 0,
        }),
    ]
}

#[test]
fn amqp_random_chunks() {
    let frames = amqp_frames();
    let mut wire = BytesMut::new();
    let mut codec = AmqpCodec::new();
    for frame in frames.clone() {
        codec.encode(frame, &mut wire).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(0xA3A9);
    for _ in 0..200 {
        let pieces = chunks(&wire, &mut rng, 13);
        assert_eq!(feed(&mut AmqpCodec::new(), pieces), frames);
    }
}

#[test]
fn amqp_byte_at_a_time() {
    let frames = amqp_frames();
    let mut wire = BytesMut::new();
    let mut codec = AmqpCodec::new();
    for frame in frames.clone() {
        codec.encode(frame, &mut wire).unwrap();
    }
    let pieces = wire.iter().map(|&b| vec![b]).collect();
    assert_eq!(feed(&mut AmqpCodec::new(), pieces), frames);
}
