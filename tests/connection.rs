//! Connection behavior against a scripted peer.
//!
//! One end of a duplex pipe is a `Connection`; the other end is driven by
//! hand with raw frames so the exact bytes on the wire can be checked.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use wsconn::{
    CloseCode, CloseFrame, Config, Connection, ConnectionState, Error, Handlers, Message,
    Negotiated, OpCode, Role,
};
use wsconn::protocol::{Frame, apply_mask};

const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Encode a frame as a client would send it.
fn client_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Frame::new(fin, opcode, payload.to_vec())
        .with_mask(Some(KEY))
        .encode(&mut buf);
    buf.to_vec()
}

fn server_with(config: Config) -> (Connection<DuplexStream>, DuplexStream) {
    let (a, peer) = tokio::io::duplex(1 << 16);
    (Connection::new(a, Role::Server, config), peer)
}

fn pair(config: Config, compression: bool) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let negotiated = Negotiated {
        subprotocol: None,
        compression,
    };
    (
        Connection::from_parts(a, Role::Client, &config, negotiated.clone(), BytesMut::new()),
        Connection::from_parts(b, Role::Server, &config, negotiated, BytesMut::new()),
    )
}

/// Read one unmasked frame written by the server.
async fn read_server_frame(peer: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    peer.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames are never masked");
    let len = match head[1] & 0x7f {
        126 => usize::from(peer.read_u16().await.unwrap()),
        127 => usize::try_from(peer.read_u64().await.unwrap()).unwrap(),
        n => usize::from(n),
    };
    let mut payload = vec![0u8; len];
    peer.read_exact(&mut payload).await.unwrap();
    (head[0], payload)
}

#[tokio::test]
async fn test_ping_during_fragmented_message() {
    let (server, mut peer) = server_with(Config::server());
    peer.write_all(&client_frame(false, OpCode::Text, b"Hel")).await.unwrap();
    peer.write_all(&client_frame(true, OpCode::Ping, b"p1")).await.unwrap();
    peer.write_all(&client_frame(false, OpCode::Continuation, b"l")).await.unwrap();
    peer.write_all(&client_frame(true, OpCode::Continuation, b"o")).await.unwrap();

    assert_eq!(server.read_message().await.unwrap(), Message::text("Hello"));

    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x8a);
    assert_eq!(payload, b"p1");

    // The next frame is the close, so only one pong was written.
    server.close(CloseCode::Normal, "").await.unwrap();
    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x88);
    assert_eq!(payload, [0x03, 0xe8]);
}

#[tokio::test]
async fn test_fragmented_equals_unfragmented() {
    let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
    for fragments in 1..=6 {
        let size = payload.len().div_ceil(fragments);
        let (client, server) = pair(Config::client().with_fragment_size(size), false);
        client.write_message(Message::binary(payload.clone())).await.unwrap();
        assert_eq!(server.read_message().await.unwrap(), Message::binary(payload.clone()));
    }
}

#[tokio::test]
async fn test_oversized_message_closes_with_1009() {
    let (server, mut peer) = server_with(Config::server().with_max_message_size(16));
    peer.write_all(&client_frame(true, OpCode::Binary, &[0u8; 32])).await.unwrap();

    let err = server.read_message().await.unwrap_err();
    assert_eq!(err, Error::MessageTooLarge { size: 32, max: 16 });
    assert_eq!(err.protocol_close_code(), Some(CloseCode::MessageTooBig));

    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x88);
    assert_eq!(payload, 1009u16.to_be_bytes());

    assert_eq!(server.read_message().await.unwrap_err(), err);
    assert_eq!(server.write_message("late").await.unwrap_err(), err);
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_invalid_utf8_closes_with_1007() {
    let (server, mut peer) = server_with(Config::server());
    peer.write_all(&client_frame(true, OpCode::Text, &[b'o', b'k', 0xff])).await.unwrap();

    assert_eq!(server.read_message().await.unwrap_err(), Error::InvalidUtf8);
    let (_, payload) = read_server_frame(&mut peer).await;
    assert_eq!(payload, 1007u16.to_be_bytes());
}

#[tokio::test]
async fn test_sequencing_errors_close_with_1002() {
    let cases: [&[Vec<u8>]; 2] = [
        &[client_frame(true, OpCode::Continuation, b"x")],
        &[
            client_frame(false, OpCode::Text, b"a"),
            client_frame(true, OpCode::Binary, b"b"),
        ],
    ];
    for frames in cases {
        let (server, mut peer) = server_with(Config::server());
        for frame in frames {
            peer.write_all(frame).await.unwrap();
        }
        let err = server.read_message().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "{err:?}");
        let (_, payload) = read_server_frame(&mut peer).await;
        assert_eq!(payload, 1002u16.to_be_bytes());
    }
}

#[tokio::test]
async fn test_rsv1_without_compression() {
    let (server, mut peer) = server_with(Config::server());
    let mut frame = client_frame(true, OpCode::Text, b"x");
    frame[0] |= 0x40;
    peer.write_all(&frame).await.unwrap();
    assert_eq!(server.read_message().await.unwrap_err(), Error::ReservedBitsSet);
}

#[tokio::test]
async fn test_close_without_status_is_answered_with_1000() {
    let (server, mut peer) = server_with(Config::server());
    peer.write_all(&client_frame(true, OpCode::Close, &[])).await.unwrap();

    assert_eq!(
        server.read_message().await.unwrap_err(),
        Error::Closed(CloseFrame::new(CloseCode::NoStatusReceived, ""))
    );
    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x88);
    assert_eq!(payload, [0x03, 0xe8]);

    // The handshake is complete, so the stream was shut down.
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_peer_close_is_echoed_and_terminal() {
    let (server, mut peer) = server_with(Config::server());
    let status = CloseFrame::new(CloseCode::GoingAway, "restart");
    peer.write_all(&client_frame(true, OpCode::Close, &status.encode()))
        .await
        .unwrap();

    let closed = Error::Closed(status.clone());
    assert_eq!(server.read_message().await.unwrap_err(), closed);
    let (_, payload) = read_server_frame(&mut peer).await;
    assert_eq!(payload, status.encode());

    assert_eq!(server.read_message().await.unwrap_err(), closed);
    assert_eq!(server.write_message("late").await.unwrap_err(), closed);
}

#[tokio::test]
async fn test_write_after_close_does_not_touch_stream() {
    let (client, mut peer) = {
        let (a, peer) = tokio::io::duplex(1 << 16);
        (Connection::new(a, Role::Client, Config::client()), peer)
    };
    client.close(CloseCode::Normal, "bye").await.unwrap();
    assert_eq!(client.write_message("after").await.unwrap_err(), Error::Closing);
    assert_eq!(client.ping(Vec::new()).await.unwrap_err(), Error::Closing);
    client.shutdown().await.unwrap();

    let mut wire = Vec::new();
    peer.read_to_end(&mut wire).await.unwrap();
    // One masked close frame: 2 header bytes, 4 key bytes, code and reason.
    assert_eq!(wire.len(), 2 + 4 + 2 + 3);
    assert_eq!(wire[0], 0x88);
    let mut payload = wire[6..].to_vec();
    apply_mask(&mut payload, wire[2..6].try_into().unwrap());
    assert_eq!(payload, [0x03, 0xe8, b'b', b'y', b'e']);
}

#[tokio::test]
async fn test_close_handshake_between_connections() {
    let (client, server) = pair(Config::default(), false);
    client.close(CloseCode::Normal, "bye").await.unwrap();
    let bye = Error::Closed(CloseFrame::new(CloseCode::Normal, "bye"));
    assert_eq!(server.read_message().await.unwrap_err(), bye);
    assert_eq!(client.read_message().await.unwrap_err(), bye);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_simultaneous_close() {
    let (client, server) = pair(Config::default(), false);
    client.close(CloseCode::Normal, "client").await.unwrap();
    server.close(CloseCode::GoingAway, "server").await.unwrap();

    assert_eq!(
        client.read_message().await.unwrap_err(),
        Error::Closed(CloseFrame::new(CloseCode::GoingAway, "server"))
    );
    assert_eq!(
        server.read_message().await.unwrap_err(),
        Error::Closed(CloseFrame::new(CloseCode::Normal, "client"))
    );
}

#[tokio::test]
async fn test_compressed_frame_on_the_wire() {
    let (a, mut peer) = tokio::io::duplex(1 << 16);
    let negotiated = Negotiated {
        subprotocol: None,
        compression: true,
    };
    let client = Connection::from_parts(a, Role::Client, &Config::client(), negotiated, BytesMut::new());
    client.write_message("Hello").await.unwrap();

    let mut head = [0u8; 6];
    peer.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0xc1, "FIN, RSV1 and text opcode");
    assert_eq!(head[1], 0x80 | 7);
    let mut payload = [0u8; 7];
    peer.read_exact(&mut payload).await.unwrap();
    apply_mask(&mut payload, head[2..6].try_into().unwrap());
    assert_eq!(payload, [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00]);
}

#[tokio::test]
async fn test_compressed_messages_roundtrip() {
    let (client, server) = pair(Config::default().with_fragment_size(64), true);
    let big: Vec<u8> = b"compressible ".iter().copied().cycle().take(10_000).collect();
    let messages = [
        Message::text("Hello"),
        Message::binary(Vec::new()),
        Message::text(""),
        Message::binary(big),
        Message::text("Hello"),
    ];
    for message in &messages {
        client.write_message(message.clone()).await.unwrap();
    }
    for message in messages {
        assert_eq!(server.read_message().await.unwrap(), message);
    }
}

#[tokio::test]
async fn test_compressed_message_inflating_past_limit() {
    let config = Config::default().with_max_message_size(1000);
    let (client, server) = pair(config, true);
    client.write_message(Message::binary(vec![0u8; 5000])).await.unwrap();
    assert!(matches!(
        server.read_message().await.unwrap_err(),
        Error::MessageTooLarge { max: 1000, .. }
    ));
}

#[tokio::test]
async fn test_compressed_wire_payload_over_limit_closes_with_1009() {
    let (a, mut peer) = tokio::io::duplex(1 << 16);
    let negotiated = Negotiated {
        subprotocol: None,
        compression: true,
    };
    let config = Config::server().with_max_message_size(16);
    let server = Connection::from_parts(a, Role::Server, &config, negotiated, BytesMut::new());

    // Empty stored blocks inflate to nothing, whatever their number.
    let mut deflate = [0x00, 0x00, 0x00, 0xff, 0xff].repeat(2000);
    deflate.push(0x00);
    let mut buf = BytesMut::new();
    Frame::new(true, OpCode::Binary, deflate)
        .with_rsv1(true)
        .with_mask(Some(KEY))
        .encode(&mut buf);
    peer.write_all(&buf).await.unwrap();

    let err = server.read_message().await.unwrap_err();
    assert_eq!(err, Error::MessageTooLarge { size: 10_001, max: 16 });
    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x88);
    assert_eq!(payload, 1009u16.to_be_bytes());
}

#[tokio::test]
async fn test_client_mask_keys_do_not_follow_a_sequence() {
    let (a, mut peer) = tokio::io::duplex(1 << 16);
    let client = Connection::new(a, Role::Client, Config::client());
    let mut keys = Vec::new();
    for _ in 0..20 {
        client.write_message("x").await.unwrap();
        let mut frame = [0u8; 7];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[..2], [0x81, 0x81]);
        keys.push(u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]));
        assert_eq!(frame[6] ^ frame[2], b'x');
    }
    let steps: std::collections::HashSet<u32> =
        keys.windows(2).map(|w| w[1].wrapping_sub(w[0])).collect();
    assert!(steps.len() > 10, "keys advance by a fixed step: {keys:x?}");
}

#[tokio::test]
async fn test_local_close_wins_race_with_peer_close() {
    let (a, mut peer) = tokio::io::duplex(16);
    let server = Arc::new(Connection::new(a, Role::Server, Config::server()));
    server.write_message(Message::binary(vec![7u8; 10])).await.unwrap();

    // Only part of our Close fits in the pipe, so `close` holds the writer.
    let closer = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.close(CloseCode::Normal, "bye").await }
    });
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    peer.write_all(&client_frame(true, OpCode::Close, &[0x03, 0xe8])).await.unwrap();
    let reader = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.read_message().await }
    });
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }

    let mut wire = Vec::new();
    peer.read_to_end(&mut wire).await.unwrap();
    let mut expected = vec![0x82, 10];
    expected.extend_from_slice(&[7u8; 10]);
    expected.extend_from_slice(&[0x88, 5, 0x03, 0xe8, b'b', b'y', b'e']);
    assert_eq!(wire, expected, "exactly one Close goes out");

    closer.await.unwrap().unwrap();
    assert_eq!(
        reader.await.unwrap().unwrap_err(),
        Error::Closed(CloseFrame::new(CloseCode::Normal, ""))
    );
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_application_close_with_unsupported_data() {
    let (server, mut peer) = server_with(Config::server());
    server.close(CloseCode::UnsupportedData, "text only").await.unwrap();
    let (byte0, payload) = read_server_frame(&mut peer).await;
    assert_eq!(byte0, 0x88);
    assert_eq!(payload[..2], 1003u16.to_be_bytes());
    assert_eq!(&payload[2..], b"text only");
}

#[tokio::test]
async fn test_custom_ping_and_pong_handlers() {
    let pongs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&pongs);
    let (client, server) = pair(Config::default(), false);
    let server = server.with_handlers(
        Handlers::new()
            .on_ping(|_| None)
            .on_pong(move |payload| {
                assert_eq!(payload, b"beat");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
    );

    client.ping(b"silent".to_vec()).await.unwrap();
    client.pong(b"beat".to_vec()).await.unwrap();
    client.write_message("done").await.unwrap();
    assert_eq!(server.read_message().await.unwrap(), Message::text("done"));
    assert_eq!(pongs.load(Ordering::SeqCst), 1);

    // No pong came back for the ping; the first frame the client sees is
    // the server's message.
    server.write_message("reply").await.unwrap();
    assert_eq!(client.read_message().await.unwrap(), Message::text("reply"));
}

#[tokio::test]
async fn test_close_handler_reply() {
    let (client, server) = pair(Config::default(), false);
    server.set_close_handler(Some(Arc::new(|_: &CloseFrame| {
        Some(CloseFrame::new(CloseCode::PolicyViolation, "custom"))
    })));
    client.close(CloseCode::Normal, "").await.unwrap();
    assert!(matches!(server.read_message().await, Err(Error::Closed(_))));
    assert_eq!(
        client.read_message().await.unwrap_err(),
        Error::Closed(CloseFrame::new(CloseCode::PolicyViolation, "custom"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_deadline() {
    let (server, _peer) = server_with(Config::server());
    server.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_secs(1)));
    assert_eq!(server.read_message().await.unwrap_err(), Error::Timeout);
    // Unusable afterwards.
    server.set_read_deadline(None);
    assert_eq!(server.read_message().await.unwrap_err(), Error::Timeout);
    assert_eq!(server.write_message("x").await.unwrap_err(), Error::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_write_deadline() {
    let (a, _peer) = tokio::io::duplex(64);
    let client = Connection::new(a, Role::Client, Config::client());
    client.set_write_deadline(Some(tokio::time::Instant::now() + Duration::from_secs(1)));
    assert_eq!(
        client.write_message(Message::binary(vec![0u8; 4096])).await.unwrap_err(),
        Error::Timeout
    );
}

#[tokio::test(start_paused = true)]
async fn test_pong_handler_extends_read_deadline() {
    let (client, server) = pair(Config::default(), false);
    let deadlines = server.deadlines();
    server.set_pong_handler(Some(Arc::new(move |_: &[u8]| {
        deadlines.set_read(Some(tokio::time::Instant::now() + Duration::from_secs(10)));
    })));
    server.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_secs(1)));

    let peer = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        client.pong(Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        client.write_message("still here").await.unwrap();
    };
    let (message, ()) = tokio::join!(server.read_message(), peer);
    assert_eq!(message.unwrap(), Message::text("still here"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_duplex() {
    const COUNT: usize = 200;
    let (client, server) = pair(Config::default().with_fragment_size(100), false);
    let client = Arc::new(client);
    let server = Arc::new(server);

    let echo = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            for _ in 0..COUNT {
                let msg = server.read_message().await.unwrap();
                server.write_message(msg).await.unwrap();
            }
        })
    };
    let writer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            for i in 0..COUNT {
                client.write_message(format!("message {i} {}", "x".repeat(i))).await.unwrap();
            }
        })
    };
    for i in 0..COUNT {
        let expected = format!("message {i} {}", "x".repeat(i));
        assert_eq!(client.read_message().await.unwrap(), Message::text(expected));
    }
    writer.await.unwrap();
    echo.await.unwrap();
}
