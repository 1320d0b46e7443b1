#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::time::Duration;

use futures_util::{SinkExt as _, Stream, StreamExt as _};
use tokio::io::AsyncWriteExt as _;
use tokio_util::codec::{FramedRead, FramedWrite};
use tunmux::tunmux_proto::{
    Bytes, Envelope, MessageType, Payload, PortFwdReq, ShellReq, TunnelClose, TunnelData, TunnelId, TunnelOpenResponse,
};
use tunmux::{Connection, DispatchTable, EnvelopeCodec, FilteringRule, OutboundReceiver, TunmuxConfig, TunmuxSession};

const TIMEOUT: Duration = Duration::from_secs(10);

fn request<P: Payload>(ty: MessageType, correlation_id: u64, payload: &P) -> Envelope {
    Envelope::from_payload(ty, payload).with_correlation_id(Some(correlation_id))
}

fn data(id: u64, bytes: &'static [u8]) -> Envelope {
    Envelope::from_payload(
        MessageType::TunnelData,
        &TunnelData::new(TunnelId::from(id), Bytes::from_static(bytes)),
    )
}

fn close(id: u64) -> Envelope {
    Envelope::from_payload(MessageType::TunnelClose, &TunnelClose::new(TunnelId::from(id), "done"))
}

async fn next_envelope(outbound_rx: &mut OutboundReceiver) -> Envelope {
    tokio::time::timeout(TIMEOUT, outbound_rx.recv()).await.unwrap().unwrap()
}

async fn expect_response(outbound_rx: &mut OutboundReceiver, ty: MessageType, correlation_id: u64) -> TunnelOpenResponse {
    let envelope = next_envelope(outbound_rx).await;
    assert_eq!(ty, envelope.message_type().unwrap());
    assert_eq!(Some(correlation_id), envelope.id);
    TunnelOpenResponse::decode(envelope.data).unwrap()
}

/// Collects tunnel data until `needle` was received.
async fn read_data_until(outbound_rx: &mut OutboundReceiver, id: u64, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();

    while !received.windows(needle.len()).any(|window| window == needle) {
        let envelope = next_envelope(outbound_rx).await;
        assert_eq!(MessageType::TunnelData, envelope.message_type().unwrap());

        let msg = TunnelData::decode(envelope.data).unwrap();
        assert_eq!(id, msg.tunnel_id);
        assert!(!msg.data.is_empty());
        received.extend_from_slice(&msg.data);
    }

    received
}

/// Skips tunnel data until the close message.
async fn read_until_close(outbound_rx: &mut OutboundReceiver) -> (Vec<u8>, TunnelClose) {
    let mut received = Vec::new();

    loop {
        let envelope = next_envelope(outbound_rx).await;

        match envelope.message_type().unwrap() {
            MessageType::TunnelData => received.extend_from_slice(&TunnelData::decode(envelope.data).unwrap().data),
            MessageType::TunnelClose => return (received, TunnelClose::decode(envelope.data).unwrap()),
            other => panic!("unexpected {other:?}"),
        }
    }
}

async fn next_frame<S>(stream: &mut S) -> Envelope
where
    S: Stream<Item = std::io::Result<Result<Envelope, tunmux::tunmux_proto::Error>>> + Unpin,
{
    tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap()
}

/// Correlation flag set, but a single body byte.
const MALFORMED_ENVELOPE: &[u8] = &[0, 0, 0, 10, 0, 0, 0, 0x20, 1, 0];

async fn assert_silent(outbound_rx: &mut OutboundReceiver) {
    let next = tokio::time::timeout(Duration::from_millis(200), outbound_rx.recv()).await;
    assert!(next.is_err(), "unexpected outbound envelope: {next:?}");
}

#[tokio::test]
async fn port_forward_echo() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_echo_server().await.unwrap();
    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = PortFwdReq::new(TunnelId::from(3), "127.0.0.1", addr.port());
    dispatch.dispatch(request(MessageType::PortFwdReq, 11, &req), &conn);

    let response = expect_response(&mut outbound_rx, MessageType::PortFwdResp, 11).await;
    assert_eq!(TunnelOpenResponse::success(), response);
    assert!(conn.tunnel(TunnelId::from(3)).is_some());

    dispatch.dispatch(data(3, b"ping"), &conn);
    dispatch.dispatch(data(3, b"pong"), &conn);
    let echoed = read_data_until(&mut outbound_rx, 3, b"pingpong").await;
    assert_eq!(b"pingpong", echoed.as_slice());

    dispatch.dispatch(close(3), &conn);
    assert!(conn.registry().is_empty());

    // A remote close is not echoed back.
    assert_silent(&mut outbound_rx).await;
}

#[tokio::test]
async fn refused_destination_is_answered_with_failure() {
    test_utils::init_tracing();

    let port = test_utils::find_refused_port().unwrap();
    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());

    let req = PortFwdReq::new(TunnelId::from(1), "127.0.0.1", port);
    DispatchTable::new().dispatch(request(MessageType::PortFwdReq, 2, &req), &conn);

    let response = expect_response(&mut outbound_rx, MessageType::PortFwdResp, 2).await;
    assert!(!response.success);
    assert!(!response.err.is_empty());

    assert!(conn.registry().is_empty());
    assert_silent(&mut outbound_rx).await;
}

#[tokio::test]
async fn filtered_destination_is_answered_without_dialing() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_echo_server().await.unwrap();
    let cfg = TunmuxConfig::restricted(FilteringRule::host_and_port("127.0.0.1", 1));
    let (conn, mut outbound_rx) = Connection::new(cfg);

    let req = PortFwdReq::new(TunnelId::from(1), "127.0.0.1", addr.port());
    DispatchTable::new().dispatch(request(MessageType::PortFwdReq, 9, &req), &conn);

    // Answered synchronously by the handler.
    let envelope = outbound_rx.try_recv().unwrap();
    assert_eq!(Some(9), envelope.id);
    let response = TunnelOpenResponse::decode(envelope.data).unwrap();
    assert!(!response.success);
    assert!(response.err.contains("not allowed"));

    assert!(conn.registry().is_empty());
}

#[tokio::test]
async fn destination_close_is_reported_after_its_data() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_greeting_server(b"hello from the destination").await.unwrap();
    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());

    let req = PortFwdReq::new(TunnelId::from(8), "127.0.0.1", addr.port());
    DispatchTable::new().dispatch(request(MessageType::PortFwdReq, 1, &req), &conn);

    let response = expect_response(&mut outbound_rx, MessageType::PortFwdResp, 1).await;
    assert!(response.success);

    let (received, close) = read_until_close(&mut outbound_rx).await;
    assert_eq!(b"hello from the destination", received.as_slice());
    assert_eq!(TunnelClose::new(TunnelId::from(8), "EOF"), close);

    assert!(conn.registry().is_empty());
}

#[tokio::test]
async fn remote_close_closes_the_destination_socket() {
    test_utils::init_tracing();

    let (addr, client_closed) = test_utils::spawn_silent_server().await.unwrap();
    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = PortFwdReq::new(TunnelId::from(4), "127.0.0.1", addr.port());
    dispatch.dispatch(request(MessageType::PortFwdReq, 1, &req), &conn);
    assert!(expect_response(&mut outbound_rx, MessageType::PortFwdResp, 1).await.success);

    dispatch.dispatch(close(4), &conn);
    assert!(conn.tunnel(TunnelId::from(4)).is_none());

    tokio::time::timeout(TIMEOUT, client_closed).await.unwrap().unwrap();

    // Data for the closed tunnel is dropped.
    dispatch.dispatch(data(4, b"too late"), &conn);
    assert!(conn.registry().is_empty());
    assert_silent(&mut outbound_rx).await;
}

#[tokio::test]
async fn duplicate_tunnel_id_is_rejected() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_echo_server().await.unwrap();
    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = PortFwdReq::new(TunnelId::from(1), "127.0.0.1", addr.port());
    dispatch.dispatch(request(MessageType::PortFwdReq, 1, &req), &conn);
    assert!(expect_response(&mut outbound_rx, MessageType::PortFwdResp, 1).await.success);

    dispatch.dispatch(request(MessageType::PortFwdReq, 2, &req), &conn);
    let response = expect_response(&mut outbound_rx, MessageType::PortFwdResp, 2).await;
    assert!(!response.success);

    // The live tunnel is untouched.
    dispatch.dispatch(data(1, b"still there"), &conn);
    assert_eq!(b"still there", read_data_until(&mut outbound_rx, 1, b"still there").await.as_slice());
    assert_eq!(1, conn.registry().len());
}

#[cfg(unix)]
#[tokio::test]
async fn shell_session_runs_commands_until_exit() {
    test_utils::init_tracing();

    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = ShellReq::new(TunnelId::from(7), "/bin/sh", false);
    dispatch.dispatch(request(MessageType::ShellReq, 5, &req), &conn);

    let response = expect_response(&mut outbound_rx, MessageType::ShellResp, 5).await;
    assert_eq!(TunnelOpenResponse::success(), response);

    dispatch.dispatch(data(7, b"echo hello\n"), &conn);
    let output = read_data_until(&mut outbound_rx, 7, b"hello").await;
    assert!(String::from_utf8_lossy(&output).contains("hello"));

    dispatch.dispatch(data(7, b"exit\n"), &conn);
    let (_, close) = read_until_close(&mut outbound_rx).await;
    assert_eq!(TunnelClose::new(TunnelId::from(7), "EOF"), close);

    assert!(conn.registry().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn shell_remote_close_is_not_echoed() {
    test_utils::init_tracing();

    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = ShellReq::new(TunnelId::from(2), "/bin/sh", false);
    dispatch.dispatch(request(MessageType::ShellReq, 1, &req), &conn);
    assert!(expect_response(&mut outbound_rx, MessageType::ShellResp, 1).await.success);

    dispatch.dispatch(close(2), &conn);
    assert!(conn.registry().is_empty());
    assert_silent(&mut outbound_rx).await;
}

#[cfg(unix)]
#[tokio::test]
async fn shell_with_zero_read_buffer_still_forwards_output() {
    test_utils::init_tracing();

    let cfg = TunmuxConfig {
        read_buffer_size: 0,
        ..TunmuxConfig::default()
    };
    let (conn, mut outbound_rx) = Connection::new(cfg);
    let dispatch = DispatchTable::new();

    let req = ShellReq::new(TunnelId::from(6), "/bin/sh", false);
    dispatch.dispatch(request(MessageType::ShellReq, 1, &req), &conn);
    assert!(expect_response(&mut outbound_rx, MessageType::ShellResp, 1).await.success);

    dispatch.dispatch(data(6, b"echo tiny\n"), &conn);
    read_data_until(&mut outbound_rx, 6, b"tiny").await;
    assert!(conn.tunnel(TunnelId::from(6)).is_some());

    dispatch.dispatch(close(6), &conn);
    assert!(conn.registry().is_empty());
}

#[cfg(unix)]
fn pty_available() -> bool {
    std::path::Path::new("/dev/ptmx").exists()
}

#[cfg(unix)]
#[tokio::test]
async fn pty_shell_runs_commands_until_exit() {
    test_utils::init_tracing();

    if !pty_available() {
        return;
    }

    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = ShellReq::new(TunnelId::from(9), "/bin/sh", true);
    dispatch.dispatch(request(MessageType::ShellReq, 4, &req), &conn);

    let response = expect_response(&mut outbound_rx, MessageType::ShellResp, 4).await;
    assert_eq!(TunnelOpenResponse::success(), response);

    // The terminal echoes the command line itself, only the evaluated output contains "pty2".
    dispatch.dispatch(data(9, b"echo pty$((1+1))\n"), &conn);
    read_data_until(&mut outbound_rx, 9, b"pty2").await;

    dispatch.dispatch(data(9, b"exit\n"), &conn);
    let (_, close) = read_until_close(&mut outbound_rx).await;
    assert_eq!(TunnelClose::new(TunnelId::from(9), "EOF"), close);

    assert!(conn.registry().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn pty_shell_remote_close_is_not_echoed() {
    test_utils::init_tracing();

    if !pty_available() {
        return;
    }

    let (conn, mut outbound_rx) = Connection::new(TunmuxConfig::default());
    let dispatch = DispatchTable::new();

    let req = ShellReq::new(TunnelId::from(10), "/bin/sh", true);
    dispatch.dispatch(request(MessageType::ShellReq, 1, &req), &conn);
    assert!(expect_response(&mut outbound_rx, MessageType::ShellResp, 1).await.success);

    dispatch.dispatch(close(10), &conn);
    assert!(conn.registry().is_empty());

    // Output the shell produced before the close may still be in flight.
    loop {
        match tokio::time::timeout(Duration::from_millis(300), outbound_rx.recv()).await {
            Ok(Some(envelope)) => assert_eq!(MessageType::TunnelData, envelope.message_type().unwrap()),
            Ok(None) | Err(_) => break,
        }
    }
}

#[tokio::test]
async fn session_skips_malformed_envelopes() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_echo_server().await.unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server);
    let session = tokio::spawn(TunmuxSession::new(Box::new(server_reader), Box::new(server_writer)).run());

    let (client_reader, client_writer) = tokio::io::split(client);
    let mut client_stream = FramedRead::new(client_reader, EnvelopeCodec);
    let mut client_sink = FramedWrite::new(client_writer, EnvelopeCodec);

    client_sink.get_mut().write_all(MALFORMED_ENVELOPE).await.unwrap();

    let req = PortFwdReq::new(TunnelId::from(1), "127.0.0.1", addr.port());
    client_sink.send(request(MessageType::PortFwdReq, 3, &req)).await.unwrap();

    let envelope = next_frame(&mut client_stream).await;
    assert_eq!(Some(3), envelope.id);
    assert!(TunnelOpenResponse::decode(envelope.data).unwrap().success);

    client_sink.close().await.unwrap();

    tokio::time::timeout(TIMEOUT, session).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn session_stops_after_repeated_malformed_envelopes() {
    test_utils::init_tracing();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server);
    let session = tokio::spawn(TunmuxSession::new(Box::new(server_reader), Box::new(server_writer)).run());

    let (_client_reader, mut client_writer) = tokio::io::split(client);
    for _ in 0..6 {
        client_writer.write_all(MALFORMED_ENVELOPE).await.unwrap();
    }
    client_writer.flush().await.unwrap();

    let error = tokio::time::timeout(TIMEOUT, session).await.unwrap().unwrap().unwrap_err();
    assert!(format!("{error:#}").contains("malformed envelopes"));
}

#[tokio::test]
async fn session_serves_tunnels_until_peer_eof() {
    test_utils::init_tracing();

    let addr = test_utils::spawn_echo_server().await.unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server);
    let session = tokio::spawn(TunmuxSession::new(Box::new(server_reader), Box::new(server_writer)).run());

    let (client_reader, client_writer) = tokio::io::split(client);
    let mut client_stream = FramedRead::new(client_reader, EnvelopeCodec);
    let mut client_sink = FramedWrite::new(client_writer, EnvelopeCodec);

    // Unknown message types are ignored.
    client_sink
        .send(Envelope {
            ty: 0x99,
            id: None,
            data: Bytes::from_static(b"?"),
        })
        .await
        .unwrap();

    let req = PortFwdReq::new(TunnelId::from(1), "127.0.0.1", addr.port());
    client_sink.send(request(MessageType::PortFwdReq, 3, &req)).await.unwrap();

    let envelope = next_frame(&mut client_stream).await;
    assert_eq!(MessageType::PortFwdResp, envelope.message_type().unwrap());
    assert_eq!(Some(3), envelope.id);
    assert!(TunnelOpenResponse::decode(envelope.data).unwrap().success);

    client_sink.send(data(1, b"over the session")).await.unwrap();

    let mut received = Vec::new();
    while received.len() < b"over the session".len() {
        let envelope = next_frame(&mut client_stream).await;
        received.extend_from_slice(&TunnelData::decode(envelope.data).unwrap().data);
    }
    assert_eq!(b"over the session", received.as_slice());

    client_sink.close().await.unwrap();

    tokio::time::timeout(TIMEOUT, session).await.unwrap().unwrap().unwrap();
}
