//! End-to-end HTTP/2 sessions over in-memory connections.

use std::sync::Arc;

use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use trellis::server::conn::Http;
use trellis::{Body, HttpService, Request, Response};

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;

const ACK: u8 = 0x1;
const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;

#[derive(Debug)]
struct Frame {
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

async fn write_frame(
    io: &mut DuplexStream,
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) {
    let len = payload.len();
    let head = [
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
        kind,
        flags,
        (stream_id >> 24) as u8 & 0x7f,
        (stream_id >> 16) as u8,
        (stream_id >> 8) as u8,
        stream_id as u8,
    ];
    io.write_all(&head).await.unwrap();
    io.write_all(payload).await.unwrap();
}

async fn read_frame(io: &mut DuplexStream) -> Frame {
    let mut head = [0u8; 9];
    io.read_exact(&mut head).await.expect("frame head");
    let len = (head[0] as usize) << 16 | (head[1] as usize) << 8 | head[2] as usize;
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.expect("frame payload");
    Frame {
        kind: head[3],
        flags: head[4],
        stream_id: ((head[5] & 0x7f) as u32) << 24
            | (head[6] as u32) << 16
            | (head[7] as u32) << 8
            | head[8] as u32,
        payload,
    }
}

/// Reads frames until one of `kind` arrives, skipping others.
async fn read_frame_of(io: &mut DuplexStream, kind: u8) -> Frame {
    loop {
        let frame = read_frame(io).await;
        if frame.kind == kind {
            return frame;
        }
    }
}

fn settings_payload(entries: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (ident, value) in entries {
        payload.extend_from_slice(&ident.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload
}

/// `:method GET`, `:scheme http`, then a literal `:path`.
fn get_request_block(path: &str) -> Vec<u8> {
    let mut block = vec![0x82, 0x86];
    if path == "/" {
        block.push(0x84);
    } else {
        block.push(0x44); // literal with indexing, name = static 4 (:path)
        block.push(path.len() as u8);
        block.extend_from_slice(path.as_bytes());
    }
    block
}

fn service() -> Arc<HttpService> {
    let service = HttpService::builder()
        .endpoint(Method::GET, "/", |_req: Request| async {
            Ok::<_, trellis::Error>(Response::new(Body::from("hi")))
        })
        .endpoint(Method::GET, "/big", |_req: Request| async {
            Ok::<_, trellis::Error>(Response::new(Body::from(vec![0x42u8; 25])))
        })
        .endpoint(Method::POST, "/echo", |mut req: Request| async move {
            let body = req.body_mut().bytes().await?;
            Ok::<_, trellis::Error>(Response::new(Body::from(body)))
        })
        .build();
    Arc::new(service)
}

fn connect() -> DuplexStream {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let service = service();
    tokio::spawn(async move {
        let _ = Http::new().serve_connection(server, service).await;
    });
    client
}

/// Preface plus client SETTINGS, consuming the server's SETTINGS and ack.
async fn handshake(client: &mut DuplexStream, entries: &[(u16, u32)]) {
    client.write_all(PREFACE).await.unwrap();
    write_frame(client, SETTINGS, 0, 0, &settings_payload(entries)).await;

    let server_settings = read_frame(client).await;
    assert_eq!(server_settings.kind, SETTINGS);
    assert_eq!(server_settings.flags & ACK, 0);
    // ack our empty/tuned settings
    let ack = read_frame(client).await;
    assert_eq!(ack.kind, SETTINGS);
    assert_eq!(ack.flags & ACK, ACK);
    // be a polite peer and ack theirs
    write_frame(client, SETTINGS, ACK, 0, &[]).await;
}

#[tokio::test]
async fn single_stream_get() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    write_frame(
        &mut client,
        HEADERS,
        END_HEADERS | END_STREAM,
        1,
        &get_request_block("/"),
    )
    .await;

    let headers = read_frame_of(&mut client, HEADERS).await;
    assert_eq!(headers.stream_id, 1);
    assert_eq!(headers.flags & END_HEADERS, END_HEADERS);
    // :status 200 is the one-byte static-table index 8.
    assert_eq!(headers.payload[0], 0x88);

    let data = read_frame_of(&mut client, DATA).await;
    assert_eq!(data.stream_id, 1);
    assert_eq!(data.payload, b"hi");
}

#[tokio::test]
async fn flow_controlled_response() {
    let mut client = connect();
    // SETTINGS_INITIAL_WINDOW_SIZE = 10
    handshake(&mut client, &[(0x4, 10)]).await;

    write_frame(
        &mut client,
        HEADERS,
        END_HEADERS | END_STREAM,
        1,
        &get_request_block("/big"),
    )
    .await;

    let _headers = read_frame_of(&mut client, HEADERS).await;
    let first = read_frame_of(&mut client, DATA).await;
    assert_eq!(first.payload.len(), 10);
    assert_eq!(first.flags & END_STREAM, 0);

    // Open the stream window twice; 10 then the final 5 arrive.
    write_frame(&mut client, WINDOW_UPDATE, 0, 1, &10u32.to_be_bytes()).await;
    let second = read_frame_of(&mut client, DATA).await;
    assert_eq!(second.payload.len(), 10);
    assert_eq!(second.flags & END_STREAM, 0);

    write_frame(&mut client, WINDOW_UPDATE, 0, 1, &10u32.to_be_bytes()).await;
    let third = read_frame_of(&mut client, DATA).await;
    assert_eq!(third.payload.len(), 5);
    assert_eq!(third.flags & END_STREAM, END_STREAM);
}

#[tokio::test]
async fn request_body_is_echoed_with_window_updates() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    // POST /echo: :method POST (static 3), :scheme http, literal :path
    let mut block = vec![0x83, 0x86, 0x44];
    block.push(5);
    block.extend_from_slice(b"/echo");
    write_frame(&mut client, HEADERS, END_HEADERS, 1, &block).await;
    write_frame(&mut client, DATA, 0, 1, b"hel").await;
    write_frame(&mut client, DATA, END_STREAM, 1, b"lo").await;

    // The session replenishes the connection window for both DATA
    // frames and the stream window for the first.
    let update = read_frame_of(&mut client, WINDOW_UPDATE).await;
    assert_eq!(update.stream_id, 0);

    let headers = read_frame_of(&mut client, HEADERS).await;
    assert_eq!(headers.payload[0], 0x88);
    let data = read_frame_of(&mut client, DATA).await;
    assert_eq!(data.payload, b"hello");
    assert_eq!(data.flags & END_STREAM, END_STREAM);
}

#[tokio::test]
async fn ping_is_echoed_with_ack() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    write_frame(&mut client, PING, 0, 0, b"01234567").await;
    let pong = read_frame_of(&mut client, PING).await;
    assert_eq!(pong.flags & ACK, ACK);
    assert_eq!(pong.payload, b"01234567");
}

#[tokio::test]
async fn new_stream_after_goaway_is_refused() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    // GOAWAY with last_stream_id = 0, NO_ERROR: the client is leaving.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    write_frame(&mut client, GOAWAY, 0, 0, &payload).await;

    // A stream opened afterwards must not be processed.
    write_frame(
        &mut client,
        HEADERS,
        END_HEADERS | END_STREAM,
        1,
        &get_request_block("/"),
    )
    .await;

    let reset = read_frame_of(&mut client, RST_STREAM).await;
    assert_eq!(reset.stream_id, 1);
    let code = u32::from_be_bytes(reset.payload[0..4].try_into().unwrap());
    assert_eq!(code, 0x7, "REFUSED_STREAM");
}

#[tokio::test]
async fn settings_on_stream_is_goaway() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    write_frame(&mut client, SETTINGS, 0, 1, &[]).await;
    let goaway = read_frame_of(&mut client, GOAWAY).await;
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(code, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn zero_window_increment_is_goaway() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    write_frame(&mut client, WINDOW_UPDATE, 0, 0, &0u32.to_be_bytes()).await;
    let goaway = read_frame_of(&mut client, GOAWAY).await;
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(code, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn bad_preface_is_goaway() {
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let service = service();
    tokio::spawn(async move {
        // Force the HTTP/2 handler to make the preface check observable.
        let _ = Http::new().serve_http2(server, service).await;
    });

    client.write_all(b"NOT A PREFACE AT ALL!!!!").await.unwrap();
    // Server SETTINGS arrives first, then the GOAWAY.
    let goaway = read_frame_of(&mut client, GOAWAY).await;
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(code, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn stale_stream_id_is_goaway() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    write_frame(
        &mut client,
        HEADERS,
        END_HEADERS | END_STREAM,
        5,
        &get_request_block("/"),
    )
    .await;
    let _ = read_frame_of(&mut client, HEADERS).await;

    // Opening stream 3 after stream 5 violates monotonicity.
    write_frame(
        &mut client,
        HEADERS,
        END_HEADERS | END_STREAM,
        3,
        &get_request_block("/"),
    )
    .await;
    let goaway = read_frame_of(&mut client, GOAWAY).await;
    let last = u32::from_be_bytes(goaway.payload[0..4].try_into().unwrap());
    assert_eq!(last, 5);
}

#[tokio::test]
async fn interleaved_header_block_is_goaway() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    // HEADERS without END_HEADERS opens a block; a PING may not
    // interleave before the CONTINUATION.
    write_frame(&mut client, HEADERS, 0, 1, &get_request_block("/")).await;
    write_frame(&mut client, PING, 0, 0, b"xxxxxxxx").await;

    let goaway = read_frame_of(&mut client, GOAWAY).await;
    let code = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(code, 0x1, "PROTOCOL_ERROR");
}

#[tokio::test]
async fn malformed_request_head_is_reset() {
    let mut client = connect();
    handshake(&mut client, &[]).await;

    // Missing :path and :scheme.
    write_frame(&mut client, HEADERS, END_HEADERS | END_STREAM, 1, &[0x82]).await;
    let reset = read_frame_of(&mut client, RST_STREAM).await;
    assert_eq!(reset.stream_id, 1);
    let code = u32::from_be_bytes(reset.payload[0..4].try_into().unwrap());
    assert_eq!(code, 0x1, "PROTOCOL_ERROR");
}
