//! Channel pooling and wire-robustness tests.

mod common;

use common::*;
use futures::future::join_all;
use remi_core::{Session, SessionConfig, Value};
use remi_wire::BasicCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[tokio::test]
async fn test_sequential_invocations_reuse_channels() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    for i in 0..1000 {
        let reply = stub
            .invoke(test_ord::ECHO, vec![Value::Str(format!("message {i}"))])
            .await
            .unwrap();
        assert_eq!(reply.into_str().unwrap(), format!("message {i}"));
    }

    // An 8-way pool serves 1000 sequential invocations with at most 8
    // physical channels (in practice one).
    assert!(
        client.channels_opened() <= 8,
        "opened {} channels",
        client.channels_opened()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invocations() {
    init_logging();
    let (client, _server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let mut tasks = Vec::new();
    for task_id in 0..32 {
        let stub = Arc::clone(&stub);
        tasks.push(tokio::spawn(async move {
            for i in 0..20 {
                let text = format!("task {task_id} call {i}");
                let reply = stub
                    .invoke(test_ord::ECHO, vec![Value::Str(text.clone())])
                    .await
                    .unwrap();
                assert_eq!(reply.into_str().unwrap(), text);
            }
        }));
    }
    for result in join_all(tasks).await {
        result.unwrap();
    }

    // Bounded by the channel limiter regardless of concurrency.
    assert!(client.channels_opened() <= 64);
}

// Raw frame helpers speaking the multiplexer protocol directly:
// channel id (u32 BE) | opcode (u8) | length (u32 BE) | payload.
const OP_OPEN: u8 = 1;
const OP_DATA: u8 = 2;

async fn write_frame(stream: &mut DuplexStream, channel: u32, op: u8, payload: &[u8]) {
    let mut header = [0u8; 9];
    header[0..4].copy_from_slice(&channel.to_be_bytes());
    header[4] = op;
    header[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_frame(stream: &mut DuplexStream) -> (u32, u8, Vec<u8>) {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await.unwrap();
    let channel = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let op = header[4];
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (channel, op, payload)
}

/// Wait for a DATA frame on the given channel, skipping frames for others.
async fn read_data_for(stream: &mut DuplexStream, channel: u32) -> Vec<u8> {
    loop {
        let (ch, op, payload) = read_frame(stream).await;
        if ch == channel && op == OP_DATA {
            return payload;
        }
    }
}

#[tokio::test]
async fn test_malformed_string_closes_channel_not_session() {
    init_logging();
    let (mut raw, server_side) = tokio::io::duplex(64 * 1024);
    let server = Session::accept(server_side, Arc::new(BasicCodec), SessionConfig::default())
        .await
        .unwrap();

    // Request on channel 1: bootstrap object (id 0), lookup method (id 4),
    // then a string whose first character byte is the illegal 0xF8.
    let mut request = Vec::new();
    request.extend_from_slice(&0u64.to_be_bytes());
    request.extend_from_slice(&4u64.to_be_bytes());
    request.push(0x01); // one character
    request.push(0xf8); // illegal sequence first byte
    write_frame(&mut raw, 1, OP_OPEN, &[]).await;
    write_frame(&mut raw, 1, OP_DATA, &request).await;

    // The server discards that channel but the session survives: a fresh
    // channel carries a well-formed lookup and gets a NOT_OK reply for the
    // unknown binding.
    let mut request = Vec::new();
    request.extend_from_slice(&0u64.to_be_bytes());
    request.extend_from_slice(&4u64.to_be_bytes());
    request.push(0x04); // four characters
    request.extend_from_slice(b"nope");
    write_frame(&mut raw, 3, OP_OPEN, &[]).await;
    write_frame(&mut raw, 3, OP_DATA, &request).await;

    let reply = tokio::time::timeout(Duration::from_secs(2), read_data_for(&mut raw, 3))
        .await
        .expect("no reply from server");
    assert_eq!(reply[0], 3, "expected a NOT_OK status byte");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn test_unknown_method_ordinal_replies_not_ok() {
    init_logging();
    let (mut raw, server_side) = tokio::io::duplex(64 * 1024);
    let server = Session::accept(server_side, Arc::new(BasicCodec), SessionConfig::default())
        .await
        .unwrap();

    // Bootstrap object, but a method identifier it never declared.
    let mut request = Vec::new();
    request.extend_from_slice(&0u64.to_be_bytes());
    request.extend_from_slice(&0xdeadu64.to_be_bytes());
    write_frame(&mut raw, 1, OP_OPEN, &[]).await;
    write_frame(&mut raw, 1, OP_DATA, &request).await;

    let reply = tokio::time::timeout(Duration::from_secs(2), read_data_for(&mut raw, 1))
        .await
        .expect("no reply from server");
    assert_eq!(reply[0], 3, "expected a NOT_OK status byte");
    assert!(!server.is_closed());
}
