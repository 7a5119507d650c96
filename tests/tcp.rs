//! TCP server/client integration, driven by the event loop.
//!
//! Run with `TEST_LOG=2 cargo test --test tcp -- --nocapture` to see the
//! tracing output.

mod common;

use std::time::Duration;

use common::*;
use commlink::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn server_routes_replies_by_addr() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("pair.sock");
    let ctx = Context::new();

    let server = ctx
        .channel(&format!("tcp://{};mode=server;name=server", sock.display()))
        .unwrap();
    let c0 = ctx
        .channel(&format!("tcp://{};mode=client;name=c0", sock.display()))
        .unwrap();
    let c1 = ctx
        .channel(&format!("tcp://{};mode=client;name=c1", sock.display()))
        .unwrap();

    let on_server = Accum::new();
    let on_c0 = Accum::new();
    let on_c1 = Accum::new();
    on_server.subscribe(&server, MsgMask::DATA);
    on_c0.subscribe(&c0, MsgMask::DATA);
    on_c1.subscribe(&c1, MsgMask::DATA);

    let mut lp = EventLoop::new().unwrap();
    lp.add(&server).unwrap();
    lp.add(&c0).unwrap();
    lp.add(&c1).unwrap();

    server.open("").unwrap();
    assert_eq!(server.state(), State::Active);
    assert!(server.children().is_empty());

    c0.open("").unwrap();
    c1.open("").unwrap();

    // Both clients connect and the server accepts one child socket each.
    drive_until(&mut lp, TIMEOUT, "clients to connect", || {
        c0.state() == State::Active
            && c1.state() == State::Active
            && server.children().len() == 2
    });

    // Client 0 posts three bytes; they surface on the server with the
    // peer's address attached.
    let mut msg = Message::data(b"xxx".as_slice());
    msg.seq = 1;
    c0.post(&msg).unwrap();

    drive_until(&mut lp, TIMEOUT, "data on server", || on_server.len() == 1);
    let inbound = on_server.take();
    assert_eq!(inbound[0].seq, 1);
    assert_eq!(inbound[0].data, b"xxx");
    let from = inbound[0].addr;

    // Replying to that address reaches client 0 only.
    let mut reply = Message::data(b"yyy".as_slice());
    reply.seq = 10;
    reply.addr = from;
    server.post(&reply).unwrap();

    drive_until(&mut lp, TIMEOUT, "reply on client 0", || on_c0.len() == 1);
    let got = on_c0.take();
    assert_eq!(got[0].seq, 10);
    assert_eq!(got[0].data, b"yyy");
    assert_eq!(on_c1.len(), 0);

    // A reply to a peer that never existed is an error.
    let mut stray = Message::data(b"z".as_slice());
    stray.addr = 999;
    assert!(matches!(
        server.post(&stray),
        Err(Error::NotFound { .. })
    ));

    // A disconnecting client takes its server-side socket with it.
    c0.close().unwrap();
    drive_until(&mut lp, TIMEOUT, "socket teardown", || {
        server.children().len() == 1
    });

    c1.free();
    c0.free();
    server.free();
    assert!(lp.channels().is_empty());
}

#[test]
fn frames_survive_interleaved_delivery() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("burst.sock");
    // A small read buffer from the defaults store forces the sockets to
    // reassemble the burst across many short reads.
    let defaults = config::Config::builder()
        .set_default("max_read_size", 64)
        .unwrap()
        .build()
        .unwrap();
    let ctx = Context::with_defaults(defaults);

    let server = ctx
        .channel(&format!("tcp://{};mode=server;name=server", sock.display()))
        .unwrap();
    let client = ctx
        .channel(&format!("tcp://{};mode=client;name=client", sock.display()))
        .unwrap();
    let on_server = Accum::new();
    on_server.subscribe(&server, MsgMask::DATA);

    let mut lp = EventLoop::new().unwrap();
    lp.add(&server).unwrap();
    lp.add(&client).unwrap();

    server.open("").unwrap();
    client.open("").unwrap();
    drive_until(&mut lp, TIMEOUT, "client to connect", || {
        client.state() == State::Active && server.children().len() == 1
    });

    // A burst of back-to-back frames arrives as distinct messages with
    // payloads and sequence numbers intact.
    for seq in 0..50i64 {
        let mut msg = Message::data(format!("payload-{seq}").into_bytes());
        msg.seq = seq;
        client.post(&msg).unwrap();
    }
    drive_until(&mut lp, TIMEOUT, "burst on server", || on_server.len() == 50);
    for (seq, msg) in on_server.take().iter().enumerate() {
        assert_eq!(msg.seq, seq as i64);
        assert_eq!(msg.data, format!("payload-{seq}").into_bytes());
    }

    client.free();
    server.free();
}
