//! Reopen wrapper integration: the child cycles with backoff, the
//! wrapper stays up.

mod common;

use std::time::{Duration, Instant};

use common::*;
use commlink::prelude::*;

#[test]
fn wrapper_survives_unreachable_peer() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // Nothing ever listens here.
    let sock = dir.path().join("nowhere.sock");
    let ctx = Context::new();

    let wrapper = ctx
        .channel(&format!(
            "reopen+tcp://{};mode=client;name=re;reopen-timeout-min=20ms;reopen-timeout-max=100ms",
            sock.display()
        ))
        .unwrap();
    let child = wrapper.children().remove(0);
    assert_eq!(child.name(), "re/reopen");

    let child_states = Accum::new();
    child_states.subscribe(&child, MsgMask::STATE);

    wrapper.open("").unwrap();
    // The wrapper comes up even though the first connect already failed.
    assert_eq!(wrapper.state(), State::Active);
    assert_eq!(child.state(), State::Error);

    // Let a few backoff cycles run.
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(300) {
        let _ = wrapper.process(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(wrapper.state(), State::Active);
    let states: Vec<State> = child_states
        .snapshot()
        .iter()
        .filter_map(|m| State::from_msgid(m.msgid))
        .collect();
    // First attempt, then at least two retries through the reset cycle.
    let errors = states.iter().filter(|s| **s == State::Error).count();
    assert!(errors >= 3, "expected repeated retries, saw {states:?}");
    let resets = states
        .windows(3)
        .filter(|w| *w == [State::Closed, State::Opening, State::Error])
        .count();
    assert!(resets >= 2, "expected reopen cycles, saw {states:?}");

    // Backoff spaces the retries out: with min=20ms and doubling, 300ms
    // fits only a handful of attempts.
    assert!(errors <= 6, "backoff not applied, saw {errors} attempts");

    wrapper.close().unwrap();
    assert_eq!(wrapper.state(), State::Closed);
    assert_eq!(child.state(), State::Closed);
    wrapper.free();
}

#[test]
fn wrapper_reconnects_when_peer_appears() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("late.sock");
    let ctx = Context::new();

    let wrapper = ctx
        .channel(&format!(
            "reopen+tcp://{};mode=client;name=late;reopen-timeout-min=10ms;reopen-timeout-max=50ms",
            sock.display()
        ))
        .unwrap();
    let child = wrapper.children().remove(0);

    wrapper.open("").unwrap();
    assert_eq!(child.state(), State::Error);

    // The peer shows up late; the next retry connects.
    let server = ctx
        .channel(&format!("tcp://{};mode=server;name=server", sock.display()))
        .unwrap();
    server.open("").unwrap();

    let mut lp = EventLoop::new().unwrap();
    lp.add(&server).unwrap();
    lp.add(&wrapper).unwrap();
    drive_until(&mut lp, Duration::from_secs(5), "child to connect", || {
        child.state() == State::Active
    });
    assert_eq!(wrapper.state(), State::Active);
    // A connected child disarms the retry timer.
    assert!(!wrapper.dcaps().contains(DCaps::PROCESS));

    wrapper.free();
    server.free();
}
