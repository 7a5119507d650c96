//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use commlink::channel::NULL_IMPL;
use commlink::prelude::*;

static INIT: Once = Once::new();

/// Initialize tracing based on the TEST_LOG environment variable.
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test echo -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("commlink={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Echo Fixture
// ============================================================================

/// Test channel: posts loop straight back to the data callbacks. Manual
/// open and Long close so the state machine is observable step by step;
/// `null=yes` in the URL hands the channel over to the null impl.
#[derive(Default)]
pub struct Echo;

impl ChannelImpl for Echo {
    fn open_policy(&self) -> OpenPolicy {
        OpenPolicy::Manual
    }

    fn close_policy(&self) -> ClosePolicy {
        ClosePolicy::Long
    }

    fn init(
        &mut self,
        _base: &Base,
        url: &Url,
        _master: Option<&Channel>,
    ) -> Result<InitAction, Error> {
        if url.get_bool("null", false)? {
            return Ok(InitAction::Replace(&NULL_IMPL));
        }
        Ok(InitAction::Ok)
    }

    fn process(&mut self, base: &Base, _timeout: Duration) -> Result<(), Error> {
        match base.state() {
            State::Opening => {
                base.set_state(State::Active);
                Ok(())
            }
            State::Closing => {
                base.closed();
                Ok(())
            }
            _ => Err(Error::Again),
        }
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<(), Error> {
        base.callback_data(msg);
        Ok(())
    }
}

pub static ECHO_IMPL: Impl = Impl {
    protocol: "echo",
    new: || Box::new(Echo),
};

// ============================================================================
// Message Accumulator
// ============================================================================

/// Collects every message delivered to a subscription.
#[derive(Clone)]
pub struct Accum {
    msgs: Arc<Mutex<Vec<Message>>>,
    cb: Callback,
}

impl Accum {
    pub fn new() -> Self {
        let msgs: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = msgs.clone();
        let cb = Callback::new(move |_c: &Channel, msg: &Message| {
            sink.lock().unwrap().push(msg.clone());
            0
        });
        Accum { msgs, cb }
    }

    pub fn subscribe(&self, channel: &Channel, mask: MsgMask) {
        channel.callback_add(&self.cb, mask).unwrap();
    }

    pub fn callback(&self) -> &Callback {
        &self.cb
    }

    pub fn len(&self) -> usize {
        self.msgs.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.msgs.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.msgs.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.msgs.lock().unwrap().clear();
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Processes a channel until it stops returning Again or the timeout
/// expires. Mirrors busy-waiting on a non-blocking endpoint.
pub fn poll_for(channel: &Channel, timeout: Duration) -> Result<(), Error> {
    let start = Instant::now();
    loop {
        match channel.process(Duration::ZERO) {
            Err(e) if e.is_again() => {}
            r => return r,
        }
        if start.elapsed() > timeout {
            return Err(Error::Timeout);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Drives an event loop until the predicate holds. Panics on timeout.
pub fn drive_until<F: FnMut() -> bool>(
    lp: &mut EventLoop,
    timeout: Duration,
    what: &str,
    mut pred: F,
) {
    let start = Instant::now();
    loop {
        if pred() {
            return;
        }
        assert!(start.elapsed() < timeout, "timed out waiting for {what}");
        if let Some(channel) = lp.poll(Duration::from_millis(5)).unwrap() {
            let _ = channel.process(Duration::ZERO);
        }
        let _ = lp.process();
    }
}
