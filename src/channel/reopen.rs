//! The `reopen+` prefix: keeps a flaky child alive.
//!
//! Wraps any channel and reopens it whenever it fails or closes, with
//! exponential backoff between `reopen-timeout-min` (default 1s) and
//! `reopen-timeout-max` (default 30s). The wrapper itself turns Active
//! right after open and stays there while the child cycles through
//! `Opening -> Error -> Closed -> Opening`; a child that reaches Active
//! resets the backoff.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::channel::base::{Base, Impl, ProcessPolicy};
use crate::channel::prefix::{Prefix, PrefixImpl};
use crate::channel::{Channel, DCaps, State};
use crate::error::{Error, Result};
use crate::url::Url;

const DEFAULT_MIN: Duration = Duration::from_secs(1);
const DEFAULT_MAX: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Reopen {
    timeout_min: Duration,
    timeout_max: Duration,
    next_timeout: Duration,
    deadline: Option<Instant>,
    open_params: String,
}

impl Reopen {
    // Arms the retry timer and asks the loop to keep processing us.
    fn schedule(&mut self, base: &Base) {
        let delay = self.next_timeout;
        self.next_timeout = (delay * 2).min(self.timeout_max);
        self.deadline = Some(Instant::now() + delay);
        debug!(channel = %base.name(), "Reopen in {:?}", delay);
        base.dcaps_update(DCaps::PROCESS, DCaps::empty());
    }

    fn disarm(&mut self, base: &Base) {
        self.deadline = None;
        self.next_timeout = self.timeout_min;
        base.dcaps_update(DCaps::empty(), DCaps::PROCESS);
    }

    fn try_open(&mut self, base: &Base, child: &Channel) {
        debug!(channel = %base.name(), "Reopening child '{}'", child.name());
        match child.open(&self.open_params) {
            Ok(()) => match child.state() {
                State::Error => self.schedule(base),
                State::Active => self.disarm(base),
                // Still Opening: wait for the child's own transition.
                _ => self.deadline = None,
            },
            Err(_) => self.schedule(base),
        }
    }
}

impl PrefixImpl for Reopen {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Custom
    }

    fn on_init(&mut self, curl: &mut Url, url: &Url, _master: Option<&Channel>) -> Result<()> {
        self.timeout_min = url.get_duration("reopen-timeout-min", DEFAULT_MIN)?;
        self.timeout_max = url.get_duration("reopen-timeout-max", DEFAULT_MAX)?;
        if self.timeout_max < self.timeout_min {
            return Err(Error::invalid_arg(
                "reopen-timeout-max is smaller than reopen-timeout-min",
            ));
        }
        self.next_timeout = self.timeout_min;
        for key in ["reopen-timeout-min", "reopen-timeout-max"] {
            curl.unset(key);
        }
        Ok(())
    }

    fn on_open(&mut self, base: &Base, params: &Url, child: &Channel) -> Result<()> {
        self.open_params = params.params_string();
        self.next_timeout = self.timeout_min;
        self.deadline = None;
        // The wrapper is usable as soon as the cycle starts; child
        // failures never propagate to it. A failed first attempt leaves
        // the child in Error state and the state sync schedules the retry.
        base.set_state(State::Active);
        let _ = child.open(&self.open_params);
        Ok(())
    }

    fn on_close(&mut self, base: &Base, force: bool, child: &Channel) -> Result<()> {
        self.disarm(base);
        child.close_force(force)
    }

    fn on_process(&mut self, base: &Base, _timeout: Duration, child: &Channel) -> Result<()> {
        if base.state() != State::Active {
            return Err(Error::Again);
        }
        let Some(deadline) = self.deadline else {
            return Err(Error::Again);
        };
        if Instant::now() < deadline {
            return Err(Error::Again);
        }
        self.try_open(base, child);
        Ok(())
    }

    fn on_active(&mut self, base: &Base, child: &Channel) -> Result<()> {
        info!(channel = %base.name(), "Child '{}' is up", child.name());
        self.disarm(base);
        base.set_state(State::Active);
        Ok(())
    }

    fn on_error(&mut self, base: &Base, _child: &Channel) -> Result<()> {
        if base.state() == State::Active {
            self.schedule(base);
        }
        Ok(())
    }

    fn on_closing(&mut self, _base: &Base) -> Result<()> {
        Ok(())
    }

    fn on_closed(&mut self, base: &Base) -> Result<()> {
        match base.state() {
            State::Closing => base.closed(),
            // Unrequested close of the child: bring it back.
            State::Active if self.deadline.is_none() => self.schedule(base),
            _ => {}
        }
        Ok(())
    }
}

/// Descriptor for the `reopen+` prefix kind.
pub static REOPEN_IMPL: Impl = Impl {
    protocol: "reopen+",
    new: || Box::new(Prefix::<Reopen>::default()),
};
