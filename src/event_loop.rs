//! Poll-driven channel scheduler.
//!
//! An [`EventLoop`] owns a set of channels and advances them in two ways:
//! channels whose dcaps request processing are stepped on every
//! [`EventLoop::process`] call, and channels with a pollable fd are
//! returned from [`EventLoop::poll`] when the OS reports readiness. An
//! internal waker keeps the loop from sleeping while any channel reports
//! pending work.
//!
//! The loop subscribes to every added channel's STATE and CHANNEL
//! messages and reconciles itself: new children are adopted, closed
//! channels leave the poll set, dcaps changes reprogram interests and
//! membership in the work lists.
//!
//! Scheduling is single-threaded and cooperative: all impl methods of the
//! loop's channels run on the thread calling `poll`/`process`, and `poll`
//! is the only blocking point.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::channel::{Callback, Channel, DCaps, State};
use crate::error::{Error, Result};
use crate::msg::{ChannelEvent, Message, MsgMask, MsgType};

const WAKE_TOKEN: Token = Token(usize::MAX);

// Maps poll dcaps to mio interests; a suspended channel (or one with no
// poll bits) stays out of the poll set entirely.
fn interests(dcaps: DCaps) -> Option<Interest> {
    if dcaps.contains(DCaps::SUSPEND) {
        return None;
    }
    match (
        dcaps.contains(DCaps::POLL_IN),
        dcaps.contains(DCaps::POLL_OUT),
    ) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

// Channel list with tombstoned removal: deleting during an iteration in
// progress leaves a hole instead of shifting indices; trailing holes are
// reclaimed.
#[derive(Default)]
struct SlotList {
    slots: Vec<Option<Channel>>,
    len: usize,
}

impl SlotList {
    fn add(&mut self, c: &Channel) {
        for slot in &mut self.slots[..self.len] {
            if slot.is_none() {
                *slot = Some(c.clone());
                return;
            }
        }
        if self.len < self.slots.len() {
            self.slots[self.len] = Some(c.clone());
        } else {
            self.slots.push(Some(c.clone()));
        }
        self.len += 1;
    }

    fn del(&mut self, c: &Channel) {
        for slot in &mut self.slots[..self.len] {
            if slot.as_ref() == Some(c) {
                *slot = None;
                break;
            }
        }
        while self.len > 0 && self.slots[self.len - 1].is_none() {
            self.len -= 1;
        }
    }

    fn get(&self, index: usize) -> Option<Channel> {
        self.slots.get(index)?.clone()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct FdEntry {
    channel: Channel,
    fd: RawFd,
}

#[derive(Default)]
struct LoopInner {
    channels: Vec<Channel>,
    process: SlotList,
    pending: SlotList,
    fds: Vec<Option<FdEntry>>,
    cb: Option<Callback>,
}

struct LoopShared {
    registry: mio::Registry,
    waker: Waker,
    inner: Mutex<LoopInner>,
}

/// The poll-driven scheduler.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(LoopShared {
            registry,
            waker,
            inner: Mutex::new(LoopInner::default()),
        });
        let weak: Weak<LoopShared> = Arc::downgrade(&shared);
        let cb = Callback::new(move |c: &Channel, msg: &Message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(c, msg);
            }
            0
        });
        shared.inner.lock().expect("loop inner poisoned").cb = Some(cb);
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(16),
            shared,
        })
    }

    /// Adds a channel (and, recursively, its current children): subscribes
    /// to its updates, places it in the work lists per its dcaps and
    /// registers its fd.
    pub fn add(&self, channel: &Channel) -> Result<()> {
        self.shared.add(channel)
    }

    /// Removes a channel from all lists and the poll set.
    pub fn del(&self, channel: &Channel) {
        self.shared.del(channel)
    }

    /// Blocks up to `timeout` and returns a channel whose fd became
    /// ready, if any. Pending channels are advanced internally when the
    /// waker fires.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Channel>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut ready = None;
        let mut woken = false;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
            } else if ready.is_none() {
                let inner = self.shared.lock();
                if let Some(Some(entry)) = inner.fds.get(event.token().0) {
                    trace!("Poll on {}", entry.channel.name());
                    ready = Some(entry.channel.clone());
                }
            }
        }
        if woken {
            debug!("Poll woken for pending channels");
            self.shared.run_list(true);
            // The wake fd is edge-like; re-arm while pending work remains
            // so the next poll does not sleep through it.
            if !self.shared.lock().pending.is_empty() {
                let _ = self.shared.waker.wake();
            }
        }
        Ok(ready)
    }

    /// Advances every processing and pending channel once. Returns
    /// [`Error::Again`] iff every channel reported Again, meaning the
    /// caller can sleep in [`EventLoop::poll`].
    pub fn process(&self) -> Result<()> {
        let mut busy = self.shared.run_list(false);
        busy |= self.shared.run_list(true);
        if busy {
            Ok(())
        } else {
            Err(Error::Again)
        }
    }

    /// Channels currently owned by the loop.
    pub fn channels(&self) -> Vec<Channel> {
        self.shared.lock().channels.clone()
    }
}

impl LoopShared {
    fn lock(&self) -> MutexGuard<'_, LoopInner> {
        self.inner.lock().expect("loop inner poisoned")
    }

    fn callback(&self) -> Callback {
        self.lock().cb.clone().expect("loop callback initialized in new")
    }

    fn add(&self, c: &Channel) -> Result<()> {
        {
            let inner = self.lock();
            if inner.channels.iter().any(|x| x == c) {
                return Ok(());
            }
        }
        info!("Add channel {} with fd {}", c.name(), c.fd());
        c.callback_add(&self.callback(), MsgMask::STATE | MsgMask::CHANNEL)?;
        let dcaps = c.dcaps();
        let mut wake = false;
        {
            let mut inner = self.lock();
            inner.channels.push(c.clone());
            if dcaps.contains(DCaps::PROCESS) {
                inner.process.add(c);
            }
            if dcaps.contains(DCaps::PENDING) {
                wake = inner.pending.is_empty();
                inner.pending.add(c);
            }
        }
        if wake {
            let _ = self.waker.wake();
        }
        self.update_registration(c);
        for child in c.children() {
            self.add(&child)?;
        }
        Ok(())
    }

    fn del(&self, c: &Channel) {
        info!("Delete channel {}", c.name());
        let _ = c.callback_del(&self.callback(), MsgMask::ALL);
        let slot = {
            let mut inner = self.lock();
            inner.channels.retain(|x| x != c);
            inner.process.del(c);
            inner.pending.del(c);
            inner
                .fds
                .iter()
                .position(|e| e.as_ref().map(|e| e.channel == *c).unwrap_or(false))
                .map(|i| (i, inner.fds[i].take().expect("position matched")))
        };
        if let Some((_, entry)) = slot {
            let _ = self.registry.deregister(&mut SourceFd(&entry.fd));
        }
    }

    // Brings the poll registration in line with the channel's fd and
    // dcaps; handles register, reregister, fd swap and deregister.
    fn update_registration(&self, c: &Channel) {
        let fd = c.fd();
        let desired = if fd < 0 { None } else { interests(c.dcaps()) };
        let mut inner = self.lock();
        let slot = inner
            .fds
            .iter()
            .position(|e| e.as_ref().map(|e| e.channel == *c).unwrap_or(false));
        let result = match (slot, desired) {
            (Some(i), None) => {
                let entry = inner.fds[i].take().expect("position matched");
                self.registry.deregister(&mut SourceFd(&entry.fd))
            }
            (Some(i), Some(interest)) => {
                let entry = inner.fds[i].as_mut().expect("position matched");
                if entry.fd != fd {
                    let old = entry.fd;
                    let _ = self.registry.deregister(&mut SourceFd(&old));
                    entry.fd = fd;
                    self.registry.register(&mut SourceFd(&fd), Token(i), interest)
                } else {
                    self.registry.reregister(&mut SourceFd(&fd), Token(i), interest)
                }
            }
            (None, Some(interest)) => {
                let i = match inner.fds.iter().position(|e| e.is_none()) {
                    Some(i) => i,
                    None => {
                        inner.fds.push(None);
                        inner.fds.len() - 1
                    }
                };
                match self.registry.register(&mut SourceFd(&fd), Token(i), interest) {
                    Ok(()) => {
                        inner.fds[i] = Some(FdEntry {
                            channel: c.clone(),
                            fd,
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to update poll registration for {}: {e}", c.name());
        }
    }

    fn poll_del(&self, c: &Channel) {
        let entry = {
            let mut inner = self.lock();
            inner
                .fds
                .iter()
                .position(|e| e.as_ref().map(|e| e.channel == *c).unwrap_or(false))
                .map(|i| inner.fds[i].take().expect("position matched"))
        };
        if let Some(entry) = entry {
            let _ = self.registry.deregister(&mut SourceFd(&entry.fd));
        }
    }

    // One pass over a work list. Iterates against a captured length and
    // re-checks liveness per slot, so channels may be added or deleted
    // from inside the process calls. Returns true if any channel did work.
    fn run_list(&self, pending: bool) -> bool {
        let len = {
            let inner = self.lock();
            if pending {
                inner.pending.len()
            } else {
                inner.process.len()
            }
        };
        let mut busy = false;
        for i in 0..len {
            let channel = {
                let inner = self.lock();
                if pending {
                    inner.pending.get(i)
                } else {
                    inner.process.get(i)
                }
            };
            let Some(channel) = channel else { continue };
            match channel.process(Duration::ZERO) {
                Ok(()) => busy = true,
                Err(e) if e.is_again() => {}
                Err(e) => {
                    // The channel moved itself to Error and left the poll
                    // set; the owner decides whether to close or reopen.
                    warn!("Process failed on {}: {e}", channel.name());
                    busy = true;
                }
            }
        }
        busy
    }

    fn update_dcaps(&self, c: &Channel, old: DCaps) {
        let dcaps = c.dcaps();
        let delta = dcaps ^ old;
        trace!(
            "Update caps {}: {:?} -> {:?} (delta {:?})",
            c.name(),
            old,
            dcaps,
            delta
        );
        if delta.intersects(DCaps::POLL_MASK | DCaps::SUSPEND) {
            self.update_registration(c);
        }
        if delta.contains(DCaps::PROCESS) {
            let mut inner = self.lock();
            if dcaps.contains(DCaps::PROCESS) {
                inner.process.add(c);
            } else {
                inner.process.del(c);
            }
        }
        if delta.contains(DCaps::PENDING) {
            let wake = {
                let mut inner = self.lock();
                if dcaps.contains(DCaps::PENDING) {
                    let was_empty = inner.pending.is_empty();
                    inner.pending.add(c);
                    was_empty
                } else {
                    inner.pending.del(c);
                    false
                }
            };
            if wake {
                let _ = self.waker.wake();
            }
        }
    }

    fn on_message(&self, c: &Channel, msg: &Message) {
        match msg.msg_type {
            MsgType::State => match State::from_msgid(msg.msgid) {
                Some(State::Active) => self.update_registration(c),
                Some(State::Closing) => self.poll_del(c),
                Some(State::Destroy) => self.del(c),
                _ => {}
            },
            MsgType::Channel => match ChannelEvent::from_msgid(msg.msgid) {
                Some(ChannelEvent::Add) => {
                    if let Some(child) = &msg.channel {
                        if let Err(e) = self.add(child) {
                            warn!("Failed to adopt child {}: {e}", child.name());
                        }
                    }
                }
                Some(ChannelEvent::Delete) => {
                    if let Some(child) = &msg.channel {
                        self.del(child);
                    }
                }
                Some(ChannelEvent::Update) => {
                    let old = msg
                        .old_value()
                        .map(|v| DCaps::from_bits_truncate(v as u32))
                        .unwrap_or_else(DCaps::empty);
                    self.update_dcaps(c, old);
                }
                Some(ChannelEvent::UpdateFd) => self.update_registration(c),
                None => {}
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Base, ChannelImpl, Impl, ProcessPolicy};
    use crate::context::Context;
    use crate::msg::Message;

    // Emits one DATA message per process call, forever.
    #[derive(Default)]
    struct Tick;

    impl ChannelImpl for Tick {
        fn process_policy(&self) -> ProcessPolicy {
            ProcessPolicy::Normal
        }

        fn process(&mut self, base: &Base, _timeout: Duration) -> Result<()> {
            base.callback_data(&Message::data(b"tick".as_slice()));
            Ok(())
        }

        fn post(&mut self, _base: &Base, _msg: &Message) -> Result<()> {
            Ok(())
        }
    }

    static TICK_IMPL: Impl = Impl {
        protocol: "tick",
        new: || Box::new(Tick),
    };

    #[test]
    fn process_list_follows_dcaps() {
        let ctx = Context::new();
        ctx.register(&TICK_IMPL).unwrap();
        let c = ctx.channel("tick://;name=t").unwrap();
        let lp = EventLoop::new().unwrap();
        lp.add(&c).unwrap();

        // Closed channel has no Process dcap yet.
        assert!(lp.process().unwrap_err().is_again());

        c.open("").unwrap();
        assert!(lp.process().is_ok());

        c.close().unwrap();
        assert!(lp.process().unwrap_err().is_again());
        c.free();
        assert!(lp.channels().is_empty());
    }

    #[test]
    fn slot_list_tombstones() {
        let ctx = Context::new();
        let a = ctx.channel("null://;name=a").unwrap();
        let b = ctx.channel("null://;name=b").unwrap();
        let mut list = SlotList::default();
        list.add(&a);
        list.add(&b);
        assert_eq!(list.len(), 2);
        list.del(&a);
        // Hole is kept while a later entry exists.
        assert_eq!(list.len(), 2);
        assert!(list.get(0).is_none());
        list.del(&b);
        assert_eq!(list.len(), 0);
        a.free();
        b.free();
    }
}
