//! Channels: named communication endpoints with a shared life-cycle.
//!
//! A channel is produced by a [`Context`](crate::Context) from a URL, moves
//! through the state machine `Closed -> Opening -> Active -> Closing ->
//! Closed` (with `Error` reachable from any non-terminal state and
//! `Destroy` as the terminal event) and delivers messages to subscribers
//! through a mask-filtered callback plane.
//!
//! The concrete behaviour of a channel is supplied by a [`ChannelImpl`]
//! selected through the context registry; this module owns everything the
//! impls share: state transitions, capability bits, the callback tables,
//! children, suspension and the dispatch glue around the impl methods.

pub mod base;
mod direct;
mod null;
pub mod prefix;
mod reopen;
mod tcp;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, error, info, trace};

use crate::config::ConfigTree;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::msg::{ChannelEvent, Message, MsgMask, MsgType};
use crate::scheme::Scheme;
use crate::stat::Stat;
use crate::url::Url;

pub use base::{Base, ChannelImpl, ChildPolicy, ClosePolicy, Impl, InitAction, OpenPolicy, ProcessPolicy};
pub use direct::DIRECT_IMPL;
pub use null::NULL_IMPL;
pub use prefix::{Prefix, PrefixImpl, PREFIX_IMPL};
pub use reopen::REOPEN_IMPL;
pub use tcp::TCP_IMPL;

/// Channel life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum State {
    /// Closed; changes to Opening or Destroy.
    Closed = 0,
    /// Opening; changes to Active or Error.
    Opening = 1,
    /// Active; changes to Closing or Error.
    Active = 2,
    /// Closing; changes to Closed or Error.
    Closing = 3,
    /// Error; reset to Closed by the next open or close.
    Error = 4,
    /// Terminal state, emitted exactly once before the object is reclaimed.
    Destroy = 5,
}

impl State {
    /// Stable string form, published to the channel's config subtree.
    pub fn name(self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::Opening => "Opening",
            State::Active => "Active",
            State::Closing => "Closing",
            State::Error => "Error",
            State::Destroy => "Destroy",
        }
    }

    /// Maps a STATE message id back to the state.
    pub fn from_msgid(msgid: i32) -> Option<State> {
        match msgid {
            0 => Some(State::Closed),
            1 => Some(State::Opening),
            2 => Some(State::Active),
            3 => Some(State::Closing),
            4 => Some(State::Error),
            5 => Some(State::Destroy),
            _ => None,
        }
    }
}

bitflags! {
    /// Static capabilities, fixed at initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        /// Channel receives data.
        const INPUT = 0x4;
        /// Channel sends data.
        const OUTPUT = 0x8;
        /// Both directions.
        const INOUT = Self::INPUT.bits() | Self::OUTPUT.bits();
        /// Channel has a single representative child.
        const PROXY = 0x10;
        /// Internal channel: not indexed by name, config not published.
        const CUSTOM = 0x20;
    }
}

bitflags! {
    /// Dynamic capabilities; drive the event loop's treatment of a channel
    /// and may change at any time. Every change is announced through a
    /// CHANNEL/Update message carrying the previous bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DCaps: u32 {
        /// Poll the fd for incoming data.
        const POLL_IN = 0x1;
        /// Poll the fd for write readiness.
        const POLL_OUT = 0x2;
        /// Mask of both poll bits.
        const POLL_MASK = 0x3;
        /// Call process for this channel.
        const PROCESS = 0x10;
        /// Pending data: process without waiting for the fd.
        const PENDING = 0x20;
        /// Channel is suspended (possibly inherited from a parent).
        const SUSPEND = 0x40;
        /// Channel is suspended explicitly; survives a parent resume.
        const SUSPEND_PERMANENT = 0x80;
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// A message callback: a shareable closure invoked synchronously for every
/// matching message. The return value is advisory and does not abort the
/// fan-out.
///
/// Identity for [`Channel::callback_add`] / [`Channel::callback_del`] is
/// the allocation: clone the same `Callback` to update or remove an
/// existing subscription.
#[derive(Clone)]
pub struct Callback {
    func: Arc<dyn Fn(&Channel, &Message) -> i32 + Send + Sync>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Channel, &Message) -> i32 + Send + Sync + 'static,
    {
        Callback { func: Arc::new(f) }
    }

    fn same(a: &Callback, b: &Callback) -> bool {
        Arc::ptr_eq(&a.func, &b.func)
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.func))
    }
}

struct CallbackEntry {
    cb: Option<Callback>,
    mask: MsgMask,
}

// One callback table. Deleted entries become tombstones so that a fan-out
// in progress never sees indices shift; trailing tombstones are compacted.
#[derive(Default)]
struct CallbackList {
    entries: Vec<CallbackEntry>,
}

impl CallbackList {
    fn add(&mut self, cb: &Callback, mask: MsgMask) {
        let mut empty = None;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            match &entry.cb {
                Some(existing) if Callback::same(existing, cb) => {
                    entry.mask |= mask;
                    return;
                }
                None if empty.is_none() => empty = Some(i),
                _ => {}
            }
        }
        let entry = CallbackEntry {
            cb: Some(cb.clone()),
            mask,
        };
        match empty {
            Some(i) => self.entries[i] = entry,
            None => self.entries.push(entry),
        }
    }

    fn del(&mut self, cb: &Callback, mask: MsgMask) -> bool {
        for entry in self.entries.iter_mut() {
            let Some(existing) = &entry.cb else { continue };
            if !Callback::same(existing, cb) {
                continue;
            }
            entry.mask -= mask;
            if entry.mask.is_empty() {
                entry.cb = None;
                self.shrink();
            }
            return true;
        }
        false
    }

    fn shrink(&mut self) {
        while matches!(self.entries.last(), Some(CallbackEntry { cb: None, .. })) {
            self.entries.pop();
        }
    }

    fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.cb.is_some()).count()
    }
}

// ============================================================================
// Internal Block
// ============================================================================

struct Child {
    channel: Channel,
    #[allow(dead_code)]
    tag: String,
}

// Per-channel state shared between the dispatch glue and the impl, guarded
// by one mutex that is never held across callback invocations.
struct Internal {
    name: String,
    caps: Caps,
    dcaps: DCaps,
    state: State,
    fd: RawFd,
    config: ConfigTree,
    children: Vec<Child>,
    cb: CallbackList,
    cb_data: CallbackList,
    stat: Option<Arc<Stat>>,
    dump: bool,
}

impl Internal {
    fn new() -> Self {
        Internal {
            name: String::new(),
            caps: Caps::empty(),
            dcaps: DCaps::empty(),
            state: State::Closed,
            fd: -1,
            config: ConfigTree::new(),
            children: Vec::new(),
            cb: CallbackList::default(),
            cb_data: CallbackList::default(),
            stat: None,
            dump: false,
        }
    }
}

pub(crate) struct Shared {
    context: Context,
    imp_desc: RwLock<&'static Impl>,
    imp: Mutex<Option<Box<dyn ChannelImpl>>>,
    internal: Mutex<Internal>,
    dead: AtomicBool,
}

// ============================================================================
// Channel Handle
// ============================================================================

/// A handle to a channel.
///
/// Handles are cheap to clone and all refer to the same endpoint; the
/// callback plane hands `&Channel` to subscribers. A channel is reclaimed
/// by [`Channel::free`], which emits the one-shot `Destroy` state, frees
/// the children and turns surviving handles inert.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

/// A non-owning channel reference.
#[derive(Clone)]
pub struct WeakChannel {
    shared: Weak<Shared>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.shared.upgrade().map(|shared| Channel { shared })
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("proto", &self.channel_impl().protocol)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    // ========================================================================
    // Accessors
    // ========================================================================

    /// The channel name, unique within its context unless the channel was
    /// created with `tll.internal=yes`.
    pub fn name(&self) -> String {
        self.internal().name.clone()
    }

    /// Current life-cycle state.
    pub fn state(&self) -> State {
        self.internal().state
    }

    /// Static capabilities.
    pub fn caps(&self) -> Caps {
        self.internal().caps
    }

    /// Dynamic capabilities.
    pub fn dcaps(&self) -> DCaps {
        self.internal().dcaps
    }

    /// The pollable file descriptor, or -1 if the channel has none.
    pub fn fd(&self) -> RawFd {
        self.internal().fd
    }

    /// The live config subtree (at least `state` and the effective `url`).
    pub fn config(&self) -> ConfigTree {
        self.internal().config.clone()
    }

    /// The owning context.
    pub fn context(&self) -> Context {
        self.shared.context.clone()
    }

    /// The stat block, when the channel was created with `stat=yes`.
    pub fn stat(&self) -> Option<Arc<Stat>> {
        self.internal().stat.clone()
    }

    /// Child channels, in insertion order.
    pub fn children(&self) -> Vec<Channel> {
        self.internal()
            .children
            .iter()
            .map(|c| c.channel.clone())
            .collect()
    }

    /// The impl descriptor this channel ended up with (after any init-time
    /// replacement).
    pub fn channel_impl(&self) -> &'static Impl {
        *self.shared.imp_desc.read().expect("impl descriptor poisoned")
    }

    /// Downgrades to a non-owning reference.
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The channel's scheme for the given message type, if it has one.
    pub fn scheme(&self, msg_type: MsgType) -> Option<Arc<Scheme>> {
        if self.shared.dead.load(Ordering::Acquire) {
            return None;
        }
        let guard = self.shared.imp.try_lock().ok()?;
        guard.as_ref()?.scheme(&Base::new(self), msg_type)
    }

    // ========================================================================
    // Callback Plane
    // ========================================================================

    /// Subscribes `cb` for the message types in `mask`.
    ///
    /// Adding a callback that is already subscribed ORs the masks into the
    /// existing entry. The DATA bit is tracked in a separate table so the
    /// data hot path stays a tight array walk.
    pub fn callback_add(&self, cb: &Callback, mask: MsgMask) -> Result<()> {
        self.ensure_alive("callback_add")?;
        let mut g = self.internal();
        let mut mask = mask;
        if mask.contains(MsgMask::DATA) {
            g.cb_data.add(cb, MsgMask::DATA);
            mask -= MsgMask::DATA;
            if mask.is_empty() {
                return Ok(());
            }
        }
        g.cb.add(cb, mask);
        Ok(())
    }

    /// Clears `mask` bits from an existing subscription; the entry is
    /// removed once its mask becomes empty.
    pub fn callback_del(&self, cb: &Callback, mask: MsgMask) -> Result<()> {
        let mut g = self.internal();
        let mut mask = mask;
        let mut found = false;
        if mask.contains(MsgMask::DATA) {
            found |= g.cb_data.del(cb, MsgMask::DATA);
            mask -= MsgMask::DATA;
        }
        if !mask.is_empty() {
            found |= g.cb.del(cb, mask);
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound {
                kind: "callback",
                name: g.name.clone(),
            })
        }
    }

    // Synchronous fan-out. The table length is captured once; entries
    // removed by a callback during the fan-out are skipped via their
    // tombstone, entries added are not seen until the next emission.
    pub(crate) fn emit(&self, msg: &Message) {
        let is_data = msg.msg_type == MsgType::Data;
        let (len, dump, name) = {
            let g = self.internal();
            let list = if is_data { &g.cb_data } else { &g.cb };
            (list.entries.len(), g.dump, g.name.clone())
        };
        if dump {
            debug!(
                channel = %name,
                msg_type = ?msg.msg_type,
                msgid = msg.msgid,
                seq = msg.seq,
                size = msg.data.len(),
                "Message"
            );
        }
        let mask = msg.msg_type.mask();
        for i in 0..len {
            let cb = {
                let g = self.internal();
                let list = if is_data { &g.cb_data } else { &g.cb };
                list.entries.get(i).and_then(|entry| match &entry.cb {
                    Some(cb) if entry.mask.intersects(mask) => Some(cb.clone()),
                    _ => None,
                })
            };
            if let Some(cb) = cb {
                (cb.func)(self, msg);
            }
        }
    }

    // ========================================================================
    // Life-Cycle Operations
    // ========================================================================

    /// Opens the channel: `Closed -> Opening`, then `-> Active` either
    /// automatically (open policy Auto) or once the impl reports progress
    /// (Manual). `params` is a bare `k=v;k=v` string.
    ///
    /// Opening a channel in `Error` state implicitly resets it to `Closed`
    /// first.
    pub fn open(&self, params: &str) -> Result<()> {
        self.ensure_alive("open")?;
        let url = Url::parse_params(params)?;
        match self.state() {
            State::Closed => {}
            State::Error => {
                self.set_state(State::Closed);
            }
            s => return Err(Error::State { op: "open", state: s }),
        }
        let mut guard = self.try_imp()?;
        let Some(imp) = guard.as_mut() else {
            return Err(Error::State {
                op: "open",
                state: State::Destroy,
            });
        };
        self.set_state(State::Opening);
        match imp.process_policy() {
            ProcessPolicy::Normal | ProcessPolicy::Always => {
                self.dcaps_update(DCaps::PROCESS, DCaps::empty())
            }
            ProcessPolicy::Never | ProcessPolicy::Custom => {}
        }
        let open_policy = imp.open_policy();
        let result = imp.open(&Base::new(self), &url);
        drop(guard);
        if let Err(e) = result {
            let name = self.name();
            error!(channel = %name, "Failed to open: {e}");
            self.set_state(State::Error);
            return Err(Error::OpenFailed { name });
        }
        if matches!(open_policy, OpenPolicy::Auto) && self.state() == State::Opening {
            self.set_state(State::Active);
        }
        Ok(())
    }

    /// Closes the channel: `-> Closing`, then `-> Closed` immediately
    /// (close policy Normal) or once the impl finishes a graceful shutdown
    /// (Long). Closing an already closed channel is a no-op.
    pub fn close(&self) -> Result<()> {
        self.close_force(false)
    }

    /// Like [`Channel::close`]; with `force` set the transition to
    /// `Closed` completes synchronously even for Long-close impls.
    pub fn close_force(&self, force: bool) -> Result<()> {
        self.ensure_alive("close")?;
        match self.state() {
            State::Closed | State::Destroy => return Ok(()),
            State::Closing if !force => return Ok(()),
            _ => {}
        }
        let mut guard = self.try_imp()?;
        let Some(imp) = guard.as_mut() else {
            return Ok(());
        };
        self.set_state(State::Closing);
        let policy = imp.close_policy();
        let process_policy = imp.process_policy();
        let result = imp.close(&Base::new(self), force);
        drop(guard);
        if matches!(policy, ClosePolicy::Normal) || force {
            self.finish_close();
            if matches!(process_policy, ProcessPolicy::Always) {
                self.dcaps_update(DCaps::PROCESS, DCaps::empty());
            }
        }
        result.map_err(|_| Error::CloseFailed { name: self.name() })
    }

    /// Advances the channel once. Dispatches to the impl only if the
    /// Process dcap is set and the channel is not suspended; returns
    /// [`Error::Again`] otherwise, and whenever there was no work.
    pub fn process(&self, timeout: Duration) -> Result<()> {
        self.ensure_alive("process")?;
        {
            let g = self.internal();
            if !g.dcaps.contains(DCaps::PROCESS) || g.dcaps.contains(DCaps::SUSPEND) {
                return Err(Error::Again);
            }
        }
        let mut guard = self.try_imp()?;
        let Some(imp) = guard.as_mut() else {
            return Err(Error::Again);
        };
        match imp.process(&Base::new(self), timeout) {
            Err(e) if !e.is_again() => {
                error!(channel = %self.name(), "Process failed: {e}");
                drop(guard);
                self.set_state(State::Error);
                Err(e)
            }
            r => r,
        }
    }

    /// Posts a message. Successful DATA posts update the channel's tx
    /// stats; [`Error::Again`] signals transport backpressure and the
    /// caller should retry.
    pub fn post(&self, msg: &Message) -> Result<()> {
        self.ensure_alive("post")?;
        let mut guard = self.try_imp()?;
        let Some(imp) = guard.as_mut() else {
            return Err(Error::State {
                op: "post",
                state: State::Destroy,
            });
        };
        let result = imp.post(&Base::new(self), msg);
        drop(guard);
        match result {
            Ok(()) => {
                if msg.msg_type == MsgType::Data {
                    if let Some(stat) = self.stat() {
                        stat.update_tx(msg.data.len());
                    }
                }
                Ok(())
            }
            Err(e) => {
                // Transport failures break the channel; argument-level
                // errors (unknown addr, wrong state) only fail the call.
                if matches!(e, Error::Io(_)) {
                    error!(channel = %self.name(), "Post failed: {e}");
                    self.set_state(State::Error);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    /// Suspends the channel and all descendants: the event loop stops
    /// polling and processing them but their state is kept. The subject
    /// itself is marked permanently suspended, so a `resume` of a parent
    /// does not wake it.
    pub fn suspend(&self) {
        self.dcaps_update(DCaps::SUSPEND_PERMANENT | DCaps::SUSPEND, DCaps::empty());
        for child in self.children() {
            child.suspend_descendant();
        }
    }

    fn suspend_descendant(&self) {
        self.dcaps_update(DCaps::SUSPEND, DCaps::empty());
        for child in self.children() {
            child.suspend_descendant();
        }
    }

    /// Resumes the channel and descendants, except sub-trees whose root is
    /// itself permanently suspended.
    pub fn resume(&self) {
        self.dcaps_update(DCaps::empty(), DCaps::SUSPEND_PERMANENT);
        self.resume_descendant();
    }

    fn resume_descendant(&self) {
        if self.dcaps().contains(DCaps::SUSPEND_PERMANENT) {
            return;
        }
        self.dcaps_update(DCaps::empty(), DCaps::SUSPEND);
        for child in self.children() {
            child.resume_descendant();
        }
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroys the channel: force-closes it if needed, emits the one-shot
    /// `Destroy` state, runs the impl's free hook, frees all children
    /// depth-first and unregisters from the context. Idempotent; surviving
    /// handles stay safe but every operation on them fails.
    pub fn free(&self) {
        if self.shared.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let name = self.name();
        debug!(channel = %name, "Destroying channel");
        if self.state() != State::Closed {
            if let Ok(mut guard) = self.shared.imp.try_lock() {
                if let Some(imp) = guard.as_mut() {
                    self.set_state(State::Closing);
                    let _ = imp.close(&Base::new(self), true);
                    drop(guard);
                    self.finish_close();
                }
            }
        }
        self.set_state(State::Destroy);
        if let Ok(mut guard) = self.shared.imp.try_lock() {
            if let Some(mut imp) = guard.take() {
                imp.free(&Base::new(self));
            }
        }
        let children: Vec<Channel> = {
            let mut g = self.internal();
            g.children.drain(..).map(|c| c.channel).collect()
        };
        for child in children {
            child.free();
        }
        let stat = self.stat();
        let custom = self.caps().contains(Caps::CUSTOM);
        self.shared
            .context
            .channel_destroyed(&name, self, custom, stat);
        let mut g = self.internal();
        g.cb = CallbackList::default();
        g.cb_data = CallbackList::default();
    }

    // ========================================================================
    // Construction and Impl-Facing Glue
    // ========================================================================

    pub(crate) fn build(context: Context, imp: &'static Impl) -> Channel {
        Channel {
            shared: Arc::new(Shared {
                context,
                imp_desc: RwLock::new(imp),
                imp: Mutex::new(None),
                internal: Mutex::new(Internal::new()),
                dead: AtomicBool::new(false),
            }),
        }
    }

    // Fresh internal block and impl instance for one round of the init
    // loop. Name, direction caps, dump and stat toggles come from the URL;
    // the effective URL and the Closed state are published to the config
    // subtree.
    pub(crate) fn reset_for_init(&self, imp: &'static Impl, url: &Url) -> Result<()> {
        let mut internal = Internal::new();
        internal.name = url
            .get("name")
            .map(|s| s.to_string())
            .unwrap_or_else(|| url.proto().to_string());
        internal.caps = match url.get("dir") {
            None => Caps::empty(),
            Some("r") | Some("in") => Caps::INPUT,
            Some("w") | Some("out") => Caps::OUTPUT,
            Some("rw") | Some("inout") => Caps::INOUT,
            Some(v) => {
                return Err(Error::invalid_arg(format!(
                    "invalid dir value '{v}' for channel '{}'",
                    internal.name
                )))
            }
        };
        internal.dump = url.get_bool("dump", false)?;
        if url.get_bool("stat", false)? {
            internal.stat = Some(Stat::new());
        }
        internal.config.set("state", State::Closed.name());
        let url_cfg = ConfigTree::new();
        url.to_config(&url_cfg);
        internal.config.set_sub("url", url_cfg);

        *self.internal() = internal;
        *self.shared.imp_desc.write().expect("impl descriptor poisoned") = imp;
        *self.shared.imp.lock().expect("impl lock poisoned") = Some((imp.new)());
        Ok(())
    }

    pub(crate) fn imp_guard(&self) -> MutexGuard<'_, Option<Box<dyn ChannelImpl>>> {
        self.shared.imp.lock().expect("impl lock poisoned")
    }

    pub(crate) fn try_imp(&self) -> Result<MutexGuard<'_, Option<Box<dyn ChannelImpl>>>> {
        self.shared.imp.try_lock().map_err(|_| Error::Again)
    }

    pub(crate) fn add_caps(&self, caps: Caps) {
        self.internal().caps |= caps;
    }

    pub(crate) fn set_state(&self, state: State) -> State {
        let (old, name, config) = {
            let mut g = self.internal();
            if g.state == state {
                return state;
            }
            let old = g.state;
            g.state = state;
            (old, g.name.clone(), g.config.clone())
        };
        info!(channel = %name, "State {:?} -> {:?}", old, state);
        config.set("state", state.name());
        self.emit(&Message::state(state));
        old
    }

    pub(crate) fn dcaps_update(&self, set: DCaps, clear: DCaps) {
        let old = {
            let mut g = self.internal();
            let old = g.dcaps;
            let new = (old - clear) | set;
            if new == old {
                return;
            }
            trace!(channel = %g.name, "Update dcaps {:?} -> {:?}", old, new);
            g.dcaps = new;
            old
        };
        self.emit(&Message::dcaps_update(old));
    }

    pub(crate) fn update_fd(&self, fd: RawFd) -> RawFd {
        let old = {
            let mut g = self.internal();
            if g.fd == fd {
                return fd;
            }
            std::mem::replace(&mut g.fd, fd)
        };
        self.emit(&Message::fd_update(old));
        old
    }

    pub(crate) fn child_add(&self, child: &Channel, tag: &str) {
        {
            let mut g = self.internal();
            g.children.push(Child {
                channel: child.clone(),
                tag: tag.to_string(),
            });
        }
        self.emit(&Message::child(ChannelEvent::Add, child.clone()));
    }

    pub(crate) fn child_del(&self, child: &Channel) -> bool {
        let removed = {
            let mut g = self.internal();
            let before = g.children.len();
            g.children.retain(|c| c.channel != *child);
            g.children.len() != before
        };
        if removed {
            self.emit(&Message::child(ChannelEvent::Delete, child.clone()));
        }
        removed
    }

    // Clears the work dcaps and finalizes the transition to Closed.
    pub(crate) fn finish_close(&self) {
        self.dcaps_update(
            DCaps::empty(),
            DCaps::PROCESS | DCaps::PENDING | DCaps::POLL_MASK,
        );
        self.set_state(State::Closed);
    }

    fn internal(&self) -> MutexGuard<'_, Internal> {
        self.shared.internal.lock().expect("channel internal poisoned")
    }

    fn ensure_alive(&self, op: &'static str) -> Result<()> {
        if self.shared.dead.load(Ordering::Acquire) {
            Err(Error::State {
                op,
                state: State::Destroy,
            })
        } else {
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_list_merges_masks() {
        let mut list = CallbackList::default();
        let cb = Callback::new(|_, _| 0);
        list.add(&cb, MsgMask::STATE);
        list.add(&cb, MsgMask::CONTROL);
        assert_eq!(list.live(), 1);
        assert_eq!(list.entries[0].mask, MsgMask::STATE | MsgMask::CONTROL);
    }

    #[test]
    fn callback_list_del_clears_bits_then_entry() {
        let mut list = CallbackList::default();
        let cb = Callback::new(|_, _| 0);
        list.add(&cb, MsgMask::STATE | MsgMask::CONTROL);
        assert!(list.del(&cb, MsgMask::STATE));
        assert_eq!(list.live(), 1);
        assert!(list.del(&cb, MsgMask::CONTROL));
        assert_eq!(list.live(), 0);
        assert!(list.entries.is_empty());
        assert!(!list.del(&cb, MsgMask::CONTROL));
    }

    #[test]
    fn callback_list_reuses_tombstones() {
        let mut list = CallbackList::default();
        let first = Callback::new(|_, _| 0);
        let second = Callback::new(|_, _| 0);
        let third = Callback::new(|_, _| 0);
        list.add(&first, MsgMask::STATE);
        list.add(&second, MsgMask::STATE);
        assert!(list.del(&first, MsgMask::STATE));
        assert_eq!(list.entries.len(), 2);
        list.add(&third, MsgMask::CHANNEL);
        // The tombstoned head slot was reused instead of growing the table.
        assert_eq!(list.entries.len(), 2);
        assert_eq!(list.live(), 2);
    }
}
