//! Scaffolding for implementing channel kinds.
//!
//! A channel kind is a type implementing [`ChannelImpl`], advertised
//! through a `&'static` [`Impl`] descriptor that the context registry maps
//! protocol names to. The descriptor's factory produces one impl instance
//! per channel; the dispatch glue in [`super::Channel`] calls the instance
//! with a [`Base`] facade giving it access to the shared per-channel state
//! (life-cycle, dcaps, children, callbacks, config, stats).
//!
//! Policies let an impl pick how much of the life-cycle the glue drives
//! for it; the defaults suit simple fd-less channels.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Caps, Channel, DCaps, State};
use crate::config::ConfigTree;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::msg::{Message, MsgType};
use crate::scheme::Scheme;
use crate::stat::Stat;
use crate::url::Url;

/// Static descriptor of a channel kind.
///
/// Descriptors are `&'static` records compared by address: registering the
/// same descriptor under two names yields two registry entries backed by
/// one kind.
pub struct Impl {
    /// Protocol name; a trailing `+` marks a prefix kind.
    pub protocol: &'static str,
    /// Factory producing one impl instance per channel.
    pub new: fn() -> Box<dyn ChannelImpl>,
}

impl Impl {
    /// True for prefix kinds (`proto+`), which wrap an inner channel.
    pub fn is_prefix(&self) -> bool {
        self.protocol.ends_with('+')
    }

    /// Descriptor identity.
    pub fn same(a: &'static Impl, b: &'static Impl) -> bool {
        std::ptr::eq(a, b)
    }
}

impl std::fmt::Debug for Impl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Impl").field("protocol", &self.protocol).finish()
    }
}

/// Result of [`ChannelImpl::init`].
pub enum InitAction {
    /// Construction proceeds with this impl.
    Ok,
    /// Restart initialization with a different impl; the construction loop
    /// tracks already-tried descriptors and fails on a repeat.
    Replace(&'static Impl),
}

/// How the `Opening -> Active` transition is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Active immediately after the impl's open returns success.
    Auto,
    /// The impl moves the state forward itself, e.g. when a connect
    /// completes.
    Manual,
}

/// How the `Closing -> Closed` transition is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Closed immediately after the impl's close returns.
    Normal,
    /// The impl finishes the close itself (graceful flush); forced closes
    /// still complete synchronously.
    Long,
}

/// When the dispatch glue sets the Process dcap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPolicy {
    /// Process is set on open and cleared on close.
    Normal,
    /// The channel is never processed; its children do all the work.
    Never,
    /// Process stays set regardless of state; the impl must tolerate being
    /// called in any state.
    Always,
    /// The impl manages the bit explicitly.
    Custom,
}

/// How many children a channel kind creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPolicy {
    /// No children.
    Never,
    /// Exactly one child; the channel gets the Proxy cap so callers see it
    /// as a stand-in for the child.
    Single,
    /// Any number of children.
    Many,
}

/// Behaviour of one channel kind.
///
/// One instance exists per channel, produced by the descriptor factory.
/// All methods run on the thread driving the channel; the glue never calls
/// two methods of the same instance concurrently. Long operations must not
/// block: return [`Error::Again`] and rely on poll readiness or the
/// Pending dcap to be called back.
#[allow(unused_variables)]
pub trait ChannelImpl: Send + Any {
    fn open_policy(&self) -> OpenPolicy {
        OpenPolicy::Auto
    }

    fn close_policy(&self) -> ClosePolicy {
        ClosePolicy::Normal
    }

    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Normal
    }

    fn child_policy(&self) -> ChildPolicy {
        ChildPolicy::Never
    }

    /// Channel construction. Return [`InitAction::Replace`] to hand the
    /// channel over to a different impl selected from the URL.
    fn init(&mut self, base: &Base, url: &Url, master: Option<&Channel>) -> Result<InitAction> {
        Ok(InitAction::Ok)
    }

    /// Begin opening. The state is already `Opening`; with
    /// [`OpenPolicy::Auto`] the glue moves to `Active` on success.
    fn open(&mut self, base: &Base, params: &Url) -> Result<()> {
        Ok(())
    }

    /// Begin closing. The state is already `Closing`; with
    /// [`ClosePolicy::Normal`] (or `force`) the glue finishes the close.
    fn close(&mut self, base: &Base, force: bool) -> Result<()> {
        Ok(())
    }

    /// Advance the channel once; non-blocking. Return [`Error::Again`]
    /// when there is no work.
    fn process(&mut self, base: &Base, timeout: Duration) -> Result<()> {
        Err(Error::Again)
    }

    /// Post a message out through the channel. [`Error::Again`] signals
    /// backpressure.
    fn post(&mut self, base: &Base, msg: &Message) -> Result<()>;

    /// The channel's scheme for a message type, if any.
    fn scheme(&self, base: &Base, msg_type: MsgType) -> Option<Arc<Scheme>> {
        None
    }

    /// Last call before the impl instance is dropped.
    fn free(&mut self, base: &Base) {}
}

/// The facade an impl uses to reach its channel's shared state.
///
/// Borrowed per call; impls never store it. Everything here is safe to
/// call from inside impl methods, including the emission helpers, whose
/// callbacks may synchronously operate on other channels.
pub struct Base<'a> {
    channel: &'a Channel,
}

impl<'a> Base<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        Base { channel }
    }

    /// The channel being implemented.
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// The owning context, for constructing child channels.
    pub fn context(&self) -> Context {
        self.channel.context()
    }

    /// Context-wide defaults store (the `config` crate view).
    pub fn defaults(&self) -> config::Config {
        self.channel.context().config_defaults()
    }

    pub fn name(&self) -> String {
        self.channel.name()
    }

    pub fn state(&self) -> State {
        self.channel.state()
    }

    /// Stores a new state, publishes it to the config subtree and emits
    /// the STATE message. Returns the previous state.
    pub fn set_state(&self, state: State) -> State {
        self.channel.set_state(state)
    }

    pub fn caps(&self) -> Caps {
        self.channel.caps()
    }

    /// Adds static capability bits. Only meaningful during init.
    pub fn caps_add(&self, caps: Caps) {
        self.channel.add_caps(caps)
    }

    pub fn dcaps(&self) -> DCaps {
        self.channel.dcaps()
    }

    /// Applies `set` and `clear` to the dcaps; a real change emits a
    /// CHANNEL/Update message carrying the previous bits.
    pub fn dcaps_update(&self, set: DCaps, clear: DCaps) {
        self.channel.dcaps_update(set, clear)
    }

    /// Sets the poll bits to exactly `poll` (a subset of
    /// [`DCaps::POLL_MASK`]).
    pub fn dcaps_poll(&self, poll: DCaps) {
        let poll = poll & DCaps::POLL_MASK;
        self.channel.dcaps_update(poll, DCaps::POLL_MASK - poll)
    }

    pub fn fd(&self) -> RawFd {
        self.channel.fd()
    }

    /// Swaps the channel's fd, emitting CHANNEL/UpdateFd on change.
    /// Returns the previous fd.
    pub fn update_fd(&self, fd: RawFd) -> RawFd {
        self.channel.update_fd(fd)
    }

    /// The live config subtree.
    pub fn config(&self) -> ConfigTree {
        self.channel.config()
    }

    pub fn stat(&self) -> Option<Arc<Stat>> {
        self.channel.stat()
    }

    /// Appends a child, tagged with a protocol sub-name, and announces it
    /// with CHANNEL/Add.
    pub fn child_add(&self, child: &Channel, tag: &str) {
        self.channel.child_add(child, tag)
    }

    /// Removes a child, announcing CHANNEL/Delete. Returns false if the
    /// channel was not a child.
    pub fn child_del(&self, child: &Channel) -> bool {
        self.channel.child_del(child)
    }

    /// Emits a message to this channel's subscribers.
    pub fn callback(&self, msg: &Message) {
        self.channel.emit(msg)
    }

    /// Emits a DATA message to the data subscribers, counting rx stats.
    pub fn callback_data(&self, msg: &Message) {
        if let Some(stat) = self.channel.stat() {
            stat.update_rx(msg.data.len());
        }
        self.channel.emit(msg)
    }

    /// Finalizes a Long close: clears the work dcaps and enters `Closed`.
    pub fn closed(&self) {
        self.channel.finish_close()
    }
}
