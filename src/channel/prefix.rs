//! Scaffolding for prefix channels.
//!
//! A prefix channel's protocol ends in `+`; it wraps exactly one inner
//! channel built from the URL remainder after the first `+` and forwards
//! the life-cycle to it. Subclasses implement [`PrefixImpl`] and override
//! only the hooks they need: URL rewriting at init, data handling, or the
//! per-state reactions.
//!
//! State messages from the child are dispatched to the hooks when the
//! wrapper's impl is idle. When a wrapper impl frame is itself driving the
//! child (open, close, process), that frame observes the child's state
//! synchronously after the call instead, so hook customizations stay in
//! effect without re-entering the wrapper.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::channel::base::{
    Base, ChannelImpl, ChildPolicy, ClosePolicy, Impl, InitAction, OpenPolicy, ProcessPolicy,
};
use crate::channel::{Callback, Channel, State, WeakChannel};
use crate::error::{Error, Result};
use crate::msg::{Message, MsgMask, MsgType};
use crate::scheme::Scheme;
use crate::url::Url;

/// Hooks a prefix channel kind can override.
///
/// Defaults give a transparent wrapper: messages are re-emitted to the
/// wrapper's subscribers and the child's state transitions drive the
/// wrapper's own.
#[allow(unused_variables)]
pub trait PrefixImpl: Send + Any {
    /// Process policy of the wrapper itself (the child does the real work).
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Never
    }

    /// Adjust the child URL before the child is constructed.
    fn on_init(&mut self, curl: &mut Url, url: &Url, master: Option<&Channel>) -> Result<()> {
        Ok(())
    }

    /// Open the child. The default forwards the open parameters.
    fn on_open(&mut self, base: &Base, params: &Url, child: &Channel) -> Result<()> {
        child.open(&params.params_string())
    }

    /// Close the child. The default forwards, honoring `force`.
    fn on_close(&mut self, base: &Base, force: bool, child: &Channel) -> Result<()> {
        child.close_force(force)
    }

    /// Process hook for wrappers that keep the Process dcap set.
    fn on_process(&mut self, base: &Base, timeout: Duration, child: &Channel) -> Result<()> {
        Err(Error::Again)
    }

    /// Data message from the child. Default: re-emit to the wrapper's
    /// subscribers.
    fn on_data(&mut self, base: &Base, msg: &Message) -> Result<()> {
        base.callback_data(msg);
        Ok(())
    }

    /// Non-data, non-state message from the child. Default: re-emit.
    fn on_other(&mut self, base: &Base, msg: &Message) -> Result<()> {
        base.callback(msg);
        Ok(())
    }

    /// Child reached Active: the wrapper is ready.
    fn on_active(&mut self, base: &Base, child: &Channel) -> Result<()> {
        base.set_state(State::Active);
        Ok(())
    }

    /// Child failed: the wrapper is broken.
    fn on_error(&mut self, base: &Base, child: &Channel) -> Result<()> {
        base.set_state(State::Error);
        Ok(())
    }

    /// Child started closing.
    fn on_closing(&mut self, base: &Base) -> Result<()> {
        if matches!(base.state(), State::Opening | State::Active) {
            base.set_state(State::Closing);
        }
        Ok(())
    }

    /// Child finished closing; finalize the wrapper's Long close.
    fn on_closed(&mut self, base: &Base) -> Result<()> {
        if base.state() == State::Closing {
            base.closed();
        }
        Ok(())
    }
}

/// Adapter turning a [`PrefixImpl`] into a [`ChannelImpl`].
pub struct Prefix<T: PrefixImpl> {
    hooks: T,
    child: Option<Channel>,
}

impl<T: PrefixImpl + Default> Default for Prefix<T> {
    fn default() -> Self {
        Prefix {
            hooks: T::default(),
            child: None,
        }
    }
}

impl<T: PrefixImpl> Prefix<T> {
    pub fn new(hooks: T) -> Self {
        Prefix { hooks, child: None }
    }

    /// The wrapped channel. Present after a successful init.
    pub fn child(&self) -> Option<&Channel> {
        self.child.as_ref()
    }

    fn child_handle(&self) -> Result<Channel> {
        self.child.clone().ok_or(Error::Again)
    }

    // Child state observed synchronously after a call the wrapper made
    // itself (dispatch skips state messages while the wrapper impl is
    // busy, so the driving frame is responsible for this).
    fn sync_child_state(&mut self, base: &Base, child: &Channel) -> Result<()> {
        match child.state() {
            State::Active => self.hooks.on_active(base, child),
            State::Error => self.hooks.on_error(base, child),
            State::Closed => self.hooks.on_closed(base),
            _ => Ok(()),
        }
    }

    fn on_state(&mut self, base: &Base, child: &Channel, msg: &Message) -> Result<()> {
        match State::from_msgid(msg.msgid) {
            Some(State::Active) => {
                if self.hooks.on_active(base, child).is_err() {
                    base.set_state(State::Error);
                }
                Ok(())
            }
            Some(State::Error) => self.hooks.on_error(base, child),
            Some(State::Closing) => self.hooks.on_closing(base),
            Some(State::Closed) => self.hooks.on_closed(base),
            Some(State::Opening) => {
                base.set_state(State::Opening);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn dispatch(weak: &WeakChannel, child: &Channel, msg: &Message) {
        let Some(parent) = weak.upgrade() else { return };
        if let Ok(mut guard) = parent.try_imp() {
            if let Some(imp) = guard.as_mut() {
                let any: &mut dyn Any = imp.as_mut();
                if let Some(prefix) = any.downcast_mut::<Prefix<T>>() {
                    let base = Base::new(&parent);
                    let _ = match msg.msg_type {
                        MsgType::Data => prefix.hooks.on_data(&base, msg),
                        MsgType::State => prefix.on_state(&base, child, msg),
                        _ => prefix.hooks.on_other(&base, msg),
                    };
                    return;
                }
            }
        }
        // The wrapper impl is busy driving the child right now; that frame
        // observes the child state itself. Traffic still flows through.
        match msg.msg_type {
            MsgType::State => {}
            _ => parent.emit(msg),
        }
    }
}

impl<T: PrefixImpl> ChannelImpl for Prefix<T> {
    fn open_policy(&self) -> OpenPolicy {
        OpenPolicy::Manual
    }

    fn close_policy(&self) -> ClosePolicy {
        ClosePolicy::Long
    }

    fn process_policy(&self) -> ProcessPolicy {
        self.hooks.process_policy()
    }

    fn child_policy(&self) -> ChildPolicy {
        ChildPolicy::Single
    }

    fn init(&mut self, base: &Base, url: &Url, master: Option<&Channel>) -> Result<InitAction> {
        let proto = url.proto().to_string();
        let sep = proto.find('+').ok_or_else(|| {
            Error::invalid_arg(format!("invalid url proto '{proto}': no + found"))
        })?;
        let (local, inner) = (&proto[..sep], &proto[sep + 1..]);
        if inner.is_empty() {
            return Err(Error::invalid_arg(format!(
                "invalid url proto '{proto}': empty inner protocol"
            )));
        }

        let mut curl = url.clone();
        curl.set_proto(inner);
        curl.set("name", format!("{}/{}", base.name(), local));
        curl.set("tll.internal", "yes");
        for key in ["dump", "stat"] {
            curl.unset(key);
        }
        self.hooks.on_init(&mut curl, url, master)?;

        debug!(channel = %base.name(), "Create child channel '{}'", curl.proto());
        let child = base.context().channel_url(&curl, master)?;
        let weak = base.channel().downgrade();
        let cb = Callback::new(move |child: &Channel, msg: &Message| {
            Self::dispatch(&weak, child, msg);
            0
        });
        child.callback_add(&cb, MsgMask::ALL)?;
        base.child_add(&child, &proto);
        self.child = Some(child);
        Ok(InitAction::Ok)
    }

    fn open(&mut self, base: &Base, params: &Url) -> Result<()> {
        let child = self.child_handle()?;
        self.hooks.on_open(base, params, &child)?;
        self.sync_child_state(base, &child)
    }

    fn close(&mut self, base: &Base, force: bool) -> Result<()> {
        let child = self.child_handle()?;
        self.hooks.on_close(base, force, &child)?;
        if !force {
            self.sync_child_state(base, &child)?;
        }
        Ok(())
    }

    fn process(&mut self, base: &Base, timeout: Duration) -> Result<()> {
        let child = self.child_handle()?;
        self.hooks.on_process(base, timeout, &child)
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<()> {
        self.child_handle()?.post(msg)
    }

    fn scheme(&self, _base: &Base, msg_type: MsgType) -> Option<Arc<Scheme>> {
        self.child.as_ref()?.scheme(msg_type)
    }
}

/// Transparent pass-through prefix: wraps any channel without changing its
/// behaviour. Useful as a stacking example and for tests.
#[derive(Default)]
pub struct PassThrough;

impl PrefixImpl for PassThrough {}

/// Descriptor for the plain `prefix+` kind.
pub static PREFIX_IMPL: Impl = Impl {
    protocol: "prefix+",
    new: || Box::new(Prefix::<PassThrough>::default()),
};
