//! The `direct` channel: an in-process loopback pair.
//!
//! The first channel created is the master side of the link; a second
//! channel created with `master=` pointing at it becomes the peer. A
//! message posted on either side is delivered as a DATA callback on the
//! other. Useful to hand a channel-shaped endpoint to code under test or
//! to stitch two components together without a transport.

use std::any::Any;

use tracing::debug;

use crate::channel::base::{Base, ChannelImpl, Impl, InitAction, ProcessPolicy};
use crate::channel::{Caps, Channel, State, WeakChannel};
use crate::error::{Error, Result};
use crate::msg::{Message, MsgType};
use crate::url::Url;

#[derive(Default)]
struct Direct {
    // Slave side holds its master strongly (a child-like lifetime); the
    // master only ever refers to the slave weakly to avoid a handle cycle.
    master: Option<Channel>,
    peer: Option<WeakChannel>,
}

impl Direct {
    fn target(&self) -> Option<Channel> {
        match &self.master {
            Some(m) => Some(m.clone()),
            None => self.peer.as_ref().and_then(|p| p.upgrade()),
        }
    }

    // Drops the master's back reference to this channel.
    fn unlink(&mut self, this: &Channel) {
        let Some(master) = self.master.take() else { return };
        let Ok(mut guard) = master.try_imp() else { return };
        let Some(imp) = guard.as_mut() else { return };
        let any: &mut dyn Any = imp.as_mut();
        if let Some(direct) = any.downcast_mut::<Direct>() {
            if let Some(peer) = &direct.peer {
                if peer.upgrade().as_ref() == Some(this) {
                    direct.peer = None;
                }
            }
        }
    }
}

impl ChannelImpl for Direct {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Never
    }

    fn init(&mut self, base: &Base, _url: &Url, master: Option<&Channel>) -> Result<InitAction> {
        base.caps_add(Caps::INOUT);
        let Some(master) = master else {
            return Ok(InitAction::Ok);
        };
        if !Impl::same(master.channel_impl(), &DIRECT_IMPL) {
            return Err(Error::TypeMismatch {
                name: master.name(),
                expected: "a direct channel",
            });
        }
        let mut guard = master.try_imp().map_err(|_| {
            Error::invalid_arg(format!("master '{}' is busy", master.name()))
        })?;
        let Some(imp) = guard.as_mut() else {
            return Err(Error::NotFound {
                kind: "master",
                name: master.name(),
            });
        };
        let any: &mut dyn Any = imp.as_mut();
        let direct = any
            .downcast_mut::<Direct>()
            .expect("impl descriptor verified above");
        direct.peer = Some(base.channel().downgrade());
        drop(guard);
        self.master = Some(master.clone());
        Ok(InitAction::Ok)
    }

    fn post(&mut self, base: &Base, msg: &Message) -> Result<()> {
        if base.state() != State::Active {
            return Err(Error::State {
                op: "post",
                state: base.state(),
            });
        }
        let Some(target) = self.target() else {
            debug!(channel = %base.name(), "No linked peer, message dropped");
            return Ok(());
        };
        if target.state() != State::Active {
            debug!(channel = %base.name(), "Peer is not active, message dropped");
            return Ok(());
        }
        if msg.msg_type == MsgType::Data {
            if let Some(stat) = target.stat() {
                stat.update_rx(msg.data.len());
            }
        }
        target.emit(msg);
        Ok(())
    }

    fn free(&mut self, base: &Base) {
        self.unlink(base.channel());
    }
}

/// Descriptor for the `direct` kind.
pub static DIRECT_IMPL: Impl = Impl {
    protocol: "direct",
    new: || Box::new(Direct::default()),
};
