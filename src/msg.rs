//! Message objects passed through the callback plane.
//!
//! Four message types flow through a channel: DATA (payload traffic),
//! CONTROL (transport specific commands), STATE (life-cycle transitions,
//! `msgid` is the new state) and CHANNEL (internal updates: dcaps changes,
//! child list changes, fd changes).
//!
//! The layout is in-process only: payloads are byte vectors, integers are
//! host endian, and CHANNEL Add/Delete events carry the child as a typed
//! handle instead of a pointer.

use bitflags::bitflags;

use crate::channel::{Channel, DCaps, State};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgType {
    /// Normal message with a data payload.
    #[default]
    Data = 0,
    /// Control message, like cache flushing or seek, if supported.
    Control = 1,
    /// State update; `msgid` equals the new [`State`].
    State = 2,
    /// Channel internal update, like dynamic caps or child list changes.
    Channel = 3,
}

impl MsgType {
    /// The mask bit selecting this type in callback subscriptions.
    pub fn mask(self) -> MsgMask {
        MsgMask::from_bits_truncate(1 << self as u32)
    }
}

bitflags! {
    /// Mask values selecting message types for callback subscriptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgMask: u32 {
        /// Data messages.
        const DATA = 1 << MsgType::Data as u32;
        /// Control messages.
        const CONTROL = 1 << MsgType::Control as u32;
        /// State messages.
        const STATE = 1 << MsgType::State as u32;
        /// Child channel updates.
        const CHANNEL = 1 << MsgType::Channel as u32;
        /// All messages.
        const ALL = !0;
    }
}

/// Message ids of [`MsgType::Channel`] messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Dynamic caps changed; `data` holds the previous dcaps bits.
    Update = 0,
    /// New child channel; carried in [`Message::channel`].
    Add = 1,
    /// Child channel removed; carried in [`Message::channel`].
    Delete = 2,
    /// File descriptor changed; `data` holds the previous fd.
    UpdateFd = 3,
}

impl ChannelEvent {
    /// Maps a CHANNEL message id back to the event, if known.
    pub fn from_msgid(msgid: i32) -> Option<Self> {
        match msgid {
            0 => Some(ChannelEvent::Update),
            1 => Some(ChannelEvent::Add),
            2 => Some(ChannelEvent::Delete),
            3 => Some(ChannelEvent::UpdateFd),
            _ => None,
        }
    }
}

/// A message flowing through a channel's callback plane.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Message type.
    pub msg_type: MsgType,
    /// Message id; schema specific for DATA, the new state for STATE,
    /// a [`ChannelEvent`] id for CHANNEL.
    pub msgid: i32,
    /// Sequence number.
    pub seq: i64,
    /// User defined flags.
    pub flags: u16,
    /// Payload bytes. For CHANNEL Update / UpdateFd this holds the
    /// previous value as host-endian `i64` bytes.
    pub data: Vec<u8>,
    /// Addressing token; transports use it to route replies to one peer.
    pub addr: i64,
    /// Child channel for CHANNEL Add / Delete events.
    pub channel: Option<Channel>,
}

impl Message {
    /// A DATA message with the given payload.
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Message {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Copies routing meta (type, msgid, seq, addr) from another message.
    pub fn copy_info(&mut self, src: &Message) {
        self.msg_type = src.msg_type;
        self.msgid = src.msgid;
        self.seq = src.seq;
        self.addr = src.addr;
    }

    pub(crate) fn state(state: State) -> Self {
        Message {
            msg_type: MsgType::State,
            msgid: state as i32,
            ..Default::default()
        }
    }

    pub(crate) fn dcaps_update(old: DCaps) -> Self {
        Message {
            msg_type: MsgType::Channel,
            msgid: ChannelEvent::Update as i32,
            data: i64::from(old.bits()).to_ne_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub(crate) fn fd_update(old: i32) -> Self {
        Message {
            msg_type: MsgType::Channel,
            msgid: ChannelEvent::UpdateFd as i32,
            data: i64::from(old).to_ne_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub(crate) fn child(event: ChannelEvent, child: Channel) -> Self {
        Message {
            msg_type: MsgType::Channel,
            msgid: event as i32,
            channel: Some(child),
            ..Default::default()
        }
    }

    /// Decodes the previous-value payload of CHANNEL Update / UpdateFd.
    pub fn old_value(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.data.as_slice().try_into().ok()?;
        Some(i64::from_ne_bytes(bytes))
    }
}
