//! A pluggable messaging and I/O framework built on
//! [mio](https://docs.rs/mio): URL-addressed channels with a shared
//! life-cycle state machine, driven by a poll-based event loop.
//!
//! - **Uniform endpoint contract:** every channel (TCP stream, in-process
//!   pair, or your own transport) is opened, closed, processed and posted
//!   to the same way, and reports back through one callback plane
//! - **URL construction:** channels are described by
//!   `proto://host;key=value` strings; protocols resolve through a
//!   registry with alias and prefix chains
//! - **Stacking:** a `proto+inner://` channel wraps an inner channel and
//!   adds behaviour (the bundled `reopen+` keeps a flaky connection alive)
//! - **Cooperative scheduling:** a single-threaded [`EventLoop`] advances
//!   channels on fd readiness or pending work; nothing blocks outside
//!   `poll`
//!
//! # Quick Start
//!
//! ```no_run
//! use commlink::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), commlink::Error> {
//! let ctx = Context::new();
//!
//! // A server and a client over a Unix socket.
//! let server = ctx.channel("tcp://./chat.sock;mode=server;name=server")?;
//! let client = ctx.channel("tcp://./chat.sock;mode=client;name=client")?;
//!
//! // Print every data message arriving at the server, and echo it back
//! // to the peer that sent it.
//! let cb = Callback::new(|server: &Channel, msg: &Message| {
//!     println!("{} bytes from peer {}", msg.data.len(), msg.addr);
//!     let _ = server.post(msg);
//!     0
//! });
//! server.callback_add(&cb, MsgMask::DATA)?;
//!
//! server.open("")?;
//! client.open("")?;
//!
//! // Drive everything from one loop.
//! let mut lp = EventLoop::new()?;
//! lp.add(&server)?;
//! lp.add(&client)?;
//! loop {
//!     if let Some(channel) = lp.poll(Duration::from_millis(100))? {
//!         let _ = channel.process(Duration::ZERO);
//!     }
//!     let _ = lp.process();
//! }
//! # }
//! ```
//!
//! # Channel URLs
//!
//! The protocol part selects the impl through the context registry. The
//! registry maps names to impls or to *aliases* (URL templates that
//! resolve further, merging their parameters). A protocol ending in `+`
//! is a prefix: `reopen+tcp://host:port;mode=client` builds a `reopen+`
//! wrapper around an inner TCP client.
//!
//! Core parameters understood for every channel:
//!
//! | Key | Description |
//! |-----|-------------|
//! | `name` | Channel name, unique within the context |
//! | `master` | Name of an existing channel to attach to |
//! | `dir` | Direction caps: `in`/`out`/`inout` (or `r`/`w`/`rw`) |
//! | `tll.internal` | Keep the channel out of the named directory |
//! | `stat` | Collect rx/tx counters |
//! | `dump` | Log every message passing the callback plane |
//!
//! # Writing a channel kind
//!
//! Implement [`ChannelImpl`] (or [`PrefixImpl`] for wrappers), describe it
//! with a static [`Impl`] descriptor and register it:
//!
//! ```
//! use commlink::prelude::*;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl ChannelImpl for Echo {
//!     fn post(&mut self, base: &Base, msg: &Message) -> Result<(), Error> {
//!         base.callback_data(msg); // loop it straight back
//!         Ok(())
//!     }
//! }
//!
//! static ECHO: Impl = Impl { protocol: "echo", new: || Box::new(Echo) };
//!
//! let ctx = Context::new();
//! ctx.register(&ECHO).unwrap();
//! let c = ctx.channel("echo://;name=e").unwrap();
//! ```

pub mod channel;
pub mod config;
pub(crate) mod context;
pub mod error;
pub mod event_loop;
pub mod module;
pub mod msg;
pub mod scheme;
pub mod stat;
pub mod url;

pub use channel::{
    Base, Callback, Caps, Channel, ChannelImpl, ChildPolicy, ClosePolicy, DCaps, Impl, InitAction,
    OpenPolicy, Prefix, PrefixImpl, ProcessPolicy, State, WeakChannel,
};
pub use config::{default_usize, ConfigTree};
pub use context::{Context, Registration};
pub use error::Error;
pub use event_loop::EventLoop;
pub use module::{ChannelModule, ModuleFlags};
pub use msg::{ChannelEvent, Message, MsgMask, MsgType};
pub use scheme::Scheme;
pub use stat::{Stat, StatList};
pub use url::Url;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::channel::{
        Base, Callback, Caps, Channel, ChannelImpl, ChildPolicy, ClosePolicy, DCaps, Impl,
        InitAction, OpenPolicy, Prefix, PrefixImpl, ProcessPolicy, State,
    };
    pub use crate::context::Context;
    pub use crate::error::Error;
    pub use crate::event_loop::EventLoop;
    pub use crate::msg::{ChannelEvent, Message, MsgMask, MsgType};
    pub use crate::url::Url;
}
