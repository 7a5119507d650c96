//! Test fixture: a loadable channel module.
//!
//! Exports one channel kind (`flip`, which loops every post back with the
//! payload reversed) plus an init hook that registers an alias for the
//! stock null channel, so the host test can observe both registration
//! paths through `Context::load`.

use commlink::prelude::*;
use commlink::{ChannelModule, ModuleFlags};

#[derive(Default)]
struct Flip;

impl ChannelImpl for Flip {
    fn post(&mut self, base: &Base, msg: &Message) -> Result<(), Error> {
        let mut data = msg.data.clone();
        data.reverse();
        let mut out = Message::data(data);
        out.copy_info(msg);
        base.callback_data(&out);
        Ok(())
    }
}

static FLIP_IMPL: Impl = Impl {
    protocol: "flip",
    new: || Box::new(Flip),
};

fn module_init(ctx: &Context) -> Result<(), Error> {
    ctx.alias_register("flip-null", "null://")
}

static MODULE: ChannelModule = ChannelModule {
    flags: ModuleFlags::empty(),
    impls: &[&FLIP_IMPL],
    init: Some(module_init),
};

// The loader resolves this symbol and reads the descriptor reference
// from it.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static commlink_module: &ChannelModule = &MODULE;
