//! The `null` channel: accepts everything, produces nothing.

use crate::channel::base::{Base, ChannelImpl, Impl, ProcessPolicy};
use crate::error::Result;
use crate::msg::Message;

#[derive(Default)]
struct Null;

impl ChannelImpl for Null {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Never
    }

    fn post(&mut self, _base: &Base, _msg: &Message) -> Result<()> {
        Ok(())
    }
}

/// Descriptor for the `null` kind.
pub static NULL_IMPL: Impl = Impl {
    protocol: "null",
    new: || Box::new(Null),
};
