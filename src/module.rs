//! Dynamically loaded channel modules.
//!
//! A module is a shared object exporting a [`ChannelModule`] descriptor
//! under a well-known symbol (conventionally `commlink_module`). Loading a
//! module registers every impl it advertises with the loading context.
//! The path argument `dir/name` maps to `dir/lib<name>.so`.

use bitflags::bitflags;

use crate::channel::Impl;
use crate::context::Context;
use crate::error::Result;

bitflags! {
    /// Module behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlags: u32 {
        /// Reload the shared object with global symbol visibility before
        /// initialization (for modules whose impls export symbols to
        /// later-loaded modules).
        const DLOPEN_GLOBAL = 0x1;
    }
}

/// Descriptor exported by a channel module.
pub struct ChannelModule {
    pub flags: ModuleFlags,
    /// Impls to register, in order.
    pub impls: &'static [&'static Impl],
    /// Optional hook run once per loading context, before registration.
    pub init: Option<fn(&Context) -> Result<()>>,
}

// Safety contract for the symbol: the exported value must be a
// `&'static ChannelModule` (the module stays loaded for the lifetime of
// the context that loaded it).
pub(crate) type ModuleSymbol = &'static ChannelModule;

/// Derives the shared object path: `dir/name` becomes `dir/lib<name>.so`.
pub(crate) fn module_path(name: &str) -> String {
    match name.rfind('/') {
        Some(sep) => format!("{}lib{}.so", &name[..sep + 1], &name[sep + 1..]),
        None => format!("lib{name}.so"),
    }
}
