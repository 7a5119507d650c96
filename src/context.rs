//! Channel context: protocol registry and channel factory.
//!
//! A [`Context`] owns the protocol registry (impls and aliases), the
//! directory of named channels, loaded modules, the scheme cache and the
//! live config root. Channels are constructed only through a context;
//! every channel holds a reference to its context for its whole lifetime.
//!
//! Contexts are cheap to clone (shared interior) and safe to query from
//! multiple threads; channels themselves are driven by a single thread.
//!
//! A process-wide default context exists for code that does not manage its
//! own; it is created lazily and lives until program exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use crate::channel::{Base, Caps, Channel, ChildPolicy, Impl, InitAction, WeakChannel};
use crate::config::ConfigTree;
use crate::error::{Error, Result};
use crate::module::{self, ChannelModule, ModuleFlags};
use crate::msg::MsgType;
use crate::scheme::Scheme;
use crate::stat::{Stat, StatList};
use crate::url::{Url, KEY_HOST, KEY_PROTO};
use crate::channel::{DIRECT_IMPL, NULL_IMPL, REOPEN_IMPL, TCP_IMPL};

/// A registry entry: a concrete impl or an alias URL to resolve further.
#[derive(Clone, Debug)]
pub enum Registration {
    Impl(&'static Impl),
    Alias(Url),
}

struct LoadedModule {
    path: String,
    // Keeps the shared object mapped; handles for a GLOBAL reload are
    // kept alongside.
    _libraries: Vec<libloading::Library>,
}

struct ContextInner {
    registry: RwLock<HashMap<String, Registration>>,
    channels: Mutex<HashMap<String, WeakChannel>>,
    scheme_cache: RwLock<HashMap<String, Arc<Scheme>>>,
    modules: Mutex<Vec<LoadedModule>>,
    config: ConfigTree,
    defaults: config::Config,
    stats: Arc<StatList>,
}

/// Registry and factory for channels.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

static DEFAULT_CONTEXT: Lazy<Context> = Lazy::new(Context::new);

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Context {
    /// Creates a context with empty defaults and the stock channel set
    /// (`null`, `direct`, `tcp`, `reopen+`) registered.
    pub fn new() -> Self {
        Self::with_defaults(config::Config::default())
    }

    /// Creates a context with a defaults store channels read settings
    /// from.
    pub fn with_defaults(defaults: config::Config) -> Self {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                registry: RwLock::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                scheme_cache: RwLock::new(HashMap::new()),
                modules: Mutex::new(Vec::new()),
                config: ConfigTree::new(),
                defaults,
                stats: Arc::new(StatList::default()),
            }),
        };
        for imp in [&NULL_IMPL, &DIRECT_IMPL, &TCP_IMPL, &REOPEN_IMPL] {
            ctx.register(imp).expect("stock registry is collision free");
        }
        ctx
    }

    /// The process-wide default context, created on first use.
    pub fn default_context() -> Context {
        DEFAULT_CONTEXT.clone()
    }

    /// The live config root: one subtree per named channel.
    pub fn config(&self) -> ConfigTree {
        self.inner.config.clone()
    }

    /// The defaults store.
    pub fn config_defaults(&self) -> config::Config {
        self.inner.defaults.clone()
    }

    /// The list of stat blocks of live `stat=yes` channels.
    pub fn stat_list(&self) -> Arc<StatList> {
        self.inner.stats.clone()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Registers an impl under its protocol name.
    pub fn register(&self, imp: &'static Impl) -> Result<()> {
        self.register_as(imp, imp.protocol)
    }

    /// Registers an impl under an explicit name.
    pub fn register_as(&self, imp: &'static Impl, name: &str) -> Result<()> {
        debug!("Register channel {} as {}", imp.protocol, name);
        let mut registry = self.registry_write();
        if registry.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "impl",
                name: name.to_string(),
            });
        }
        registry.insert(name.to_string(), Registration::Impl(imp));
        Ok(())
    }

    /// Unregisters an impl by its protocol name.
    pub fn unregister(&self, imp: &'static Impl) -> Result<()> {
        self.unregister_as(imp, imp.protocol)
    }

    /// Unregisters an impl registered under an explicit name.
    pub fn unregister_as(&self, imp: &'static Impl, name: &str) -> Result<()> {
        let mut registry = self.registry_write();
        match registry.get(name) {
            None => Err(Error::NotFound {
                kind: "impl",
                name: name.to_string(),
            }),
            Some(Registration::Alias(_)) => Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: "an impl (entry is an alias)",
            }),
            Some(Registration::Impl(existing)) if !Impl::same(existing, imp) => {
                Err(Error::ImplMismatch {
                    name: name.to_string(),
                })
            }
            Some(Registration::Impl(_)) => {
                registry.remove(name);
                Ok(())
            }
        }
    }

    /// Registers an alias: `name` resolves to `url` before construction.
    ///
    /// The alias URL must not define a host or a channel name, and its
    /// protocol must already resolve through the registry.
    pub fn alias_register(&self, name: &str, url: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_arg("empty alias name"));
        }
        let cfg = Url::parse(url)?;
        for key in [KEY_HOST, "name"] {
            if cfg.has(key) {
                return Err(Error::AliasInvalid {
                    name: name.to_string(),
                    field: key.to_string(),
                });
            }
        }
        // One resolution step must succeed; full chains are walked (and
        // cycles caught) at construction time.
        if self.lookup(cfg.proto()).is_none() {
            return Err(Error::Unresolvable {
                proto: cfg.proto().to_string(),
            });
        }
        debug!("Register alias {} as {}", name, cfg.proto());
        let mut registry = self.registry_write();
        if registry.contains_key(name) {
            return Err(Error::Duplicate {
                kind: "alias",
                name: name.to_string(),
            });
        }
        registry.insert(name.to_string(), Registration::Alias(cfg));
        Ok(())
    }

    /// Removes an alias; the URL must match the registered one.
    pub fn alias_unregister(&self, name: &str, url: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_arg("empty alias name"));
        }
        let cfg = Url::parse(url)?;
        let mut registry = self.registry_write();
        match registry.get(name) {
            None => Err(Error::NotFound {
                kind: "alias",
                name: name.to_string(),
            }),
            Some(Registration::Impl(_)) => Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: "an alias (entry is an impl)",
            }),
            Some(Registration::Alias(existing)) if existing.proto() != cfg.proto() => {
                Err(Error::TypeMismatch {
                    name: name.to_string(),
                    expected: "an alias with a matching protocol",
                })
            }
            Some(Registration::Alias(_)) => {
                registry.remove(name);
                Ok(())
            }
        }
    }

    /// Looks up the registry entry for a protocol: an exact match, or the
    /// `p+` prefix entry when `proto` contains a `+`.
    pub fn lookup(&self, proto: &str) -> Option<Registration> {
        let registry = self.registry_read();
        if let Some(entry) = registry.get(proto) {
            return Some(entry.clone());
        }
        let sep = proto.find('+')?;
        registry.get(&proto[..sep + 1]).cloned()
    }

    /// Returns the impl registered under `name`, if the entry is an impl.
    pub fn impl_get(&self, name: &str) -> Option<&'static Impl> {
        match self.lookup(name)? {
            Registration::Impl(imp) => Some(imp),
            Registration::Alias(_) => None,
        }
    }

    // Alias resolution: rewrites the URL in place until an impl is found.
    // Prefix aliases splice the URL's `+` suffix onto their own protocol;
    // alias parameters merge into the URL, collisions are errors.
    fn resolve(&self, url: &mut Url) -> Result<&'static Impl> {
        let mut proto = url.proto().to_string();
        let mut seen: Vec<String> = Vec::new();
        loop {
            let entry = self.lookup(&proto).ok_or_else(|| Error::Unresolvable {
                proto: proto.clone(),
            })?;
            match entry {
                Registration::Impl(imp) => {
                    url.set_proto(proto);
                    return Ok(imp);
                }
                Registration::Alias(alias) => {
                    if seen.contains(&proto) {
                        return Err(Error::AliasLoop { proto });
                    }
                    seen.push(proto.clone());
                    let aproto = alias.proto();
                    debug!("Found alias '{}' for '{}'", aproto, proto);
                    proto = match proto.find('+') {
                        Some(sep) if aproto.ends_with('+') => {
                            format!("{aproto}{}", &proto[sep + 1..])
                        }
                        _ => aproto.to_string(),
                    };
                    for (k, v) in alias.params() {
                        if k == KEY_PROTO || k == KEY_HOST {
                            continue;
                        }
                        if url.has(k) {
                            return Err(Error::DuplicateField {
                                key: k.to_string(),
                                proto: aproto.to_string(),
                            });
                        }
                        url.set(k, v);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Channel Construction
    // ========================================================================

    /// Constructs a channel from a URL string, without a master.
    pub fn channel(&self, url: &str) -> Result<Channel> {
        let url = Url::parse(url)?;
        self.channel_url(&url, None)
    }

    /// Constructs a channel from a parsed URL and optional master.
    pub fn channel_url(&self, url: &Url, master: Option<&Channel>) -> Result<Channel> {
        self.channel_with_impl(url, master, None)
    }

    /// Constructs a channel, optionally bypassing impl resolution.
    ///
    /// With `imp` set, the URL's protocol is not consulted and no alias
    /// rewriting happens; this is how parent channels create their
    /// internal children from a known kind.
    pub fn channel_with_impl(
        &self,
        url: &Url,
        master: Option<&Channel>,
        imp: Option<&'static Impl>,
    ) -> Result<Channel> {
        let mut url = url.clone();
        let mut imp = match imp {
            Some(imp) => imp,
            None => self.resolve(&mut url)?,
        };
        let url_str = url.to_string();

        let internal = url.get_bool("tll.internal", false)?;

        let master_resolved;
        let master = match master {
            Some(m) => Some(m),
            None => match url.get("master") {
                Some(name) => {
                    master_resolved = self.get(name).ok_or_else(|| Error::NotFound {
                        kind: "master",
                        name: name.to_string(),
                    })?;
                    Some(&master_resolved)
                }
                None => None,
            },
        };

        let channel = Channel::build(self.clone(), imp);
        let mut seen: Vec<*const Impl> = Vec::new();
        let child_policy = loop {
            channel.reset_for_init(imp, &url)?;
            debug!("Initialize channel with impl '{}'", imp.protocol);
            let mut guard = channel.imp_guard();
            let instance = guard.as_mut().expect("fresh impl instance");
            let action = instance.init(&Base::new(&channel), &url, master);
            let policy = instance.child_policy();
            drop(guard);
            match action {
                Ok(InitAction::Ok) => break policy,
                Ok(InitAction::Replace(next)) => {
                    info!("Reinitialize channel with different impl '{}'", next.protocol);
                    seen.push(imp as *const Impl);
                    if seen.iter().any(|p| std::ptr::eq(*p, next as *const Impl)) {
                        channel.free();
                        return Err(Error::InitLoop {
                            protocol: next.protocol.to_string(),
                        });
                    }
                    imp = next;
                }
                Err(e) => {
                    error!("Failed to init channel {url_str}: {e}");
                    channel.free();
                    return Err(Error::InitFailed { url: url_str });
                }
            }
        };

        if matches!(child_policy, ChildPolicy::Single) {
            channel.add_caps(Caps::PROXY);
        }
        if internal {
            channel.add_caps(Caps::CUSTOM);
        }

        let name = channel.name();
        if !internal {
            let duplicate = {
                let mut channels =
                    self.inner.channels.lock().expect("channel directory poisoned");
                match channels.get(&name) {
                    Some(existing) if existing.upgrade().is_some() => true,
                    _ => {
                        channels.insert(name.clone(), channel.downgrade());
                        false
                    }
                }
            };
            if duplicate {
                channel.free();
                return Err(Error::Duplicate {
                    kind: "channel",
                    name,
                });
            }
            self.inner.config.set_sub(&name, channel.config());
        }

        if let Some(stat) = channel.stat() {
            stat.set_name_if_empty(&name);
            info!("Register channel {} stat", name);
            self.inner.stats.add(stat);
        }

        Ok(channel)
    }

    /// Looks up a live channel by name.
    pub fn get(&self, name: &str) -> Option<Channel> {
        let channels = self.inner.channels.lock().expect("channel directory poisoned");
        channels.get(name)?.upgrade()
    }

    // Directory and stat cleanup, invoked from Channel::free.
    pub(crate) fn channel_destroyed(
        &self,
        name: &str,
        channel: &Channel,
        custom: bool,
        stat: Option<Arc<Stat>>,
    ) {
        if !custom {
            let mut channels = self.inner.channels.lock().expect("channel directory poisoned");
            if let Some(existing) = channels.get(name) {
                if existing.upgrade().map(|c| c == *channel).unwrap_or(true) {
                    channels.remove(name);
                    self.inner.config.remove(name);
                }
            }
        }
        if let Some(stat) = stat {
            self.inner.stats.remove(&stat);
        }
    }

    // ========================================================================
    // Schemes
    // ========================================================================

    /// Loads a scheme with optional caching.
    ///
    /// `channel://<name>` resolves to the DATA scheme of the named live
    /// channel. Everything else goes through [`Scheme::load`]; with
    /// `cache` set, results are memoized by URL string.
    pub fn scheme_load(&self, url: &str, cache: bool) -> Result<Arc<Scheme>> {
        if let Some(name) = url.strip_prefix("channel://") {
            let channel = self.get(name).ok_or_else(|| Error::NotFound {
                kind: "channel",
                name: name.to_string(),
            })?;
            return channel.scheme(MsgType::Data).ok_or_else(|| Error::NotFound {
                kind: "scheme",
                name: url.to_string(),
            });
        }

        if !cache {
            return Scheme::load(url);
        }

        {
            let cached = self.inner.scheme_cache.read().expect("scheme cache poisoned");
            if let Some(scheme) = cached.get(url) {
                return Ok(scheme.clone());
            }
        }

        let scheme = Scheme::load(url)?;
        let mut cached = self.inner.scheme_cache.write().expect("scheme cache poisoned");
        Ok(cached
            .entry(url.to_string())
            .or_insert(scheme)
            .clone())
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Loads a channel module shared object and registers its impls.
    ///
    /// `path` is `dir/name`, mapped to `dir/lib<name>.so`; `symbol` names
    /// the exported [`ChannelModule`] descriptor. Loading the same path
    /// twice is a no-op.
    pub fn load(&self, path: &str, symbol: &str) -> Result<()> {
        let path = module::module_path(path);
        debug!("Loading module from {path}");

        {
            let modules = self.inner.modules.lock().expect("module table poisoned");
            if modules.iter().any(|m| m.path == path) {
                info!("Module {path} already loaded");
                return Ok(());
            }
        }

        // Safety: loading runs arbitrary module constructors; the module
        // is trusted the same way a linked-in channel impl is.
        let library = unsafe { libloading::Library::new(&path) }.map_err(|e| {
            Error::ModuleLoad {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;

        // Safety: the symbol contract requires a &'static ChannelModule.
        let descriptor: &'static ChannelModule = unsafe {
            let symbol: libloading::Symbol<module::ModuleSymbol> =
                library.get(symbol.as_bytes()).map_err(|e| Error::ModuleLoad {
                    path: path.clone(),
                    reason: format!("{symbol}: {e}"),
                })?;
            *symbol
        };

        let mut libraries = vec![library];
        if descriptor.flags.contains(ModuleFlags::DLOPEN_GLOBAL) {
            debug!("Reload {path} with global symbol visibility");
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
            // Safety: same object, already mapped; this only widens the
            // symbol visibility.
            let global = unsafe { UnixLibrary::open(Some(&path), RTLD_NOW | RTLD_GLOBAL) }
                .map_err(|e| Error::ModuleLoad {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            libraries.push(global.into());
        }

        if let Some(init) = descriptor.init {
            init(self).map_err(|e| Error::ModuleLoad {
                path: path.clone(),
                reason: format!("init hook failed: {e}"),
            })?;
        }

        for imp in descriptor.impls {
            if let Err(e) = self.register(imp) {
                warn!("Module {path}: {e}");
            }
        }

        let mut modules = self.inner.modules.lock().expect("module table poisoned");
        modules.push(LoadedModule {
            path,
            _libraries: libraries,
        });
        Ok(())
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.inner.registry.read().expect("registry poisoned")
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.inner.registry.write().expect("registry poisoned")
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry_read();
        f.debug_struct("Context")
            .field("registry", &registry.len())
            .field(
                "channels",
                &self.inner.channels.lock().expect("channel directory poisoned").len(),
            )
            .finish()
    }
}
