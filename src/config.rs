//! Live configuration tree.
//!
//! The hierarchical configuration store proper is an external collaborator;
//! the core only needs a small shared tree that channels publish their live
//! status into (at least the `state` leaf and the effective `url` subtree)
//! and that the context mounts under each channel's name. Sub-trees are
//! shared, so a value written through a channel's own view is immediately
//! visible through the context root.
//!
//! Defaults for channel construction come from the [`config`] crate and are
//! read through the namespaced lookup at the bottom of this module.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A shared hierarchical string tree addressed by dotted paths.
///
/// Cloning is cheap and produces another view of the same tree.
#[derive(Clone, Default)]
pub struct ConfigTree {
    node: Arc<Node>,
}

#[derive(Default)]
struct Node {
    entries: Mutex<BTreeMap<String, Value>>,
}

enum Value {
    Leaf(String),
    Sub(ConfigTree),
}

impl ConfigTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a leaf at a dotted path.
    pub fn get(&self, path: &str) -> Option<String> {
        let (node, leaf) = self.descend(path, false)?;
        let entries = node.node.entries.lock().expect("config tree poisoned");
        match entries.get(leaf) {
            Some(Value::Leaf(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Writes a leaf at a dotted path, creating intermediate sub-trees.
    ///
    /// An existing entry at the leaf position is overwritten, whatever its
    /// previous kind.
    pub fn set(&self, path: &str, value: impl Into<String>) {
        let (node, leaf) = self
            .descend(path, true)
            .expect("descend with create always succeeds");
        let mut entries = node.node.entries.lock().expect("config tree poisoned");
        entries.insert(leaf.to_string(), Value::Leaf(value.into()));
    }

    /// Returns the sub-tree at a dotted path, if present.
    pub fn sub(&self, path: &str) -> Option<ConfigTree> {
        let (node, leaf) = self.descend(path, false)?;
        let entries = node.node.entries.lock().expect("config tree poisoned");
        match entries.get(leaf) {
            Some(Value::Sub(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Mounts a shared sub-tree at a dotted path. Later updates through
    /// either view are visible through the other.
    pub fn set_sub(&self, path: &str, tree: ConfigTree) {
        let (node, leaf) = self
            .descend(path, true)
            .expect("descend with create always succeeds");
        let mut entries = node.node.entries.lock().expect("config tree poisoned");
        entries.insert(leaf.to_string(), Value::Sub(tree));
    }

    /// Removes the entry (leaf or sub-tree) at a dotted path.
    pub fn remove(&self, path: &str) {
        if let Some((node, leaf)) = self.descend(path, false) {
            let mut entries = node.node.entries.lock().expect("config tree poisoned");
            entries.remove(leaf);
        }
    }

    /// Flattens all leaves under `prefix` into sorted `(dotted-path, value)`
    /// pairs. Paths are relative to this tree, not to the prefix.
    pub fn browse(&self, prefix: &str) -> Vec<(String, String)> {
        let root = if prefix.is_empty() {
            Some(self.clone())
        } else {
            self.sub(prefix)
        };
        let mut out = Vec::new();
        if let Some(root) = root {
            let base = if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}.")
            };
            root.collect(&base, &mut out);
        }
        out
    }

    fn collect(&self, base: &str, out: &mut Vec<(String, String)>) {
        let entries = self.node.entries.lock().expect("config tree poisoned");
        for (k, v) in entries.iter() {
            match v {
                Value::Leaf(value) => out.push((format!("{base}{k}"), value.clone())),
                Value::Sub(sub) => sub.collect(&format!("{base}{k}."), out),
            }
        }
    }

    // Walks all path segments but the last; returns the owning tree and the
    // final segment. With `create` set, missing or non-sub intermediate
    // entries are replaced by fresh sub-trees.
    fn descend<'p>(&self, path: &'p str, create: bool) -> Option<(ConfigTree, &'p str)> {
        let mut node = self.clone();
        let mut rest = path;
        while let Some(pos) = rest.find('.') {
            let (head, tail) = (&rest[..pos], &rest[pos + 1..]);
            let next = {
                let mut entries = node.node.entries.lock().expect("config tree poisoned");
                match entries.get(head) {
                    Some(Value::Sub(t)) => t.clone(),
                    _ if create => {
                        let t = ConfigTree::new();
                        entries.insert(head.to_string(), Value::Sub(t.clone()));
                        t
                    }
                    _ => return None,
                }
            };
            node = next;
            rest = tail;
        }
        Some((node, rest))
    }
}

impl std::fmt::Debug for ConfigTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.browse("")).finish()
    }
}

// ============================================================================
// Namespaced Defaults Lookup
// ============================================================================

/// Reads a numeric setting from the context defaults store for a named
/// channel. A channel-specific `{name}.{key}` entry wins over the bare
/// `{key}`; `None` when neither is set.
pub fn default_usize(defaults: &config::Config, name: &str, key: &str) -> Option<usize> {
    if !name.is_empty() {
        if let Ok(value) = defaults.get::<usize>(&format!("{name}.{key}")) {
            return Some(value);
        }
    }
    defaults.get::<usize>(key).ok()
}
