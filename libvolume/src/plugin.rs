//! Volume plugin trait and registry.
//!
//! A [`VolumePlugin`] encapsulates everything backend-specific the
//! reconciliation engine needs to know about a volume type: whether specs of
//! that type are attachable or device-mountable (which feeds identity
//! derivation) and where the node-global device mount for a spec lives.  The
//! actual mount mechanics belong to the operation executor, not here.
//!
//! Plugin names may contain `/` (reverse-domain style, e.g.
//! `example.com/nfs`); on disk they appear with `/` escaped to `~` so a
//! plugin name is always a single path component.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::types::VolumeSpec;

/// Backend-specific volume behavior consumed by the reconciliation engine.
pub trait VolumePlugin: Send + Sync {
    /// Canonical plugin name, e.g. `"example.com/fake"`.
    fn name(&self) -> &str;

    /// Whether volumes of this spec must be attached to the node.
    fn can_attach(&self, spec: &VolumeSpec) -> bool;

    /// Whether volumes of this spec have a node-global device mount.
    fn can_device_mount(&self, spec: &VolumeSpec) -> bool;

    /// Node-global device mount path for the spec, when one exists.
    fn global_mount_path(&self, spec: &VolumeSpec) -> Option<PathBuf>;
}

/// Lookup table of registered plugins, keyed by canonical name.
///
/// Backed by a concurrent map so registration at startup and lookups from
/// the reconstruction path need no external locking.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn VolumePlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its canonical name.  A later registration
    /// with the same name replaces the earlier one.
    pub fn register(&self, plugin: Arc<dyn VolumePlugin>) {
        self.plugins.insert(plugin.name().to_owned(), plugin);
    }

    /// Look up a plugin by canonical (unescaped) name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn VolumePlugin>> {
        self.plugins.get(name).map(|p| p.value().clone())
    }
}

/// Escape a plugin name for use as a single on-disk path component.
pub fn escape_plugin_name(name: &str) -> String {
    name.replace('/', "~")
}

/// Inverse of [`escape_plugin_name`].
pub fn unescape_plugin_name(escaped: &str) -> String {
    escaped.replace('~', "/")
}
