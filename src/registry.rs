//! Plugin resolution: maps a plugin name to a constructor, checking that
//! the entry was built against a compatible API version.
//!
//! Dynamically loaded modules are out of scope here; every plugin is
//! compiled in and described by a [`PluginEntry`]. The version rule matches
//! the dynamic-module convention all the same: entries built against an
//! *older* API are accepted (the engine only uses the prefix it knows),
//! entries claiming a *newer* API than the engine speaks are refused.

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use crate::backend::Plugin;
use crate::plugins::{FilePlugin, MemoryPlugin, NullPlugin};

/// The layer API version this engine was built against.
pub const API_VERSION: u32 = 2;

/// Plugin configuration as `key=value` pairs, in the order given.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    pairs: Vec<(String, String)>,
}

impl Settings {
    /// Empty settings.
    pub fn new() -> Settings {
        Settings::default()
    }

    /// Append one `key=value` pair.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Settings {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Last value given for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse `key` as a byte size, allowing `k`/`M`/`G`/`T` suffixes
    /// (powers of 1024). Returns `default` when the key is absent.
    pub fn get_size(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            Some(value) => parse_size(value),
            None => Ok(default),
        }
    }
}

/// Parse a human-friendly byte count: a plain integer, optionally followed
/// by one of `k`, `M`, `G`, `T` (case-insensitive, powers of 1024).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 10),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 20),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 30),
        Some(c) if c.eq_ignore_ascii_case(&'t') => (&s[..s.len() - 1], 40),
        Some(_) => (s, 0),
        None => bail!("empty size"),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| eyre!("cannot parse size {s:?}"))?;
    n.checked_shl(shift)
        .filter(|v| v >> shift == n)
        .ok_or_else(|| eyre!("size {s:?} overflows"))
}

/// One resolvable plugin.
pub struct PluginEntry {
    /// Name used on the command line and in logs.
    pub name: &'static str,
    /// API version the entry was written against.
    pub api_version: u32,
    /// Construct the plugin from its settings.
    pub build: fn(&Settings) -> Result<Box<dyn Plugin>>,
}

/// The set of plugins this server can serve from.
pub struct Registry {
    entries: Vec<PluginEntry>,
}

impl Registry {
    /// A registry holding the built-in plugins.
    pub fn builtin() -> Registry {
        Registry {
            entries: vec![
                PluginEntry {
                    name: "memory",
                    api_version: API_VERSION,
                    build: |settings| {
                        let size = settings.get_size("size", 10 << 20)?;
                        let export = settings.get("export").unwrap_or("default");
                        Ok(Box::new(MemoryPlugin::new(export, size)))
                    },
                },
                PluginEntry {
                    name: "file",
                    api_version: API_VERSION,
                    build: |settings| {
                        let path = settings
                            .get("path")
                            .ok_or_else(|| eyre!("the file plugin requires path=<FILE>"))?;
                        let export = settings.get("export").unwrap_or("default");
                        Ok(Box::new(FilePlugin::new(export, path)))
                    },
                },
                PluginEntry {
                    name: "null",
                    api_version: API_VERSION,
                    build: |settings| {
                        let size = settings.get_size("size", 10 << 20)?;
                        Ok(Box::new(NullPlugin::new(size)))
                    },
                },
            ],
        }
    }

    /// Add an entry (e.g. an embedding application's own plugin).
    pub fn register(&mut self, entry: PluginEntry) {
        self.entries.push(entry);
    }

    /// Names of every registered plugin.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Resolve `name` and build the plugin. An entry written against a
    /// newer API than this engine speaks is refused; older entries are
    /// fine, the engine uses only what they declare.
    pub fn resolve(&self, name: &str, settings: &Settings) -> Result<Box<dyn Plugin>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| {
                eyre!(
                    "unknown plugin {name:?} (available: {})",
                    self.names().join(", ")
                )
            })?;
        if entry.api_version > API_VERSION {
            bail!(
                "plugin {name:?} needs API version {} but this server speaks {}",
                entry.api_version,
                API_VERSION
            );
        }
        (entry.build)(settings)
    }
}
