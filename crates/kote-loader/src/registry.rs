//! Global handler registries.
//!
//! The `RegistrySet` holds the four tables the rest of the process reads
//! to answer "what can be invoked right now": commands (for help and
//! alias resolution), callback patterns, inline-query patterns and
//! message watchers. It is owned by the application context and shared
//! behind a `tokio::sync::RwLock`; holders must not keep the lock across
//! a handler invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;

use crate::events::Handler;
use crate::runtime::{MessageFilter, SubscriptionId};

pub type SharedRegistries = Arc<RwLock<RegistrySet>>;

// ─── Entries ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub module: String,
    pub doc: String,
    pub is_alias: bool,
}

#[derive(Clone)]
pub struct CallbackEntry {
    pub pattern: Regex,
    pub handler: Handler,
    pub module: String,
}

#[derive(Clone)]
pub struct InlineEntry {
    pub pattern: Regex,
    pub handler: Handler,
    pub title: String,
    pub description: String,
    pub module: String,
}

#[derive(Clone)]
pub struct WatcherEntry {
    pub handler: Handler,
    pub filter: MessageFilter,
    pub module: String,
    pub subscription: SubscriptionId,
}

/// Counts of what `remove_module` pruned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pruned {
    pub commands: usize,
    pub callbacks: usize,
    pub inline: usize,
    pub watchers: usize,
}

// ─── Registry set ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RegistrySet {
    /// Command name → providers. Lists are never left empty.
    commands: BTreeMap<String, Vec<CommandEntry>>,
    /// One entry per pattern source text, in registration order.
    callbacks: Vec<CallbackEntry>,
    inline: Vec<InlineEntry>,
    watchers: Vec<WatcherEntry>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistries {
        Arc::new(RwLock::new(Self::new()))
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn add_command(&mut self, name: &str, entry: CommandEntry) {
        self.commands.entry(name.to_string()).or_default().push(entry);
    }

    /// Remove the alias entry registered under `alias`, if any.
    pub fn remove_alias_entry(&mut self, alias: &str) -> bool {
        let Some(entries) = self.commands.get_mut(alias) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !e.is_alias);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.commands.remove(alias);
        }
        removed
    }

    /// Drop every alias entry from the command table.
    pub fn clear_aliases(&mut self) -> usize {
        let mut removed = 0;
        self.commands.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| !e.is_alias);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn commands(&self) -> &BTreeMap<String, Vec<CommandEntry>> {
        &self.commands
    }

    pub fn command_entries(&self, name: &str) -> &[CommandEntry] {
        self.commands.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Modules providing `name` as a real (non-alias) command.
    pub fn command_providers(&self, name: &str) -> Vec<String> {
        self.command_entries(name)
            .iter()
            .filter(|e| !e.is_alias)
            .map(|e| e.module.clone())
            .collect()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Commands of one module, sorted, aliases included.
    pub fn module_commands(&self, module: &str) -> Vec<(String, CommandEntry)> {
        self.commands
            .iter()
            .flat_map(|(name, entries)| {
                entries
                    .iter()
                    .filter(|e| e.module == module)
                    .map(move |e| (name.clone(), e.clone()))
            })
            .collect()
    }

    // ── Callbacks & inline queries ───────────────────────────────────

    /// Register a callback handler. An existing entry with the same
    /// pattern source is replaced in place.
    pub fn set_callback(&mut self, entry: CallbackEntry) {
        match self
            .callbacks
            .iter_mut()
            .find(|e| e.pattern.as_str() == entry.pattern.as_str())
        {
            Some(existing) => {
                if existing.module != entry.module {
                    tracing::warn!(
                        pattern = %entry.pattern,
                        previous = %existing.module,
                        module = %entry.module,
                        "callback pattern taken over by another module"
                    );
                }
                *existing = entry;
            }
            None => self.callbacks.push(entry),
        }
    }

    pub fn set_inline(&mut self, entry: InlineEntry) {
        match self
            .inline
            .iter_mut()
            .find(|e| e.pattern.as_str() == entry.pattern.as_str())
        {
            Some(existing) => *existing = entry,
            None => self.inline.push(entry),
        }
    }

    /// First callback whose pattern matches `data`, with its captures.
    pub fn match_callback(&self, data: &str) -> Option<(Handler, Vec<Option<String>>)> {
        self.callbacks.iter().find_map(|e| {
            captures_of(&e.pattern, data).map(|caps| (Arc::clone(&e.handler), caps))
        })
    }

    pub fn match_inline(&self, query: &str) -> Option<(Handler, Vec<Option<String>>)> {
        self.inline.iter().find_map(|e| {
            captures_of(&e.pattern, query).map(|caps| (Arc::clone(&e.handler), caps))
        })
    }

    pub fn callbacks(&self) -> &[CallbackEntry] {
        &self.callbacks
    }

    pub fn inline_handlers(&self) -> &[InlineEntry] {
        &self.inline
    }

    // ── Watchers ─────────────────────────────────────────────────────

    pub fn add_watcher(&mut self, entry: WatcherEntry) {
        self.watchers.push(entry);
    }

    pub fn watchers(&self) -> &[WatcherEntry] {
        &self.watchers
    }

    // ── Whole-module operations ──────────────────────────────────────

    /// Prune every entry owned by `module` from all four tables.
    pub fn remove_module(&mut self, module: &str) -> Pruned {
        let mut pruned = Pruned::default();

        self.commands.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.module != module);
            pruned.commands += before - entries.len();
            !entries.is_empty()
        });

        let before = self.callbacks.len();
        self.callbacks.retain(|e| e.module != module);
        pruned.callbacks = before - self.callbacks.len();

        let before = self.inline.len();
        self.inline.retain(|e| e.module != module);
        pruned.inline = before - self.inline.len();

        let before = self.watchers.len();
        self.watchers.retain(|e| e.module != module);
        pruned.watchers = before - self.watchers.len();

        pruned
    }

    /// Whether any table still references `module`.
    pub fn references(&self, module: &str) -> bool {
        self.commands
            .values()
            .flatten()
            .any(|e| e.module == module)
            || self.callbacks.iter().any(|e| e.module == module)
            || self.inline.iter().any(|e| e.module == module)
            || self.watchers.iter().any(|e| e.module == module)
    }
}

pub(crate) fn captures_of(pattern: &Regex, text: &str) -> Option<Vec<Option<String>>> {
    pattern.captures(text).map(|caps| {
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{handler, Reply};

    fn noop() -> Handler {
        handler(|_| async { Ok(Reply::None) })
    }

    fn entry(module: &str, is_alias: bool) -> CommandEntry {
        CommandEntry {
            module: module.into(),
            doc: String::new(),
            is_alias,
        }
    }

    fn callback(pattern: &str, module: &str) -> CallbackEntry {
        CallbackEntry {
            pattern: Regex::new(pattern).unwrap(),
            handler: noop(),
            module: module.into(),
        }
    }

    #[test]
    fn test_remove_module_prunes_empty_lists() {
        let mut set = RegistrySet::new();
        set.add_command("ping", entry("ping", false));
        set.add_command("p", entry("ping", true));
        set.add_command("help", entry("help", false));
        set.set_callback(callback("^ping:(.+)$", "ping"));

        let pruned = set.remove_module("ping");
        assert_eq!(pruned.commands, 2);
        assert_eq!(pruned.callbacks, 1);
        assert!(!set.has_command("ping"));
        assert!(!set.has_command("p"));
        assert!(set.has_command("help"));
        assert!(!set.references("ping"));
    }

    #[test]
    fn test_shared_command_keeps_other_provider() {
        let mut set = RegistrySet::new();
        set.add_command("stats", entry("a", false));
        set.add_command("stats", entry("b", false));
        set.remove_module("a");
        assert_eq!(set.command_providers("stats"), vec!["b".to_string()]);
    }

    #[test]
    fn test_callback_reregistration_replaces() {
        let mut set = RegistrySet::new();
        set.set_callback(callback("^x:(.+)$", "one"));
        set.set_callback(callback("^x:(.+)$", "two"));
        assert_eq!(set.callbacks().len(), 1);
        assert_eq!(set.callbacks()[0].module, "two");
    }

    #[test]
    fn test_match_callback_captures() {
        let mut set = RegistrySet::new();
        set.set_callback(callback("^mod:(load|unload):(.+)$", "menu"));
        let (_, caps) = set.match_callback("mod:load:weather").unwrap();
        assert_eq!(
            caps,
            vec![Some("load".to_string()), Some("weather".to_string())]
        );
        assert!(set.match_callback("other").is_none());
    }

    #[test]
    fn test_clear_aliases() {
        let mut set = RegistrySet::new();
        set.add_command("ping", entry("ping", false));
        set.add_command("p", entry("ping", true));
        set.add_command("pp", entry("ping", true));
        assert_eq!(set.clear_aliases(), 2);
        assert_eq!(set.commands().len(), 1);
        assert!(!set.remove_alias_entry("p"));
    }

    #[test]
    fn test_module_commands_sorted() {
        let mut set = RegistrySet::new();
        set.add_command("zeta", entry("m", false));
        set.add_command("alpha", entry("m", false));
        set.add_command("other", entry("n", false));
        let names: Vec<String> = set.module_commands("m").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
