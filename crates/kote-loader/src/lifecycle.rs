//! Module lifecycle manager.
//!
//! `ModuleManager` owns the loaded-module table and is the only writer of
//! the registries. Loading a module goes through the same steps whether
//! the request comes from a command, the menu or the queue worker:
//!
//! 1. idempotence check;
//! 2. core integrity check;
//! 3. static scan of untrusted source (a block quarantines the file);
//! 4. compile and run module-level code;
//! 5. collect descriptors, prepare every binding, then commit them;
//! 6. record the module;
//! 7. re-check integrity, tearing the module down if it tampered.
//!
//! Operations on one module name are serialised by a per-name lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use kote_db::Store;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use walkdir::WalkDir;

use crate::aliases::{AliasLayer, PendingAlias};
use crate::config::LoaderConfig;
use crate::dispatch::{guard_command, AccessPolicy};
use crate::error::{error_chain, LoaderError};
use crate::events::Handler;
use crate::handler::{HandlerDescriptor, ModuleContext, NativeModule};
use crate::integrity::{IntegrityMonitor, IntegrityStatus};
use crate::manifest::ModuleManifest;
use crate::registry::{
    CallbackEntry, CommandEntry, InlineEntry, RegistrySet, SharedRegistries, WatcherEntry,
};
use crate::runtime::{panic_message, Dispatcher, MessageFilter, SubscriptionId};
use crate::scanner::{self, ScanLevel};
use crate::storage::ModuleStorage;
use crate::script::{SandboxConfig, ScriptUnit, UnitCache};
use crate::worker::QueueHandle;

/// Suffix for files the scanner refused.
pub const BLOCKED_SUFFIX: &str = ".blocked";
/// Suffix for files that tampered with core files while loading.
pub const MALWARE_SUFFIX: &str = ".malware";

const SCRIPT_EXTENSION: &str = "rhai";
const PACKAGE_INIT: &str = "_init.rhai";

// ─── Results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Ok,
    Info,
    Error,
}

/// Outcome of a lifecycle operation on one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub module: String,
    pub status: ResultStatus,
    pub message: String,
    /// Scanner findings and manifest warnings worth showing the operator.
    pub notes: Vec<String>,
    /// Error trace, for failures.
    pub detail: Option<String>,
}

pub type UnloadResult = LoadResult;

impl LoadResult {
    pub fn ok(module: &str, message: impl Into<String>) -> Self {
        Self::new(module, ResultStatus::Ok, message)
    }

    pub fn info(module: &str, message: impl Into<String>) -> Self {
        Self::new(module, ResultStatus::Info, message)
    }

    pub fn error(module: &str, message: impl Into<String>) -> Self {
        Self::new(module, ResultStatus::Error, message)
    }

    fn new(module: &str, status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            status,
            message: message.into(),
            notes: Vec::new(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = match self.status {
            ResultStatus::Ok => "✅",
            ResultStatus::Info => "ℹ️",
            ResultStatus::Error => "❌",
        };
        write!(f, "{icon} {}: {}", self.module, self.message)?;
        for note in &self.notes {
            write!(f, "\n  • {note}")?;
        }
        Ok(())
    }
}

// ─── Loaded-module table ────────────────────────────────────────────────

#[derive(Clone)]
pub enum ModuleUnit {
    Script(Arc<ScriptUnit>),
    Native(Arc<dyn NativeModule>),
}

impl ModuleUnit {
    pub fn is_native(&self) -> bool {
        matches!(self, ModuleUnit::Native(_))
    }
}

/// A command binding kept so aliases can reuse the guarded handler.
#[derive(Clone)]
pub(crate) struct BoundCommand {
    pub name: String,
    pub handler: Handler,
    pub incoming: bool,
}

/// One subscription made on behalf of a module.
#[derive(Clone)]
pub(crate) struct Binding {
    pub subscription: SubscriptionId,
    pub command: Option<BoundCommand>,
}

#[derive(Clone)]
pub(crate) struct AliasBinding {
    pub alias: String,
    pub subscription: SubscriptionId,
}

pub struct LoadedModule {
    pub name: String,
    pub unit: ModuleUnit,
    pub manifest: ModuleManifest,
    pub path: Option<PathBuf>,
    pub loaded_at: DateTime<Utc>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) alias_bindings: Vec<AliasBinding>,
}

impl LoadedModule {
    pub(crate) fn command(&self, name: &str) -> Option<&BoundCommand> {
        self.bindings
            .iter()
            .filter_map(|b| b.command.as_ref())
            .find(|c| c.name == name)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        self.bindings
            .iter()
            .map(|b| b.subscription)
            .chain(self.alias_bindings.iter().map(|a| a.subscription))
            .collect()
    }
}

/// Build the command pattern for `<prefix><name>` with optional arguments.
pub fn command_pattern(prefix: &str, name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?is)^{}{}(?:\s+(.*))?$",
        regex::escape(prefix),
        regex::escape(name)
    ))
}

/// Dotted module names: `[A-Za-z0-9_-]` components separated by dots.
pub fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

// ─── Manager ────────────────────────────────────────────────────────────

pub struct ModuleManagerBuilder {
    config: LoaderConfig,
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    queue: QueueHandle,
    sandbox: SandboxConfig,
    natives: Vec<Arc<dyn NativeModule>>,
    integrity: Option<IntegrityMonitor>,
}

impl ModuleManagerBuilder {
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn native(mut self, module: Arc<dyn NativeModule>) -> Self {
        self.natives.push(module);
        self
    }

    pub fn natives(mut self, modules: impl IntoIterator<Item = Arc<dyn NativeModule>>) -> Self {
        self.natives.extend(modules);
        self
    }

    pub fn integrity(mut self, monitor: IntegrityMonitor) -> Self {
        self.integrity = Some(monitor);
        self
    }

    pub fn build(self) -> Arc<ModuleManager> {
        let integrity = self.integrity.unwrap_or_else(|| {
            IntegrityMonitor::new(
                self.config.integrity_root.clone(),
                self.config.integrity_files.clone(),
            )
        });
        let registries = self.dispatcher.registries();
        Arc::new_cyclic(|self_ref| ModuleManager {
            config: self.config,
            sandbox: self.sandbox,
            store: self.store,
            dispatcher: self.dispatcher,
            registries,
            integrity,
            natives: self.natives,
            queue: self.queue,
            loaded: RwLock::new(HashMap::new()),
            units: UnitCache::new(),
            locks: StdMutex::new(HashMap::new()),
            pending_aliases: StdMutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }
}

pub struct ModuleManager {
    config: LoaderConfig,
    sandbox: SandboxConfig,
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    registries: SharedRegistries,
    integrity: IntegrityMonitor,
    natives: Vec<Arc<dyn NativeModule>>,
    queue: QueueHandle,
    /// Lock order: `loaded` before `registries`.
    pub(crate) loaded: RwLock<HashMap<String, LoadedModule>>,
    units: UnitCache,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) pending_aliases: StdMutex<HashMap<i64, PendingAlias>>,
    self_ref: Weak<ModuleManager>,
}

/// A binding whose fallible parts are done; committing it cannot fail.
enum Prepared {
    Command {
        name: String,
        doc: String,
        incoming: bool,
        guarded: Handler,
        filter: MessageFilter,
    },
    Watcher {
        handler: Handler,
        filter: MessageFilter,
    },
    Callback(CallbackEntry),
    Inline(InlineEntry),
}

struct Imported {
    unit: ModuleUnit,
    manifest: ModuleManifest,
    path: Option<PathBuf>,
    descriptors: Vec<HandlerDescriptor>,
    notes: Vec<String>,
}

impl ModuleManager {
    pub fn builder(
        config: LoaderConfig,
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        queue: QueueHandle,
    ) -> ModuleManagerBuilder {
        ModuleManagerBuilder {
            config,
            store,
            dispatcher,
            queue,
            sandbox: SandboxConfig::default(),
            natives: Vec::new(),
            integrity: None,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registries(&self) -> SharedRegistries {
        Arc::clone(&self.registries)
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn unit_cache(&self) -> &UnitCache {
        &self.units
    }

    pub fn aliases(&self) -> AliasLayer<'_> {
        AliasLayer::new(self)
    }

    /// Current command prefix.
    pub fn prefix(&self) -> String {
        self.store
            .setting(kote_db::SETTING_PREFIX)
            .unwrap_or_else(|| self.config.default_prefix.clone())
    }

    fn native(&self, name: &str) -> Option<Arc<dyn NativeModule>> {
        self.natives.iter().find(|m| m.name() == name).cloned()
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.native(name).is_some()
    }

    fn module_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().await.contains_key(name)
    }

    pub async fn loaded_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn module_info(&self, name: &str) -> Option<ModuleManifest> {
        self.loaded
            .read()
            .await
            .get(name)
            .map(|m| m.manifest.clone())
    }

    pub async fn loaded_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.loaded.read().await.get(name).map(|m| m.loaded_at)
    }

    pub async fn subscriptions_of(&self, name: &str) -> Vec<SubscriptionId> {
        self.loaded
            .read()
            .await
            .get(name)
            .map(LoadedModule::subscriptions)
            .unwrap_or_default()
    }

    pub async fn commands(&self) -> BTreeMap<String, Vec<CommandEntry>> {
        self.registries.read().await.commands().clone()
    }

    // ── Discovery & resolution ───────────────────────────────────────

    /// Every loadable module name: built-ins first, then scripts found
    /// under the plugin root, sorted.
    pub fn discover(&self) -> Vec<String> {
        let mut names: Vec<String> = self.natives.iter().map(|m| m.name().to_string()).collect();
        for name in discover_scripts(&self.config.plugin_dir) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// `a.b` → `<root>/a/b.rhai`, else `<root>/a/b/_init.rhai`.
    pub async fn resolve(&self, name: &str) -> Option<PathBuf> {
        if !is_valid_module_name(name) {
            return None;
        }
        let relative: PathBuf = name.split('.').collect();
        let base = self.config.plugin_dir.join(relative);

        let mut file = base.clone().into_os_string();
        file.push(".");
        file.push(SCRIPT_EXTENSION);
        let candidates = [PathBuf::from(file), base.join(PACKAGE_INIT)];
        for candidate in candidates {
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        None
    }

    // ── Lifecycle operations ─────────────────────────────────────────

    pub async fn load(&self, name: &str, report_chat: Option<i64>) -> LoadResult {
        let lock = self.module_lock(name);
        let _guard = lock.lock().await;
        self.load_locked(name, report_chat).await
    }

    pub async fn unload(&self, name: &str) -> UnloadResult {
        let lock = self.module_lock(name);
        let _guard = lock.lock().await;
        self.unload_locked(name).await
    }

    /// Unload then load under one lock, then rebind aliases.
    pub async fn reload(&self, name: &str, report_chat: Option<i64>) -> LoadResult {
        let lock = self.module_lock(name);
        let _guard = lock.lock().await;

        let unloaded = self.unload_locked(name).await;
        if unloaded.is_error() {
            return unloaded;
        }
        let mut result = self.load_locked(name, report_chat).await;
        if result.is_ok() {
            result.message = "reloaded".into();
            if let Err(e) = self.aliases().reregister_all().await {
                tracing::warn!(module = %name, error = %e, "alias rebind after reload failed");
            }
        }
        result
    }

    async fn load_locked(&self, name: &str, report_chat: Option<i64>) -> LoadResult {
        if self.is_loaded(name).await {
            return LoadResult::info(name, "already loaded");
        }

        if let IntegrityStatus::Compromised { file, reason } = self.integrity.verify().await {
            return LoadResult::error(
                name,
                format!(
                    "core file {} was {reason}; loading is disabled",
                    file.display()
                ),
            );
        }

        let imported = match self.import(name, report_chat).await {
            Ok(Ok(imported)) => imported,
            Ok(Err(refusal)) => return refusal,
            Err(e) => {
                self.units.purge(name);
                tracing::error!(module = %name, error = %e, "module failed to load");
                return LoadResult::error(name, e.to_string()).with_detail(error_chain(&e));
            }
        };

        let prepared = match self.prepare(name, &imported.descriptors) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.units.purge(name);
                tracing::error!(module = %name, error = %e, "module registration failed");
                return LoadResult::error(name, e.to_string()).with_detail(error_chain(&e));
            }
        };

        let notes = imported.notes.clone();
        let path = imported.path.clone();
        self.commit(name, imported, prepared).await;

        if let IntegrityStatus::Compromised { file, reason } = self.integrity.verify().await {
            tracing::error!(module = %name, file = %file.display(), %reason, "module tampered with core files");
            self.teardown(name).await;
            let mut message = format!(
                "module modified core file {} ({reason}) while loading",
                file.display()
            );
            if let Some(path) = path {
                match quarantine(&path, MALWARE_SUFFIX).await {
                    Ok(moved) => message.push_str(&format!("; quarantined as {}", moved.display())),
                    Err(e) => message.push_str(&format!("; quarantine failed: {e}")),
                }
            }
            return LoadResult::error(name, message);
        }

        tracing::info!(module = %name, "module loaded");
        LoadResult::ok(name, "loaded").with_notes(notes)
    }

    /// Read, scan, compile and run a module; collect its descriptors.
    /// The inner `Err` is a refusal that has already been turned into a
    /// result (scanner block, missing file).
    async fn import(
        &self,
        name: &str,
        report_chat: Option<i64>,
    ) -> Result<Result<Imported, LoadResult>, LoaderError> {
        if let Some(native) = self.native(name) {
            let ctx = ModuleContext::new(
                name,
                Arc::clone(&self.store),
                self.registries(),
                self.queue.clone(),
                self.self_ref.clone(),
            );
            let descriptors =
                match std::panic::catch_unwind(AssertUnwindSafe(|| native.register(&ctx))) {
                    Ok(result) => result?,
                    Err(payload) => {
                        let trace = panic_message(payload.as_ref());
                        return Ok(Err(LoadResult::error(name, "module panicked while registering")
                            .with_detail(trace)));
                    }
                };
            return Ok(Ok(Imported {
                manifest: native.manifest(),
                unit: ModuleUnit::Native(native),
                path: None,
                descriptors,
                notes: Vec::new(),
            }));
        }

        let Some(path) = self.resolve(name).await else {
            return Ok(Err(LoadResult::error(name, "module file not found")));
        };
        let source = tokio::fs::read_to_string(&path).await?;

        let scan = scanner::scan(&source);
        if scan.is_blocked() {
            tracing::warn!(module = %name, reasons = ?scan.reasons, "module blocked by scanner");
            let mut message = String::from("blocked by the security scanner");
            match quarantine(&path, BLOCKED_SUFFIX).await {
                Ok(moved) => message.push_str(&format!("; moved to {}", moved.display())),
                Err(e) => message.push_str(&format!("; quarantine failed: {e}")),
            }
            return Ok(Err(LoadResult::error(name, message).with_notes(scan.reasons)));
        }

        let mut notes = Vec::new();
        if scan.level >= ScanLevel::Info {
            notes.extend(scan.reasons.iter().cloned());
        }
        if scan.level >= ScanLevel::Warning {
            if let Some(chat_id) = report_chat {
                let text = format!(
                    "⚠️ {name}: scanner verdict {}\n{}",
                    scan.level,
                    scan.reasons
                        .iter()
                        .map(|r| format!("• {r}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                if let Err(e) = self.dispatcher.client().send_message(chat_id, &text, None).await {
                    tracing::warn!(module = %name, error = %e, "failed to post scanner warning");
                }
            }
        }

        let manifest = ModuleManifest::parse(&source);
        notes.extend(manifest.validate());

        // Fresh compile every time; any cached unit is replaced below.
        self.units.purge(name);
        let module_name = name.to_string();
        let script_path = path.clone();
        let sandbox = self.sandbox.clone();
        let root = self.config.plugin_dir.clone();
        let storage = ModuleStorage::new(name, Arc::clone(&self.store));
        let compiled = tokio::task::spawn_blocking(move || {
            let unit = Arc::new(ScriptUnit::compile(
                &module_name,
                &script_path,
                &source,
                &sandbox,
                &root,
                Some(storage),
            )?);
            unit.run_module_code()?;
            let descriptors = unit.descriptors()?;
            Ok::<_, LoaderError>((unit, descriptors))
        })
        .await;

        let (unit, descriptors) = match compiled {
            Ok(result) => result?,
            Err(join) => {
                let trace = if join.is_panic() {
                    panic_message(join.into_panic().as_ref())
                } else {
                    join.to_string()
                };
                return Ok(Err(
                    LoadResult::error(name, "module panicked while importing").with_detail(trace)
                ));
            }
        };
        self.units.insert(Arc::clone(&unit));

        Ok(Ok(Imported {
            unit: ModuleUnit::Script(unit),
            manifest,
            path: Some(path),
            descriptors,
            notes,
        }))
    }

    /// Compile every pattern and wrap every command. Nothing is
    /// subscribed or registered yet.
    fn prepare(
        &self,
        name: &str,
        descriptors: &[HandlerDescriptor],
    ) -> Result<Vec<Prepared>, LoaderError> {
        let prefix = self.prefix();
        let policy: Arc<dyn AccessPolicy> = self.store.clone();

        descriptors
            .iter()
            .map(|descriptor| -> Result<Prepared, LoaderError> {
                let prepared = match descriptor {
                    HandlerDescriptor::Command(cmd) => Prepared::Command {
                        name: cmd.name.clone(),
                        doc: cmd.doc.clone(),
                        incoming: cmd.incoming,
                        guarded: guard_command(
                            &cmd.name,
                            cmd.min_level,
                            Arc::clone(&cmd.handler),
                            Arc::clone(&policy),
                            self.config.denial_notice,
                        ),
                        filter: MessageFilter::new(
                            cmd.incoming,
                            true,
                            Some(command_pattern(&prefix, &cmd.name)?),
                        ),
                    },
                    HandlerDescriptor::Watcher(w) => Prepared::Watcher {
                        handler: Arc::clone(&w.handler),
                        filter: MessageFilter::new(
                            w.incoming,
                            w.outgoing,
                            w.pattern.as_deref().map(Regex::new).transpose()?,
                        ),
                    },
                    HandlerDescriptor::Callback(c) => Prepared::Callback(CallbackEntry {
                        pattern: Regex::new(&c.pattern)?,
                        handler: Arc::clone(&c.handler),
                        module: name.to_string(),
                    }),
                    HandlerDescriptor::InlineQuery(i) => Prepared::Inline(InlineEntry {
                        pattern: Regex::new(&i.pattern)?,
                        handler: Arc::clone(&i.handler),
                        title: i.title.clone(),
                        description: i.description.clone(),
                        module: name.to_string(),
                    }),
                };
                Ok(prepared)
            })
            .collect()
    }

    async fn commit(&self, name: &str, imported: Imported, prepared: Vec<Prepared>) {
        let mut loaded = self.loaded.write().await;
        let mut registries = self.registries.write().await;

        let mut bindings = Vec::new();
        for item in prepared {
            match item {
                Prepared::Command {
                    name: command,
                    doc,
                    incoming,
                    guarded,
                    filter,
                } => {
                    let subscription = self.dispatcher.subscribe(Arc::clone(&guarded), filter);
                    registries.add_command(
                        &command,
                        CommandEntry {
                            module: name.to_string(),
                            doc,
                            is_alias: false,
                        },
                    );
                    bindings.push(Binding {
                        subscription,
                        command: Some(BoundCommand {
                            name: command,
                            handler: guarded,
                            incoming,
                        }),
                    });
                }
                Prepared::Watcher { handler, filter } => {
                    let subscription =
                        self.dispatcher.subscribe(Arc::clone(&handler), filter.clone());
                    registries.add_watcher(WatcherEntry {
                        handler,
                        filter,
                        module: name.to_string(),
                        subscription,
                    });
                    bindings.push(Binding {
                        subscription,
                        command: None,
                    });
                }
                Prepared::Callback(entry) => registries.set_callback(entry),
                Prepared::Inline(entry) => registries.set_inline(entry),
            }
        }

        loaded.insert(
            name.to_string(),
            LoadedModule {
                name: name.to_string(),
                unit: imported.unit,
                manifest: imported.manifest,
                path: imported.path,
                loaded_at: Utc::now(),
                bindings,
                alias_bindings: Vec::new(),
            },
        );
    }

    /// Remove every trace of a loaded module. Returns whether it was loaded.
    async fn teardown(&self, name: &str) -> bool {
        let removed = {
            let mut loaded = self.loaded.write().await;
            let Some(module) = loaded.remove(name) else {
                return false;
            };
            let mut registries = self.registries.write().await;
            self.detach(&module, &mut registries);
            module
        };
        self.units.purge(name);
        tracing::debug!(module = %removed.name, "module torn down");
        true
    }

    fn detach(&self, module: &LoadedModule, registries: &mut RegistrySet) {
        for subscription in module.subscriptions() {
            self.dispatcher.unsubscribe(subscription);
        }
        let pruned = registries.remove_module(&module.name);
        tracing::debug!(
            module = %module.name,
            commands = pruned.commands,
            callbacks = pruned.callbacks,
            inline = pruned.inline,
            watchers = pruned.watchers,
            "registries pruned"
        );
    }

    async fn unload_locked(&self, name: &str) -> UnloadResult {
        if !self.teardown(name).await {
            return LoadResult::info(name, "not loaded");
        }
        tracing::info!(module = %name, "module unloaded");
        LoadResult::ok(name, "unloaded")
    }
}

/// Rename `path` to `path<suffix>`.
async fn quarantine(path: &Path, suffix: &str) -> Result<PathBuf, std::io::Error> {
    let mut target = path.as_os_str().to_owned();
    target.push(suffix);
    let target = PathBuf::from(target);
    tokio::fs::rename(path, &target).await?;
    tracing::warn!(from = %path.display(), to = %target.display(), "module quarantined");
    Ok(target)
}

/// Script modules under `root`, as sorted dotted names.
fn discover_scripts(root: &Path) -> Vec<String> {
    let entries: Vec<walkdir::DirEntry> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(Result::ok)
        .collect();

    let packages: BTreeSet<PathBuf> = entries
        .iter()
        .filter(|e| e.file_type().is_file() && e.file_name() == PACKAGE_INIT)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect();

    let mut names = BTreeSet::new();
    for package in &packages {
        if let Some(name) = dotted_name(root, package) {
            names.insert(name);
        }
    }

    for entry in entries.iter().filter(|e| e.file_type().is_file()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem.starts_with('_') {
            continue;
        }
        // Files inside a package are its sub-units, not modules.
        if path
            .ancestors()
            .skip(1)
            .take_while(|a| *a != root)
            .any(|a| packages.contains(a))
        {
            continue;
        }
        if let Some(name) = dotted_name(root, &path.with_extension("")) {
            names.insert(name);
        }
    }

    names.into_iter().collect()
}

fn dotted_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let name = parts.join(".");
    is_valid_module_name(&name).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_pattern() {
        let re = command_pattern(".", "ping").unwrap();
        assert!(re.is_match(".ping"));
        assert!(re.is_match(".PING"));
        assert!(re.is_match(".ping a\nb"));
        assert!(!re.is_match(".pingx"));
        assert!(!re.is_match("ping"));
        let caps = re.captures(".ping   hello").unwrap();
        assert_eq!(caps.get(1).map(|m| m.as_str()), Some("hello"));
    }

    #[test]
    fn test_command_pattern_escapes_prefix() {
        let re = command_pattern("$", "a+b").unwrap();
        assert!(re.is_match("$a+b"));
        assert!(!re.is_match("$aab"));
    }

    #[test]
    fn test_module_name_validation() {
        assert!(is_valid_module_name("ping"));
        assert!(is_valid_module_name("tools.net_stat"));
        assert!(!is_valid_module_name(""));
        assert!(!is_valid_module_name("a..b"));
        assert!(!is_valid_module_name("../etc"));
        assert!(!is_valid_module_name("a/b"));
    }

    #[test]
    fn test_discover_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("ping.rhai"), "").unwrap();
        std::fs::write(root.join("_private.rhai"), "").unwrap();
        std::fs::write(root.join("notes.txt"), "").unwrap();
        std::fs::write(root.join("old.rhai.blocked"), "").unwrap();
        std::fs::create_dir_all(root.join("tools")).unwrap();
        std::fs::write(root.join("tools/net.rhai"), "").unwrap();
        std::fs::create_dir_all(root.join("weather")).unwrap();
        std::fs::write(root.join("weather/_init.rhai"), "").unwrap();
        std::fs::write(root.join("weather/api.rhai"), "").unwrap();

        assert_eq!(
            discover_scripts(root),
            vec!["ping", "tools.net", "weather"]
        );
    }

    #[test]
    fn test_discover_missing_root() {
        assert!(discover_scripts(Path::new("/nonexistent/kote/modules")).is_empty());
    }

    #[tokio::test]
    async fn test_quarantine_renames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.rhai");
        std::fs::write(&path, "system()").unwrap();
        let moved = quarantine(&path, BLOCKED_SUFFIX).await.unwrap();
        assert_eq!(moved, dir.path().join("evil.rhai.blocked"));
        assert!(!path.exists());
        assert!(moved.exists());
    }

    #[test]
    fn test_result_display() {
        let result = LoadResult::ok("ping", "loaded").with_notes(vec!["import of `http`".into()]);
        assert_eq!(result.to_string(), "✅ ping: loaded\n  • import of `http`");
    }
}
