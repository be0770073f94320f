//! Rhai script modules.
//!
//! Each loaded script gets its own engine with the operation, call-depth
//! and string-size limits from [`SandboxConfig`], plus the `log_*` and
//! storage host functions bound to the module name. Handlers run on the
//! blocking pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use kote_db::{PermissionLevel, StorageKind};
use rhai::module_resolvers::FileModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde::{Deserialize, Serialize};

use crate::error::LoaderError;
use crate::events::{handler, Event, Handler, InlineArticle, Invocation, Reply};
use crate::handler::{
    CallbackDescriptor, CommandDescriptor, HandlerDescriptor, InlineDescriptor,
    WatcherDescriptor,
};
use crate::storage::ModuleStorage;

const MAX_LOG_MESSAGE_LEN: usize = 4096;

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Operations per call before the engine aborts (default: 1_000_000).
    pub max_operations: u64,
    /// Maximum function call nesting (default: 64).
    pub max_call_depth: usize,
    /// Maximum string length in bytes (default: 1 MiB).
    pub max_string_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_depth: 64,
            max_string_size: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_operations: std::env::var("KOTE_SCRIPT_MAX_OPERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_operations),
            max_call_depth: std::env::var("KOTE_SCRIPT_MAX_CALL_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_call_depth),
            max_string_size: std::env::var("KOTE_SCRIPT_MAX_STRING_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_string_size),
        }
    }
}

/// Strip control characters and cap the length of script log lines.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.len() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

fn build_engine(
    module: &str,
    config: &SandboxConfig,
    root: &Path,
    storage: Option<ModuleStorage>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_depth);
    engine.set_max_string_size(config.max_string_size);
    engine.set_module_resolver(FileModuleResolver::new_with_path(root));

    let name = module.to_string();
    engine.register_fn("log_info", move |msg: &str| {
        tracing::info!(plugin = %name, "{}", sanitize_log_message(msg));
    });
    let name = module.to_string();
    engine.register_fn("log_warn", move |msg: &str| {
        tracing::warn!(plugin = %name, "{}", sanitize_log_message(msg));
    });
    let name = module.to_string();
    engine.register_fn("log_error", move |msg: &str| {
        tracing::error!(plugin = %name, "{}", sanitize_log_message(msg));
    });
    let name = module.to_string();
    engine.on_print(move |msg| {
        tracing::info!(plugin = %name, "{}", sanitize_log_message(msg));
    });

    if let Some(storage) = storage {
        register_storage(&mut engine, storage);
    }
    engine
}

// ─── Storage host functions ─────────────────────────────────────────────

type HostResult<T> = Result<T, Box<EvalAltResult>>;

/// Drive a store call from a script. Scripts only run on the blocking
/// pool, where waiting on the runtime is allowed.
fn block_on_store<F: std::future::Future>(storage: &ModuleStorage, fut: F) -> HostResult<F::Output> {
    let handle = tokio::runtime::Handle::try_current().map_err(|e| {
        tracing::warn!(plugin = %storage.module(), error = %e, "storage used outside the runtime");
        format!("storage is unavailable: {e}")
    })?;
    Ok(handle.block_on(fut))
}

fn storage_error(e: kote_db::StoreError) -> Box<EvalAltResult> {
    format!("storage error: {e}").into()
}

fn storage_get(storage: &ModuleStorage, key: &str, kind: StorageKind) -> HostResult<Dynamic> {
    match block_on_store(storage, storage.get(key, kind))?.map_err(storage_error)? {
        Some(value) => rhai::serde::to_dynamic(value),
        None => Ok(Dynamic::UNIT),
    }
}

fn storage_set(
    storage: &ModuleStorage,
    key: &str,
    value: Dynamic,
    kind: StorageKind,
) -> HostResult<()> {
    let value: serde_json::Value = rhai::serde::from_dynamic(&value)?;
    block_on_store(storage, storage.set(key, &value, kind))?.map_err(storage_error)
}

fn register_storage(engine: &mut Engine, storage: ModuleStorage) {
    let s = storage.clone();
    engine.register_fn("storage_get", move |key: &str| {
        storage_get(&s, key, StorageKind::Data)
    });
    let s = storage.clone();
    engine.register_fn("storage_set", move |key: &str, value: Dynamic| {
        storage_set(&s, key, value, StorageKind::Data)
    });
    let s = storage.clone();
    engine.register_fn("storage_delete", move |key: &str| -> HostResult<bool> {
        block_on_store(&s, s.delete(key, StorageKind::Data))?.map_err(storage_error)
    });
    let s = storage.clone();
    engine.register_fn("storage_all", move || -> HostResult<Map> {
        let values = block_on_store(&s, s.all(StorageKind::Data))?.map_err(storage_error)?;
        let mut map = Map::new();
        for (key, value) in values {
            map.insert(key.into(), rhai::serde::to_dynamic(value)?);
        }
        Ok(map)
    });
    let s = storage.clone();
    engine.register_fn("config_get", move |key: &str| {
        storage_get(&s, key, StorageKind::Config)
    });
    engine.register_fn("config_set", move |key: &str, value: Dynamic| {
        storage_set(&storage, key, value, StorageKind::Config)
    });
}

// ─── Script-side types ──────────────────────────────────────────────────

/// One entry of the array a script's `register()` returns.
#[derive(Debug, Deserialize)]
struct ScriptDescriptor {
    kind: String,
    handler: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    doc: Option<String>,
    #[serde(default)]
    incoming: bool,
    #[serde(default)]
    outgoing: bool,
    #[serde(default)]
    min_level: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// The event map script handlers receive.
#[derive(Debug, Serialize)]
struct ScriptEvent {
    kind: &'static str,
    text: String,
    args: Option<String>,
    captures: Vec<Option<String>>,
    chat_id: Option<i64>,
    sender_id: i64,
    message_id: Option<i64>,
    outgoing: bool,
}

impl From<&Invocation> for ScriptEvent {
    fn from(inv: &Invocation) -> Self {
        let (kind, message_id, outgoing) = match &inv.event {
            Event::Message(m) => ("message", Some(m.id), m.outgoing),
            Event::Callback(q) => ("callback", Some(q.message_id), false),
            Event::Inline(_) => ("inline", None, false),
        };
        Self {
            kind,
            text: inv.event.text().to_string(),
            args: inv.args().map(str::to_string),
            captures: inv.captures.clone(),
            chat_id: inv.event.chat_id(),
            sender_id: inv.sender_id(),
            message_id,
            outgoing,
        }
    }
}

fn reply_from_dynamic(value: Dynamic) -> Result<Reply, LoaderError> {
    if value.is_unit() {
        return Ok(Reply::None);
    }
    if value.is_array() {
        let articles: Vec<InlineArticle> = rhai::serde::from_dynamic(&value)?;
        return Ok(Reply::Articles(articles));
    }
    if value.is_string() {
        return Ok(value
            .into_string()
            .map(Reply::Text)
            .unwrap_or_default());
    }
    Ok(Reply::Text(value.to_string()))
}

// ─── Script unit ────────────────────────────────────────────────────────

/// A compiled script module.
pub struct ScriptUnit {
    name: String,
    path: PathBuf,
    engine: Engine,
    ast: AST,
}

impl std::fmt::Debug for ScriptUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptUnit")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ScriptUnit {
    /// Compile `source`. `root` is where `import` statements resolve;
    /// without `storage` the storage host functions are not defined.
    pub fn compile(
        name: &str,
        path: &Path,
        source: &str,
        config: &SandboxConfig,
        root: &Path,
        storage: Option<ModuleStorage>,
    ) -> Result<Self, LoaderError> {
        let engine = build_engine(name, config, root, storage);
        let ast = engine.compile(source)?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            engine,
            ast,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the module-level statements once.
    pub fn run_module_code(&self) -> Result<(), LoaderError> {
        let mut scope = Scope::new();
        self.engine.run_ast_with_scope(&mut scope, &self.ast)?;
        Ok(())
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    /// Call a script function without re-running module-level code.
    pub fn call(&self, function: &str, args: impl rhai::FuncArgs) -> Result<Dynamic, LoaderError> {
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let value = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &self.ast,
            function,
            args,
        )?;
        Ok(value)
    }

    /// Call `register()` and bind every returned descriptor to this unit.
    pub fn descriptors(self: &Arc<Self>) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        if !self.has_function("register") {
            return Err(LoaderError::InvalidDescriptor(
                "module defines no register() function".into(),
            ));
        }
        let value = self.call("register", ())?;
        let raw: Vec<ScriptDescriptor> = rhai::serde::from_dynamic(&value).map_err(|e| {
            LoaderError::InvalidDescriptor(format!("register() must return descriptor maps: {e}"))
        })?;
        raw.into_iter().map(|d| self.bind(d)).collect()
    }

    fn bind(self: &Arc<Self>, raw: ScriptDescriptor) -> Result<HandlerDescriptor, LoaderError> {
        if !self.has_function(&raw.handler) {
            return Err(LoaderError::InvalidDescriptor(format!(
                "handler function '{}' is not defined",
                raw.handler
            )));
        }
        let handler = script_handler(Arc::clone(self), raw.handler.clone());

        let descriptor: HandlerDescriptor = match raw.kind.as_str() {
            "command" => {
                let name = raw.name.filter(|n| !n.trim().is_empty()).ok_or_else(|| {
                    LoaderError::InvalidDescriptor(format!(
                        "command bound to '{}' has no name",
                        raw.handler
                    ))
                })?;
                let min_level = match raw.min_level.as_deref() {
                    None => PermissionLevel::User,
                    Some(level) => PermissionLevel::parse(level).ok_or_else(|| {
                        LoaderError::InvalidDescriptor(format!("unknown min_level '{level}'"))
                    })?,
                };
                CommandDescriptor::new(name.trim(), handler)
                    .doc(raw.doc.unwrap_or_default())
                    .min_level(min_level)
                    .incoming(raw.incoming)
                    .into()
            }
            "watcher" => WatcherDescriptor {
                incoming: raw.incoming,
                outgoing: raw.outgoing,
                pattern: raw.pattern,
                handler,
            }
            .into(),
            "callback" => CallbackDescriptor {
                pattern: required(raw.pattern, "callback", "pattern")?,
                handler,
            }
            .into(),
            "inline" => InlineDescriptor {
                pattern: required(raw.pattern, "inline", "pattern")?,
                title: raw.title.or(raw.name).unwrap_or_else(|| raw.handler.clone()),
                description: raw.description.unwrap_or_default(),
                handler,
            }
            .into(),
            other => {
                return Err(LoaderError::InvalidDescriptor(format!(
                    "unknown handler kind '{other}'"
                )))
            }
        };
        Ok(descriptor)
    }
}

fn required(value: Option<String>, kind: &str, field: &str) -> Result<String, LoaderError> {
    value.ok_or_else(|| LoaderError::InvalidDescriptor(format!("{kind} handler needs a {field}")))
}

fn script_handler(unit: Arc<ScriptUnit>, function: String) -> Handler {
    handler(move |inv: Invocation| {
        let unit = Arc::clone(&unit);
        let function = function.clone();
        async move {
            let event = rhai::serde::to_dynamic(ScriptEvent::from(&inv))
                .map_err(LoaderError::from)?;
            let value =
                tokio::task::spawn_blocking(move || unit.call(&function, (event,))).await??;
            Ok(reply_from_dynamic(value)?)
        }
    })
}

// ─── Unit cache ─────────────────────────────────────────────────────────

/// Compiled units by dotted module name.
#[derive(Debug, Default)]
pub struct UnitCache {
    units: RwLock<HashMap<String, Arc<ScriptUnit>>>,
}

impl UnitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a unit, returning the one it replaced.
    pub fn insert(&self, unit: Arc<ScriptUnit>) -> Option<Arc<ScriptUnit>> {
        self.units
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit.name().to_string(), unit)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScriptUnit>> {
        self.units
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop `name` and every `name.*` sub-unit. Returns how many went.
    pub fn purge(&self, name: &str) -> usize {
        let prefix = format!("{name}.");
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        let before = units.len();
        units.retain(|key, _| key != name && !key.starts_with(&prefix));
        before - units.len()
    }

    pub fn len(&self) -> usize {
        self.units.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Message;
    use crate::runtime::RecordingClient;

    fn compile(name: &str, source: &str) -> Arc<ScriptUnit> {
        let root = std::env::temp_dir();
        Arc::new(
            ScriptUnit::compile(
                name,
                Path::new("test.rhai"),
                source,
                &SandboxConfig::default(),
                &root,
                None,
            )
            .unwrap(),
        )
    }

    fn message_invocation(text: &str, args: Option<&str>) -> Invocation {
        Invocation {
            event: Event::Message(Message::outgoing(1, 2, text).with_id(3)),
            captures: vec![args.map(str::to_string)],
            client: Arc::new(RecordingClient::new()),
        }
    }

    #[test]
    fn test_sandbox_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_operations, 1_000_000);
        assert_eq!(config.max_call_depth, 64);
        assert_eq!(config.max_string_size, 1024 * 1024);
    }

    #[test]
    fn test_sanitize_log_message() {
        assert_eq!(sanitize_log_message("a\u{7}b\nc"), "ab\nc");
        let long = "x".repeat(MAX_LOG_MESSAGE_LEN + 10);
        assert!(sanitize_log_message(&long).ends_with("(truncated)"));
    }

    #[test]
    fn test_compile_error() {
        let err = ScriptUnit::compile(
            "bad",
            Path::new("bad.rhai"),
            "fn (",
            &SandboxConfig::default(),
            &std::env::temp_dir(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::Compile(_)));
    }

    #[test]
    fn test_descriptors_bind_all_kinds() {
        let unit = compile(
            "demo",
            r#"
            fn ping(e) { "pong" }
            fn seen(e) { }
            fn press(e) { "ok" }
            fn card(e) { [#{ title: "t", text: "body" }] }
            fn register() {
                [
                    #{ kind: "command", name: "ping", handler: "ping", doc: "Ping!", min_level: "trusted", incoming: true },
                    #{ kind: "watcher", handler: "seen", incoming: true },
                    #{ kind: "callback", handler: "press", pattern: "^demo:(.+)$" },
                    #{ kind: "inline", handler: "card", pattern: "^demo$", title: "Demo" },
                ]
            }
            "#,
        );
        let descriptors = unit.descriptors().unwrap();
        let kinds: Vec<&str> = descriptors.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec!["command", "watcher", "callback", "inline"]);

        match &descriptors[0] {
            HandlerDescriptor::Command(c) => {
                assert_eq!(c.name, "ping");
                assert_eq!(c.doc, "Ping!");
                assert_eq!(c.min_level, PermissionLevel::Trusted);
                assert!(c.incoming);
            }
            _ => panic!("expected a command"),
        }
    }

    #[test]
    fn test_missing_register_is_invalid() {
        let unit = compile("empty", "fn helper() { 1 }");
        assert!(matches!(
            unit.descriptors(),
            Err(LoaderError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_undefined_handler_is_invalid() {
        let unit = compile(
            "typo",
            r#"fn register() { [#{ kind: "command", name: "x", handler: "nope" }] }"#,
        );
        let err = unit.descriptors().err().unwrap();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_unknown_kind_is_invalid() {
        let unit = compile(
            "odd",
            r#"fn h(e) {} fn register() { [#{ kind: "timer", handler: "h" }] }"#,
        );
        assert!(unit.descriptors().is_err());
    }

    #[test]
    fn test_module_code_runs_and_errors_surface() {
        assert!(compile("ok", "let x = 40 + 2; log_info(`x = ${x}`);")
            .run_module_code()
            .is_ok());
        let err = compile("boom", "throw \"import failed\";")
            .run_module_code()
            .unwrap_err();
        assert!(matches!(err, LoaderError::Script(_)));
    }

    #[test]
    fn test_operation_limit() {
        let unit = Arc::new(
            ScriptUnit::compile(
                "spin",
                Path::new("spin.rhai"),
                "loop { }",
                &SandboxConfig {
                    max_operations: 1_000,
                    ..Default::default()
                },
                &std::env::temp_dir(),
                None,
            )
            .unwrap(),
        );
        assert!(unit.run_module_code().is_err());
    }

    #[tokio::test]
    async fn test_script_handler_receives_event() {
        let unit = compile(
            "echo",
            r#"
            fn echo(e) { `${e.args} from ${e.sender_id}` }
            fn register() { [#{ kind: "command", name: "echo", handler: "echo" }] }
            "#,
        );
        let descriptors = unit.descriptors().unwrap();
        let HandlerDescriptor::Command(cmd) = &descriptors[0] else {
            panic!("expected a command");
        };
        let reply = (cmd.handler)(message_invocation(".echo hi", Some("hi")))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("hi from 2".into()));
    }

    #[tokio::test]
    async fn test_script_handler_error_propagates() {
        let unit = compile(
            "fail",
            r#"
            fn fail(e) { throw "nope"; }
            fn register() { [#{ kind: "command", name: "fail", handler: "fail" }] }
            "#,
        );
        let descriptors = unit.descriptors().unwrap();
        let HandlerDescriptor::Command(cmd) = &descriptors[0] else {
            panic!("expected a command");
        };
        let err = (cmd.handler)(message_invocation(".fail", None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_reply_from_dynamic() {
        assert_eq!(reply_from_dynamic(Dynamic::UNIT).unwrap(), Reply::None);
        assert_eq!(
            reply_from_dynamic(Dynamic::from("hi")).unwrap(),
            Reply::Text("hi".into())
        );
        assert_eq!(
            reply_from_dynamic(Dynamic::from(42_i64)).unwrap(),
            Reply::Text("42".into())
        );
    }

    #[test]
    fn test_unit_cache_purges_sub_units() {
        let cache = UnitCache::new();
        cache.insert(compile("pkg", ""));
        cache.insert(compile("pkg.helpers", ""));
        cache.insert(compile("pkgx", ""));
        assert_eq!(cache.purge("pkg"), 2);
        assert!(cache.contains("pkgx"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unit_cache_replace() {
        let cache = UnitCache::new();
        assert!(cache.insert(compile("a", "")).is_none());
        assert!(cache.insert(compile("a", "let x = 1;")).is_some());
    }
}
