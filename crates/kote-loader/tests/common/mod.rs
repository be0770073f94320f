// Shared test utilities for integration tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use kote_db::{PermissionLevel, Store};
use kote_loader::{
    builtin, handler, CommandDescriptor, CommandWorker, Dispatcher, HandlerDescriptor,
    LoaderConfig, LoaderError, Message, ModuleContext, ModuleManager, NativeModule, QueueHandle,
    RecordingClient, RegistrySet, Reply,
};
use tempfile::TempDir;

pub const OWNER: i64 = 100;
pub const TRUSTED: i64 = 200;
pub const STRANGER: i64 = 300;
pub const CHAT: i64 = -1001;

pub const PING: &str = r#"//! <manifest>
//! version: 1.0.0
//! author: tests
//! </manifest>
//!
//! Replies with pong.

fn ping(e) { "pong" }

fn register() {
    [#{ kind: "command", name: "ping", handler: "ping", doc: "reply with pong", incoming: true }]
}
"#;

pub const ECHO: &str = r#"
fn echo(e) { `echo: ${e.args}` }

fn register() {
    [#{ kind: "command", name: "echo", handler: "echo", doc: "repeat the arguments" }]
}
"#;

/// A module the scanner must refuse.
pub const EVIL: &str = r#"
fn wipe(e) { system("rm -rf ~"); }

fn register() {
    [#{ kind: "command", name: "wipe", handler: "wipe" }]
}
"#;

pub fn stats_module(reply: &str) -> String {
    format!(
        r#"
fn stats(e) {{ "{reply}" }}

fn register() {{
    [#{{ kind: "command", name: "stats", handler: "stats" }}]
}}
"#
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub client: Arc<RecordingClient>,
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub manager: Arc<ModuleManager>,
    pub worker: Option<CommandWorker>,
    next_message: AtomicI64,
}

/// Harness with the built-in modules and an empty plugin directory.
pub async fn harness() -> Harness {
    harness_with(Vec::new(), |_| {}).await
}

/// Harness with extra native modules and a config hook. Integrity files
/// named in the config are created with fixed content before the manager
/// is built.
pub async fn harness_with(
    natives: Vec<Arc<dyn NativeModule>>,
    configure: impl FnOnce(&mut LoaderConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LoaderConfig::for_root(dir.path());
    configure(&mut config);
    std::fs::create_dir_all(&config.plugin_dir).unwrap();
    for file in &config.integrity_files {
        std::fs::write(dir.path().join(file), "original").unwrap();
    }

    let store = Arc::new(Store::in_memory().await.unwrap());
    store
        .set_user_level(OWNER, PermissionLevel::Owner)
        .await
        .unwrap();
    store
        .set_user_level(TRUSTED, PermissionLevel::Trusted)
        .await
        .unwrap();

    let client = Arc::new(RecordingClient::new());
    let dispatcher = Arc::new(Dispatcher::new(client.clone(), RegistrySet::shared()));
    let (queue, receiver) = QueueHandle::channel();
    let manager = ModuleManager::builder(config, store.clone(), dispatcher.clone(), queue)
        .natives(builtin::all())
        .natives(natives)
        .build();
    let worker = CommandWorker::new(manager.clone(), receiver);

    Harness {
        dir,
        client,
        store,
        dispatcher,
        manager,
        worker: Some(worker),
        next_message: AtomicI64::new(1),
    }
}

impl Harness {
    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn plugin_path(&self, relative: &str) -> PathBuf {
        self.manager.config().plugin_dir.join(relative)
    }

    /// Write a script under the plugin directory.
    pub fn write_module(&self, relative: &str, source: &str) -> PathBuf {
        let path = self.plugin_path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, source).unwrap();
        path
    }

    pub fn worker(&self) -> &CommandWorker {
        self.worker.as_ref().unwrap()
    }

    /// The account owner types `text`. Returns how many handlers ran.
    pub async fn owner_says(&self, text: &str) -> usize {
        let id = self.next_message.fetch_add(1, Ordering::SeqCst);
        self.dispatcher
            .deliver_message(Message::outgoing(CHAT, OWNER, text).with_id(id))
            .await
    }

    /// Someone else sends `text` into the chat.
    pub async fn user_says(&self, sender: i64, text: &str) -> usize {
        let id = self.next_message.fetch_add(1, Ordering::SeqCst);
        self.dispatcher
            .deliver_message(Message::incoming(CHAT, sender, text).with_id(id))
            .await
    }

    pub fn texts(&self) -> Vec<String> {
        self.client.texts()
    }

    /// Last text sent or edited, cleared afterwards.
    pub fn take_last(&self) -> Option<String> {
        let last = self.client.texts().pop();
        self.client.clear();
        last
    }
}

/// Native module with an owner-only command that counts its invocations.
pub struct CounterModule {
    pub hits: Arc<AtomicUsize>,
}

impl CounterModule {
    pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (Arc::new(Self { hits: hits.clone() }), hits)
    }
}

impl NativeModule for CounterModule {
    fn name(&self) -> &str {
        "counter"
    }

    fn register(&self, _ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        let hits = self.hits.clone();
        let bump = handler(move |_| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::from("counted"))
            }
        });
        Ok(vec![CommandDescriptor::new("bump", bump)
            .min_level(PermissionLevel::Owner)
            .incoming(true)
            .into()])
    }
}

/// Native module that rewrites a core file while registering.
pub struct TamperModule {
    pub target: PathBuf,
}

impl NativeModule for TamperModule {
    fn name(&self) -> &str {
        "tamper"
    }

    fn register(&self, _ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        std::fs::write(&self.target, "patched")?;
        let noop = handler(|_| async { Ok(Reply::None) });
        Ok(vec![CommandDescriptor::new("tampered", noop).into()])
    }
}
