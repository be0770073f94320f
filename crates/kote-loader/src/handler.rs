//! Handler descriptors and native modules.
//!
//! A module tells the loader what it provides by returning a list of
//! [`HandlerDescriptor`]s. Script modules build them from the maps their
//! `register()` function returns; native modules build them directly.

use std::sync::{Arc, Weak};

use kote_db::{PermissionLevel, Store};

use crate::error::LoaderError;
use crate::events::Handler;
use crate::lifecycle::ModuleManager;
use crate::manifest::ModuleManifest;
use crate::registry::SharedRegistries;
use crate::worker::QueueHandle;

// ─── Descriptors ────────────────────────────────────────────────────────

/// A `<prefix><name>` command.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub doc: String,
    pub min_level: PermissionLevel,
    /// Also accept the command from other users, not only from the
    /// account itself.
    pub incoming: bool,
    pub handler: Handler,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            doc: String::new(),
            min_level: PermissionLevel::User,
            incoming: false,
            handler,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn min_level(mut self, level: PermissionLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn incoming(mut self, incoming: bool) -> Self {
        self.incoming = incoming;
        self
    }
}

/// A raw message watcher.
#[derive(Clone)]
pub struct WatcherDescriptor {
    pub incoming: bool,
    pub outgoing: bool,
    pub pattern: Option<String>,
    pub handler: Handler,
}

#[derive(Clone)]
pub struct CallbackDescriptor {
    pub pattern: String,
    pub handler: Handler,
}

#[derive(Clone)]
pub struct InlineDescriptor {
    pub pattern: String,
    pub title: String,
    pub description: String,
    pub handler: Handler,
}

#[derive(Clone)]
pub enum HandlerDescriptor {
    Command(CommandDescriptor),
    Watcher(WatcherDescriptor),
    Callback(CallbackDescriptor),
    InlineQuery(InlineDescriptor),
}

impl HandlerDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerDescriptor::Command(_) => "command",
            HandlerDescriptor::Watcher(_) => "watcher",
            HandlerDescriptor::Callback(_) => "callback",
            HandlerDescriptor::InlineQuery(_) => "inline",
        }
    }
}

impl From<CommandDescriptor> for HandlerDescriptor {
    fn from(d: CommandDescriptor) -> Self {
        HandlerDescriptor::Command(d)
    }
}

impl From<WatcherDescriptor> for HandlerDescriptor {
    fn from(d: WatcherDescriptor) -> Self {
        HandlerDescriptor::Watcher(d)
    }
}

impl From<CallbackDescriptor> for HandlerDescriptor {
    fn from(d: CallbackDescriptor) -> Self {
        HandlerDescriptor::Callback(d)
    }
}

impl From<InlineDescriptor> for HandlerDescriptor {
    fn from(d: InlineDescriptor) -> Self {
        HandlerDescriptor::InlineQuery(d)
    }
}

// ─── Native modules ─────────────────────────────────────────────────────

/// What a native module can reach while registering and at call time.
#[derive(Clone)]
pub struct ModuleContext {
    pub name: String,
    pub store: Arc<Store>,
    pub registries: SharedRegistries,
    pub queue: QueueHandle,
    manager: Weak<ModuleManager>,
}

impl ModuleContext {
    pub(crate) fn new(
        name: &str,
        store: Arc<Store>,
        registries: SharedRegistries,
        queue: QueueHandle,
        manager: Weak<ModuleManager>,
    ) -> Self {
        Self {
            name: name.to_string(),
            store,
            registries,
            queue,
            manager,
        }
    }

    /// The owning manager. Fails only during shutdown.
    pub fn manager(&self) -> anyhow::Result<Arc<ModuleManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("module manager is shutting down"))
    }
}

/// A module compiled into the binary. Native modules are the trusted
/// system set and skip the code scanner.
pub trait NativeModule: Send + Sync {
    fn name(&self) -> &str;

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::default()
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError>;
}
