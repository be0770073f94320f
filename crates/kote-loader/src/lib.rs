//! Kote module loader
//!
//! Dynamic module lifecycle for a chat userbot. Modules are Rhai scripts
//! dropped into a plugin directory (or native modules compiled into the
//! binary); each declares handlers through a `register()` function. The
//! loader scans untrusted source before running it, guards every command
//! behind a kill-switch and permission tiers, watches core files for
//! tampering, and serves lifecycle requests from chat, a menu and a
//! mailbox file.

pub mod aliases;
pub mod builtin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handler;
pub mod integrity;
pub mod lifecycle;
pub mod manifest;
pub mod registry;
pub mod runtime;
pub mod scanner;
pub mod script;
pub mod storage;
pub mod worker;

pub use aliases::{AliasChooser, AliasLayer, AliasOutcome, PendingAlias};
pub use config::{FileConfig, LoaderConfig};
pub use dispatch::{guard_command, AccessPolicy, REENABLE_COMMAND};
pub use error::{error_chain, LoaderError};
pub use events::{
    handler, CallbackQuery, Event, Handler, InlineArticle, InlineQuery, Invocation, Message, Reply,
};
pub use handler::{
    CallbackDescriptor, CommandDescriptor, HandlerDescriptor, InlineDescriptor, ModuleContext,
    NativeModule, WatcherDescriptor,
};
pub use integrity::{IntegrityMonitor, IntegrityStatus, TamperReason};
pub use lifecycle::{
    command_pattern, LoadResult, ModuleManager, ModuleManagerBuilder, ModuleUnit, ResultStatus,
    UnloadResult, BLOCKED_SUFFIX, MALWARE_SUFFIX,
};
pub use manifest::ModuleManifest;
pub use registry::{RegistrySet, SharedRegistries};
pub use runtime::{ChatClient, Dispatcher, MessageFilter, Outbound, RecordingClient, SubscriptionId};
pub use scanner::{scan, ScanLevel, ScanResult};
pub use script::{SandboxConfig, ScriptUnit, UnitCache};
pub use storage::ModuleStorage;
pub use worker::{CommandWorker, QueueCommand, QueueHandle, QueueReceiver, QueueRequest};
