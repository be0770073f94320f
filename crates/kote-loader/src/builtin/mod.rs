//! Built-in native modules.
//!
//! These make up the trusted system set: they are compiled into the
//! binary, never scanned, and loaded through the same lifecycle as
//! script modules.

use std::sync::Arc;

use kote_db::PermissionLevel;

use crate::events::Invocation;
use crate::handler::{ModuleContext, NativeModule};

pub mod admin;
pub mod aliases;
pub mod help;
pub mod menu;
pub mod modules;
pub mod power;

pub use admin::AdminModule;
pub use aliases::AliasesModule;
pub use help::HelpModule;
pub use menu::MenuModule;
pub use modules::ModulesModule;
pub use power::PowerModule;

/// Every built-in module, in load order.
pub fn all() -> Vec<Arc<dyn NativeModule>> {
    vec![
        Arc::new(PowerModule),
        Arc::new(ModulesModule),
        Arc::new(AliasesModule),
        Arc::new(AdminModule),
        Arc::new(HelpModule),
        Arc::new(MenuModule),
    ]
}

/// Usage line for a command that was called without its arguments.
pub(crate) fn usage(ctx: &ModuleContext, command: &str, args: &str) -> String {
    format!("ℹ️ Usage: {}{command} {args}", ctx.store.prefix())
}

/// Callbacks and inline queries bypass the command pipeline, so their
/// handlers check the caller themselves.
pub(crate) fn caller_is(ctx: &ModuleContext, inv: &Invocation, level: PermissionLevel) -> bool {
    ctx.store.user_level(inv.sender_id()) >= level
}
