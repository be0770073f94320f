//! `alias`, `unalias`, `aliases` and the ambiguous-alias chooser.

use kote_db::PermissionLevel;

use crate::aliases::{AliasChooser, AliasOutcome};
use crate::builtin::{caller_is, usage};
use crate::error::LoaderError;
use crate::events::{handler, Handler, Invocation, Reply};
use crate::handler::{
    CallbackDescriptor, CommandDescriptor, HandlerDescriptor, ModuleContext, NativeModule,
};
use crate::manifest::ModuleManifest;

/// Callback data prefix of the chooser buttons.
pub const CHOICE_PREFIX: &str = "al_res:";
/// Chooser value that drops the pending alias.
pub const CHOICE_CANCEL: &str = "cancel";

pub struct AliasesModule;

impl NativeModule for AliasesModule {
    fn name(&self) -> &str {
        "aliases"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Manages command aliases.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        Ok(vec![
            CommandDescriptor::new("alias", create(ctx))
                .doc("create an alias: alias <name> <command>")
                .min_level(PermissionLevel::Owner)
                .incoming(true)
                .into(),
            CommandDescriptor::new("unalias", remove(ctx))
                .doc("remove an alias")
                .min_level(PermissionLevel::Owner)
                .incoming(true)
                .into(),
            CommandDescriptor::new("aliases", list(ctx))
                .doc("list aliases")
                .min_level(PermissionLevel::Owner)
                .incoming(true)
                .into(),
            CallbackDescriptor {
                pattern: format!("^{CHOICE_PREFIX}(.+)$"),
                handler: choose(ctx),
            }
            .into(),
        ])
    }
}

fn create(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let mut parts = inv.args().unwrap_or_default().split_whitespace();
            let (Some(alias), Some(command)) = (parts.next(), parts.next()) else {
                return Ok(Reply::Text(usage(&ctx, "alias", "<alias> <command>")));
            };
            let command = command.trim_start_matches(ctx.store.prefix().as_str());

            let manager = ctx.manager()?;
            let outcome = manager
                .aliases()
                .create_alias(inv.sender_id(), alias, command, AliasChooser::Interactive)
                .await?;

            let mut text = outcome.to_string();
            if let AliasOutcome::NeedsChoice { modules, .. } = &outcome {
                text.push_str("\nChoose one:");
                for module in modules {
                    text.push_str(&format!("\n• {module} → {CHOICE_PREFIX}{module}"));
                }
                text.push_str(&format!("\n• cancel → {CHOICE_PREFIX}{CHOICE_CANCEL}"));
            }
            Ok(Reply::Text(text))
        }
    })
}

fn remove(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let Some(alias) = inv.args().map(str::to_string) else {
                return Ok(Reply::Text(usage(&ctx, "unalias", "<alias>")));
            };
            let manager = ctx.manager()?;
            if manager.aliases().remove_alias(&alias).await? {
                Ok(Reply::Text(format!("🗑 Alias {alias} removed")))
            } else {
                Ok(Reply::Text(format!("ℹ️ No alias named {alias}")))
            }
        }
    })
}

fn list(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |_| {
        let ctx = ctx.clone();
        async move {
            let aliases = ctx.store.aliases();
            if aliases.is_empty() {
                return Ok(Reply::from("ℹ️ No aliases defined"));
            }
            let prefix = ctx.store.prefix();
            let mut out = format!("🔗 Aliases ({}):", aliases.len());
            for record in aliases {
                out.push_str(&format!(
                    "\n• {prefix}{} → {prefix}{} ({})",
                    record.alias, record.real_command, record.module_name
                ));
            }
            Ok(Reply::Text(out))
        }
    })
}

fn choose(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            if !caller_is(&ctx, &inv, PermissionLevel::Owner) {
                return Ok(Reply::from("⛔ Owner only"));
            }
            let choice = inv
                .capture(0)
                .map(str::trim)
                .filter(|c| *c != CHOICE_CANCEL);
            let manager = ctx.manager()?;
            let outcome = manager
                .aliases()
                .resolve_pending(inv.sender_id(), choice)
                .await?;
            Ok(Reply::Text(outcome.to_string()))
        }
    })
}
