//! `trust`, `untrust`, `listtrust`, `prefix`, `setprefix`.

use kote_db::{PermissionLevel, SETTING_PREFIX};

use crate::builtin::usage;
use crate::error::LoaderError;
use crate::events::{handler, Handler, Invocation, Reply};
use crate::handler::{CommandDescriptor, HandlerDescriptor, ModuleContext, NativeModule};
use crate::manifest::ModuleManifest;

pub struct AdminModule;

impl NativeModule for AdminModule {
    fn name(&self) -> &str {
        "admin"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Manages trusted users and the command prefix.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        let command = |name: &str, doc: &str, level: PermissionLevel, handler: Handler| {
            HandlerDescriptor::from(
                CommandDescriptor::new(name, handler)
                    .doc(doc)
                    .min_level(level)
                    .incoming(true),
            )
        };

        Ok(vec![
            command("trust", "grant a user trusted access", PermissionLevel::Owner, trust(ctx)),
            command("untrust", "revoke trusted access", PermissionLevel::Owner, untrust(ctx)),
            command("listtrust", "list trusted users", PermissionLevel::Trusted, list_trusted(ctx)),
            command("prefix", "show the command prefix", PermissionLevel::Trusted, show_prefix(ctx)),
            command(
                "setprefix",
                "change the command prefix and rebind every module",
                PermissionLevel::Owner,
                set_prefix(ctx),
            ),
        ])
    }
}

/// The user id argument, or the usage line to reply with.
fn user_arg(ctx: &ModuleContext, inv: &Invocation, command: &str) -> Result<i64, String> {
    inv.args()
        .and_then(|a| a.trim().parse().ok())
        .ok_or_else(|| usage(ctx, command, "<user id>"))
}

fn trust(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let user_id = match user_arg(&ctx, &inv, "trust") {
                Ok(id) => id,
                Err(usage) => return Ok(Reply::Text(usage)),
            };
            if ctx.store.user_level(user_id) == PermissionLevel::Owner {
                return Ok(Reply::from("⛔ The owner cannot be demoted"));
            }
            ctx.store
                .set_user_level(user_id, PermissionLevel::Trusted)
                .await?;
            tracing::info!(user_id, "user trusted");
            Ok(Reply::Text(format!("✅ User {user_id} is now trusted")))
        }
    })
}

fn untrust(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let user_id = match user_arg(&ctx, &inv, "untrust") {
                Ok(id) => id,
                Err(usage) => return Ok(Reply::Text(usage)),
            };
            match ctx.store.user_level(user_id) {
                PermissionLevel::Owner => Ok(Reply::from("⛔ The owner cannot be demoted")),
                PermissionLevel::User => {
                    Ok(Reply::Text(format!("ℹ️ User {user_id} is not trusted")))
                }
                PermissionLevel::Trusted => {
                    ctx.store.remove_user(user_id).await?;
                    tracing::info!(user_id, "user untrusted");
                    Ok(Reply::Text(format!("🗑 User {user_id} is no longer trusted")))
                }
            }
        }
    })
}

fn list_trusted(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |_| {
        let ctx = ctx.clone();
        async move {
            let users = ctx.store.users_by_level(PermissionLevel::Trusted);
            if users.is_empty() {
                return Ok(Reply::from("ℹ️ No trusted users"));
            }
            let mut out = format!("👥 Trusted users ({}):", users.len());
            for user in users {
                out.push_str(&format!("\n• {user}"));
            }
            Ok(Reply::Text(out))
        }
    })
}

fn show_prefix(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |_| {
        let ctx = ctx.clone();
        async move {
            let prefix = ctx.manager()?.prefix();
            Ok(Reply::Text(format!(
                "ℹ️ Current prefix: {prefix}\nChange it with {prefix}setprefix <prefix>"
            )))
        }
    })
}

/// Store the new prefix, then reload every loaded module so command
/// and alias patterns are rebuilt with it.
fn set_prefix(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let Some(prefix) = inv.args().map(str::trim).filter(|p| !p.is_empty()) else {
                return Ok(Reply::Text(usage(&ctx, "setprefix", "<prefix>")));
            };
            if prefix.chars().any(char::is_whitespace) {
                return Ok(Reply::from("❌ The prefix cannot contain spaces"));
            }
            let prefix = prefix.to_string();

            let manager = ctx.manager()?;
            ctx.store.set_setting(SETTING_PREFIX, &prefix).await?;
            tracing::info!(prefix = %prefix, "command prefix changed");

            let mut failed = Vec::new();
            for name in manager.loaded_modules().await {
                let result = manager.reload(&name, None).await;
                if result.is_error() {
                    failed.push(result.to_string());
                }
            }

            let mut out = format!("✅ Prefix changed to {prefix}");
            if !failed.is_empty() {
                out.push_str("\n\nSome modules failed to reload:");
                for line in failed {
                    out.push_str(&format!("\n{line}"));
                }
            }
            Ok(Reply::Text(out))
        }
    })
}
