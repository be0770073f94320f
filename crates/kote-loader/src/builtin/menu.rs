//! Companion-bot menu: lifecycle buttons and the inline module card.
//!
//! Button presses are queued through the command worker rather than run
//! inline, so a menu can reload the module that drew it.

use kote_db::PermissionLevel;

use crate::builtin::caller_is;
use crate::error::LoaderError;
use crate::events::{handler, Handler, InlineArticle, Invocation, Reply};
use crate::handler::{
    CallbackDescriptor, HandlerDescriptor, InlineDescriptor, ModuleContext, NativeModule,
};
use crate::manifest::ModuleManifest;
use crate::worker::{QueueCommand, QueueRequest};

pub struct MenuModule;

impl NativeModule for MenuModule {
    fn name(&self) -> &str {
        "menu"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Module buttons and inline module cards.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        Ok(vec![
            CallbackDescriptor {
                pattern: "^mod:(load|unload|reload):(.+)$".into(),
                handler: lifecycle_button(ctx),
            }
            .into(),
            InlineDescriptor {
                pattern: "^module:(.+)$".into(),
                title: "Module card".into(),
                description: "Show a loaded module's manifest".into(),
                handler: module_card(ctx),
            }
            .into(),
        ])
    }
}

fn lifecycle_button(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            if !caller_is(&ctx, &inv, PermissionLevel::Owner) {
                return Ok(Reply::from("⛔ Owner only"));
            }
            let (Some(command), Some(module)) = (
                inv.capture(0).and_then(QueueCommand::parse),
                inv.capture(1).map(str::trim),
            ) else {
                return Ok(Reply::from("Invalid button"));
            };

            ctx.queue
                .submit(QueueRequest {
                    command,
                    module_name: module.to_string(),
                    chat_id: inv.event.chat_id(),
                })
                .await?;
            tracing::info!(command = %command, module = %module, "menu request queued");
            Ok(Reply::Text(format!("⏳ Queued {command} of {module}")))
        }
    })
}

fn module_card(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let Some(name) = inv.capture(0).map(str::trim).filter(|n| !n.is_empty()) else {
                return Ok(Reply::None);
            };
            let manager = ctx.manager()?;
            let article = match manager.module_info(name).await {
                Some(manifest) => InlineArticle {
                    title: format!("📦 {name}"),
                    description: manifest.description.clone(),
                    text: manifest.render(name),
                },
                None => InlineArticle {
                    title: format!("{name} is not loaded"),
                    description: String::new(),
                    text: format!("ℹ️ {name} is not loaded"),
                },
            };
            Ok(Reply::Articles(vec![article]))
        }
    })
}
