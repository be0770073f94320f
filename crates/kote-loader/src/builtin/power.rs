//! `on` / `off`: the kill-switch.

use kote_db::PermissionLevel;

use crate::dispatch::REENABLE_COMMAND;
use crate::error::LoaderError;
use crate::events::{handler, Reply};
use crate::handler::{CommandDescriptor, HandlerDescriptor, ModuleContext, NativeModule};
use crate::manifest::ModuleManifest;

pub struct PowerModule;

impl NativeModule for PowerModule {
    fn name(&self) -> &str {
        "power"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Turns command handling on and off.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        let store = ctx.store.clone();
        let on = handler(move |_| {
            let store = store.clone();
            async move {
                store.set_enabled(true).await?;
                tracing::info!("userbot enabled");
                Ok(Reply::from("✅ Userbot enabled"))
            }
        });

        let store = ctx.store.clone();
        let off = handler(move |_| {
            let store = store.clone();
            async move {
                store.set_enabled(false).await?;
                tracing::info!("userbot disabled");
                Ok(Reply::Text(format!(
                    "💤 Userbot disabled. Send {}{REENABLE_COMMAND} to wake it up.",
                    store.prefix()
                )))
            }
        });

        Ok(vec![
            CommandDescriptor::new(REENABLE_COMMAND, on)
                .doc("enable command handling")
                .min_level(PermissionLevel::Trusted)
                .incoming(true)
                .into(),
            CommandDescriptor::new("off", off)
                .doc("disable every command except on")
                .min_level(PermissionLevel::Trusted)
                .incoming(true)
                .into(),
        ])
    }
}
