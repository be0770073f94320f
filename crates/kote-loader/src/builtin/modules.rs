//! `load`, `unload`, `reload`, `modules`, `minfo`.

use std::future::Future;
use std::sync::Arc;

use kote_db::PermissionLevel;

use crate::builtin::usage;
use crate::error::LoaderError;
use crate::events::{handler, Handler, Invocation, Reply};
use crate::handler::{CommandDescriptor, HandlerDescriptor, ModuleContext, NativeModule};
use crate::lifecycle::{LoadResult, ModuleManager};
use crate::manifest::ModuleManifest;

pub struct ModulesModule;

impl NativeModule for ModulesModule {
    fn name(&self) -> &str {
        "modules"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Loads, unloads and inspects modules.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        let command = |name: &str, doc: &str, handler: Handler| -> HandlerDescriptor {
            CommandDescriptor::new(name, handler)
                .doc(doc)
                .min_level(PermissionLevel::Owner)
                .incoming(true)
                .into()
        };

        Ok(vec![
            command(
                "load",
                "load a module from the plugin directory",
                with_module(ctx, "load", |manager, name, chat| async move {
                    manager.load(&name, chat).await
                }),
            ),
            command(
                "unload",
                "unload a module",
                with_module(ctx, "unload", |manager, name, _| async move {
                    if manager.is_builtin(&name) {
                        return LoadResult::info(
                            &name,
                            "built-in modules cannot be unloaded from chat",
                        );
                    }
                    manager.unload(&name).await
                }),
            ),
            command(
                "reload",
                "reload a module from disk",
                with_module(ctx, "reload", |manager, name, chat| async move {
                    manager.reload(&name, chat).await
                }),
            ),
            command("modules", "list loaded modules", list_modules(ctx)),
            command("minfo", "show a module's manifest", module_info(ctx)),
        ])
    }
}

/// A handler taking one module name and running a lifecycle operation.
fn with_module<F, Fut>(ctx: &ModuleContext, command: &'static str, op: F) -> Handler
where
    F: Fn(Arc<ModuleManager>, String, Option<i64>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = LoadResult> + Send + 'static,
{
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        let op = op.clone();
        async move {
            let Some(name) = inv.args().map(str::to_string) else {
                return Ok(Reply::Text(usage(&ctx, command, "<module>")));
            };
            let manager = ctx.manager()?;
            let result = op(manager, name, inv.event.chat_id()).await;
            Ok(Reply::Text(render_result(&result)))
        }
    })
}

pub(crate) fn render_result(result: &LoadResult) -> String {
    let mut out = result.to_string();
    if let Some(detail) = &result.detail {
        out.push_str("\n\n");
        out.push_str(detail);
    }
    out
}

fn list_modules(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |_| {
        let ctx = ctx.clone();
        async move {
            let manager = ctx.manager()?;
            let names = manager.loaded_modules().await;
            let registries = ctx.registries.read().await;

            let mut out = format!("📦 Loaded modules ({}):", names.len());
            for name in &names {
                let commands: Vec<String> = registries
                    .module_commands(name)
                    .into_iter()
                    .filter(|(_, entry)| !entry.is_alias)
                    .map(|(command, _)| command)
                    .collect();
                if commands.is_empty() {
                    out.push_str(&format!("\n• {name}"));
                } else {
                    out.push_str(&format!("\n• {name}: {}", commands.join(", ")));
                }
            }
            Ok(Reply::Text(out))
        }
    })
}

fn module_info(ctx: &ModuleContext) -> Handler {
    let ctx = ctx.clone();
    handler(move |inv: Invocation| {
        let ctx = ctx.clone();
        async move {
            let Some(name) = inv.args().map(str::to_string) else {
                return Ok(Reply::Text(usage(&ctx, "minfo", "<module>")));
            };
            let manager = ctx.manager()?;
            let Some(manifest) = manager.module_info(&name).await else {
                return Ok(Reply::Text(format!("ℹ️ {name} is not loaded")));
            };

            let prefix = manager.prefix();
            let mut out = manifest.render(&name);
            if let Some(at) = manager.loaded_at(&name).await {
                out.push_str(&format!("\n\nloaded: {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
            }
            let registries = ctx.registries.read().await;
            let commands = registries.module_commands(&name);
            if !commands.is_empty() {
                out.push_str("\n\nCommands:");
                for (command, entry) in commands {
                    if entry.doc.is_empty() {
                        out.push_str(&format!("\n• {prefix}{command}"));
                    } else {
                        out.push_str(&format!("\n• {prefix}{command}: {}", entry.doc));
                    }
                }
            }
            Ok(Reply::Text(out))
        }
    })
}
