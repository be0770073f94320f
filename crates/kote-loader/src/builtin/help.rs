//! `help`: commands grouped by module.

use std::collections::BTreeMap;

use crate::error::LoaderError;
use crate::events::{handler, Invocation, Reply};
use crate::handler::{CommandDescriptor, HandlerDescriptor, ModuleContext, NativeModule};
use crate::manifest::ModuleManifest;
use crate::registry::{CommandEntry, RegistrySet};

pub struct HelpModule;

impl NativeModule for HelpModule {
    fn name(&self) -> &str {
        "help"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            description: "Lists available commands.".into(),
            ..Default::default()
        }
    }

    fn register(&self, ctx: &ModuleContext) -> Result<Vec<HandlerDescriptor>, LoaderError> {
        let ctx = ctx.clone();
        let help = handler(move |inv: Invocation| {
            let ctx = ctx.clone();
            async move {
                let prefix = ctx.store.prefix();
                let registries = ctx.registries.read().await;
                let text = match inv.args() {
                    Some(module) => render_module(&registries, &prefix, module),
                    None => render_overview(&registries, &prefix),
                };
                Ok(Reply::Text(text))
            }
        });

        Ok(vec![CommandDescriptor::new("help", help)
            .doc("list commands, or one module's commands")
            .into()])
    }
}

/// Every module with its commands on one line; aliases are starred.
pub fn render_overview(registries: &RegistrySet, prefix: &str) -> String {
    let mut by_module: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, entries) in registries.commands() {
        for entry in entries {
            let label = if entry.is_alias {
                format!("{prefix}{name}*")
            } else {
                format!("{prefix}{name}")
            };
            by_module.entry(entry.module.as_str()).or_default().push(label);
        }
    }

    if by_module.is_empty() {
        return "ℹ️ No commands available".to_string();
    }
    let mut out = String::from("📖 Commands:");
    for (module, commands) in by_module {
        out.push_str(&format!("\n<b>{module}</b>: {}", commands.join(", ")));
    }
    out.push_str("\n\n* alias");
    out
}

pub fn render_module(registries: &RegistrySet, prefix: &str, module: &str) -> String {
    let commands = registries.module_commands(module);
    if commands.is_empty() {
        return format!("ℹ️ No commands from {module}");
    }
    let mut out = format!("📖 <b>{module}</b>:");
    for (name, CommandEntry { doc, is_alias, .. }) in commands {
        let marker = if is_alias { "*" } else { "" };
        if doc.is_empty() {
            out.push_str(&format!("\n• {prefix}{name}{marker}"));
        } else {
            out.push_str(&format!("\n• {prefix}{name}{marker}: {doc}"));
        }
    }
    out
}
