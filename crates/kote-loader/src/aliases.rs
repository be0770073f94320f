//! Command aliases.
//!
//! An alias is a persisted `(alias, real_command, module)` triple bound
//! live as an extra subscription that forwards to the module's guarded
//! command handler. Alias bindings belong to the module's table entry and
//! are rebuilt from the store after every reload.

use std::collections::HashMap;
use std::fmt;

use kote_db::AliasRecord;
use tokio::time::Instant;

use crate::error::LoaderError;
use crate::events::{handler, Handler, Invocation};
use crate::lifecycle::{command_pattern, AliasBinding, LoadedModule, ModuleManager};
use crate::registry::{CommandEntry, RegistrySet};
use crate::runtime::MessageFilter;

/// How an ambiguous real command is resolved to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasChooser {
    Module(String),
    /// Park the request and let the operator pick.
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasOutcome {
    Created {
        alias: String,
        command: String,
        module: String,
    },
    NeedsChoice {
        alias: String,
        command: String,
        modules: Vec<String>,
    },
    Refused(String),
}

impl fmt::Display for AliasOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasOutcome::Created {
                alias,
                command,
                module,
            } => write!(f, "✅ Alias {alias} → {command} ({module}) created"),
            AliasOutcome::NeedsChoice {
                command, modules, ..
            } => write!(
                f,
                "❓ {command} is provided by several modules: {}",
                modules.join(", ")
            ),
            AliasOutcome::Refused(reason) => write!(f, "🚫 {reason}"),
        }
    }
}

/// An ambiguous alias waiting for the operator's choice.
#[derive(Debug, Clone)]
pub struct PendingAlias {
    pub alias: String,
    pub command: String,
    pub modules: Vec<String>,
    pub expires_at: Instant,
}

pub struct AliasLayer<'a> {
    manager: &'a ModuleManager,
}

impl<'a> AliasLayer<'a> {
    pub(crate) fn new(manager: &'a ModuleManager) -> Self {
        Self { manager }
    }

    pub async fn create_alias(
        &self,
        operator: i64,
        alias: &str,
        command: &str,
        chooser: AliasChooser,
    ) -> Result<AliasOutcome, LoaderError> {
        let alias = alias.trim();
        let command = command.trim();
        if alias.is_empty() || alias.chars().any(char::is_whitespace) {
            return Ok(AliasOutcome::Refused(format!("invalid alias name '{alias}'")));
        }

        let providers = {
            let registries = self.manager.registries();
            let registries = registries.read().await;
            if registries.has_command(alias) {
                return Ok(AliasOutcome::Refused(format!(
                    "{alias} is already a command or alias"
                )));
            }
            registries.command_providers(command)
        };
        if self.manager.store().alias(alias).is_some() {
            return Ok(AliasOutcome::Refused(format!("alias {alias} already exists")));
        }

        if providers.is_empty() {
            return Ok(AliasOutcome::Refused(format!("unknown command {command}")));
        }
        let module = if providers.len() == 1 {
            providers[0].clone()
        } else {
            match chooser {
                AliasChooser::Module(module) if providers.contains(&module) => module,
                AliasChooser::Module(module) => {
                    return Ok(AliasOutcome::Refused(format!(
                        "module {module} does not provide {command}"
                    )));
                }
                AliasChooser::Interactive => {
                    let pending = PendingAlias {
                        alias: alias.to_string(),
                        command: command.to_string(),
                        modules: providers.clone(),
                        expires_at: Instant::now() + self.manager.config().alias_ttl,
                    };
                    self.pending().insert(operator, pending);
                    return Ok(AliasOutcome::NeedsChoice {
                        alias: alias.to_string(),
                        command: command.to_string(),
                        modules: providers,
                    });
                }
            }
        };

        let record = AliasRecord {
            alias: alias.to_string(),
            real_command: command.to_string(),
            module_name: module.clone(),
        };
        self.manager.store().add_alias(&record).await?;
        self.bind(&record).await?;
        tracing::info!(alias = %alias, command = %command, module = %module, "alias created");

        Ok(AliasOutcome::Created {
            alias: record.alias,
            command: record.real_command,
            module,
        })
    }

    /// Finish, cancel (`None`) or expire the operator's pending alias.
    pub async fn resolve_pending(
        &self,
        operator: i64,
        choice: Option<&str>,
    ) -> Result<AliasOutcome, LoaderError> {
        let Some(pending) = self.pending().remove(&operator) else {
            return Ok(AliasOutcome::Refused("no alias is waiting for a choice".into()));
        };
        if Instant::now() >= pending.expires_at {
            return Ok(AliasOutcome::Refused(format!(
                "choice for alias {} expired",
                pending.alias
            )));
        }
        let Some(module) = choice else {
            return Ok(AliasOutcome::Refused(format!(
                "alias {} cancelled",
                pending.alias
            )));
        };
        self.create_alias(
            operator,
            &pending.alias,
            &pending.command,
            AliasChooser::Module(module.to_string()),
        )
        .await
    }

    pub fn pending_for(&self, operator: i64) -> Option<PendingAlias> {
        self.pending().get(&operator).cloned()
    }

    /// Delete an alias and its live binding. Returns whether it existed.
    pub async fn remove_alias(&self, alias: &str) -> Result<bool, LoaderError> {
        let record = self.manager.store().alias(alias);
        let removed = self.manager.store().remove_alias(alias).await?;

        let mut loaded = self.manager.loaded.write().await;
        let registries = self.manager.registries();
        let mut registries = registries.write().await;
        if let Some(module) = record
            .as_ref()
            .and_then(|r| loaded.get_mut(&r.module_name))
        {
            let dispatcher = self.manager.dispatcher();
            module.alias_bindings.retain(|binding| {
                if binding.alias == alias {
                    dispatcher.unsubscribe(binding.subscription);
                    false
                } else {
                    true
                }
            });
        }
        registries.remove_alias_entry(alias);

        if removed {
            tracing::info!(alias = %alias, "alias removed");
        }
        Ok(removed)
    }

    /// Drop every live alias binding, then bind every persisted alias
    /// whose module is loaded. Returns how many were bound.
    pub async fn reregister_all(&self) -> Result<usize, LoaderError> {
        let mut loaded = self.manager.loaded.write().await;
        let registries = self.manager.registries();
        let mut registries = registries.write().await;

        registries.clear_aliases();
        for module in loaded.values_mut() {
            for binding in module.alias_bindings.drain(..) {
                self.manager.dispatcher().unsubscribe(binding.subscription);
            }
        }

        let mut bound = 0;
        for record in self.manager.store().aliases() {
            if self.bind_into(&mut loaded, &mut registries, &record)? {
                bound += 1;
            }
        }
        tracing::debug!(bound, "aliases rebound");
        Ok(bound)
    }

    async fn bind(&self, record: &AliasRecord) -> Result<bool, LoaderError> {
        let mut loaded = self.manager.loaded.write().await;
        let registries = self.manager.registries();
        let mut registries = registries.write().await;
        self.bind_into(&mut loaded, &mut registries, record)
    }

    fn bind_into(
        &self,
        loaded: &mut HashMap<String, LoadedModule>,
        registries: &mut RegistrySet,
        record: &AliasRecord,
    ) -> Result<bool, LoaderError> {
        let Some(module) = loaded.get_mut(&record.module_name) else {
            return Ok(false);
        };
        let Some(command) = module.command(&record.real_command).cloned() else {
            tracing::warn!(
                alias = %record.alias,
                command = %record.real_command,
                module = %record.module_name,
                "alias target no longer exists"
            );
            return Ok(false);
        };

        let prefix = self.manager.prefix();
        let pattern = command_pattern(&prefix, &record.alias)?;
        let subscription = self.manager.dispatcher().subscribe(
            passthrough(&record.alias, command.handler),
            MessageFilter::new(command.incoming, true, Some(pattern)),
        );
        module.alias_bindings.push(AliasBinding {
            alias: record.alias.clone(),
            subscription,
        });
        registries.add_command(
            &record.alias,
            CommandEntry {
                module: record.module_name.clone(),
                doc: format!("alias for {prefix}{}", record.real_command),
                is_alias: true,
            },
        );
        Ok(true)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingAlias>> {
        self.manager
            .pending_aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Forward to the already-guarded command handler unchanged.
fn passthrough(alias: &str, inner: Handler) -> Handler {
    let alias = alias.to_string();
    handler(move |inv: Invocation| {
        tracing::trace!(alias = %alias, "alias invoked");
        inner(inv)
    })
}
