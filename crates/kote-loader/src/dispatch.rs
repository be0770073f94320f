//! Command dispatch pipeline.
//!
//! Every command handler is wrapped at registration time:
//!
//! 1. kill-switch: while the bot is disabled only `on` from an owner runs;
//! 2. permission: callers below the command's level are dropped;
//! 3. invoke, catching both errors and panics;
//! 4. report failures back into the chat, or to the log if that fails.
//!
//! Nothing a handler does can propagate into the event runtime.

use std::sync::Arc;

use kote_db::{PermissionLevel, Store};

use crate::events::{handler, Event, Handler, Invocation, Reply};
use crate::runtime::{invoke, respond};

/// The one command that runs while the kill-switch is engaged.
pub const REENABLE_COMMAND: &str = "on";

/// Where the pipeline reads caller levels and the kill-switch from.
pub trait AccessPolicy: Send + Sync {
    fn user_level(&self, user_id: i64) -> PermissionLevel;

    fn is_enabled(&self) -> bool;

    fn prefix(&self) -> String {
        ".".to_string()
    }
}

impl AccessPolicy for Store {
    fn user_level(&self, user_id: i64) -> PermissionLevel {
        Store::user_level(self, user_id)
    }

    fn is_enabled(&self) -> bool {
        Store::is_enabled(self)
    }

    fn prefix(&self) -> String {
        Store::prefix(self)
    }
}

/// Wrap `inner` in the dispatch pipeline for `command`.
pub fn guard_command(
    command: &str,
    min_level: PermissionLevel,
    inner: Handler,
    policy: Arc<dyn AccessPolicy>,
    denial_notice: bool,
) -> Handler {
    let command = command.to_string();
    handler(move |inv: Invocation| {
        let command = command.clone();
        let inner = Arc::clone(&inner);
        let policy = Arc::clone(&policy);
        async move {
            let sender = inv.sender_id();
            let level = policy.user_level(sender);

            if !policy.is_enabled()
                && !(command == REENABLE_COMMAND && level == PermissionLevel::Owner)
            {
                tracing::debug!(command = %command, sender, "kill-switch engaged, command dropped");
                return Ok(Reply::None);
            }

            if level < min_level {
                tracing::info!(
                    command = %command,
                    sender,
                    level = %level,
                    required = %min_level,
                    "permission denied"
                );
                if denial_notice {
                    if let Event::Message(message) = &inv.event {
                        let notice = format!(
                            "⛔ {}{command} requires {min_level} access",
                            policy.prefix()
                        );
                        if let Err(e) = respond(inv.client.as_ref(), message, &notice).await {
                            tracing::warn!(command = %command, error = %e, "failed to send denial notice");
                        }
                    }
                }
                return Ok(Reply::None);
            }

            match invoke(&inner, inv.clone()).await {
                Ok(reply) => Ok(reply),
                Err(trace) => {
                    report_failure(&inv, &policy.prefix(), &command, &trace).await;
                    Ok(Reply::None)
                }
            }
        }
    })
}

/// The chat message posted when a command fails.
pub fn failure_report(prefix: &str, command: &str, trace: &str) -> String {
    format!(
        "🚫 <b>Call</b> <code>{}{}</code> <b>failed!</b>\n\n🧾 <b>Logs:</b>\n<blockquote expandable>{}</blockquote>",
        escape_html(prefix),
        escape_html(command),
        escape_html(trace)
    )
}

async fn report_failure(inv: &Invocation, prefix: &str, command: &str, trace: &str) {
    tracing::warn!(command = %command, error = %trace, "command failed");

    let Event::Message(message) = &inv.event else {
        tracing::error!(command = %command, trace = %trace, "command failed outside a message");
        return;
    };
    let report = failure_report(prefix, command, trace);
    if let Err(e) = respond(inv.client.as_ref(), message, &report).await {
        tracing::error!(
            command = %command,
            trace = %trace,
            error = %e,
            "failed to deliver command failure report"
        );
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
