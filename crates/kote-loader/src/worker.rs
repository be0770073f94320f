//! Command queue worker.
//!
//! Lifecycle requests arrive from two places with the same contract: a
//! JSON mailbox file polled on an interval (written by an out-of-process
//! control bot) and an in-process channel used by the menu surface.
//! After each request the list of loaded modules is written to the state
//! file.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LoaderError;
use crate::lifecycle::{LoadResult, ModuleManager};

/// Module name that expands to every discovered module.
pub const ALL_MODULES: &str = "all";

const QUEUE_CAPACITY: usize = 64;
/// Lower bound for the mailbox poll period; a zero period is not a valid tick.
const MIN_QUEUE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueCommand {
    Load,
    Unload,
    Reload,
}

impl QueueCommand {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "load" => Some(QueueCommand::Load),
            "unload" => Some(QueueCommand::Unload),
            "reload" => Some(QueueCommand::Reload),
            _ => None,
        }
    }
}

impl fmt::Display for QueueCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueCommand::Load => "load",
            QueueCommand::Unload => "unload",
            QueueCommand::Reload => "reload",
        };
        f.write_str(s)
    }
}

/// One lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub command: QueueCommand,
    pub module_name: String,
    /// Where the combined report goes.
    #[serde(default)]
    pub chat_id: Option<i64>,
}

// ─── Channel ────────────────────────────────────────────────────────────

/// Sending side of the in-process queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueRequest>,
}

pub type QueueReceiver = mpsc::Receiver<QueueRequest>;

impl QueueHandle {
    pub fn channel() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn submit(&self, request: QueueRequest) -> Result<(), LoaderError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| LoaderError::QueueClosed)
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────

pub struct CommandWorker {
    manager: Arc<ModuleManager>,
    receiver: QueueReceiver,
}

impl CommandWorker {
    pub fn new(manager: Arc<ModuleManager>, receiver: QueueReceiver) -> Self {
        Self { manager, receiver }
    }

    /// Load every discovered module, rebind aliases and write the state
    /// file.
    pub async fn startup(&self) -> Vec<LoadResult> {
        let mut results = Vec::new();
        for name in self.manager.discover() {
            let result = self.manager.load(&name, None).await;
            if result.is_error() {
                tracing::warn!(module = %name, error = %result.message, "startup load failed");
            }
            results.push(result);
        }
        match self.manager.aliases().reregister_all().await {
            Ok(bound) => tracing::info!(aliases = bound, "aliases bound"),
            Err(e) => tracing::error!(error = %e, "failed to bind aliases at startup"),
        }
        self.write_state().await;

        let loaded = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(loaded, total = results.len(), "startup load complete");
        results
    }

    /// Run one request, post the combined report and rewrite the state
    /// file.
    pub async fn process(&self, request: &QueueRequest) -> Vec<LoadResult> {
        tracing::info!(command = %request.command, module = %request.module_name, "queue request");

        let mut results = Vec::new();
        for name in self.targets(request).await {
            let result = match request.command {
                QueueCommand::Load => self.manager.load(&name, request.chat_id).await,
                QueueCommand::Unload => self.manager.unload(&name).await,
                QueueCommand::Reload => self.manager.reload(&name, request.chat_id).await,
            };
            results.push(result);
        }

        if let Some(chat_id) = request.chat_id {
            let report = render_report(request, &results);
            if let Err(e) = self
                .manager
                .dispatcher()
                .client()
                .send_message(chat_id, &report, None)
                .await
            {
                tracing::warn!(chat_id, error = %e, "failed to post queue report");
            }
        }
        self.write_state().await;
        results
    }

    async fn targets(&self, request: &QueueRequest) -> Vec<String> {
        let name = request.module_name.trim();
        if !name.eq_ignore_ascii_case(ALL_MODULES) {
            return vec![name.to_string()];
        }
        let discovered = self.manager.discover();
        match request.command {
            // Unloading the built-ins would leave nothing to load them back with.
            QueueCommand::Unload => discovered
                .into_iter()
                .filter(|n| !self.manager.is_builtin(n))
                .collect(),
            _ => discovered,
        }
    }

    /// Process the mailbox file if present. The file is removed whether
    /// or not its content was valid.
    pub async fn poll_mailbox(&self) -> Option<Vec<LoadResult>> {
        let path = &self.manager.config().mailbox;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read mailbox");
                String::new()
            }
        };
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove mailbox");
        }

        match serde_json::from_str::<QueueRequest>(&content) {
            Ok(request) => Some(self.process(&request).await),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid mailbox request");
                None
            }
        }
    }

    async fn write_state(&self) {
        let loaded = self.manager.loaded_modules().await;
        let path = &self.manager.config().state_file;
        let result = async {
            let json = serde_json::to_string_pretty(&loaded)?;
            tokio::fs::write(path, json).await?;
            Ok::<_, LoaderError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write state file");
        }
    }

    /// Serve the channel and the mailbox until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.manager.config().queue_poll.max(MIN_QUEUE_POLL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            mailbox = %self.manager.config().mailbox.display(),
            "command worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.receiver.recv() => match request {
                    Some(request) => {
                        self.process(&request).await;
                    }
                    None => {
                        tracing::debug!("queue channel closed");
                        cancel.cancelled().await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.poll_mailbox().await;
                }
            }
        }
        tracing::info!("command worker stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

/// One message summarising every result of a request.
pub fn render_report(request: &QueueRequest, results: &[LoadResult]) -> String {
    let mut report = format!("📋 {} {}", request.command, request.module_name);
    if results.is_empty() {
        report.push_str("\nNothing to do.");
    }
    for result in results {
        report.push('\n');
        report.push_str(&result.to_string());
    }
    report
}
