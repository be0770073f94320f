//! Terminal stand-in for the chat platform.
//!
//! Outbound actions are printed to stdout; each stdin line becomes an
//! event typed by the owner:
//!
//! - `cb <data>` presses a callback button;
//! - `iq <query>` runs an inline query;
//! - anything else is an outgoing message.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kote_loader::{
    CallbackQuery, ChatClient, Dispatcher, InlineArticle, InlineQuery, LoaderError, Message,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Chat id used for everything typed into the console.
pub const CONSOLE_CHAT: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Message(String),
    Callback(String),
    Inline(String),
}

impl ConsoleInput {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        if let Some(data) = line.strip_prefix("cb ") {
            return Some(ConsoleInput::Callback(data.trim().to_string()));
        }
        if let Some(query) = line.strip_prefix("iq ") {
            return Some(ConsoleInput::Inline(query.trim().to_string()));
        }
        Some(ConsoleInput::Message(line.to_string()))
    }
}

pub struct ConsoleClient {
    out: Mutex<tokio::io::Stdout>,
    next_id: AtomicI64,
}

impl ConsoleClient {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn next_message_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn print(&self, text: &str) -> Result<(), LoaderError> {
        let mut out = self.out.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

impl Default for ConsoleClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for ConsoleClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, LoaderError> {
        let id = self.next_message_id();
        let header = match reply_to {
            Some(to) => format!("── [{chat_id}] #{id} ↩ #{to}"),
            None => format!("── [{chat_id}] #{id}"),
        };
        self.print(&format!("{header}\n{text}")).await?;
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), LoaderError> {
        self.print(&format!("── [{chat_id}] #{message_id} (edited)\n{text}"))
            .await
    }

    async fn answer_callback(&self, query_id: &str, text: &str) -> Result<(), LoaderError> {
        self.print(&format!("── callback {query_id}: {text}")).await
    }

    async fn answer_inline(
        &self,
        query_id: &str,
        articles: &[InlineArticle],
    ) -> Result<(), LoaderError> {
        let mut out = format!("── inline {query_id}: {} result(s)", articles.len());
        for article in articles {
            out.push_str(&format!("\n[{}] {}\n{}", article.title, article.description, article.text));
        }
        self.print(&out).await
    }
}

/// Feed stdin lines into the dispatcher until EOF or cancellation.
pub async fn run(
    client: Arc<ConsoleClient>,
    dispatcher: Arc<Dispatcher>,
    owner_id: i64,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("console input closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read console input");
                break;
            }
        };

        let Some(input) = ConsoleInput::parse(&line) else {
            continue;
        };
        let id = client.next_message_id();
        match input {
            ConsoleInput::Message(text) => {
                let message = Message::outgoing(CONSOLE_CHAT, owner_id, text).with_id(id);
                if dispatcher.deliver_message(message).await == 0 {
                    tracing::debug!("no handler matched");
                }
            }
            ConsoleInput::Callback(data) => {
                let query = CallbackQuery {
                    id: format!("cb-{id}"),
                    chat_id: CONSOLE_CHAT,
                    sender_id: owner_id,
                    message_id: id,
                    data,
                };
                if !dispatcher.deliver_callback(query).await {
                    tracing::info!("no callback handler matched");
                }
            }
            ConsoleInput::Inline(query) => {
                let query = InlineQuery {
                    id: format!("iq-{id}"),
                    sender_id: owner_id,
                    query,
                };
                if !dispatcher.deliver_inline(query).await {
                    tracing::info!("no inline handler matched");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_console_input() {
        assert_eq!(ConsoleInput::parse("  \n"), None);
        assert_eq!(
            ConsoleInput::parse(".ping\n"),
            Some(ConsoleInput::Message(".ping".into()))
        );
        assert_eq!(
            ConsoleInput::parse("cb mod:reload:ping"),
            Some(ConsoleInput::Callback("mod:reload:ping".into()))
        );
        assert_eq!(
            ConsoleInput::parse("iq module:help"),
            Some(ConsoleInput::Inline("module:help".into()))
        );
    }
}
