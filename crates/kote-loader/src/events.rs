//! Chat events and the handler contract.
//!
//! Every handler, whether it lives in a script or in a native module, is
//! an async function from an [`Invocation`] to a [`Reply`]. The runtime
//! delivers the reply; handlers only need the client for anything beyond
//! a single answer.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::runtime::ChatClient;

// ─── Incoming events ────────────────────────────────────────────────────

/// A chat message, either sent by the account itself (`outgoing`) or
/// received from someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub outgoing: bool,
}

impl Message {
    /// A message typed by the account owner.
    pub fn outgoing(chat_id: i64, sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            id: 0,
            chat_id,
            sender_id,
            text: text.into(),
            outgoing: true,
        }
    }

    /// A message received from another user.
    pub fn incoming(chat_id: i64, sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            id: 0,
            chat_id,
            sender_id,
            text: text.into(),
            outgoing: false,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }
}

/// A button press on a menu rendered by the companion bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub chat_id: i64,
    pub sender_id: i64,
    pub message_id: i64,
    pub data: String,
}

/// An inline query typed into the companion bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub sender_id: i64,
    pub query: String,
}

/// One inline-query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineArticle {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Message),
    Callback(CallbackQuery),
    Inline(InlineQuery),
}

impl Event {
    pub fn sender_id(&self) -> i64 {
        match self {
            Event::Message(m) => m.sender_id,
            Event::Callback(q) => q.sender_id,
            Event::Inline(q) => q.sender_id,
        }
    }

    /// Chat the event belongs to. Inline queries have none.
    pub fn chat_id(&self) -> Option<i64> {
        match self {
            Event::Message(m) => Some(m.chat_id),
            Event::Callback(q) => Some(q.chat_id),
            Event::Inline(_) => None,
        }
    }

    /// The text the handler pattern was matched against.
    pub fn text(&self) -> &str {
        match self {
            Event::Message(m) => &m.text,
            Event::Callback(q) => &q.data,
            Event::Inline(q) => &q.query,
        }
    }
}

// ─── Handler contract ───────────────────────────────────────────────────

/// What a handler wants sent back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reply {
    #[default]
    None,
    Text(String),
    Articles(Vec<InlineArticle>),
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

/// One call of a handler.
#[derive(Clone)]
pub struct Invocation {
    pub event: Event,
    /// Capture groups of the matched pattern, group 1 onwards.
    pub captures: Vec<Option<String>>,
    pub client: Arc<dyn ChatClient>,
}

impl Invocation {
    /// Command arguments: the first capture, trimmed, if non-empty.
    pub fn args(&self) -> Option<&str> {
        self.captures
            .first()
            .and_then(|c| c.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).and_then(|c| c.as_deref())
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.event {
            Event::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn sender_id(&self) -> i64 {
        self.event.sender_id()
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Reply>>;

/// Type-erased handler shared between registries and subscriptions.
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(f(invocation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RecordingClient;

    fn invocation(captures: Vec<Option<String>>) -> Invocation {
        Invocation {
            event: Event::Message(Message::outgoing(1, 2, ".echo hi")),
            captures,
            client: Arc::new(RecordingClient::default()),
        }
    }

    #[test]
    fn test_args_trims_first_capture() {
        let inv = invocation(vec![Some("  hello world ".into())]);
        assert_eq!(inv.args(), Some("hello world"));
    }

    #[test]
    fn test_args_empty_or_missing() {
        assert_eq!(invocation(vec![]).args(), None);
        assert_eq!(invocation(vec![None]).args(), None);
        assert_eq!(invocation(vec![Some("   ".into())]).args(), None);
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::Callback(CallbackQuery {
            id: "q1".into(),
            chat_id: 10,
            sender_id: 20,
            message_id: 30,
            data: "mod:load:ping".into(),
        });
        assert_eq!(event.sender_id(), 20);
        assert_eq!(event.chat_id(), Some(10));
        assert_eq!(event.text(), "mod:load:ping");

        let inline = Event::Inline(InlineQuery {
            id: "i1".into(),
            sender_id: 5,
            query: "module:ping".into(),
        });
        assert_eq!(inline.chat_id(), None);
    }

    #[test]
    fn test_reply_from_str() {
        assert_eq!(Reply::from("ok"), Reply::Text("ok".into()));
        assert_eq!(Reply::default(), Reply::None);
    }

    #[tokio::test]
    async fn test_handler_boxes_closure() {
        let h = handler(|inv: Invocation| async move {
            Ok(Reply::Text(format!("sender {}", inv.sender_id())))
        });
        let reply = h(invocation(vec![])).await.unwrap();
        assert_eq!(reply, Reply::Text("sender 2".into()));
    }
}
