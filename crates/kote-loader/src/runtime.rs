//! Event runtime.
//!
//! An in-process stand-in for the chat client's update loop. Message
//! handlers are subscribed with a [`MessageFilter`]; callback and inline
//! queries are routed through the shared [`RegistrySet`]. Matching
//! handlers are collected under the lock and invoked after it is
//! released, so a handler may load or unload modules.
//!
//! [`RegistrySet`]: crate::registry::RegistrySet

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use regex::Regex;

use crate::error::LoaderError;
use crate::events::{
    CallbackQuery, Event, Handler, InlineArticle, InlineQuery, Invocation, Message, Reply,
};
use crate::registry::{captures_of, SharedRegistries};

// ─── Chat client ────────────────────────────────────────────────────────

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a message, optionally as a reply. Returns the new message id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, LoaderError>;

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str)
        -> Result<(), LoaderError>;

    async fn answer_callback(&self, query_id: &str, text: &str) -> Result<(), LoaderError>;

    async fn answer_inline(
        &self,
        query_id: &str,
        articles: &[InlineArticle],
    ) -> Result<(), LoaderError>;
}

/// Answer a message the way the account would: edit it when it is our
/// own, reply to it otherwise.
pub async fn respond(
    client: &dyn ChatClient,
    message: &Message,
    text: &str,
) -> Result<(), LoaderError> {
    if message.outgoing {
        client
            .edit_message(message.chat_id, message.id, text)
            .await
    } else {
        client
            .send_message(message.chat_id, text, Some(message.id))
            .await
            .map(|_| ())
    }
}

/// Everything a [`RecordingClient`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Sent {
        chat_id: i64,
        text: String,
        reply_to: Option<i64>,
    },
    Edited {
        chat_id: i64,
        message_id: i64,
        text: String,
    },
    CallbackAnswer {
        query_id: String,
        text: String,
    },
    InlineAnswer {
        query_id: String,
        articles: Vec<InlineArticle>,
    },
}

impl Outbound {
    pub fn text(&self) -> Option<&str> {
        match self {
            Outbound::Sent { text, .. }
            | Outbound::Edited { text, .. }
            | Outbound::CallbackAnswer { text, .. } => Some(text),
            Outbound::InlineAnswer { .. } => None,
        }
    }
}

/// Client that records every outbound action instead of talking to a
/// network. Used for headless runs and tests.
#[derive(Debug, Default)]
pub struct RecordingClient {
    log: Mutex<Vec<Outbound>>,
    next_id: AtomicU64,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn outbound(&self) -> Vec<Outbound> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.outbound()
            .iter()
            .filter_map(|o| o.text().map(str::to_string))
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, entry: Outbound) -> Result<(), LoaderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LoaderError::Client("client offline".into()));
        }
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }
}

#[async_trait]
impl ChatClient for RecordingClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, LoaderError> {
        self.record(Outbound::Sent {
            chat_id,
            text: text.to_string(),
            reply_to,
        })?;
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), LoaderError> {
        self.record(Outbound::Edited {
            chat_id,
            message_id,
            text: text.to_string(),
        })
    }

    async fn answer_callback(&self, query_id: &str, text: &str) -> Result<(), LoaderError> {
        self.record(Outbound::CallbackAnswer {
            query_id: query_id.to_string(),
            text: text.to_string(),
        })
    }

    async fn answer_inline(
        &self,
        query_id: &str,
        articles: &[InlineArticle],
    ) -> Result<(), LoaderError> {
        self.record(Outbound::InlineAnswer {
            query_id: query_id.to_string(),
            articles: articles.to_vec(),
        })
    }
}

// ─── Filters & subscriptions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which messages a subscription sees. With neither direction set, both
/// directions match.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub incoming: bool,
    pub outgoing: bool,
    pub pattern: Option<Regex>,
}

impl MessageFilter {
    pub fn new(incoming: bool, outgoing: bool, pattern: Option<Regex>) -> Self {
        Self {
            incoming,
            outgoing,
            pattern,
        }
    }

    /// Captures when `message` passes the filter, `None` otherwise.
    pub fn matches(&self, message: &Message) -> Option<Vec<Option<String>>> {
        let direction_ok = match (self.incoming, self.outgoing) {
            (false, false) => true,
            (incoming, outgoing) => {
                if message.outgoing {
                    outgoing
                } else {
                    incoming
                }
            }
        };
        if !direction_ok {
            return None;
        }
        match &self.pattern {
            Some(pattern) => captures_of(pattern, &message.text),
            None => Some(Vec::new()),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    filter: MessageFilter,
}

// ─── Dispatcher ─────────────────────────────────────────────────────────

pub struct Dispatcher {
    client: Arc<dyn ChatClient>,
    registries: SharedRegistries,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ChatClient>, registries: SharedRegistries) -> Self {
        Self {
            client,
            registries,
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> Arc<dyn ChatClient> {
        Arc::clone(&self.client)
    }

    pub fn registries(&self) -> SharedRegistries {
        Arc::clone(&self.registries)
    }

    pub fn subscribe(&self, handler: Handler, filter: MessageFilter) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription {
                id,
                handler,
                filter,
            });
        id
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|s| s.id == id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run every matching message handler in subscription order.
    /// Returns how many handlers were invoked.
    pub async fn deliver_message(&self, message: Message) -> usize {
        let matched: Vec<(Handler, Vec<Option<String>>)> = {
            let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter_map(|s| {
                    s.filter
                        .matches(&message)
                        .map(|caps| (Arc::clone(&s.handler), caps))
                })
                .collect()
        };

        let count = matched.len();
        for (handler, captures) in matched {
            let invocation = Invocation {
                event: Event::Message(message.clone()),
                captures,
                client: self.client(),
            };
            match invoke(&handler, invocation).await {
                Ok(Reply::Text(text)) => {
                    if let Err(e) = respond(self.client.as_ref(), &message, &text).await {
                        tracing::warn!(chat_id = message.chat_id, error = %e, "failed to deliver reply");
                    }
                }
                Ok(_) => {}
                Err(trace) => {
                    tracing::warn!(chat_id = message.chat_id, error = %trace, "message handler failed");
                }
            }
        }
        count
    }

    /// Route a button press to the first matching callback handler.
    pub async fn deliver_callback(&self, query: CallbackQuery) -> bool {
        let matched = self.registries.read().await.match_callback(&query.data);
        let Some((handler, captures)) = matched else {
            tracing::debug!(data = %query.data, "no callback handler matched");
            return false;
        };

        let invocation = Invocation {
            event: Event::Callback(query.clone()),
            captures,
            client: self.client(),
        };
        let answer = match invoke(&handler, invocation).await {
            Ok(Reply::Text(text)) => Some(text),
            Ok(_) => None,
            Err(trace) => {
                tracing::warn!(data = %query.data, error = %trace, "callback handler failed");
                Some("Error".to_string())
            }
        };
        if let Some(text) = answer {
            if let Err(e) = self.client.answer_callback(&query.id, &text).await {
                tracing::warn!(error = %e, "failed to answer callback");
            }
        }
        true
    }

    pub async fn deliver_inline(&self, query: InlineQuery) -> bool {
        let matched = self.registries.read().await.match_inline(&query.query);
        let Some((handler, captures)) = matched else {
            return false;
        };

        let invocation = Invocation {
            event: Event::Inline(query.clone()),
            captures,
            client: self.client(),
        };
        match invoke(&handler, invocation).await {
            Ok(Reply::Articles(articles)) => {
                if let Err(e) = self.client.answer_inline(&query.id, &articles).await {
                    tracing::warn!(error = %e, "failed to answer inline query");
                }
            }
            Ok(Reply::Text(text)) => {
                let article = InlineArticle {
                    title: text.clone(),
                    description: String::new(),
                    text,
                };
                if let Err(e) = self.client.answer_inline(&query.id, &[article]).await {
                    tracing::warn!(error = %e, "failed to answer inline query");
                }
            }
            Ok(Reply::None) => {}
            Err(trace) => {
                tracing::warn!(query = %query.query, error = %trace, "inline handler failed");
            }
        }
        true
    }
}

// ─── Guarded invocation ─────────────────────────────────────────────────

/// Invoke a handler, turning both `Err` results and panics into a
/// printable trace.
pub async fn invoke(handler: &Handler, invocation: Invocation) -> Result<Reply, String> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_message(payload.as_ref())),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(format!("{err:?}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("panicked: {message}")
}
