//! Conversation session: one user's chat history and the in-flight guard.
//!
//! A session is either [`SessionState::Idle`] or
//! [`SessionState::AwaitingReply`]. `submit` appends the user turn and
//! waits for the chat service; a second `submit` while one is in flight
//! fails with [`Error::SessionBusy`].
//!
//! If the completion fails, times out, or the `submit` future is dropped,
//! the pending user turn is taken back out so the history is exactly what
//! it was before. On failure the prompt is handed back inside
//! [`Error::Completion`] for the caller to retry.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::chat::{ChatService, ModelParams};
use crate::error::{Error, Result};
use crate::models::ConversationTurn;
use crate::scope::RetrievalScope;

static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)source:[ \t]*[^\n]+?:[ \t]*page[ \t]+\d+").expect("valid citation regex")
});

/// Wrap every `Source: <title>: page <n>` citation in `*emphasis*`.
pub fn highlight_citations(text: &str) -> String {
    CITATION_RE.replace_all(text, "*${0}*").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingReply,
}

struct Inner {
    turns: Vec<ConversationTurn>,
    state: SessionState,
}

pub struct Session {
    namespace: String,
    chat: Arc<dyn ChatService>,
    params: ModelParams,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl Session {
    /// A fresh, idle session retrieving from `namespace`.
    pub fn new(
        namespace: impl Into<String>,
        chat: Arc<dyn ChatService>,
        params: ModelParams,
        timeout: Duration,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            chat,
            params,
            timeout,
            inner: Mutex::new(Inner {
                turns: Vec::new(),
                state: SessionState::Idle,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Snapshot of the conversation so far.
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.lock().turns.clone()
    }

    /// Forget the conversation. Rejected while a reply is in flight.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == SessionState::AwaitingReply {
            return Err(Error::SessionBusy);
        }
        inner.turns.clear();
        Ok(())
    }

    /// Send `text` as the next user turn and wait for the assistant reply.
    ///
    /// Returns the appended assistant turn, with citations highlighted.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        scope: &RetrievalScope,
    ) -> Result<ConversationTurn> {
        let prompt = text.into();
        let history = {
            let mut inner = self.lock();
            if inner.state == SessionState::AwaitingReply {
                return Err(Error::SessionBusy);
            }
            inner.turns.push(ConversationTurn::user(prompt.clone()));
            inner.state = SessionState::AwaitingReply;
            inner.turns.clone()
        };
        let pending = PendingTurn {
            session: self,
            settled: false,
        };

        let reply = tokio::time::timeout(
            self.timeout,
            self.chat
                .chat(&self.namespace, &history, scope, &self.params),
        )
        .await;

        let reason = match reply {
            Ok(Ok(content)) => {
                let turn = ConversationTurn::assistant(highlight_citations(&content));
                pending.settle(Some(turn.clone()));
                debug!(namespace = %self.namespace, turns = history.len() + 1, "reply appended");
                return Ok(turn);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("no reply within {}s", self.timeout.as_secs_f64()),
        };

        pending.settle(None);
        warn!(namespace = %self.namespace, %reason, "completion failed; conversation unchanged");
        Err(Error::Completion { prompt, reason })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The user turn appended by an in-flight `submit`.
///
/// Dropped unsettled (the future was cancelled) it rolls the turn back.
struct PendingTurn<'a> {
    session: &'a Session,
    settled: bool,
}

impl PendingTurn<'_> {
    fn settle(mut self, reply: Option<ConversationTurn>) {
        self.settled = true;
        let mut inner = self.session.lock();
        match reply {
            Some(turn) => inner.turns.push(turn),
            None => {
                inner.turns.pop();
            }
        }
        inner.state = SessionState::Idle;
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.session.lock();
        inner.turns.pop();
        inner.state = SessionState::Idle;
    }
}
