//! Client-side conversation state.
//!
//! The store appends the user's turn as soon as it is submitted, then appends
//! either the assistant's reply or an apology once the relay call settles.
//! Only one submission may be in flight at a time.

use crate::client::ClientError;
use crate::protocol::RelayRequest;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const GREETING: &str = "Hi! Ask me anything.";
pub const APOLOGY: &str = "Sorry, I hit an error reaching the backend. Please try again.";
const EMPTY_REPLY: &str = "[No response]";
const FALLBACK_ERROR: &str = "Request failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    /// `None` when `content` is blank; a turn never holds empty text.
    pub fn new(role: Role, content: impl Into<String>) -> Option<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return None;
        }
        Some(Self { role, content })
    }

    fn assistant_reply(reply: String) -> Self {
        Self::new(Role::Assistant, reply).unwrap_or_else(|| Self {
            role: Role::Assistant,
            content: EMPTY_REPLY.to_string(),
        })
    }

    fn fixed(role: Role, content: &'static str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Sends one user turn to the relay and yields the reply text.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, request: &RelayRequest) -> Result<String, ClientError>;
}

#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub session_id: Option<String>,
    pub turns: Vec<Turn>,
    pub busy: bool,
    pub error: Option<String>,
    /// Failed submissions since the last reset.
    pub failures: u64,
    /// Bumped on every reset.
    pub epoch: u64,
}

struct ChatState {
    session_id: Option<String>,
    turns: Vec<Turn>,
    busy: bool,
    error: Option<String>,
    failures: u64,
    epoch: u64,
}

pub struct Conversation<T> {
    transport: T,
    state: Mutex<ChatState>,
}

// Clears `busy` however `submit` exits, including when its future is dropped.
struct BusyGuard<'a> {
    state: &'a Mutex<ChatState>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).busy = false;
    }
}

fn lock(state: &Mutex<ChatState>) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: RelayTransport> Conversation<T> {
    /// A `session_id` switches the store to session-scoped requests.
    pub fn new(transport: T, session_id: Option<String>) -> Self {
        Self {
            transport,
            state: Mutex::new(ChatState {
                session_id,
                turns: vec![Turn::fixed(Role::Assistant, GREETING)],
                busy: false,
                error: None,
                failures: 0,
                epoch: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let state = lock(&self.state);
        ChatSnapshot {
            session_id: state.session_id.clone(),
            turns: state.turns.clone(),
            busy: state.busy,
            error: state.error.clone(),
            failures: state.failures,
            epoch: state.epoch,
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    /// Returns `false` without touching any state when `text` is blank or
    /// another submission is still in flight.
    pub async fn submit(&self, text: &str) -> bool {
        let text = text.trim();
        let Some(turn) = Turn::new(Role::User, text) else {
            return false;
        };
        let (request, epoch) = {
            let mut state = lock(&self.state);
            if state.busy {
                return false;
            }
            state.busy = true;
            state.error = None;
            state.turns.push(turn);
            (
                RelayRequest::new(state.session_id.clone(), text),
                state.epoch,
            )
        };
        let _busy = BusyGuard { state: &self.state };

        let outcome = self.transport.send(&request).await;

        {
            let mut state = lock(&self.state);
            if state.epoch != epoch {
                tracing::debug!("conversation reset while in flight; dropping reply");
            } else {
                match outcome {
                    Ok(reply) => state.turns.push(Turn::assistant_reply(reply)),
                    Err(err) => {
                        let message = err.to_string();
                        state.error = Some(if message.is_empty() {
                            FALLBACK_ERROR.to_string()
                        } else {
                            message
                        });
                        state.failures += 1;
                        state.turns.push(Turn::fixed(Role::Assistant, APOLOGY));
                    }
                }
            }
        }
        true
    }

    /// Start over with only the greeting, optionally under a new session id.
    pub fn reset(&self, session_id: Option<String>) {
        let mut state = lock(&self.state);
        state.session_id = session_id;
        state.turns = vec![Turn::fixed(Role::Assistant, GREETING)];
        state.error = None;
        state.failures = 0;
        state.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Replays queued outcomes in order and records each request.
    #[derive(Default)]
    struct QueuedTransport {
        replies: Mutex<VecDeque<Result<String, ClientError>>>,
        requests: Mutex<Vec<RelayRequest>>,
    }

    impl QueuedTransport {
        fn with(replies: Vec<Result<String, ClientError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RelayTransport for QueuedTransport {
        async fn send(&self, request: &RelayRequest) -> Result<String, ClientError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ClientError::InvalidResponse))
        }
    }

    /// Holds every call open until the test releases it.
    #[derive(Default)]
    struct GatedTransport {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
        requests: Mutex<Vec<RelayRequest>>,
    }

    #[async_trait]
    impl RelayTransport for GatedTransport {
        async fn send(&self, request: &RelayRequest) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.entered.notify_one();
            self.release.notified().await;
            Ok("released".to_string())
        }
    }

    fn proxy_error() -> ClientError {
        ClientError::Proxy {
            status: 502,
            message: "Backend error (500): oops".to_string(),
        }
    }

    fn roles(snapshot: &ChatSnapshot) -> Vec<Role> {
        snapshot.turns.iter().map(Turn::role).collect()
    }

    #[test]
    fn blank_turns_are_never_built() {
        assert!(Turn::new(Role::User, "").is_none());
        assert!(Turn::new(Role::Assistant, " \n\t ").is_none());
        assert_eq!(Turn::new(Role::User, "hi").unwrap().content(), "hi");
    }

    #[tokio::test]
    async fn successful_submissions_alternate_in_order() {
        let replies = (0..3).map(|i| Ok(format!("reply {i}"))).collect();
        let conversation = Conversation::new(QueuedTransport::with(replies), None);

        for i in 0..3 {
            assert!(conversation.submit(&format!("  question {i} ")).await);
        }

        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.turns[0].content(), GREETING);
        let turns = &snapshot.turns[1..];
        assert_eq!(turns.len(), 6);
        for (i, pair) in turns.chunks(2).enumerate() {
            assert_eq!(pair[0].role(), Role::User);
            assert_eq!(pair[0].content(), format!("question {i}"));
            assert_eq!(pair[1].role(), Role::Assistant);
            assert_eq!(pair[1].content(), format!("reply {i}"));
        }
        assert!(!snapshot.busy);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn requests_follow_session_mode() {
        let transport = QueuedTransport::with(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let conversation = Conversation::new(transport, Some("s-1".to_string()));

        conversation.submit("hello").await;
        conversation.reset(None);
        conversation.submit("again").await;

        let requests = conversation.transport.requests.lock().unwrap();
        assert_eq!(
            requests[0],
            RelayRequest::Session {
                session_id: "s-1".to_string(),
                message: "hello".to_string(),
            }
        );
        assert_eq!(
            requests[1],
            RelayRequest::Prompt {
                prompt: "again".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn blank_submission_is_a_no_op() {
        let conversation = Conversation::new(QueuedTransport::default(), None);

        assert!(!conversation.submit("   ").await);

        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.turns.len(), 1);
        assert!(conversation.transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_appends_apology_and_clears_busy() {
        let conversation = Conversation::new(QueuedTransport::with(vec![Err(proxy_error())]), None);

        assert!(conversation.submit("hello").await);

        let snapshot = conversation.snapshot();
        assert_eq!(
            roles(&snapshot),
            vec![Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(snapshot.turns[1].content(), "hello");
        assert_eq!(snapshot.turns[2].content(), APOLOGY);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Proxy failed: 502 Backend error (500): oops")
        );
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn next_submission_clears_previous_error() {
        let transport = QueuedTransport::with(vec![Err(proxy_error()), Ok("ok".to_string())]);
        let conversation = Conversation::new(transport, None);

        conversation.submit("first").await;
        assert!(conversation.snapshot().error.is_some());

        conversation.submit("second").await;
        let snapshot = conversation.snapshot();
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.turns.len(), 5);
        assert_eq!(snapshot.turns[4].content(), "ok");
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test]
    async fn repeated_identical_failures_are_each_counted() {
        let transport = QueuedTransport::with(vec![Err(proxy_error()), Err(proxy_error())]);
        let conversation = Conversation::new(transport, None);

        conversation.submit("first").await;
        let first = conversation.snapshot();
        conversation.submit("second").await;
        let second = conversation.snapshot();

        assert_eq!(first.error, second.error);
        assert_eq!(first.failures, 1);
        assert_eq!(second.failures, 2);
        assert_eq!(second.turns[4].content(), APOLOGY);

        conversation.reset(None);
        assert_eq!(conversation.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn empty_reply_is_replaced() {
        let conversation =
            Conversation::new(QueuedTransport::with(vec![Ok("  ".to_string())]), None);

        conversation.submit("hello").await;

        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.turns[2].content(), "[No response]");
    }

    #[tokio::test]
    async fn second_submit_while_in_flight_is_ignored() {
        let conversation = Conversation::new(GatedTransport::default(), None);

        let first = conversation.submit("one");
        let second = async {
            conversation.transport.entered.notified().await;
            let before = conversation.snapshot();
            assert!(before.busy);

            assert!(!conversation.submit("two").await);

            let after = conversation.snapshot();
            assert_eq!(before.turns, after.turns);
            assert_eq!(before.error, after.error);
            conversation.transport.release.notify_one();
        };
        let (accepted, ()) = futures::join!(first, second);

        assert!(accepted);
        assert_eq!(conversation.transport.calls.load(Ordering::SeqCst), 1);
        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.turns.len(), 3);
        assert_eq!(snapshot.turns[1].content(), "one");
        assert_eq!(snapshot.turns[2].content(), "released");
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn user_turn_is_visible_before_reply() {
        let conversation = Conversation::new(GatedTransport::default(), None);

        let first = conversation.submit("hello");
        let observe = async {
            conversation.transport.entered.notified().await;
            let snapshot = conversation.snapshot();
            assert_eq!(snapshot.turns.last().unwrap().content(), "hello");
            assert_eq!(snapshot.turns.last().unwrap().role(), Role::User);
            conversation.transport.release.notify_one();
        };
        futures::join!(first, observe);
    }

    #[tokio::test]
    async fn reset_in_flight_drops_stale_reply() {
        let conversation = Conversation::new(GatedTransport::default(), Some("s-1".to_string()));

        let first = conversation.submit("old session");
        let switch = async {
            conversation.transport.entered.notified().await;
            conversation.reset(Some("s-2".to_string()));
            assert!(conversation.is_busy());
            conversation.transport.release.notify_one();
        };
        futures::join!(first, switch);

        let snapshot = conversation.snapshot();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.session_id.as_deref(), Some("s-2"));
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.turns[0].content(), GREETING);
        assert!(!snapshot.busy);
    }

    #[tokio::test]
    async fn dropped_submission_still_clears_busy() {
        let conversation = Conversation::new(GatedTransport::default(), None);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), conversation.submit("hello")).await;

        assert!(timed_out.is_err());
        let snapshot = conversation.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.turns.last().unwrap().content(), "hello");
        assert_eq!(snapshot.turns.len(), 2);
    }
}
