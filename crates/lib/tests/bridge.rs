//! Integration tests for the chat bridge against a scripted backend.
//! No network: the backend replays canned fragment sequences and counts sessions.

use async_trait::async_trait;
use pyro::bridge::{BridgeError, BridgeEvent, ChatBridge, SendHandle, SendRequest};
use pyro::error::ErrorKind;
use pyro::llm::{ChatBackend, ChatSession, ImagePayload, LlmError};
use pyro::session::{Conversation, Turn};
use pyro::settings::API_KEY_PLACEHOLDER;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

enum Reply {
    Fragments(Vec<&'static str>),
    FailAfter(Vec<&'static str>, &'static str),
    /// Wait for the notify before streaming the fragments.
    Gated(Arc<Notify>, Vec<&'static str>),
    Panic,
}

#[derive(Default)]
struct State {
    sessions_created: AtomicUsize,
    configured_keys: Mutex<Vec<String>>,
    /// Number of prior turns each send saw, in order.
    history_seen: Mutex<Vec<usize>>,
    images_seen: Mutex<Vec<Option<String>>>,
    replies: Mutex<VecDeque<Reply>>,
}

#[derive(Clone, Default)]
struct ScriptedBackend {
    state: Arc<State>,
}

impl ScriptedBackend {
    fn with_replies(replies: Vec<Reply>) -> Self {
        let backend = Self::default();
        *backend.state.replies.lock().unwrap() = replies.into();
        backend
    }

    fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::SeqCst)
    }
}

impl ChatBackend for ScriptedBackend {
    fn configure(&self, api_key: &str) -> Result<(), LlmError> {
        self.state.configured_keys.lock().unwrap().push(api_key.to_string());
        Ok(())
    }

    fn create_session(&self, _model: &str) -> Box<dyn ChatSession> {
        self.state.sessions_created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            conversation: Conversation::new(),
        })
    }
}

struct ScriptedSession {
    state: Arc<State>,
    conversation: Conversation,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn send_streaming(
        &mut self,
        message: &str,
        image: Option<&ImagePayload>,
        on_fragment: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError> {
        self.state
            .history_seen
            .lock()
            .unwrap()
            .push(self.conversation.turns.len());
        self.state
            .images_seen
            .lock()
            .unwrap()
            .push(image.map(|i| i.mime_type.clone()));
        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Fragments(vec!["ok"]));
        let (fragments, failure) = match reply {
            Reply::Fragments(f) => (f, None),
            Reply::FailAfter(f, msg) => (f, Some(msg)),
            Reply::Gated(gate, f) => {
                gate.notified().await;
                (f, None)
            }
            Reply::Panic => panic!("scripted session panicked"),
        };
        let mut text = String::new();
        for f in fragments {
            tokio::task::yield_now().await;
            on_fragment(f);
            text.push_str(f);
        }
        if let Some(msg) = failure {
            return Err(LlmError::Api(msg.to_string()));
        }
        self.conversation
            .push_exchange(Turn::user(message, image.cloned()), text.clone());
        Ok(text)
    }

    fn conversation(&self) -> &Conversation {
        &self.conversation
    }
}

fn bridge(backend: &ScriptedBackend) -> ChatBridge {
    ChatBridge::new(
        Arc::new(backend.clone()),
        tokio::runtime::Handle::current(),
    )
}

async fn collect(mut handle: SendHandle) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("bridge event within 5s")
    {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn placeholder_key_fails_without_progress_or_backend_calls() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("", API_KEY_PLACEHOLDER))).await;
    assert_eq!(events, vec![BridgeEvent::Failure(BridgeError::InvalidKey)]);
    match &events[0] {
        BridgeEvent::Failure(e) => {
            assert_eq!(e.to_string(), "API key not set");
            assert_eq!(e.kind(), ErrorKind::InvalidKey);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.sessions_created(), 0);
    assert!(backend.state.configured_keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_key_is_rejected() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("hi", "  "))).await;
    assert_eq!(events, vec![BridgeEvent::Failure(BridgeError::InvalidKey)]);
    assert!(!bridge.is_busy());
}

#[tokio::test]
async fn successful_send_reports_each_fragment_then_completion() {
    let backend = ScriptedBackend::with_replies(vec![Reply::Fragments(vec!["Hel", "lo", ", ", "world"])]);
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("hi", "key-1"))).await;
    assert_eq!(
        events,
        vec![
            BridgeEvent::Progress(1),
            BridgeEvent::Progress(2),
            BridgeEvent::Progress(3),
            BridgeEvent::Progress(4),
            BridgeEvent::Completion("Hello, world".to_string()),
        ]
    );
    assert_eq!(
        *backend.state.configured_keys.lock().unwrap(),
        vec!["key-1".to_string()]
    );
    assert!(bridge.has_session());
    assert!(!bridge.is_busy());
}

#[tokio::test]
async fn empty_reply_completes_without_progress() {
    let backend = ScriptedBackend::with_replies(vec![Reply::Fragments(vec![])]);
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("hi", "key"))).await;
    assert_eq!(events, vec![BridgeEvent::Completion(String::new())]);
}

#[tokio::test]
async fn mid_stream_failure_yields_one_failure_and_no_completion() {
    let backend = ScriptedBackend::with_replies(vec![Reply::FailAfter(
        vec!["partial", " text"],
        "connection reset",
    )]);
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("hi", "key"))).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], BridgeEvent::Progress(1));
    assert_eq!(events[1], BridgeEvent::Progress(2));
    match &events[2] {
        BridgeEvent::Failure(e) => {
            assert_eq!(e.kind(), ErrorKind::TransportFailure);
            assert!(e.to_string().contains("connection reset"), "{}", e);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, BridgeEvent::Completion(_))));

    // The bridge is usable again afterwards and keeps the same session.
    let text = bridge.send(SendRequest::new("again", "key")).outcome().await;
    assert_eq!(text, Ok("ok".to_string()));
    assert_eq!(backend.sessions_created(), 1);
}

#[tokio::test]
async fn session_is_reused_until_reset() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    bridge.send(SendRequest::new("one", "key")).outcome().await.unwrap();
    bridge.send(SendRequest::new("two", "key")).outcome().await.unwrap();
    assert_eq!(backend.sessions_created(), 1);
    assert_eq!(*backend.state.history_seen.lock().unwrap(), vec![0, 2]);

    bridge.reset().unwrap();
    assert!(!bridge.has_session());
    bridge.send(SendRequest::new("three", "key")).outcome().await.unwrap();
    assert_eq!(backend.sessions_created(), 2);
    assert_eq!(*backend.state.history_seen.lock().unwrap(), vec![0, 2, 0]);
}

#[tokio::test]
async fn reset_without_session_is_a_no_op() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    assert_eq!(bridge.reset(), Ok(()));
    assert_eq!(backend.sessions_created(), 0);
}

#[tokio::test]
async fn concurrent_send_and_reset_are_refused_while_busy() {
    let gate = Arc::new(Notify::new());
    let backend = ScriptedBackend::with_replies(vec![Reply::Gated(Arc::clone(&gate), vec!["a", "b"])]);
    let bridge = bridge(&backend);

    let first = bridge.send(SendRequest::new("slow", "key"));
    assert!(bridge.is_busy());

    let second = collect(bridge.send(SendRequest::new("fast", "key"))).await;
    assert_eq!(second, vec![BridgeEvent::Failure(BridgeError::Busy)]);
    assert_eq!(bridge.reset(), Err(BridgeError::Busy));

    gate.notify_one();
    let events = collect(first).await;
    assert_eq!(events.last(), Some(&BridgeEvent::Completion("ab".to_string())));
    assert!(!bridge.is_busy());
    assert_eq!(bridge.reset(), Ok(()));
    // Only the first send reached the backend.
    assert_eq!(backend.state.history_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn image_is_forwarded_with_the_message() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    let image = ImagePayload::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00]);
    bridge
        .send(SendRequest::new("what is this?", "key").with_image(image))
        .outcome()
        .await
        .unwrap();
    bridge.send(SendRequest::new("thanks", "key")).outcome().await.unwrap();
    assert_eq!(
        *backend.state.images_seen.lock().unwrap(),
        vec![Some("image/jpeg".to_string()), None]
    );
}

#[tokio::test]
async fn next_send_is_accepted_as_soon_as_terminal_event_arrives() {
    let backend = ScriptedBackend::default();
    let bridge = bridge(&backend);
    let mut handle = bridge.send(SendRequest::new("one", "key"));
    while let Some(ev) = handle.recv().await {
        if ev.is_terminal() {
            let next = bridge.send(SendRequest::new("two", "key")).outcome().await;
            assert_eq!(next, Ok("ok".to_string()));
        }
    }
}

#[tokio::test]
async fn panic_in_session_fails_once_and_discards_the_session() {
    let backend = ScriptedBackend::with_replies(vec![Reply::Panic]);
    let bridge = bridge(&backend);
    let events = collect(bridge.send(SendRequest::new("boom", "key"))).await;
    assert_eq!(
        events,
        vec![BridgeEvent::Failure(BridgeError::Transport(
            "chat task panicked".to_string()
        ))]
    );
    assert!(!bridge.is_busy());
    assert!(!bridge.has_session());
    assert_eq!(backend.sessions_created(), 1);

    let text = bridge.send(SendRequest::new("again", "key")).outcome().await;
    assert_eq!(text, Ok("ok".to_string()));
    assert_eq!(backend.sessions_created(), 2);
}
