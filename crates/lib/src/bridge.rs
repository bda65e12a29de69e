//! Chat bridge: one conversation, one send at a time, results delivered as events.
//!
//! `send` validates the key, then runs the turn on a background tokio task: configure the
//! backend, create the session on first use, stream the reply, and report
//! `Progress(n)` per fragment followed by exactly one `Completion` or `Failure`.
//! The caller never blocks; it reads events from the returned [`SendHandle`].

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::llm::{ChatBackend, ChatSession, ImagePayload};
use crate::settings::is_usable_api_key;

/// Model every new session is bound to unless the bridge was built with another.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("API key not set")]
    InvalidKey,
    #[error("a message is already being sent")]
    Busy,
    #[error("{0}")]
    Transport(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidKey => ErrorKind::InvalidKey,
            BridgeError::Busy => ErrorKind::Busy,
            BridgeError::Transport(_) => ErrorKind::TransportFailure,
        }
    }
}

/// What a send reports back. Progress counters start at 1 and only increase; the
/// terminal event (`Completion` or `Failure`) is always the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Number of reply fragments received so far.
    Progress(usize),
    /// Full reply text.
    Completion(String),
    Failure(BridgeError),
}

impl BridgeEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BridgeEvent::Progress(_))
    }
}

/// One message to send, with the API key as it was when the user hit send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub message: String,
    pub image: Option<ImagePayload>,
    pub api_key: String,
}

impl SendRequest {
    pub fn new(message: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            image: None,
            api_key: api_key.into(),
        }
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }
}

/// Receiving end of one send's events.
pub struct SendHandle {
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl SendHandle {
    /// Next event, or `None` once the terminal event has been taken.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for UI loops; `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the terminal event, skipping progress.
    pub async fn outcome(mut self) -> Result<String, BridgeError> {
        while let Some(ev) = self.rx.recv().await {
            match ev {
                BridgeEvent::Progress(_) => {}
                BridgeEvent::Completion(text) => return Ok(text),
                BridgeEvent::Failure(e) => return Err(e),
            }
        }
        Err(BridgeError::Transport(
            "chat task ended without a result".to_string(),
        ))
    }

    fn rejected(err: BridgeError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(BridgeEvent::Failure(err));
        Self { rx }
    }
}

struct Shared {
    backend: Arc<dyn ChatBackend>,
    model: String,
    session: Mutex<Option<Box<dyn ChatSession>>>,
    in_flight: AtomicBool,
}

impl Shared {
    fn take_or_create_session(&self) -> Box<dyn ChatSession> {
        let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(s) => s,
            None => {
                log::debug!("bridge: creating session for model {}", self.model);
                self.backend.create_session(&self.model)
            }
        }
    }

    fn restore_session(&self, session: Box<dyn ChatSession>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }
}

/// Holds the single in-flight slot; released on drop.
struct InFlight(Arc<Shared>);

impl InFlight {
    fn acquire(shared: &Arc<Shared>) -> Option<Self> {
        shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(Arc::clone(shared)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Bridge between a front end and the remote chat service for one conversation.
pub struct ChatBridge {
    shared: Arc<Shared>,
    runtime: tokio::runtime::Handle,
}

impl ChatBridge {
    /// Bridge using [`DEFAULT_MODEL`]. Background work is spawned on `runtime`.
    pub fn new(backend: Arc<dyn ChatBackend>, runtime: tokio::runtime::Handle) -> Self {
        Self::with_model(backend, runtime, DEFAULT_MODEL)
    }

    pub fn with_model(
        backend: Arc<dyn ChatBackend>,
        runtime: tokio::runtime::Handle,
        model: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                model: model.into(),
                session: Mutex::new(None),
                in_flight: AtomicBool::new(false),
            }),
            runtime,
        }
    }

    pub fn model(&self) -> &str {
        &self.shared.model
    }

    /// True while a send is running.
    pub fn is_busy(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// True if a conversation exists (it is created lazily by the first send).
    /// While a send is running the session is held by that send and this reports false.
    pub fn has_session(&self) -> bool {
        self.shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start sending `request`. Returns immediately; all outcomes, including an unusable
    /// key or a send already in flight, arrive as events on the handle.
    pub fn send(&self, request: SendRequest) -> SendHandle {
        if !is_usable_api_key(&request.api_key) {
            log::warn!("bridge: send rejected, API key not set");
            return SendHandle::rejected(BridgeError::InvalidKey);
        }
        let Some(guard) = InFlight::acquire(&self.shared) else {
            log::warn!("bridge: send rejected, another send is in flight");
            return SendHandle::rejected(BridgeError::Busy);
        };
        log::info!(
            "bridge: sending message ({} chars, image: {})",
            request.message.chars().count(),
            request.image.is_some()
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(run_send(shared, guard, request, tx));
        SendHandle { rx }
    }

    /// Drop the conversation so the next send starts with a clean history.
    /// Refused with `Busy` while a send is running.
    pub fn reset(&self) -> Result<(), BridgeError> {
        let _guard = InFlight::acquire(&self.shared).ok_or(BridgeError::Busy)?;
        let dropped = self
            .shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if dropped.is_some() {
            log::info!("bridge: session reset");
        }
        Ok(())
    }
}

async fn run_send(
    shared: Arc<Shared>,
    guard: InFlight,
    request: SendRequest,
    tx: mpsc::UnboundedSender<BridgeEvent>,
) {
    let outcome = AssertUnwindSafe(run_turn(&shared, &request, &tx))
        .catch_unwind()
        .await;
    // Free the slot first so a front end reacting to the terminal event can send again.
    drop(guard);
    let event = match outcome {
        Ok(Ok(text)) => {
            log::debug!("bridge: reply complete ({} chars)", text.chars().count());
            BridgeEvent::Completion(text)
        }
        Ok(Err(e)) => {
            log::warn!("bridge: send failed: {}", e);
            BridgeEvent::Failure(e)
        }
        Err(_) => {
            log::error!("bridge: chat task panicked; session discarded");
            BridgeEvent::Failure(BridgeError::Transport("chat task panicked".to_string()))
        }
    };
    let _ = tx.send(event);
}

async fn run_turn(
    shared: &Shared,
    request: &SendRequest,
    tx: &mpsc::UnboundedSender<BridgeEvent>,
) -> Result<String, BridgeError> {
    shared
        .backend
        .configure(&request.api_key)
        .map_err(|e| BridgeError::Transport(e.to_string()))?;

    let mut session = shared.take_or_create_session();
    let mut fragments = 0usize;
    let mut on_fragment = |_: &str| {
        fragments += 1;
        let _ = tx.send(BridgeEvent::Progress(fragments));
    };
    let result = session
        .send_streaming(&request.message, request.image.as_ref(), &mut on_fragment)
        .await;
    shared.restore_session(session);
    result.map_err(|e| BridgeError::Transport(e.to_string()))
}
