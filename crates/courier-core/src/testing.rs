//! In-process collaborator fakes for tests.
//!
//! Built for this crate's unit tests and, behind the `test-support`
//! feature, for integration tests and downstream crates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_types::{AuthError, AuthResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::notify::Notifier;
use crate::realtime::{EventSubscription, RealtimeTransport, SubscriptionId};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Handler = Box<dyn Fn(&ApiRequest) -> AuthResult<ApiResponse> + Send + Sync>;

/// HTTP transport answering from a closure, recording every request.
pub struct ScriptedHttp {
    handler: Handler,
    delay: Option<Duration>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedHttp {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest) -> AuthResult<ApiResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers with `responses` in order, then fails every further request.
    pub fn sequence(responses: Vec<AuthResult<ApiResponse>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            lock(&queue)
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::transport("script exhausted")))
        })
    }

    /// Holds every response for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn count_path(&self, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

impl HttpTransport for ScriptedHttp {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, AuthResult<ApiResponse>> {
        lock(&self.requests).push(request.clone());
        async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(&request)
        }
        .boxed()
    }
}

/// Notifier that remembers what it was asked to show.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}

/// A call made on [`FakeRealtime`], in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeCall {
    Connect,
    Disconnect,
    Emit(String, Value),
    Subscribe(String),
    Unsubscribe(SubscriptionId),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RealtimeCall>,
    connects: usize,
    open: usize,
    max_open: usize,
    fail_connects: bool,
    next_id: SubscriptionId,
    handlers: HashMap<SubscriptionId, (String, mpsc::UnboundedSender<Value>)>,
}

/// Realtime transport that records calls and lets tests push events.
#[derive(Default)]
pub struct FakeRealtime {
    state: Mutex<FakeState>,
}

impl FakeRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, fail: bool) {
        lock(&self.state).fail_connects = fail;
    }

    pub fn calls(&self) -> Vec<RealtimeCall> {
        lock(&self.state).calls.clone()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// Channels connected and not yet disconnected.
    pub fn open_channels(&self) -> usize {
        lock(&self.state).open
    }

    /// Highest number of channels ever open at once.
    pub fn max_open_channels(&self) -> usize {
        lock(&self.state).max_open
    }

    /// Handlers currently registered for `event`.
    pub fn subscribers(&self, event: &str) -> usize {
        lock(&self.state)
            .handlers
            .values()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Delivers a server event to every handler registered for it. Returns
    /// how many received it.
    pub fn push(&self, event: &str, payload: Value) -> usize {
        lock(&self.state)
            .handlers
            .values()
            .filter(|(name, _)| name == event)
            .filter(|(_, tx)| tx.send(payload.clone()).is_ok())
            .count()
    }
}

impl RealtimeTransport for FakeRealtime {
    fn connect(&self) -> BoxFuture<'_, AuthResult<()>> {
        let mut state = lock(&self.state);
        state.calls.push(RealtimeCall::Connect);
        let result = if state.fail_connects {
            Err(AuthError::transport("connection refused"))
        } else {
            state.connects += 1;
            state.open += 1;
            state.max_open = state.max_open.max(state.open);
            Ok(())
        };
        futures_util::future::ready(result).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        let mut state = lock(&self.state);
        state.calls.push(RealtimeCall::Disconnect);
        state.open = state.open.saturating_sub(1);
        futures_util::future::ready(()).boxed()
    }

    fn emit(&self, event: &str, payload: Value) -> BoxFuture<'_, AuthResult<()>> {
        lock(&self.state)
            .calls
            .push(RealtimeCall::Emit(event.to_string(), payload));
        futures_util::future::ready(Ok(())).boxed()
    }

    fn subscribe(&self, event: &str) -> BoxFuture<'_, AuthResult<EventSubscription>> {
        let mut state = lock(&self.state);
        state.calls.push(RealtimeCall::Subscribe(event.to_string()));
        state.next_id += 1;
        let id = state.next_id;
        let (tx, events) = mpsc::unbounded_channel();
        state.handlers.insert(id, (event.to_string(), tx));
        futures_util::future::ready(Ok(EventSubscription { id, events })).boxed()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, ()> {
        let mut state = lock(&self.state);
        state.calls.push(RealtimeCall::Unsubscribe(id));
        state.handlers.remove(&id);
        futures_util::future::ready(()).boxed()
    }
}
