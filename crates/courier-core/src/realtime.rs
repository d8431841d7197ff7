//! Realtime Connection Coordinator.
//!
//! Keeps the persistent channel open exactly while the session is logged in.
//! One task owns the channel and handles, in order, session transitions and
//! inbound events, so a logout-then-login pair is fully torn down before the
//! next channel opens and no event is forwarded once teardown has begun.
//!
//! Teardown order is fixed: stop reading events, unsubscribe, disconnect.

use std::future;
use std::sync::Arc;

use courier_types::{AuthResult, Order, Session};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::orders::OrderSink;

pub type SubscriptionId = u64;

/// A live event subscription. Dropping `events` stops delivery locally;
/// [`RealtimeTransport::unsubscribe`] removes the handler at the transport.
#[derive(Debug)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<Value>,
}

/// Persistent bidirectional channel to the server.
///
/// Reconnects after transport-level drops are the implementation's concern;
/// the coordinator only opens and closes.
pub trait RealtimeTransport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, AuthResult<()>>;
    fn disconnect(&self) -> BoxFuture<'_, ()>;
    fn emit(&self, event: &str, payload: Value) -> BoxFuture<'_, AuthResult<()>>;
    fn subscribe(&self, event: &str) -> BoxFuture<'_, AuthResult<EventSubscription>>;
    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Open for the session of this epoch.
    Connected { epoch: u64 },
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

struct OpenChannel {
    epoch: u64,
    subscription: SubscriptionId,
    events: mpsc::UnboundedReceiver<Value>,
    events_closed: bool,
}

pub struct RealtimeCoordinator {
    transport: Arc<dyn RealtimeTransport>,
    sink: Arc<dyn OrderSink>,
    config: RealtimeConfig,
    state: watch::Sender<ConnectionState>,
    channel: Option<OpenChannel>,
}

impl RealtimeCoordinator {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        sink: Arc<dyn OrderSink>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            transport,
            sink,
            config,
            state: watch::Sender::new(ConnectionState::Disconnected),
            channel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Brings the channel in line with `session`: open while logged in,
    /// closed otherwise, reopened when the session epoch changes.
    pub async fn reconcile(&mut self, session: &Session) {
        let desired = session.is_logged_in().then(|| session.epoch());
        let current = self.channel.as_ref().map(|channel| channel.epoch);
        if desired == current {
            return;
        }

        if self.channel.is_some() {
            self.teardown().await;
        }
        if let Some(epoch) = desired {
            self.open(epoch).await;
        }
    }

    /// Runs the coordinator on its own task, following `session` until
    /// shutdown or until the session store goes away.
    pub fn spawn(self, session: watch::Receiver<Session>) -> RealtimeHandle {
        let state = self.watch();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(session, shutdown.clone()));
        RealtimeHandle {
            state,
            guard: shutdown.drop_guard(),
            task,
        }
    }

    async fn run(mut self, mut session: watch::Receiver<Session>, shutdown: CancellationToken) {
        let initial = session.borrow_and_update().clone();
        self.reconcile(&initial).await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                changed = session.changed() => {
                    if changed.is_err() {
                        debug!("session store dropped; stopping realtime coordinator");
                        break;
                    }
                    let snapshot = session.borrow_and_update().clone();
                    self.reconcile(&snapshot).await;
                }
                event = next_event(&mut self.channel) => match event {
                    Some(payload) => self.deliver(payload),
                    None => {
                        debug!("order subscription closed by transport");
                        if let Some(channel) = self.channel.as_mut() {
                            channel.events_closed = true;
                        }
                    }
                },
            }
        }

        if self.channel.is_some() {
            self.teardown().await;
        }
    }

    async fn open(&mut self, epoch: u64) {
        if let Err(err) = self.transport.connect().await {
            warn!(epoch, error = %err, "realtime connect failed");
            return;
        }

        let subscription = match self.transport.subscribe(&self.config.order_event).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(epoch, error = %err, "order subscription failed; closing channel");
                self.transport.disconnect().await;
                return;
            }
        };

        let payload = Value::String(self.config.announce_payload.clone());
        if let Err(err) = self.transport.emit(&self.config.announce_event, payload).await {
            warn!(epoch, error = %err, "readiness announcement failed");
        }

        self.channel = Some(OpenChannel {
            epoch,
            subscription: subscription.id,
            events: subscription.events,
            events_closed: false,
        });
        self.state.send_replace(ConnectionState::Connected { epoch });
        info!(epoch, event = %self.config.order_event, "realtime channel open");
    }

    async fn teardown(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let OpenChannel {
            epoch,
            subscription,
            mut events,
            ..
        } = channel;

        events.close();
        let mut discarded = 0usize;
        while events.try_recv().is_ok() {
            discarded += 1;
        }
        drop(events);

        self.transport.unsubscribe(subscription).await;
        self.transport.disconnect().await;
        self.state.send_replace(ConnectionState::Disconnected);
        info!(epoch, discarded, "realtime channel closed");
    }

    fn deliver(&self, payload: Value) {
        match Order::from_value(payload) {
            Ok(order) => {
                debug!(order_id = %order.order_id, "order received");
                self.sink.add_order(order);
            }
            Err(err) => warn!(error = %err, "malformed order event dropped"),
        }
    }
}

/// Next inbound event, or never when there is nothing to read.
async fn next_event(channel: &mut Option<OpenChannel>) -> Option<Value> {
    match channel {
        Some(channel) if !channel.events_closed => channel.events.recv().await,
        _ => future::pending().await,
    }
}

/// Owner's handle on a spawned coordinator. Dropping it stops the task.
pub struct RealtimeHandle {
    state: watch::Receiver<ConnectionState>,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the connection state satisfies `predicate`.
    ///
    /// Returns `None` if the coordinator stopped first.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        let mut state = self.state.clone();
        state.wait_for(predicate).await.ok().map(|state| *state)
    }

    /// Closes the channel if open and waits for the task to finish.
    pub async fn shutdown(self) {
        let token = self.guard.disarm();
        token.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "realtime coordinator task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_types::Identity;
    use serde_json::json;

    use super::*;
    use crate::orders::OrderBook;
    use crate::session::SessionStore;
    use crate::testing::{FakeRealtime, RealtimeCall};

    fn coordinator(realtime: &Arc<FakeRealtime>, book: &Arc<OrderBook>) -> RealtimeCoordinator {
        RealtimeCoordinator::new(
            Arc::clone(realtime) as Arc<dyn RealtimeTransport>,
            Arc::clone(book) as Arc<dyn OrderSink>,
            RealtimeConfig::default(),
        )
    }

    fn user(email: &str) -> Identity {
        Identity::new("Kim", email, "a1")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_reconcile_opens_subscribes_then_announces() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let mut coordinator = coordinator(&realtime, &book);

        let session = Session::authenticated(user("kim@example.com"), 1);
        coordinator.reconcile(&session).await;

        assert_eq!(coordinator.state(), ConnectionState::Connected { epoch: 1 });
        assert_eq!(
            realtime.calls(),
            vec![
                RealtimeCall::Connect,
                RealtimeCall::Subscribe("order".to_string()),
                RealtimeCall::Emit("acceptOrder".to_string(), json!("hello")),
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_before_disconnect() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let mut coordinator = coordinator(&realtime, &book);

        coordinator
            .reconcile(&Session::authenticated(user("kim@example.com"), 1))
            .await;
        coordinator.reconcile(&Session::logged_out(2)).await;

        let calls = realtime.calls();
        let unsubscribe = calls
            .iter()
            .position(|call| matches!(call, RealtimeCall::Unsubscribe(_)))
            .unwrap();
        let disconnect = calls
            .iter()
            .position(|call| *call == RealtimeCall::Disconnect)
            .unwrap();
        assert!(unsubscribe < disconnect);
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(realtime.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_stays_disconnected() {
        let realtime = Arc::new(FakeRealtime::new());
        realtime.fail_connects(true);
        let book = Arc::new(OrderBook::new());
        let mut coordinator = coordinator(&realtime, &book);

        coordinator
            .reconcile(&Session::authenticated(user("kim@example.com"), 1))
            .await;

        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(realtime.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_spawned_coordinator_follows_session() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let store = SessionStore::new();
        let handle = coordinator(&realtime, &book).spawn(store.subscribe());

        settle().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(realtime.connects(), 0);

        let epoch = store.set_user(user("kim@example.com"));
        let state = handle.wait_until(|state| state.is_connected()).await;
        assert_eq!(state, Some(ConnectionState::Connected { epoch }));

        realtime.push("order", json!({"orderId": "o-1", "price": 6000}));
        realtime.push("order", json!({"price": "no id"}));
        settle().await;
        assert_eq!(book.orders().len(), 1);

        store.clear();
        handle.wait_until(|state| !state.is_connected()).await;
        assert_eq!(realtime.open_channels(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_refreshing_the_token_keeps_the_channel() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let store = SessionStore::new();
        store.set_user(user("kim@example.com"));
        let handle = coordinator(&realtime, &book).spawn(store.subscribe());
        handle.wait_until(|state| state.is_connected()).await;

        store.set_access_token("a2");
        settle().await;

        assert_eq!(realtime.connects(), 1);
        assert_eq!(realtime.open_channels(), 1);
        handle.shutdown().await;
        assert_eq!(realtime.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_switching_user_reopens_channel() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let store = SessionStore::new();
        store.set_user(user("kim@example.com"));
        let handle = coordinator(&realtime, &book).spawn(store.subscribe());
        handle.wait_until(|state| state.is_connected()).await;

        let next = store.set_user(user("lee@example.com"));
        handle
            .wait_until(|state| *state == ConnectionState::Connected { epoch: next })
            .await;

        assert_eq!(realtime.connects(), 2);
        assert_eq!(realtime.max_open_channels(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_after_logout_are_not_delivered() {
        let realtime = Arc::new(FakeRealtime::new());
        let book = Arc::new(OrderBook::new());
        let store = SessionStore::new();
        store.set_user(user("kim@example.com"));
        let handle = coordinator(&realtime, &book).spawn(store.subscribe());
        handle.wait_until(|state| state.is_connected()).await;

        store.clear();
        realtime.push("order", json!({"orderId": "late"}));
        handle.wait_until(|state| !state.is_connected()).await;
        settle().await;

        assert!(book.orders().is_empty());
        handle.shutdown().await;
    }
}
