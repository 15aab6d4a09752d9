//! In-process broker
//!
//! [`LoopbackBroker`] implements [`Transport`] without a network. Every connection made through
//! it shares one routing table, so a message published by one connection reaches the handlers of
//! every other matching subscription. Outside code can inject messages, watch topics, count the
//! calls made against the broker and make individual operations fail.
//!
//! ```rust,no_run
//! # async fn demo() {
//! use heating_control::mqtt::LoopbackBroker;
//!
//! let broker = LoopbackBroker::new();
//! let mut commands = broker.watch("/actuators/room-1");
//! broker.inject("/readings/temperature", br#"{"sensorID":"s1","type":"temperature","value":18}"#);
//! let _first = commands.recv().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{topic_matches, Connection, MessageHandler, Transport};
use crate::error::TransportError;

/// Number of calls made against a [`LoopbackBroker`], failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub subscribe: usize,
    pub publish: usize,
    pub unsubscribe: usize,
    pub disconnect: usize,
}

#[derive(Debug, Clone, Default)]
struct Failures {
    connect: Option<TransportError>,
    subscribe: Option<TransportError>,
    publish: Option<TransportError>,
    unsubscribe: Option<TransportError>,
    disconnect: Option<TransportError>,
}

struct Subscription {
    connection: u64,
    filter: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    subscriptions: Vec<Subscription>,
    observers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>,
    failures: Failures,
    calls: CallCounts,
    publish_delay: Option<Duration>,
}

struct Inner {
    state: Mutex<BrokerState>,
    fault: watch::Sender<Option<TransportError>>,
}

#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                fault,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `payload` to every matching subscriber and watcher, returns how many received it
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        let (handlers, observers) = {
            let mut state = self.state();
            state.observers.retain(|(_, tx)| !tx.is_closed());
            let handlers: Vec<MessageHandler> = state
                .subscriptions
                .iter()
                .filter(|sub| topic_matches(&sub.filter, topic))
                .map(|sub| sub.handler.clone())
                .collect();
            let observers: Vec<mpsc::UnboundedSender<Vec<u8>>> = state
                .observers
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect();
            (handlers, observers)
        };

        debug!(
            "Loopback delivering on {} to {} handler(s), {} watcher(s)",
            topic,
            handlers.len(),
            observers.len()
        );
        let delivered = handlers.len() + observers.len();
        for handler in handlers {
            handler(payload.to_vec());
        }
        for observer in observers {
            let _ = observer.send(payload.to_vec());
        }
        delivered
    }

    /// Receives a copy of every message published on topics matching `filter`
    pub fn watch(&self, filter: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().observers.push((filter.to_string(), tx));
        rx
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Number of live subscriptions across all connections
    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn fail_connect(&self, error: TransportError) {
        self.state().failures.connect = Some(error);
    }

    pub fn fail_subscribe(&self, error: TransportError) {
        self.state().failures.subscribe = Some(error);
    }

    pub fn fail_publish(&self, error: TransportError) {
        self.state().failures.publish = Some(error);
    }

    pub fn fail_unsubscribe(&self, error: TransportError) {
        self.state().failures.unsubscribe = Some(error);
    }

    pub fn fail_disconnect(&self, error: TransportError) {
        self.state().failures.disconnect = Some(error);
    }

    /// Removes every injected failure
    pub fn heal(&self) {
        self.state().failures = Failures::default();
    }

    /// Delays each publish acknowledgement, simulating a slow broker
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    /// Kills every live connection; their `fault` futures resolve with `error`
    pub fn sever(&self, error: TransportError) {
        let _ = self.inner.fault.send(Some(error));
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let id = {
            let mut state = self.state();
            state.calls.connect += 1;
            if let Some(error) = state.failures.connect.clone() {
                return Err(error);
            }
            state.next_connection += 1;
            state.next_connection
        };
        debug!("Loopback connection {} opened for {}", id, address);

        // A fresh session is not affected by an earlier sever
        self.inner.fault.send_replace(None);

        Ok(Arc::new(LoopbackConnection {
            id,
            broker: self.clone(),
            fault_rx: self.inner.fault.subscribe(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackConnection {
    id: u64,
    broker: LoopbackBroker,
    fault_rx: watch::Receiver<Option<TransportError>>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed("connection was disconnected".to_string()))
        } else if let Some(cause) = self.fault_rx.borrow().clone() {
            Err(cause)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.subscribe += 1;
        self.ensure_open()?;
        if let Some(error) = state.failures.subscribe.clone() {
            return Err(error);
        }
        state.subscriptions.push(Subscription {
            connection: self.id,
            filter: topic.to_string(),
            handler,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.broker.state();
            state.calls.publish += 1;
            state.publish_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.ensure_open()?;
        let failure = self.broker.state().failures.publish.clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.broker.inject(topic, &payload);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.unsubscribe += 1;
        self.ensure_open()?;
        if let Some(error) = state.failures.unsubscribe.clone() {
            return Err(error);
        }
        state
            .subscriptions
            .retain(|sub| !(sub.connection == self.id && sub.filter == topic));
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.disconnect += 1;
        self.closed.store(true, Ordering::Release);
        state.subscriptions.retain(|sub| sub.connection != self.id);
        debug!("Loopback connection {} closed", self.id);
        match state.failures.disconnect.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn fault(&self) -> TransportError {
        let mut fault_rx = self.fault_rx.clone();
        loop {
            let current = fault_rx.borrow_and_update().clone();
            if let Some(cause) = current {
                return cause;
            }
            if fault_rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}
