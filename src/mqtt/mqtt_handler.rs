//! rumqttc-backed transport
//!
//! rumqttc splits a session into an [`AsyncClient`] (request side) and an [`EventLoop`] that has
//! to be polled to make progress. [`MqttTransport::connect`] polls the loop inline until CONNACK,
//! then hands it to a background task which:
//!
//! - routes inbound PUBLISH packets to the matching subscription handlers
//! - correlates SUBACK / UNSUBACK / PUBACK with the request that caused them
//! - reports a dead session through [`Connection::fault`] unless a disconnect was requested
//!
//! # Acknowledgement correlation
//!
//! rumqttc does not hand out packet ids when a request is queued. Requests are therefore pushed
//! into a per-kind FIFO while holding `request_order`, so the FIFO order equals the order in
//! which the event loop emits `Outgoing::{Subscribe, Unsubscribe, Publish}(pkid)`. At that point
//! the waiter is moved into an in-flight table keyed by packet id and resolved by the ack.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{topic_matches, Connection, MessageHandler, MqttSettings, Transport};
use crate::error::TransportError;

const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let (host, port) = parse_address(address)?;

        let mut options = MqttOptions::new(self.settings.client_id.clone(), host.clone(), port);
        options
            .set_keep_alive(self.settings.keep_alive)
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, self.settings.request_capacity);

        debug!("Waiting for CONNACK from {}:{}", host, port);
        let timeout_ms = self.settings.connect_timeout.as_millis() as u64;
        match tokio::time::timeout(self.settings.connect_timeout, await_connack(&mut eventloop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::Timeout(timeout_ms)),
        }
        info!("MQTT session established with {}:{}", host, port);

        let shared = Arc::new(Shared::default());
        let (fault_tx, fault_rx) = watch::channel(None);
        let event_task = tokio::spawn(drive_event_loop(eventloop, shared.clone(), fault_tx));

        Ok(Arc::new(MqttConnection {
            client,
            shared,
            request_order: tokio::sync::Mutex::new(()),
            ack_timeout: self.settings.ack_timeout,
            fault_rx,
            event_task: tokio::sync::Mutex::new(Some(event_task)),
        }))
    }
}

/// Splits `tcp://host:port`, `mqtt://host:port`, `host:port` or `host` into host and port
pub fn parse_address(address: &str) -> Result<(String, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());

    let authority = match address.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => address,
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, DEFAULT_PORT),
    };

    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(event) => debug!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(TransportError::Refused(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct AckTable {
    queued: HashMap<RequestKind, VecDeque<AckSender>>,
    in_flight: HashMap<(RequestKind, u16), AckSender>,
}

impl AckTable {
    fn enqueue(&mut self, kind: RequestKind, waiter: AckSender) {
        self.queued.entry(kind).or_default().push_back(waiter);
    }

    /// Drops the most recent waiter of `kind` after its request could not be queued
    fn withdraw_last(&mut self, kind: RequestKind) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    fn sent(&mut self, kind: RequestKind, pkid: u16) {
        match self.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(waiter) => {
                self.in_flight.insert((kind, pkid), waiter);
            }
            None => debug!("No waiter for outgoing {:?} {}", kind, pkid),
        }
    }

    fn resolve(&mut self, kind: RequestKind, pkid: u16, result: Result<(), TransportError>) {
        match self.in_flight.remove(&(kind, pkid)) {
            Some(waiter) => {
                // The requester may have timed out already
                let _ = waiter.send(result);
            }
            None => debug!("Unexpected ack for {:?} {}", kind, pkid),
        }
    }

    fn fail_all(&mut self, cause: &TransportError) {
        let queued = self.queued.drain().flat_map(|(_, waiters)| waiters);
        let in_flight = self.in_flight.drain().map(|(_, waiter)| waiter);
        for waiter in queued.chain(in_flight) {
            let _ = waiter.send(Err(cause.clone()));
        }
    }
}

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    acks: Mutex<AckTable>,
    closing: AtomicBool,
}

impl Shared {
    fn acks(&self) -> MutexGuard<'_, AckTable> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<(String, MessageHandler)>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .subscriptions()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!("No subscription for message on {}", topic);
        }
        for handler in handlers {
            handler(payload.to_vec());
        }
    }

    fn incoming(&self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => self.deliver(&publish.topic, &publish.payload),
            Packet::SubAck(ack) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(TransportError::NotAcknowledged(
                        "broker rejected subscription".to_string(),
                    ))
                } else {
                    Ok(())
                };
                self.acks().resolve(RequestKind::Subscribe, ack.pkid, result);
            }
            Packet::UnsubAck(ack) => self.acks().resolve(RequestKind::Unsubscribe, ack.pkid, Ok(())),
            Packet::PubAck(ack) => self.acks().resolve(RequestKind::Publish, ack.pkid, Ok(())),
            other => debug!("Incoming {:?}", other),
        }
    }

    fn outgoing(&self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Subscribe(pkid) => self.acks().sent(RequestKind::Subscribe, pkid),
            Outgoing::Unsubscribe(pkid) => self.acks().sent(RequestKind::Unsubscribe, pkid),
            Outgoing::Publish(pkid) => self.acks().sent(RequestKind::Publish, pkid),
            _ => {}
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    fault: watch::Sender<Option<TransportError>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) => shared.incoming(packet),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, leaving event loop");
                break;
            }
            Ok(Event::Outgoing(outgoing)) => shared.outgoing(outgoing),
            Err(e) => {
                let cause = TransportError::Closed(e.to_string());
                if shared.closing.load(Ordering::Acquire) {
                    debug!("Event loop closed during disconnect: {}", e);
                } else {
                    error!("MQTT event loop failed: {}", e);
                    shared.acks().fail_all(&cause);
                    let _ = fault.send(Some(cause));
                }
                break;
            }
        }
    }

    shared
        .acks()
        .fail_all(&TransportError::Closed("event loop stopped".to_string()));
    shared.subscriptions().clear();
}

pub struct MqttConnection {
    client: AsyncClient,
    shared: Arc<Shared>,
    /// Serializes request submission so ack waiters line up with outgoing packet ids
    request_order: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    fault_rx: watch::Receiver<Option<TransportError>>,
    event_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    async fn acknowledged<F>(&self, kind: RequestKind, submit: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), ClientError>>,
    {
        let (waiter, ack) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            self.shared.acks().enqueue(kind, waiter);
            if let Err(e) = submit.await {
                self.shared.acks().withdraw_last(kind);
                return Err(TransportError::Client(e.to_string()));
            }
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed(
                "event loop stopped before acknowledgement".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(self.ack_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.shared
            .subscriptions()
            .push((topic.to_string(), handler));

        let result = self
            .acknowledged(
                RequestKind::Subscribe,
                self.client.subscribe(topic, QoS::AtMostOnce),
            )
            .await;

        if result.is_err() {
            self.shared
                .subscriptions()
                .retain(|(filter, _)| filter != topic);
        }
        result
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.acknowledged(
            RequestKind::Publish,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.shared
            .subscriptions()
            .retain(|(filter, _)| filter != topic);

        self.acknowledged(RequestKind::Unsubscribe, self.client.unsubscribe(topic))
            .await
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        self.shared.closing.store(true, Ordering::Release);
        let requested = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Client(e.to_string()));

        let task = self.event_task.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!("Event loop did not stop within {:?}, aborting it", timeout);
                task.abort();
                self.shared.subscriptions().clear();
                return Err(TransportError::Timeout(timeout.as_millis() as u64));
            }
        }
        requested
    }

    async fn fault(&self) -> TransportError {
        let mut fault_rx = self.fault_rx.clone();
        loop {
            let current = fault_rx.borrow_and_update().clone();
            if let Some(cause) = current {
                return cause;
            }
            if fault_rx.changed().await.is_err() {
                // Event loop ended without a fault: the session was closed on purpose
                return std::future::pending().await;
            }
        }
    }
}
