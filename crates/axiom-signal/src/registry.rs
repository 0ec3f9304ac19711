//! Channel registry: connections, their channel subscriptions, and
//! best-effort fan-out.
//!
//! Each connection owns one delivery task, spawned at registration and fed
//! through an unbounded outbox. A broadcast takes its sequence number and
//! enqueues into every subscriber's outbox under one lock, so each
//! subscriber sees messages in sequence order. The delivery task pushes into
//! the subscriber's bounded queue under a per-message timeout, so a full or
//! dead subscriber only costs itself that message. Unregistering a
//! connection fires its cancellation token: whatever is still in its outbox
//! is skipped and its [`Subscriber`] stops yielding.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axiom_core::now_unix_secs;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, DeliveryFailure, Result, SignalError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Per-subscriber, per-message delivery budget.
    pub delivery_timeout_ms: u64,
    /// Queue depth of each subscriber.
    pub subscriber_buffer: usize,
    /// How many recent failures are kept for inspection.
    pub failure_history: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 1_000,
            subscriber_buffer: 256,
            failure_history: 128,
        }
    }
}

/// A message as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    /// Registry-wide, increasing.
    pub sequence: u64,
    pub payload: serde_json::Value,
    /// Unix seconds.
    pub sent_at: u64,
}

/// Receiving end of a registered connection.
#[derive(Debug)]
pub struct Subscriber {
    id: ConnectionId,
    receiver: mpsc::Receiver<Arc<ChannelMessage>>,
    cancel: CancellationToken,
}

impl Subscriber {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Next message, or `None` once the connection is unregistered. Messages
    /// still queued at that point are discarded.
    pub async fn recv(&mut self) -> Option<Arc<ChannelMessage>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            message = self.receiver.recv() => message,
        }
    }

    /// Fires when the connection is unregistered.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct Connection {
    channels: BTreeSet<String>,
    /// `None` when registered outside a Tokio runtime.
    outbox: Option<mpsc::UnboundedSender<Outgoing>>,
    cancel: CancellationToken,
}

struct Outgoing {
    message: Arc<ChannelMessage>,
    reply: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct Subscriptions {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<String, BTreeSet<ConnectionId>>,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    config: SignalConfig,
    subscriptions: RwLock<Subscriptions>,
    /// Held across enqueueing so outboxes fill in sequence order.
    sequence: Mutex<u64>,
    ledger: Arc<Ledger>,
}

/// Delivery bookkeeping shared with the per-connection tasks.
struct Ledger {
    failure_history: usize,
    counters: Counters,
    failures: Mutex<VecDeque<DeliveryFailure>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Outcome of delivering one message to one subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The connection was unregistered before the message went out.
    Skipped,
    Failed(DeliveryError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub channel: String,
    pub sequence: u64,
    pub attempted: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failures: Vec<DeliveryFailure>,
}

/// Handle on the pending deliveries of one broadcast. Dropping it does not
/// cancel them.
#[derive(Debug)]
pub struct Dispatch {
    channel: String,
    sequence: u64,
    pending: Vec<(ConnectionId, oneshot::Receiver<Delivery>)>,
}

impl Dispatch {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of subscribers the message was sent to.
    pub fn fan_out(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every delivery and summarize.
    pub async fn settle(self) -> DeliveryReport {
        let mut report = DeliveryReport {
            channel: self.channel,
            sequence: self.sequence,
            attempted: self.pending.len(),
            ..DeliveryReport::default()
        };
        for (connection, outcome) in self.pending {
            let error = match outcome.await {
                Ok(Delivery::Delivered) => {
                    report.delivered += 1;
                    continue;
                }
                // A dropped reply means the outbox closed before delivery.
                Ok(Delivery::Skipped) | Err(_) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(Delivery::Failed(error)) => error,
            };
            report.failures.push(DeliveryFailure {
                connection,
                channel: report.channel.clone(),
                sequence: report.sequence,
                error,
                at: now_unix_secs(),
            });
        }
        report
    }
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

impl ChannelRegistry {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(Subscriptions::default()),
                sequence: Mutex::new(0),
                ledger: Arc::new(Ledger {
                    failure_history: config.failure_history,
                    counters: Counters::default(),
                    failures: Mutex::new(VecDeque::new()),
                }),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.inner.config
    }

    /// Register a connection with no subscriptions and hand back its
    /// receiving end. The connection's delivery task runs on the current
    /// Tokio runtime; registered outside one, the connection never receives.
    pub fn register_connection(&self, id: impl Into<ConnectionId>) -> Result<Subscriber> {
        let id = id.into();
        let mut subs = self.inner.subscriptions.write();
        if subs.connections.contains_key(&id) {
            return Err(SignalError::AlreadyExists(id));
        }
        let (sender, receiver) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        let cancel = CancellationToken::new();
        let outbox = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (outbox, queued) = mpsc::unbounded_channel();
                runtime.spawn(run_delivery(
                    Arc::clone(&self.inner.ledger),
                    id.clone(),
                    sender,
                    queued,
                    cancel.clone(),
                    Duration::from_millis(self.inner.config.delivery_timeout_ms),
                ));
                Some(outbox)
            }
            Err(_) => {
                tracing::warn!(connection = %id, "registered outside a tokio runtime, nothing will be delivered");
                None
            }
        };
        subs.connections.insert(
            id.clone(),
            Connection {
                channels: BTreeSet::new(),
                outbox,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(connection = %id, "registered connection");
        Ok(Subscriber {
            id,
            receiver,
            cancel,
        })
    }

    /// Add channels to a connection. Already-held channels are left as they
    /// are. Returns the connection's full channel list.
    pub fn subscribe<I, S>(&self, id: &ConnectionId, channels: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.inner.subscriptions.write();
        let subs = &mut *guard;
        let conn = subs
            .connections
            .get_mut(id)
            .ok_or_else(|| SignalError::NotFound(id.clone()))?;
        for channel in channels {
            let channel = channel.into();
            if conn.channels.insert(channel.clone()) {
                subs.channels.entry(channel).or_default().insert(id.clone());
            }
        }
        Ok(conn.channels.iter().cloned().collect())
    }

    /// Drop channels from a connection; channels it does not hold are ignored.
    pub fn unsubscribe<I, S>(&self, id: &ConnectionId, channels: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.inner.subscriptions.write();
        let subs = &mut *guard;
        let conn = subs
            .connections
            .get_mut(id)
            .ok_or_else(|| SignalError::NotFound(id.clone()))?;
        for channel in channels {
            let channel = channel.into();
            if conn.channels.remove(&channel) {
                detach(&mut subs.channels, &channel, id);
            }
        }
        Ok(conn.channels.iter().cloned().collect())
    }

    /// Remove the connection and all its subscriptions. In-flight deliveries
    /// to it are skipped.
    pub fn unregister_connection(&self, id: &ConnectionId) -> Result<()> {
        let mut guard = self.inner.subscriptions.write();
        let subs = &mut *guard;
        let conn = subs
            .connections
            .remove(id)
            .ok_or_else(|| SignalError::NotFound(id.clone()))?;
        conn.cancel.cancel();
        for channel in &conn.channels {
            detach(&mut subs.channels, channel, id);
        }
        tracing::debug!(connection = %id, channels = conn.channels.len(), "unregistered connection");
        Ok(())
    }

    pub fn channels_of(&self, id: &ConnectionId) -> Result<Vec<String>> {
        self.inner
            .subscriptions
            .read()
            .connections
            .get(id)
            .map(|c| c.channels.iter().cloned().collect())
            .ok_or_else(|| SignalError::NotFound(id.clone()))
    }

    pub fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner
            .subscriptions
            .read()
            .channels
            .get(channel)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.subscriptions.read().connections.len()
    }

    /// Publish `payload` on `channel`.
    ///
    /// Never blocks on subscribers and never fails: the message is queued on
    /// each subscriber's outbox and its delivery task reports the outcome.
    /// Failures are logged and recorded.
    pub fn broadcast_to_channel(&self, channel: &str, payload: serde_json::Value) -> Dispatch {
        let mut sequence = self.inner.sequence.lock();
        *sequence += 1;
        let mut dispatch = Dispatch {
            channel: channel.to_string(),
            sequence: *sequence,
            pending: Vec::new(),
        };

        let subs = self.inner.subscriptions.read();
        let Some(ids) = subs.channels.get(channel) else {
            return dispatch;
        };
        let message = Arc::new(ChannelMessage {
            channel: channel.to_string(),
            sequence: *sequence,
            payload,
            sent_at: now_unix_secs(),
        });
        for id in ids {
            let Some(outbox) = subs.connections.get(id).and_then(|c| c.outbox.as_ref()) else {
                continue;
            };
            let (reply, outcome) = oneshot::channel();
            let queued = Outgoing {
                message: Arc::clone(&message),
                reply,
            };
            if outbox.send(queued).is_err() {
                self.inner.ledger.record(id, &message, Delivery::Skipped);
            }
            dispatch.pending.push((id.clone(), outcome));
        }
        dispatch
    }

    pub fn stats(&self) -> RegistryStats {
        let subs = self.inner.subscriptions.read();
        let counters = &self.inner.ledger.counters;
        RegistryStats {
            connections: subs.connections.len(),
            channels: subs.channels.len(),
            subscriptions: subs.channels.values().map(BTreeSet::len).sum(),
            delivered: counters.delivered.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Most recent delivery failures, oldest first.
    pub fn recent_failures(&self) -> Vec<DeliveryFailure> {
        self.inner.ledger.failures.lock().iter().cloned().collect()
    }
}

fn detach(channels: &mut HashMap<String, BTreeSet<ConnectionId>>, channel: &str, id: &ConnectionId) {
    if let Some(ids) = channels.get_mut(channel) {
        ids.remove(id);
        if ids.is_empty() {
            channels.remove(channel);
        }
    }
}

/// Per-connection delivery loop. Ends once the connection is unregistered
/// or the registry is dropped.
async fn run_delivery(
    ledger: Arc<Ledger>,
    connection: ConnectionId,
    sender: mpsc::Sender<Arc<ChannelMessage>>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbox.recv() => next,
        };
        let Some(Outgoing { message, reply }) = next else {
            break;
        };
        let outcome = deliver(&sender, &cancel, Arc::clone(&message), timeout).await;
        ledger.record(&connection, &message, outcome);
        // The broadcaster may have dropped its dispatch.
        let _ = reply.send(outcome);
    }

    outbox.close();
    while let Ok(Outgoing { message, reply }) = outbox.try_recv() {
        ledger.record(&connection, &message, Delivery::Skipped);
        let _ = reply.send(Delivery::Skipped);
    }
}

async fn deliver(
    sender: &mpsc::Sender<Arc<ChannelMessage>>,
    cancel: &CancellationToken,
    message: Arc<ChannelMessage>,
    timeout: Duration,
) -> Delivery {
    if cancel.is_cancelled() {
        return Delivery::Skipped;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Skipped,
        sent = tokio::time::timeout(timeout, sender.send(message)) => match sent {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(_)) => Delivery::Failed(DeliveryError::Closed),
            Err(_) => Delivery::Failed(DeliveryError::Timeout),
        },
    }
}

impl Ledger {
    fn record(&self, connection: &ConnectionId, message: &ChannelMessage, outcome: Delivery) {
        let error = match outcome {
            Delivery::Delivered => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Delivery::Skipped => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Delivery::Failed(error) => error,
        };
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            %connection,
            channel = %message.channel,
            sequence = message.sequence,
            "delivery failed: {error}"
        );

        let limit = self.failure_history;
        if limit == 0 {
            return;
        }
        let mut failures = self.failures.lock();
        while failures.len() >= limit {
            failures.pop_front();
        }
        failures.push_back(DeliveryFailure {
            connection: connection.clone(),
            channel: message.channel.clone(),
            sequence: message.sequence,
            error,
            at: now_unix_secs(),
        });
    }
}
