//! Fan-out dispatcher and per-session backpressure
//!
//! Every session owns a bounded outbound queue. Producers (the lane
//! workers) only ever enqueue; a per-session writer task drains the
//! queue to the socket. A full queue drops the oldest message rather
//! than blocking the pipeline, and sustained drops inside a sliding window
//! force the session off to protect everyone else. Heartbeats bypass
//! the drop policy: they are always enqueued, evicting a data message
//! when the queue is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use types::ids::Symbol;

use crate::config::DispatchConfig;
use crate::metrics::PipelineMetrics;
use crate::subscriptions::{ClientId, MessageKind, SubscriptionRegistry};

/// Classification of a queued message for the drop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Market data (tick/kline/depth); subject to drop-oldest.
    Data,
    /// Ping/pong traffic; never dropped.
    Heartbeat,
}

/// A serialized message waiting on a session's outbound queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: String,
    pub class: MessageClass,
    pub queued_at: i64,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued without displacement.
    Queued,
    /// Queued after dropping the oldest message.
    DroppedOldest,
    /// Sustained overflow: the session must be disconnected.
    Disconnect,
}

/// Bounded outbound queue with drop accounting.
#[derive(Debug)]
struct SessionQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
    dropped_total: u64,
    window_start: i64,
    dropped_in_window: u64,
}

impl SessionQueue {
    fn new(capacity: usize, now: i64) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            dropped_total: 0,
            window_start: now,
            dropped_in_window: 0,
        }
    }

    fn note_drop(&mut self, now: i64, config: &DispatchConfig) -> bool {
        if now - self.window_start > config.drop_window_nanos {
            self.window_start = now;
            self.dropped_in_window = 0;
        }
        self.dropped_total += 1;
        self.dropped_in_window += 1;
        self.dropped_in_window > config.drop_rate_threshold
    }

    fn enqueue_data(
        &mut self,
        message: QueuedMessage,
        now: i64,
        config: &DispatchConfig,
    ) -> EnqueueOutcome {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return EnqueueOutcome::Queued;
        }

        if self.note_drop(now, config) {
            return EnqueueOutcome::Disconnect;
        }
        self.messages.pop_front();
        self.messages.push_back(message);
        EnqueueOutcome::DroppedOldest
    }

    fn enqueue_heartbeat(
        &mut self,
        message: QueuedMessage,
        now: i64,
        config: &DispatchConfig,
    ) -> EnqueueOutcome {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return EnqueueOutcome::Queued;
        }

        // Evict the oldest data message; heartbeats stay.
        let victim = self
            .messages
            .iter()
            .position(|m| m.class == MessageClass::Data);
        match victim {
            Some(idx) => {
                self.messages.remove(idx);
            }
            None => {
                self.messages.pop_front();
            }
        }
        self.note_drop(now, config);
        self.messages.push_back(message);
        EnqueueOutcome::DroppedOldest
    }

    fn drain(&mut self, max: usize) -> Vec<QueuedMessage> {
        let n = max.min(self.messages.len());
        self.messages.drain(..n).collect()
    }
}

/// Shared handle for one client session.
///
/// The dispatcher enqueues through it; the session's writer task waits
/// on `notify` and drains. The queue mutex is only ever held for O(1)
/// operations, never across await points.
pub struct SessionHandle {
    pub id: ClientId,
    queue: Mutex<SessionQueue>,
    notify: Notify,
    connected: AtomicBool,
    last_heartbeat: AtomicI64,
}

impl SessionHandle {
    fn new(id: ClientId, capacity: usize, now: i64) -> Self {
        Self {
            id,
            queue: Mutex::new(SessionQueue::new(capacity, now)),
            notify: Notify::new(),
            connected: AtomicBool::new(true),
            last_heartbeat: AtomicI64::new(now),
        }
    }

    fn enqueue(
        &self,
        message: QueuedMessage,
        now: i64,
        config: &DispatchConfig,
    ) -> EnqueueOutcome {
        let outcome = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            match message.class {
                MessageClass::Data => queue.enqueue_data(message, now, config),
                MessageClass::Heartbeat => queue.enqueue_heartbeat(message, now, config),
            }
        };
        if outcome != EnqueueOutcome::Disconnect {
            self.notify.notify_one();
        }
        outcome
    }

    /// Drain up to `max` queued messages for writing.
    pub fn drain(&self, max: usize) -> Vec<QueuedMessage> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(max)
    }

    /// Wait until messages are available or the session closes.
    pub async fn wait_for_messages(&self) {
        self.notify.notified().await;
    }

    /// Wake the writer task (used on disconnect).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .len()
    }

    /// Total messages dropped for this session.
    pub fn dropped_total(&self) -> u64 {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dropped_total
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Record inbound activity for the heartbeat timeout.
    pub fn touch_heartbeat(&self, now: i64) {
        self.last_heartbeat.store(now, Ordering::Relaxed);
    }

    pub fn is_stale(&self, now: i64, timeout_nanos: i64) -> bool {
        now - self.last_heartbeat.load(Ordering::Relaxed) > timeout_nanos
    }
}

/// Routes produced messages to every subscribed session.
pub struct Dispatcher {
    sessions: DashMap<ClientId, Arc<SessionHandle>>,
    registry: Arc<SubscriptionRegistry>,
    config: DispatchConfig,
    metrics: Arc<PipelineMetrics>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        config: DispatchConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            config,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new session and hand back its shared handle.
    pub fn register(&self, now: i64) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SessionHandle::new(id, self.config.queue_capacity, now));
        self.sessions.insert(id, handle.clone());
        self.metrics.connected_sessions.fetch_add(1, Ordering::Relaxed);
        info!(client_id = id, "Session registered");
        handle
    }

    /// Tear down a session: subscriptions, queue, writer wakeup.
    pub fn disconnect(&self, client: ClientId) {
        self.registry.remove_client(client);
        if let Some((_, handle)) = self.sessions.remove(&client) {
            handle.mark_disconnected();
            self.metrics
                .connected_sessions
                .fetch_sub(1, Ordering::Relaxed);
            info!(client_id = client, "Session disconnected");
        }
    }

    pub fn session(&self, client: ClientId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&client).map(|h| Arc::clone(h.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Messages queued across all sessions right now.
    pub fn total_queue_depth(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().queue_len())
            .sum()
    }

    /// Fan a serialized data message out to every subscriber of
    /// (symbol, kind). Sessions that exceed the sustained-drop threshold
    /// are force-disconnected; their ids are returned.
    pub fn publish(
        &self,
        symbol: &Symbol,
        kind: MessageKind,
        payload: &str,
        now: i64,
    ) -> Vec<ClientId> {
        let subscribers = self.registry.subscribers(symbol, kind);
        let mut evicted = Vec::new();

        for client in subscribers {
            let Some(handle) = self.session(client) else {
                continue;
            };
            let message = QueuedMessage {
                payload: payload.to_string(),
                class: MessageClass::Data,
                queued_at: now,
            };
            match handle.enqueue(message, now, &self.config) {
                EnqueueOutcome::Queued => {
                    self.metrics.messages_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::DroppedOldest => {
                    self.metrics.messages_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(client_id = client, "Queue full — dropped oldest message");
                }
                EnqueueOutcome::Disconnect => {
                    self.metrics
                        .forced_disconnects
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        client_id = client,
                        dropped = handle.dropped_total(),
                        "Sustained drops — force-disconnecting session"
                    );
                    evicted.push(client);
                }
            }
        }

        for client in &evicted {
            self.disconnect(*client);
        }
        evicted
    }

    /// Enqueue a data message for one specific session (snapshots,
    /// error replies). Subject to the normal drop policy.
    pub fn send_direct(&self, client: ClientId, payload: &str, now: i64) {
        if let Some(handle) = self.session(client) {
            let message = QueuedMessage {
                payload: payload.to_string(),
                class: MessageClass::Data,
                queued_at: now,
            };
            match handle.enqueue(message, now, &self.config) {
                EnqueueOutcome::Queued => {
                    self.metrics.messages_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::DroppedOldest => {
                    self.metrics.messages_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::Disconnect => {
                    self.metrics
                        .forced_disconnects
                        .fetch_add(1, Ordering::Relaxed);
                    self.disconnect(client);
                }
            }
        }
    }

    /// Enqueue a heartbeat reply for one session, bypassing drop policy.
    pub fn send_heartbeat(&self, client: ClientId, payload: &str, now: i64) {
        if let Some(handle) = self.session(client) {
            let message = QueuedMessage {
                payload: payload.to_string(),
                class: MessageClass::Heartbeat,
                queued_at: now,
            };
            if handle.enqueue(message, now, &self.config) == EnqueueOutcome::DroppedOldest {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Disconnect sessions whose heartbeat timed out. Returns their ids.
    pub fn sweep_stale(&self, now: i64) -> Vec<ClientId> {
        let timeout = self.config.heartbeat_timeout_nanos;
        let stale: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_stale(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        for client in &stale {
            warn!(client_id = client, "Heartbeat timeout — removing session");
            self.disconnect(*client);
        }
        stale
    }
}
