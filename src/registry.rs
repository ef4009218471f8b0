//! Connection Registry. Tracks live sockets and their outbound queues.
//!
//! Each connection gets its own bounded mailbox rather than a single shared
//! `broadcast::channel` — a `broadcast` sender can't tell us when a specific
//! subscriber's queue is full, and the slow-consumer policy needs exactly
//! that signal per connection. The mailbox is a plain `VecDeque` rather than
//! `tokio::sync::mpsc`, because the slow-consumer policy's first step
//! (evicting an already-queued low-priority frame to make room for a normal-
//! priority one) needs to reach into the middle of the queue — something an
//! `mpsc::Sender` has no way to do.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::models::{ConnectionId, Identity};
use crate::protocol::Frame;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

struct Mailbox {
    queue: std::sync::Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn pop(&self) -> Option<Frame> {
        self.queue.lock().unwrap().pop_front()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

/// Receiving half of a connection's mailbox. Mirrors `mpsc::Receiver`'s
/// `recv`/`try_recv` shape so call sites didn't need to change when the
/// mailbox stopped being an `mpsc` channel.
pub struct MailboxReceiver {
    mailbox: Arc<Mailbox>,
}

impl MailboxReceiver {
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.mailbox.pop() {
                return Some(frame);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        match self.mailbox.pop() {
            Some(frame) => Ok(frame),
            None if self.mailbox.is_closed() => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }
}

impl Drop for MailboxReceiver {
    fn drop(&mut self) {
        self.mailbox.closed.store(true, Ordering::Release);
    }
}

/// Per-connection outbound mailbox plus the bookkeeping needed to apply the
/// slow-consumer policy.
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    mailbox: Arc<Mailbox>,
    identity: std::sync::RwLock<Option<Arc<Identity>>>,
    /// Set once authentication completes; gates dispatch of any frame other
    /// than `authenticate`.
    pub authenticated: AtomicBool,
    /// Wall-clock instant the outbound queue was first observed full.
    /// `None` while the queue has headroom. Used to enforce T_slow=10s.
    full_since: std::sync::Mutex<Option<Instant>>,
    pub last_pong_at: std::sync::Mutex<Instant>,
    /// Guards teardown against running twice for the same connection
    /// (teardown must be idempotent).
    torn_down: AtomicBool,
    /// Set by the broadcast fabric when this connection's queue has been
    /// full for `T_slow`; the connection's own gateway loop observes it via
    /// `close_notify` and closes with the carried code.
    pending_close: std::sync::Mutex<Option<u16>>,
    pub close_notify: tokio::sync::Notify,
    /// Count of low-priority frames dropped under backpressure (policy step
    /// 2). Observable for diagnostics; never gates behavior itself.
    drop_counter: AtomicU64,
}

impl ConnectionHandle {
    fn new(connection_id: ConnectionId, mailbox: Arc<Mailbox>) -> Self {
        Self {
            connection_id,
            mailbox,
            identity: std::sync::RwLock::new(None),
            authenticated: AtomicBool::new(false),
            full_since: std::sync::Mutex::new(None),
            last_pong_at: std::sync::Mutex::new(Instant::now()),
            torn_down: AtomicBool::new(false),
            pending_close: std::sync::Mutex::new(None),
            close_notify: tokio::sync::Notify::new(),
            drop_counter: AtomicU64::new(0),
        }
    }

    pub fn dropped_low_priority_count(&self) -> u64 {
        self.drop_counter.load(Ordering::Relaxed)
    }

    /// Returns `true` the first time it's called for this connection, and
    /// `false` on every subsequent call.
    pub fn begin_teardown(&self) -> bool {
        self.torn_down.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Ask this connection's gateway loop to close with `code` at its next
    /// opportunity. Idempotent — the first requested code wins.
    pub fn request_close(&self, code: u16) {
        let mut guard = self.pending_close.lock().unwrap();
        if guard.is_none() {
            *guard = Some(code);
            self.close_notify.notify_one();
        }
    }

    pub fn take_pending_close(&self) -> Option<u16> {
        self.pending_close.lock().unwrap().take()
    }

    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.identity.read().unwrap().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.identity().map(|i| i.username.clone())
    }

    pub fn touch_pong(&self) {
        *self.last_pong_at.lock().unwrap() = Instant::now();
    }

    pub fn seconds_since_pong(&self) -> u64 {
        self.last_pong_at.lock().unwrap().elapsed().as_secs()
    }

    /// Outcome of attempting to enqueue a frame, used by the broadcast fabric
    /// to drive the slow-consumer policy:
    /// 1. If there's room, enqueue directly.
    /// 2. If full and the incoming frame outranks a queued low-priority
    ///    frame, evict the oldest such frame and enqueue the incoming one.
    /// 3. If full and the incoming frame is itself low-priority, drop it
    ///    silently and bump `drop_counter`.
    /// 4. Otherwise report `QueueFull`, or `SustainedFull` once the queue has
    ///    been full for `T_slow`.
    pub fn enqueue(&self, frame: Frame) -> EnqueueOutcome {
        if self.mailbox.is_closed() {
            return EnqueueOutcome::ConnectionGone;
        }

        let mut queue = self.mailbox.queue.lock().unwrap();
        if queue.len() < self.mailbox.capacity {
            queue.push_back(frame);
            drop(queue);
            self.mailbox.notify.notify_one();
            *self.full_since.lock().unwrap() = None;
            return EnqueueOutcome::Sent;
        }

        if !frame.is_low_priority() {
            if let Some(position) = queue.iter().position(|queued| queued.is_low_priority()) {
                queue.remove(position);
                queue.push_back(frame);
                drop(queue);
                self.mailbox.notify.notify_one();
                *self.full_since.lock().unwrap() = None;
                return EnqueueOutcome::Sent;
            }
        }
        drop(queue);

        let mut guard = self.full_since.lock().unwrap();
        let since = *guard.get_or_insert_with(Instant::now);
        if since.elapsed().as_secs() >= crate::ratelimit::T_SLOW_SECS {
            EnqueueOutcome::SustainedFull
        } else if frame.is_low_priority() {
            self.drop_counter.fetch_add(1, Ordering::Relaxed);
            EnqueueOutcome::DroppedLowPriority
        } else {
            EnqueueOutcome::QueueFull
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Sent,
    /// Queue was full but the frame was low-priority, so it was dropped
    /// silently rather than threatening the connection.
    DroppedLowPriority,
    /// Queue was full and stayed within the grace period.
    QueueFull,
    /// Queue has been full for at least `T_slow`; caller should close 4003.
    SustainedFull,
    ConnectionGone,
}

/// Live connection table plus the username → connection index used for
/// single-active-session eviction.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_username: DashMap<String, ConnectionId>,
    next_worker_sequence: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (Arc<ConnectionHandle>, MailboxReceiver) {
        let connection_id = ConnectionId::now_v7();
        let mailbox = Arc::new(Mailbox::new(OUTBOUND_QUEUE_CAPACITY));
        let handle = Arc::new(ConnectionHandle::new(connection_id, mailbox.clone()));
        self.connections.insert(connection_id, handle.clone());
        self.next_worker_sequence.fetch_add(1, Ordering::Relaxed);
        (handle, MailboxReceiver { mailbox })
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|e| e.clone())
    }

    /// Bind an authenticated identity to a connection. Returns the previous
    /// connection id for this username, if any — the caller must evict it
    /// with close code 4006, enforcing a single active session per user.
    pub fn attach_identity(&self, connection_id: ConnectionId, identity: Identity) -> Option<ConnectionId> {
        let username = identity.username.clone();
        if let Some(handle) = self.connections.get(&connection_id) {
            *handle.identity.write().unwrap() = Some(Arc::new(identity));
            handle.authenticated.store(true, Ordering::Release);
        }
        let previous = self.by_username.insert(username, connection_id);
        previous.filter(|prev| *prev != connection_id)
    }

    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&connection_id).map(|(_, h)| h);
        if let Some(handle) = &removed {
            if let Some(username) = handle.username() {
                // Only clear the username index if it still points at us —
                // an evicting connection may already have overwritten it.
                self.by_username.remove_if(&username, |_, v| *v == connection_id);
            }
        }
        removed
    }

    pub fn connection_for_username(&self, username: &str) -> Option<Arc<ConnectionHandle>> {
        let connection_id = *self.by_username.get(username)?;
        self.get(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn online_usernames(&self) -> Vec<String> {
        self.by_username.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn identity(username: &str) -> Identity {
        Identity {
            user_id: uuid::Uuid::now_v7(),
            username: username.to_string(),
            display_name: username.to_string(),
            avatar_url: None,
            role: Role::Member,
        }
    }

    #[test]
    fn attaching_identity_twice_evicts_previous_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = registry.register();
        let (second, _rx2) = registry.register();

        assert!(registry.attach_identity(first.connection_id, identity("alice")).is_none());
        let evicted = registry.attach_identity(second.connection_id, identity("alice"));
        assert_eq!(evicted, Some(first.connection_id));
        assert_eq!(registry.connection_for_username("alice").unwrap().connection_id, second.connection_id);
    }

    #[test]
    fn incoming_normal_priority_evicts_oldest_queued_low_priority_frame() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register();
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            let outcome = handle.enqueue(Frame::TypingStart { channel_id: uuid::Uuid::now_v7() });
            assert_eq!(outcome, EnqueueOutcome::Sent);
        }
        let outcome = handle.enqueue(Frame::LeaveVoice);
        assert_eq!(outcome, EnqueueOutcome::Sent);
    }

    #[test]
    fn full_queue_of_normal_priority_frames_reports_queue_full() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register();
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            let outcome = handle.enqueue(Frame::LeaveVoice);
            assert_eq!(outcome, EnqueueOutcome::Sent);
        }
        let outcome = handle.enqueue(Frame::LeaveVoice);
        assert_eq!(outcome, EnqueueOutcome::QueueFull);
    }

    #[test]
    fn full_queue_drops_incoming_low_priority_frame_and_counts_it() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register();
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            let outcome = handle.enqueue(Frame::LeaveVoice);
            assert_eq!(outcome, EnqueueOutcome::Sent);
        }
        let outcome = handle.enqueue(Frame::TypingStart { channel_id: uuid::Uuid::now_v7() });
        assert_eq!(outcome, EnqueueOutcome::DroppedLowPriority);
        assert_eq!(handle.dropped_low_priority_count(), 1);
    }

    #[test]
    fn removing_connection_clears_username_index() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register();
        registry.attach_identity(handle.connection_id, identity("bob"));
        registry.remove(handle.connection_id);
        assert!(registry.connection_for_username("bob").is_none());
    }
}
