//! Subscription and publication bookkeeping
//!
//! These objects track the contract between the client and its caller: a
//! `Subscription` counts deliveries into one callback, a `Publication`
//! records the one-shot outcome of a publish.

use crate::channel::Channel;
use crate::client::ClientCore;
use crate::error::{BayeuxError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Internal state of one subscription, shared between the registry entry
/// and the handle returned to the caller.
pub(crate) struct SubscriptionState {
    id: Uuid,
    channel: Channel,
    active: AtomicBool,
    created_at: SystemTime,
    last_used: Mutex<Option<SystemTime>>,
    message_count: AtomicU64,
    error_count: AtomicU64,
}

impl SubscriptionState {
    pub(crate) fn new(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel,
            active: AtomicBool::new(true),
            created_at: SystemTime::now(),
            last_used: Mutex::new(None),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Count a delivery into the callback
    pub(crate) fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Some(SystemTime::now());
    }

    /// Count a callback failure
    pub(crate) fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub(crate) fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub(crate) fn last_used(&self) -> Option<SystemTime> {
        *self.last_used.lock()
    }
}

/// An active subscription returned by `BayeuxClient::subscribe`.
///
/// Dropping the handle leaves the subscription in place; call
/// [`Subscription::cancel`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.state.channel)
            .field("active", &self.state.is_active())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubscriptionState>, core: Arc<ClientCore>) -> Self {
        Self { state, core }
    }

    /// Opaque subscription id
    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    /// The channel or pattern this subscription listens on
    pub fn channel(&self) -> &Channel {
        self.state.channel()
    }

    /// Whether the callback is still eligible to fire
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn created_at(&self) -> SystemTime {
        self.state.created_at()
    }

    /// When the callback last fired
    pub fn last_used(&self) -> Option<SystemTime> {
        self.state.last_used()
    }

    /// Number of messages delivered to the callback
    pub fn message_count(&self) -> u64 {
        self.state.message_count()
    }

    /// Number of callback failures
    pub fn error_count(&self) -> u64 {
        self.state.error_count()
    }

    /// Deactivate this subscription and remove it from the client.
    ///
    /// If this was the last subscription on its channel, the channel is
    /// unsubscribed from the server as well.
    pub async fn cancel(self) -> Result<()> {
        self.core.cancel_subscription(&self.state).await
    }
}

/// The outcome of a publish.
///
/// A publication is created pending and reaches exactly one terminal
/// state; later marks are ignored so the first outcome is never
/// overwritten.
#[derive(Debug, Clone)]
pub struct Publication {
    id: String,
    channel: String,
    data: Value,
    ext: Option<Value>,
    created_at: SystemTime,
    completed_at: Option<SystemTime>,
    successful: bool,
    error: Option<BayeuxError>,
    subscriber_count: u64,
}

impl Publication {
    pub(crate) fn new(
        id: String,
        channel: String,
        data: Value,
        subscriber_count: u64,
    ) -> Self {
        Self {
            id,
            channel,
            data,
            ext: None,
            created_at: SystemTime::now(),
            completed_at: None,
            successful: false,
            error: None,
            subscriber_count,
        }
    }

    pub(crate) fn mark_successful(&mut self) {
        if self.completed_at.is_some() {
            return;
        }
        self.successful = true;
        self.completed_at = Some(SystemTime::now());
    }

    pub(crate) fn mark_failed(&mut self, error: BayeuxError) {
        if self.completed_at.is_some() {
            return;
        }
        self.error = Some(error);
        self.completed_at = Some(SystemTime::now());
    }

    pub(crate) fn set_ext(&mut self, ext: Value) {
        self.ext = Some(ext);
    }

    /// Correlation id the publish was sent with
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn ext(&self) -> Option<&Value> {
        self.ext.as_ref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        self.completed_at
    }

    /// Whether a terminal state has been reached
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn error(&self) -> Option<&BayeuxError> {
        self.error.as_ref()
    }

    /// Number of local subscriptions whose pattern matched the channel at
    /// publish time
    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count
    }
}
