//! Lifecycle events fired by a [`TransactionSession`](crate::TransactionSession).
//!
//! Listeners are registered once on an [`EventBus`] and receive every event of
//! every request in dispatch order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{Method, Uri};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{Level, event};
use uuid::Uuid;

/// Lifecycle points at which events are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePoint {
    BeforeBeginTransaction,
    AfterBeginTransaction,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
    BeforeEveryRollback,
    AfterEveryRollback,
}

impl LifecyclePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePoint::BeforeBeginTransaction => "before_begin_transaction",
            LifecyclePoint::AfterBeginTransaction => "after_begin_transaction",
            LifecyclePoint::BeforeCommit => "before_commit",
            LifecyclePoint::AfterCommit => "after_commit",
            LifecyclePoint::BeforeRollback => "before_rollback",
            LifecyclePoint::AfterRollback => "after_rollback",
            LifecyclePoint::BeforeEveryRollback => "before_every_rollback",
            LifecyclePoint::AfterEveryRollback => "after_every_rollback",
        }
    }

    pub fn rollback_pair(is_final: bool) -> (LifecyclePoint, LifecyclePoint) {
        if is_final {
            (LifecyclePoint::BeforeRollback, LifecyclePoint::AfterRollback)
        } else {
            (
                LifecyclePoint::BeforeEveryRollback,
                LifecyclePoint::AfterEveryRollback,
            )
        }
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned snapshot of the request a transaction runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub request_id: Uuid,
    #[serde(serialize_with = "serialize_display")]
    pub method: Method,
    #[serde(serialize_with = "serialize_display")]
    pub uri: Uri,
    pub route_name: Option<String>,
}

impl RequestInfo {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
            uri,
            route_name: None,
        }
    }

    pub fn with_route_name(mut self, route_name: impl Into<String>) -> Self {
        self.route_name = Some(route_name.into());
        self
    }
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub point: LifecyclePoint,
    /// `None` when fired from the `transaction()` helper
    pub request: Option<RequestInfo>,
    pub current_attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(point: LifecyclePoint, request: Option<RequestInfo>, current_attempt: u32) -> Self {
        Self {
            point,
            request,
            current_attempt,
            occurred_at: Utc::now(),
        }
    }
}

/// Observer registered by the host application.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent);
}

/// Fan-out of lifecycle events to registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Vec<Arc<dyn TransactionListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub async fn dispatch(&self, event: &LifecycleEvent) {
        for listener in &self.listeners {
            listener.on_event(event).await;
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Logs each lifecycle event at DEBUG level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

#[async_trait]
impl TransactionListener for TracingListener {
    async fn on_event(&self, lifecycle: &LifecycleEvent) {
        let request_id = lifecycle
            .request
            .as_ref()
            .map(|r| r.request_id.to_string())
            .unwrap_or_default();
        event!(
            Level::DEBUG,
            point = %lifecycle.point,
            attempt = lifecycle.current_attempt,
            request_id = %request_id,
            "transaction lifecycle event"
        );
    }
}

/// Keeps every event it receives, in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded `(point, attempt)` pairs
    pub fn points(&self) -> Vec<(LifecyclePoint, u32)> {
        self.events()
            .into_iter()
            .map(|e| (e.point, e.current_attempt))
            .collect()
    }

    pub fn count(&self, point: LifecyclePoint) -> usize {
        self.events().iter().filter(|e| e.point == point).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl TransactionListener for RecordingListener {
    async fn on_event(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
