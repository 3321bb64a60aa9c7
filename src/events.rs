//! Typed lifecycle event bus.
//!
//! Every routing and execution decision publishes an event here. Delivery is
//! fire-and-forget: subscribers run synchronously at the publication site, a
//! panicking subscriber is logged and removed without affecting the query,
//! and ordering is guaranteed only within a single query. Subscribers that
//! need to do I/O should hand the event off to their own worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    QueryStart,
    ComplexityDetected,
    DomainDetected,
    ModelCallStart,
    ModelCallComplete,
    ModelCallError,
    CascadeDecision,
    BudgetWarning,
    BudgetExceeded,
    QueryComplete,
    QueryError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::QueryStart => "QUERY_START",
            Self::ComplexityDetected => "COMPLEXITY_DETECTED",
            Self::DomainDetected => "DOMAIN_DETECTED",
            Self::ModelCallStart => "MODEL_CALL_START",
            Self::ModelCallComplete => "MODEL_CALL_COMPLETE",
            Self::ModelCallError => "MODEL_CALL_ERROR",
            Self::CascadeDecision => "CASCADE_DECISION",
            Self::BudgetWarning => "BUDGET_WARNING",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::QueryComplete => "QUERY_COMPLETE",
            Self::QueryError => "QUERY_ERROR",
        };
        f.write_str(s)
    }
}

/// One published event: `{kind, ts, query_id, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeEvent {
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub query_id: Uuid,
    pub payload: Value,
}

impl CascadeEvent {
    pub fn new(kind: EventKind, query_id: Uuid, payload: Value) -> Self {
        Self {
            kind,
            ts: Utc::now(),
            query_id,
            payload,
        }
    }

    // Convenience constructors for the common shapes.

    pub fn query_start(query_id: Uuid, text: &str) -> Self {
        Self::new(EventKind::QueryStart, query_id, json!({ "text": text }))
    }

    pub fn model_call_start(query_id: Uuid, model: &str, provider: &str, step: &str) -> Self {
        Self::new(
            EventKind::ModelCallStart,
            query_id,
            json!({ "model": model, "provider": provider, "step": step }),
        )
    }

    pub fn model_call_complete(
        query_id: Uuid,
        model: &str,
        step: &str,
        cost: f64,
        latency_ms: u64,
    ) -> Self {
        Self::new(
            EventKind::ModelCallComplete,
            query_id,
            json!({ "model": model, "step": step, "cost": cost, "latency_ms": latency_ms }),
        )
    }

    pub fn model_call_error(query_id: Uuid, model: &str, step: &str, error: &str) -> Self {
        Self::new(
            EventKind::ModelCallError,
            query_id,
            json!({ "model": model, "step": step, "error": error }),
        )
    }

    pub fn cascade_decision(query_id: Uuid, accepted: bool, reason: &str, quality: f64) -> Self {
        Self::new(
            EventKind::CascadeDecision,
            query_id,
            json!({
                "decision": if accepted { "accept" } else { "escalate" },
                "reason": reason,
                "quality_score": quality,
            }),
        )
    }

    pub fn query_error(query_id: Uuid, kind: &str, message: &str) -> Self {
        Self::new(
            EventKind::QueryError,
            query_id,
            json!({ "error_kind": kind, "message": message }),
        )
    }
}

type Callback = Arc<dyn Fn(&CascadeEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` subscribes to every kind.
    kinds: Option<HashSet<EventKind>>,
    callback: Callback,
}

/// Handle returned by [`CallbackBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Fan-out bus with a copy-on-write subscriber table.
///
/// `publish` takes a snapshot of the table, so registration never blocks a
/// query in flight and delivery order within a query matches publication
/// order.
pub struct CallbackBus {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl CallbackBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(None, Arc::new(callback))
    }

    /// Subscribe to a specific set of kinds.
    pub fn subscribe_kinds<F>(&self, kinds: &[EventKind], callback: F) -> SubscriptionId
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(Some(kinds.iter().copied().collect()), Arc::new(callback))
    }

    fn subscribe_inner(&self, kinds: Option<HashSet<EventKind>>, callback: Callback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.subscribers.write().expect("subscriber table poisoned");
        let mut next: Vec<Subscriber> = Vec::with_capacity(table.len() + 1);
        next.extend(table.iter().map(|s| Subscriber {
            id: s.id,
            kinds: s.kinds.clone(),
            callback: Arc::clone(&s.callback),
        }));
        next.push(Subscriber { id, kinds, callback });
        *table = Arc::new(next);
        SubscriptionId(id)
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.remove_ids(&[id.0]);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber table poisoned")
            .len()
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// A subscriber that panics is removed from the table and never affects
    /// the query or the remaining subscribers.
    pub fn publish(&self, event: &CascadeEvent) {
        let snapshot = Arc::clone(&self.subscribers.read().expect("subscriber table poisoned"));

        let mut panicked: Vec<u64> = Vec::new();
        for subscriber in snapshot.iter() {
            if let Some(kinds) = &subscriber.kinds {
                if !kinds.contains(&event.kind) {
                    continue;
                }
            }
            let callback = Arc::clone(&subscriber.callback);
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    subscriber_id = subscriber.id,
                    kind = %event.kind,
                    "event subscriber panicked; removing it"
                );
                panicked.push(subscriber.id);
            }
        }

        if !panicked.is_empty() {
            self.remove_ids(&panicked);
        }
    }

    fn remove_ids(&self, ids: &[u64]) {
        let mut table = self.subscribers.write().expect("subscriber table poisoned");
        let next: Vec<Subscriber> = table
            .iter()
            .filter(|s| !ids.contains(&s.id))
            .map(|s| Subscriber {
                id: s.id,
                kinds: s.kinds.clone(),
                callback: Arc::clone(&s.callback),
            })
            .collect();
        *table = Arc::new(next);
    }
}

impl Default for CallbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminator frame for the SSE stream mode.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Encode a JSON-serializable delta as a server-sent-event frame.
///
/// Each frame is independently parseable: `data: {json}\n\n`.
pub fn sse_frame<T: Serialize>(delta: &T) -> String {
    let body = serde_json::to_string(delta).unwrap_or_else(|_| "{}".to_string());
    format!("data: {body}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn event(kind: EventKind) -> CascadeEvent {
        CascadeEvent::new(kind, Uuid::new_v4(), json!({}))
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = CallbackBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event(EventKind::QueryStart));
        bus.publish(&event(EventKind::QueryComplete));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kind_filter() {
        let bus = CallbackBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe_kinds(&[EventKind::BudgetWarning], move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&event(EventKind::QueryStart));
        bus.publish(&event(EventKind::BudgetWarning));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_removed() {
        let bus = CallbackBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        bus.subscribe(|_| panic!("subscriber bug"));
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&event(EventKind::QueryStart));
        // The healthy subscriber still ran; the panicking one is gone.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&event(EventKind::QueryStart));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = CallbackBus::new();
        let id = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_per_query_publication_order() {
        let bus = CallbackBus::new();
        let log: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        bus.subscribe(move |e| sink.lock().unwrap().push(e.kind));

        let query_id = Uuid::new_v4();
        for kind in [
            EventKind::QueryStart,
            EventKind::ComplexityDetected,
            EventKind::DomainDetected,
            EventKind::ModelCallStart,
            EventKind::ModelCallComplete,
            EventKind::QueryComplete,
        ] {
            bus.publish(&CascadeEvent::new(kind, query_id, json!({})));
        }

        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                EventKind::QueryStart,
                EventKind::ComplexityDetected,
                EventKind::DomainDetected,
                EventKind::ModelCallStart,
                EventKind::ModelCallComplete,
                EventKind::QueryComplete,
            ]
        );
    }

    #[test]
    fn test_sse_frames() {
        let frame = sse_frame(&json!({"content": "hel", "done": false}));
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        // Each frame body is independently parseable.
        let body = frame.trim_start_matches("data: ").trim_end();
        assert!(serde_json::from_str::<Value>(body).is_ok());
        assert_eq!(SSE_DONE, "data: [DONE]\n\n");
    }

    #[test]
    fn test_event_serialization_shape() {
        let e = CascadeEvent::query_start(Uuid::nil(), "hi");
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["kind"], "QUERY_START");
        assert!(value["ts"].is_string());
        assert_eq!(value["payload"]["text"], "hi");
    }
}
