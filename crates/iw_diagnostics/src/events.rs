//! Process-wide event bus, diagnostics envelopes, and the ring buffer that
//! backs streaming reads (component C, §4.C).

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Fields copied onto every envelope when present in the call-site `data`.
const REQUIRED_CONTEXT_KEYS: &[&str] = &[
    "session_id",
    "model_fingerprint",
    "discovery_fingerprint",
    "effective_config_fingerprint",
    "conflict_fingerprint",
    "job_id",
    "idempotency_key",
];

/// The wire shape of a single diagnostics event (§4.C, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub component: String,
    pub operation: String,
    /// ISO-8601 UTC, second resolution.
    pub timestamp: String,
    pub data: Value,
    /// Monotonically increasing per-process sequence number; used by the
    /// ring buffer's streaming readers to resume after a given point.
    pub seq: u64,
}

type Subscriber = Box<dyn Fn(&Envelope) + Send + Sync>;

struct Subscription {
    pattern: String,
    callback: Subscriber,
}

/// Publish/subscribe bus plus an in-memory ring buffer of the last `N=2000`
/// events. One instance per process, keyed by the Wizards-root path per the
/// original's "process-wide singleton" design (§9).
pub struct EventBus {
    subscribers: Mutex<Vec<Subscription>>,
    ring: Mutex<VecDeque<Envelope>>,
    ring_capacity: usize,
    seq: AtomicU64,
    condvar: Condvar,
    heartbeat: Duration,
}

impl EventBus {
    pub const DEFAULT_RING_CAPACITY: usize = 2000;
    pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

    pub fn new() -> Arc<Self> {
        Self::with_capacity(Self::DEFAULT_RING_CAPACITY, Self::DEFAULT_HEARTBEAT_SECS)
    }

    pub fn with_capacity(ring_capacity: usize, heartbeat_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            seq: AtomicU64::new(0),
            condvar: Condvar::new(),
            heartbeat: Duration::from_secs(heartbeat_secs),
        })
    }

    /// Subscribe to an exact event name, or `"*"` for every event. Returns
    /// nothing callers need to track: subscriptions live for the bus's
    /// lifetime, matching the original's module-level registration style.
    pub fn subscribe<F>(&self, pattern: &str, callback: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.push(Subscription {
            pattern: pattern.to_string(),
            callback: Box::new(callback),
        });
    }

    /// Build and publish an envelope. Fail-safe: panics raised inside a
    /// subscriber are caught and dropped, never propagated to the publisher
    /// (§4.C, §7 "fail-safe emissions").
    pub fn publish(&self, event: &str, component: &str, operation: &str, mut data: Value) {
        if !data.is_object() {
            data = Value::Object(Map::new());
        }
        let envelope = Envelope {
            event: event.to_string(),
            component: component.to_string(),
            operation: operation.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data: with_required_context(data),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        tracing::debug!(
            event = %envelope.event,
            component = %envelope.component,
            operation = %envelope.operation,
            "diagnostics"
        );

        {
            let mut ring = self.ring.lock().expect("ring lock poisoned");
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(envelope.clone());
        }
        self.condvar.notify_all();

        let subs = self.subscribers.lock().expect("subscribers lock poisoned");
        for sub in subs.iter() {
            if sub.pattern != "*" && sub.pattern != envelope.event {
                continue;
            }
            // A subscriber's own panic must never take down the publisher.
            let _ = catch_unwind(AssertUnwindSafe(|| (sub.callback)(&envelope)));
        }
    }

    /// Snapshot of every buffered event at or after `since_seq`, blocking up
    /// to the heartbeat interval if nothing new has arrived yet. Returns an
    /// empty vec on a heartbeat timeout so long-lived streams stay alive.
    pub fn poll_since(&self, since_seq: u64) -> Vec<Envelope> {
        let ring = self.ring.lock().expect("ring lock poisoned");
        let (ring, _timed_out) = self
            .condvar
            .wait_timeout_while(ring, self.heartbeat, |ring| {
                ring.back().map(|e| e.seq < since_seq).unwrap_or(true)
            })
            .expect("ring lock poisoned");
        ring.iter()
            .filter(|e| e.seq >= since_seq)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Envelope> {
        self.ring.lock().expect("ring lock poisoned").iter().cloned().collect()
    }

    pub fn latest_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

fn with_required_context(data: Value) -> Value {
    let Value::Object(mut map) = data else {
        return data;
    };
    let mut envelope_body = Map::new();
    for key in REQUIRED_CONTEXT_KEYS {
        if let Some(v) = map.get(*key) {
            envelope_body.insert((*key).to_string(), v.clone());
        }
    }
    // The rest of the call-site payload rides alongside under the original
    // keys; required context is duplicated at the top so readers that only
    // care about correlation ids don't need to know each event's full shape.
    for (k, v) in map.iter() {
        envelope_body.entry(k.clone()).or_insert_with(|| v.clone());
    }
    map.clear();
    Value::Object(envelope_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_reaches_exact_and_wildcard_subscribers() {
        let bus = EventBus::new();
        let exact_hits = Arc::new(AtomicUsize::new(0));
        let wildcard_hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = Arc::clone(&exact_hits);
            bus.subscribe("session.start", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let hits = Arc::clone(&wildcard_hits);
            bus.subscribe("*", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish("session.start", "wizard", "create_session", serde_json::json!({}));
        bus.publish("plan.compute", "wizard", "compute_plan", serde_json::json!({}));

        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscriber_panic_does_not_propagate() {
        let bus = EventBus::new();
        bus.subscribe("*", |_| panic!("boom"));
        // Must not panic the publisher.
        bus.publish("model.load", "wizard", "load", serde_json::json!({}));
        assert_eq!(bus.snapshot().len(), 1);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let bus = EventBus::with_capacity(3, 15);
        for i in 0..10 {
            bus.publish("step.submit", "wizard", "submit_step", serde_json::json!({"i": i}));
        }
        assert_eq!(bus.snapshot().len(), 3);
        let last = bus.snapshot();
        assert_eq!(last.last().unwrap().data["i"], 9);
    }

    #[test]
    fn required_context_is_copied() {
        let bus = EventBus::new();
        bus.publish(
            "session.start",
            "wizard",
            "create_session",
            serde_json::json!({"session_id": "abc123", "extra": "field"}),
        );
        let env = bus.snapshot().pop().unwrap();
        assert_eq!(env.data["session_id"], "abc123");
        assert_eq!(env.data["extra"], "field");
    }
}
