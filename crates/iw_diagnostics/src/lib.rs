//! Event bus, diagnostics envelopes, and rolling-file logging shared by
//! every import-wizard crate (component C, §4.C, §10.2).

pub mod events;
pub mod logging;

pub use events::{Envelope, EventBus};

use serde_json::Value;
use std::time::Instant;

/// RAII-style helper for the `operation.start` / `operation.end` pair that
/// must bracket every observable operation (§5 "diagnostics from a single
/// operation are strictly totally ordered").
///
/// Usage: build one at the top of an operation, call `.end(bus, Ok(data))`
/// or `.end(bus, Err(message))` on every exit path.
pub struct OperationSpan<'a> {
    bus: &'a EventBus,
    component: String,
    operation: String,
    context: Value,
    started_at: Instant,
}

impl<'a> OperationSpan<'a> {
    pub fn start(bus: &'a EventBus, component: &str, operation: &str, context: Value) -> Self {
        bus.publish("operation.start", component, operation, context.clone());
        Self {
            bus,
            component: component.to_string(),
            operation: operation.to_string(),
            context,
            started_at: Instant::now(),
        }
    }

    pub fn end_ok(self, extra: Value) {
        self.end(true, None, extra);
    }

    pub fn end_err(self, message: impl Into<String>, extra: Value) {
        self.end(false, Some(message.into()), extra);
    }

    fn end(self, ok: bool, error: Option<String>, extra: Value) {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let mut data = self.context;
        merge(&mut data, extra);
        merge(
            &mut data,
            serde_json::json!({ "ok": ok, "duration_ms": duration_ms, "error": error }),
        );
        self.bus
            .publish("operation.end", &self.component, &self.operation, data);
    }
}

fn merge(base: &mut Value, extra: Value) {
    let (Value::Object(base_map), Value::Object(extra_map)) = (base, extra) else {
        return;
    };
    for (k, v) in extra_map {
        base_map.insert(k, v);
    }
}
