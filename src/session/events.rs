//! Protocol event trace
//!
//! Bounded ring buffer of wire-level events for diagnostics. Request and
//! response records are correlated by request id so responses carry the
//! round-trip duration.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::protocol::RequestId;

/// Kind of traced event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Request written to the transport
    RequestSent,
    /// Response matched to a pending request
    ResponseReceived,
    /// Notification in either direction
    Notification,
    /// Failure while exchanging messages
    Error,
}

/// One traced event
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolEvent {
    /// Event kind
    pub kind: EventKind,
    /// Wall-clock time
    pub timestamp: DateTime<Utc>,
    /// Method involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request id, for requests and responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Round trip, for responses
    #[serde(skip_serializing_if = "Option::is_none", with = "duration_ms")]
    pub duration: Option<Duration>,
    /// True for server-to-client traffic
    pub inbound: bool,
    /// Error message or other detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64() * 1000.0),
            None => s.serialize_none(),
        }
    }
}

/// Aggregate counters over everything traced (not just what is buffered)
#[derive(Debug, Clone, Default, Serialize)]
pub struct TracingStatistics {
    /// Requests sent
    pub requests_sent: u64,
    /// Responses received
    pub responses_received: u64,
    /// Responses carrying a JSON-RPC error
    pub error_responses: u64,
    /// Notifications seen
    pub notifications: u64,
    /// Exchange failures
    pub errors: u64,
    /// Requests still awaiting a response
    pub in_flight: usize,
    /// Mean round trip in milliseconds
    pub avg_latency_ms: f64,
    /// Events currently buffered
    pub buffered_events: usize,
    /// Ring buffer capacity
    pub capacity: usize,
}

struct TracerState {
    events: VecDeque<ProtocolEvent>,
    in_flight: HashMap<RequestId, (Instant, String)>,
    stats: TracingStatistics,
    total_latency: Duration,
}

/// Bounded protocol event recorder, shared by the session manager and every
/// protocol client it creates
pub struct ProtocolTracer {
    capacity: usize,
    state: Mutex<TracerState>,
}

impl ProtocolTracer {
    /// Create a tracer keeping at most `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(TracerState {
                events: VecDeque::with_capacity(capacity.min(1024)),
                in_flight: HashMap::new(),
                stats: TracingStatistics::default(),
                total_latency: Duration::ZERO,
            }),
        }
    }

    fn push(&self, state: &mut TracerState, event: ProtocolEvent) {
        if state.events.len() == self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    /// Record an outbound request
    pub fn request_sent(&self, id: &RequestId, method: &str) {
        let mut state = self.state.lock();
        state
            .in_flight
            .insert(id.clone(), (Instant::now(), method.to_string()));
        state.stats.requests_sent += 1;
        self.push(
            &mut state,
            ProtocolEvent {
                kind: EventKind::RequestSent,
                timestamp: Utc::now(),
                method: Some(method.to_string()),
                request_id: Some(id.to_string()),
                duration: None,
                inbound: false,
                detail: None,
            },
        );
    }

    /// Record the response to `id`. Returns the round trip when the request
    /// was traced.
    pub fn response_received(&self, id: &RequestId, error: Option<&str>) -> Option<Duration> {
        let mut state = self.state.lock();
        let started = state.in_flight.remove(id);
        let duration = started.as_ref().map(|(at, _)| at.elapsed());
        state.stats.responses_received += 1;
        if error.is_some() {
            state.stats.error_responses += 1;
        }
        if let Some(d) = duration {
            state.total_latency += d;
        }
        self.push(
            &mut state,
            ProtocolEvent {
                kind: EventKind::ResponseReceived,
                timestamp: Utc::now(),
                method: started.map(|(_, method)| method),
                request_id: Some(id.to_string()),
                duration,
                inbound: true,
                detail: error.map(str::to_string),
            },
        );
        duration
    }

    /// Record a notification
    pub fn notification(&self, method: &str, inbound: bool) {
        let mut state = self.state.lock();
        state.stats.notifications += 1;
        self.push(
            &mut state,
            ProtocolEvent {
                kind: EventKind::Notification,
                timestamp: Utc::now(),
                method: Some(method.to_string()),
                request_id: None,
                duration: None,
                inbound,
                detail: None,
            },
        );
    }

    /// Record an exchange failure. A request id, when given, stops being
    /// in flight.
    pub fn error(&self, method: Option<&str>, id: Option<&RequestId>, message: &str) {
        let mut state = self.state.lock();
        if let Some(id) = id {
            state.in_flight.remove(id);
        }
        state.stats.errors += 1;
        self.push(
            &mut state,
            ProtocolEvent {
                kind: EventKind::Error,
                timestamp: Utc::now(),
                method: method.map(str::to_string),
                request_id: id.map(ToString::to_string),
                duration: None,
                inbound: false,
                detail: Some(message.to_string()),
            },
        );
    }

    /// The `n` most recent events, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<ProtocolEvent> {
        let state = self.state.lock();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    /// Counter snapshot
    #[must_use]
    pub fn statistics(&self) -> TracingStatistics {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.in_flight = state.in_flight.len();
        stats.buffered_events = state.events.len();
        stats.capacity = self.capacity;
        #[allow(clippy::cast_precision_loss)]
        if stats.responses_received > 0 {
            stats.avg_latency_ms =
                state.total_latency.as_secs_f64() * 1000.0 / stats.responses_received as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlates_request_and_response() {
        let tracer = ProtocolTracer::new(10);
        let id = RequestId::Number(1);
        tracer.request_sent(&id, "tools/list");
        std::thread::sleep(Duration::from_millis(5));
        let rtt = tracer.response_received(&id, None).unwrap();
        assert!(rtt >= Duration::from_millis(5));

        let events = tracer.recent(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::ResponseReceived);
        assert_eq!(events[1].method.as_deref(), Some("tools/list"));
        assert_eq!(tracer.statistics().in_flight, 0);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let tracer = ProtocolTracer::new(3);
        for i in 0..5 {
            tracer.notification(&format!("n{i}"), true);
        }
        let events = tracer.recent(10);
        let methods: Vec<_> = events.iter().filter_map(|e| e.method.as_deref()).collect();
        assert_eq!(methods, vec!["n2", "n3", "n4"]);

        let stats = tracer.statistics();
        assert_eq!(stats.notifications, 5);
        assert_eq!(stats.buffered_events, 3);
    }

    #[test]
    fn recent_returns_tail() {
        let tracer = ProtocolTracer::new(10);
        tracer.notification("a", false);
        tracer.error(Some("b"), None, "boom");
        let tail = tracer.recent(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, EventKind::Error);
        assert_eq!(tail[0].detail.as_deref(), Some("boom"));
    }

    #[test]
    fn error_clears_in_flight_request() {
        let tracer = ProtocolTracer::new(10);
        let id = RequestId::Number(9);
        tracer.request_sent(&id, "ping");
        tracer.error(Some("ping"), Some(&id), "timed out");
        let stats = tracer.statistics();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.errors, 1);
    }
}
