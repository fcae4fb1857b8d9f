//! Structured decision events.
//!
//! Every evaluation produces one [`DecisionEvent`]. Events are queued on a
//! bounded channel with `try_send` so the connection path never waits on a
//! slow consumer; when the queue is full the event is dropped and counted.

use crate::types::{current_timestamp_millis, Action, CountryCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What produced the action in an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// A fresh rule-set evaluation
    Rule,
    /// Served from the decision cache
    Cached,
    /// Refused by the connection guard before any lookup
    Guard,
    /// The address could not be parsed
    InvalidInput,
    /// The geolocation lookup exceeded its time budget or too many lookups
    /// were already in flight
    Timeout,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecisionReason::Rule => "rule",
            DecisionReason::Cached => "cached",
            DecisionReason::Guard => "guard",
            DecisionReason::InvalidInput => "invalid input",
            DecisionReason::Timeout => "lookup timeout",
        };
        f.write_str(text)
    }
}

/// One evaluation, as seen by audit consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    /// `None` when the input could not be parsed
    pub ip: Option<IpAddr>,
    /// The text the host passed in
    pub raw_input: String,
    pub action: Action,
    pub reason: DecisionReason,
    pub country: CountryCode,
    /// Human-readable description of the matched rule or block cause
    pub detail: String,
    pub latency_micros: u64,
    pub rule_version: u64,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl DecisionEvent {
    pub fn new(
        ip: Option<IpAddr>,
        raw_input: impl Into<String>,
        action: Action,
        reason: DecisionReason,
        country: CountryCode,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ip,
            raw_input: raw_input.into(),
            action,
            reason,
            country,
            detail: detail.into(),
            latency_micros: 0,
            rule_version: 0,
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn with_latency_micros(mut self, latency_micros: u64) -> Self {
        self.latency_micros = latency_micros;
        self
    }

    pub fn with_rule_version(mut self, rule_version: u64) -> Self {
        self.rule_version = rule_version;
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.action == Action::Deny
    }
}

/// Sending half of the decision event channel.
///
/// Cloning is cheap; all clones share the same drop counter.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Option<mpsc::Sender<DecisionEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Creates a sink and the receiver its events arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DecisionEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, receiver)
    }

    /// A sink that discards everything without counting it.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues an event without waiting.
    pub fn emit(&self, event: DecisionEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        // Full queue or departed consumer: the connection path must not wait
        if sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: Action) -> DecisionEvent {
        DecisionEvent::new(
            Some("192.0.2.1".parse().unwrap()),
            "192.0.2.1",
            action,
            DecisionReason::Rule,
            CountryCode::Unknown,
            "default",
        )
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (sink, mut receiver) = EventSink::channel(8);
        sink.emit(event(Action::Allow));
        sink.emit(event(Action::Deny).with_rule_version(7));

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.action, Action::Allow);
        assert!(second.is_blocked());
        assert_eq!(second.rule_version, 7);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (sink, _receiver) = EventSink::channel(2);
        for _ in 0..5 {
            sink.emit(event(Action::Deny));
        }
        assert_eq!(sink.dropped(), 3);
    }

    #[tokio::test]
    async fn test_closed_channel_counts_drops() {
        let (sink, receiver) = EventSink::channel(2);
        drop(receiver);
        sink.emit(event(Action::Allow));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = EventSink::disabled();
        sink.emit(event(Action::Allow));
        assert_eq!(sink.dropped(), 0);
        assert!(!sink.is_enabled());
    }

    #[test]
    fn test_event_serializes_reason_snake_case() {
        let mut e = event(Action::Deny);
        e.reason = DecisionReason::InvalidInput;
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["reason"], "invalid_input");
        assert_eq!(json["action"], "deny");
    }
}
