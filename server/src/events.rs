//! Security events and the sinks that receive them.
//!
//! The admission controller and session guardian never log or alert directly;
//! they emit a [`SecurityEvent`] into whatever [`AuditSink`] they were built
//! with. Sinks must not block the caller.

use crate::validation::sanitize_for_log;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Warnings and above are also operator alerts.
    pub fn is_alert(self) -> bool {
        self >= Severity::Warning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    ChallengeCreated,
    RateLimited,
    InvalidOrigin,
    HandshakeSuccess,
    HandshakeTimeout,
    HandshakeInvalid,
    Lockout,
    LockedOutAttempt,
    SessionCreated,
    SessionSwap,
    SessionFlagged,
    SessionPurged,
}

impl EventTag {
    pub fn as_str(self) -> &'static str {
        match self {
            EventTag::ChallengeCreated => "CHALLENGE_CREATED",
            EventTag::RateLimited => "RATE_LIMITED",
            EventTag::InvalidOrigin => "INVALID_ORIGIN",
            EventTag::HandshakeSuccess => "HANDSHAKE_SUCCESS",
            EventTag::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            EventTag::HandshakeInvalid => "HANDSHAKE_INVALID",
            EventTag::Lockout => "LOCKOUT",
            EventTag::LockedOutAttempt => "LOCKED_OUT_ATTEMPT",
            EventTag::SessionCreated => "SESSION_CREATED",
            EventTag::SessionSwap => "SESSION_SWAP_DETECTED",
            EventTag::SessionFlagged => "SESSION_FLAGGED",
            EventTag::SessionPurged => "SESSION_PURGED",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityEvent {
    pub severity: Severity,
    pub tag: EventTag,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(severity: Severity, tag: EventTag, detail: impl Into<String>) -> Self {
        Self {
            severity,
            tag,
            detail: detail.into(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: SecurityEvent);
}

/// Writes events through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn record(&self, event: SecurityEvent) {
        let detail = sanitize_for_log(&event.detail);
        match event.severity {
            Severity::Info => info!("[{}] {}", event.tag, detail),
            Severity::Warning => warn!("[{}] {}", event.tag, detail),
            Severity::Critical => error!("[{}] {}", event.tag, detail),
        }
    }
}

/// Forwards events to an async consumer over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SecurityEvent>,
}

impl ChannelSink {
    /// Creates the sink together with the receiving end for the consumer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SecurityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelSink {
    fn record(&self, event: SecurityEvent) {
        // A closed receiver means nobody is listening; dropping is fine.
        let _ = self.tx.send(event);
    }
}

/// Log target the operator-alert channel writes under, so alerts can be
/// routed separately with `RUST_LOG=warden::alert=warn`.
pub const ALERT_TARGET: &str = "warden::alert";

/// Passes on only events that are operator alerts.
#[derive(Debug, Clone)]
pub struct AlertFilter<S> {
    inner: S,
}

impl<S: AuditSink> AlertFilter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: AuditSink> AuditSink for AlertFilter<S> {
    fn record(&self, event: SecurityEvent) {
        if event.severity.is_alert() {
            self.inner.record(event);
        }
    }
}

/// Drains an alert channel until every sender is gone, writing each alert
/// under [`ALERT_TARGET`]. Returns how many alerts were delivered.
pub async fn forward_alerts(mut rx: mpsc::UnboundedReceiver<SecurityEvent>) -> usize {
    let mut delivered = 0;
    while let Some(event) = rx.recv().await {
        let detail = sanitize_for_log(&event.detail);
        match event.severity {
            Severity::Critical => error!(target: ALERT_TARGET, "ALERT [{}] {}", event.tag, detail),
            _ => warn!(target: ALERT_TARGET, "ALERT [{}] {}", event.tag, detail),
        }
        delivered += 1;
    }
    delivered
}

/// Delivers every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for MultiSink {
    fn record(&self, event: SecurityEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Keeps events in memory. Used by tests and by operator tooling that wants
/// to inspect recent history.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, tag: EventTag) -> usize {
        self.events.lock().iter().filter(|e| e.tag == tag).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_threshold() {
        assert!(!Severity::Info.is_alert());
        assert!(Severity::Warning.is_alert());
        assert!(Severity::Critical.is_alert());
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(EventTag::SessionSwap.to_string(), "SESSION_SWAP_DETECTED");
        assert_eq!(EventTag::Lockout.as_str(), "LOCKOUT");
    }

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.record(SecurityEvent::new(
            Severity::Info,
            EventTag::ChallengeCreated,
            "origin 1.2.3.4",
        ));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.tag, EventTag::ChallengeCreated);
        assert_eq!(event.detail, "origin 1.2.3.4");
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.record(SecurityEvent::new(Severity::Info, EventTag::Lockout, ""));
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let multi = MultiSink::new(vec![a.clone() as Arc<dyn AuditSink>, b.clone()]);
        multi.record(SecurityEvent::new(
            Severity::Warning,
            EventTag::SessionSwap,
            "x",
        ));
        assert_eq!(a.count(EventTag::SessionSwap), 1);
        assert_eq!(b.count(EventTag::SessionSwap), 1);
    }

    #[tokio::test]
    async fn test_alert_channel_carries_only_alerts() {
        let (channel, rx) = ChannelSink::new();
        let audit = Arc::new(MemorySink::new());
        let sink = MultiSink::new(vec![
            audit.clone() as Arc<dyn AuditSink>,
            Arc::new(AlertFilter::new(channel)),
        ]);

        sink.record(SecurityEvent::new(Severity::Info, EventTag::HandshakeSuccess, "ok"));
        sink.record(SecurityEvent::new(Severity::Warning, EventTag::HandshakeInvalid, "bad"));
        sink.record(SecurityEvent::new(Severity::Critical, EventTag::Lockout, "locked"));
        drop(sink);

        assert_eq!(audit.events().len(), 3);
        assert_eq!(forward_alerts(rx).await, 2);
    }
}
