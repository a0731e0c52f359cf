//! Session guardian: binds each authenticated identity to the origin it first
//! arrived from and refuses that identity from anywhere else.
//!
//! The bound-origin comparison and the create/deny decision happen inside one
//! shard lock, so two simultaneous logins for the same identity from two
//! origins can never both bind.

use crate::clock::{duration_millis, elapsed_millis, Clock};
use crate::config::SecurityConfig;
use crate::enforcement::Enforcer;
use crate::events::{AuditSink, EventTag, SecurityEvent, Severity};
use crate::fingerprint::{SessionFingerprint, COMPROMISED_THRESHOLD};
use crate::store::ShardedMap;
use log::debug;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warden_shared::Origin;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub fingerprint: SessionFingerprint,
    /// Set while the identity is offline and counting down its grace period.
    pub disconnected_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidOrigin,
    SessionSwap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    Created(SessionFingerprint),
    /// Same identity back from its bound origin.
    Resumed(SessionFingerprint),
    Denied(DenyReason),
}

impl SessionDecision {
    pub fn fingerprint(&self) -> Option<&SessionFingerprint> {
        match self {
            SessionDecision::Created(fp) | SessionDecision::Resumed(fp) => Some(fp),
            SessionDecision::Denied(_) => None,
        }
    }
}

struct Swap {
    original: Option<Origin>,
    suspicion: u32,
}

pub struct SessionGuardian {
    sessions: ShardedMap<Uuid, SessionRecord>,
    enforce_ip_lock: bool,
    ban_on_swap: bool,
    ban_duration: Duration,
    grace_ms: u64,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AuditSink>,
    enforcer: Arc<dyn Enforcer>,
}

impl SessionGuardian {
    /// Creates an empty guardian with the session policy from `config`.
    pub fn new(
        config: &SecurityConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
        enforcer: Arc<dyn Enforcer>,
    ) -> Self {
        Self {
            sessions: ShardedMap::new(),
            enforce_ip_lock: config.session.enforce_ip_lock,
            ban_on_swap: config.session.ban_on_swap,
            ban_duration: config.ban_duration(),
            grace_ms: duration_millis(config.session_grace()),
            clock,
            sink,
            enforcer,
        }
    }

    fn emit(&self, severity: Severity, tag: EventTag, detail: String) {
        self.sink.record(SecurityEvent::new(severity, tag, detail));
    }

    /// Pre-authentication check for `identity` arriving from an unvalidated origin.
    pub fn pre_login(&self, identity: Uuid, raw_origin: &str, protocol_version: u32) -> SessionDecision {
        match Origin::parse(raw_origin) {
            Some(origin) => self.admit(identity, origin, protocol_version),
            None => {
                self.emit(
                    Severity::Warning,
                    EventTag::InvalidOrigin,
                    format!("Invalid origin during login for {}", identity),
                );
                SessionDecision::Denied(DenyReason::InvalidOrigin)
            }
        }
    }

    /// Binds, resumes or refuses `identity` arriving from `origin`.
    ///
    /// A mismatch with IP lock enforced adds compromise-level suspicion to the
    /// existing session and, if configured, bans the new origin for the
    /// configured duration. With IP lock off the identity is rebound.
    pub fn admit(&self, identity: Uuid, origin: Origin, protocol_version: u32) -> SessionDecision {
        let now = self.clock.now_millis();
        let enforce = self.enforce_ip_lock;

        let outcome = self.sessions.with_entry(identity, |entry| match entry {
            Entry::Vacant(vacant) => {
                let fingerprint = SessionFingerprint::bound(identity, origin, protocol_version, now);
                vacant.insert(SessionRecord {
                    fingerprint: fingerprint.clone(),
                    disconnected_at: None,
                });
                Ok(SessionDecision::Created(fingerprint))
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.fingerprint.matches(&origin) {
                    record.disconnected_at = None;
                    Ok(SessionDecision::Resumed(record.fingerprint.clone()))
                } else if enforce {
                    record.fingerprint.increment_suspicion(COMPROMISED_THRESHOLD);
                    Err(Swap {
                        original: record.fingerprint.bound_origin(),
                        suspicion: record.fingerprint.suspicion(),
                    })
                } else {
                    let fingerprint = SessionFingerprint::bound(identity, origin, protocol_version, now);
                    occupied.insert(SessionRecord {
                        fingerprint: fingerprint.clone(),
                        disconnected_at: None,
                    });
                    Ok(SessionDecision::Created(fingerprint))
                }
            }
        });

        match outcome {
            Ok(decision) => {
                if let SessionDecision::Created(fp) = &decision {
                    debug!("Session created for {} from {}", identity, origin);
                    self.emit(
                        Severity::Info,
                        EventTag::SessionCreated,
                        format!("Identity: {} origin: {} hash: {}", identity, origin, fp.protocol_hash()),
                    );
                }
                decision
            }
            Err(swap) => {
                self.handle_swap(identity, origin, swap);
                SessionDecision::Denied(DenyReason::SessionSwap)
            }
        }
    }

    fn handle_swap(&self, identity: Uuid, new_origin: Origin, swap: Swap) {
        let original = swap
            .original
            .map(|o| o.to_string())
            .unwrap_or_else(|| "unbound".to_string());
        self.emit(
            Severity::Warning,
            EventTag::SessionSwap,
            format!(
                "Identity: {} original: {} new: {} suspicion: {}",
                identity, original, new_origin, swap.suspicion
            ),
        );
        if self.ban_on_swap {
            self.enforcer
                .block(&new_origin, self.ban_duration, "corrupted session detected");
        }
    }

    /// Makes sure a fingerprint exists once the identity is fully online,
    /// creating one with the real protocol version if the pre-login record is
    /// gone.
    pub fn ensure_session(&self, identity: Uuid, raw_origin: &str, protocol_version: u32) -> SessionFingerprint {
        let now = self.clock.now_millis();
        self.sessions.with_entry(identity, |entry| {
            entry
                .or_insert_with(|| SessionRecord {
                    fingerprint: SessionFingerprint::new(identity, raw_origin, protocol_version, now),
                    disconnected_at: None,
                })
                .fingerprint
                .clone()
        })
    }

    /// False when there is no session or the origin differs from the bound one.
    pub fn validate_session(&self, identity: Uuid, raw_origin: &str) -> bool {
        self.sessions
            .with_value(&identity, |record| record.fingerprint.validate_origin(raw_origin))
            .unwrap_or(false)
    }

    /// Starts the grace countdown. Returns false when there is no session.
    pub fn on_disconnect(&self, identity: Uuid) -> bool {
        let now = self.clock.now_millis();
        self.sessions
            .with_value(&identity, |record| record.disconnected_at = Some(now))
            .is_some()
    }

    /// Drops sessions whose grace period ran out without a reconnect.
    pub fn purge_disconnected(&self) -> usize {
        let now = self.clock.now_millis();
        let grace_ms = self.grace_ms;
        let mut purged = Vec::new();
        self.sessions.retain(|identity, record| match record.disconnected_at {
            Some(at) if elapsed_millis(now, at) >= grace_ms => {
                purged.push(*identity);
                false
            }
            _ => true,
        });
        for identity in &purged {
            self.emit(
                Severity::Info,
                EventTag::SessionPurged,
                format!("Identity: {}", identity),
            );
        }
        purged.len()
    }

    /// Operator action: raises the session to at least under investigation.
    /// Returns false when there is no session.
    pub fn flag_for_investigation(&self, identity: Uuid) -> bool {
        let flagged = self
            .sessions
            .with_value(&identity, |record| record.fingerprint.mark_investigated())
            .is_some();
        if flagged {
            self.emit(
                Severity::Warning,
                EventTag::SessionFlagged,
                format!("Identity: {}", identity),
            );
        }
        flagged
    }

    /// Adds `level` suspicion points. Returns false when there is no session.
    pub fn add_suspicion(&self, identity: Uuid, level: u32) -> bool {
        self.sessions
            .with_value(&identity, |record| record.fingerprint.increment_suspicion(level))
            .is_some()
    }

    /// Operator action: resets suspicion and status to active.
    pub fn clear_suspicion(&self, identity: Uuid) -> bool {
        self.sessions
            .with_value(&identity, |record| record.fingerprint.clear_suspicion())
            .is_some()
    }

    pub fn fingerprint(&self, identity: Uuid) -> Option<SessionFingerprint> {
        self.sessions.get(&identity).map(|record| record.fingerprint)
    }

    /// Snapshot of every tracked session.
    pub fn sessions(&self) -> Vec<(Uuid, SessionFingerprint)> {
        self.sessions
            .snapshot()
            .into_iter()
            .map(|(identity, record)| (identity, record.fingerprint))
            .collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::enforcement::BanList;
    use crate::events::MemorySink;
    use crate::fingerprint::SessionStatus;
    use std::thread;

    const HOME: &str = "192.168.1.100";
    const AWAY: &str = "203.0.113.77";

    struct Harness {
        guardian: SessionGuardian,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        bans: Arc<BanList>,
    }

    fn harness_with(config: SecurityConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(50_000));
        let sink = Arc::new(MemorySink::new());
        let bans = Arc::new(BanList::new(clock.clone()));
        let guardian = SessionGuardian::new(&config, clock.clone(), sink.clone(), bans.clone());
        Harness {
            guardian,
            clock,
            sink,
            bans,
        }
    }

    fn harness() -> Harness {
        harness_with(SecurityConfig::default())
    }

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).unwrap()
    }

    #[test]
    fn test_first_login_creates_binding() {
        let h = harness();
        let id = Uuid::new_v4();
        match h.guardian.pre_login(id, HOME, 1) {
            SessionDecision::Created(fp) => {
                assert_eq!(fp.identity(), id);
                assert_eq!(fp.bound_origin(), Some(origin(HOME)));
            }
            other => panic!("expected Created, got {:?}", other),
        }
        assert!(h.guardian.validate_session(id, HOME));
        assert!(!h.guardian.validate_session(id, AWAY));
        assert!(!h.guardian.validate_session(Uuid::new_v4(), HOME));
        assert_eq!(h.sink.count(EventTag::SessionCreated), 1);
    }

    #[test]
    fn test_invalid_origin_denied() {
        let h = harness();
        assert_eq!(
            h.guardian.pre_login(Uuid::new_v4(), "300.1.1.1", 1),
            SessionDecision::Denied(DenyReason::InvalidOrigin)
        );
        assert_eq!(h.guardian.active_session_count(), 0);
    }

    #[test]
    fn test_same_origin_resumes_and_keeps_suspicion() {
        let h = harness();
        let id = Uuid::new_v4();
        h.guardian.pre_login(id, HOME, 1);
        h.guardian.add_suspicion(id, 3);

        let decision = h.guardian.pre_login(id, HOME, 1);
        assert!(matches!(decision, SessionDecision::Resumed(_)));
        assert_eq!(decision.fingerprint().unwrap().suspicion(), 3);
        assert_eq!(h.sink.count(EventTag::SessionCreated), 1);
    }

    #[test]
    fn test_session_swap_denied_and_banned() {
        let h = harness();
        let id = Uuid::new_v4();
        h.guardian.pre_login(id, HOME, 1);

        assert_eq!(
            h.guardian.pre_login(id, AWAY, 1),
            SessionDecision::Denied(DenyReason::SessionSwap)
        );

        let fp = h.guardian.fingerprint(id).unwrap();
        assert_eq!(fp.bound_origin(), Some(origin(HOME)));
        assert_eq!(fp.suspicion(), 10);
        assert_eq!(fp.status(), SessionStatus::Compromised);
        assert!(h.bans.is_blocked(&origin(AWAY)));
        assert!(!h.bans.is_blocked(&origin(HOME)));
        assert_eq!(h.sink.count(EventTag::SessionSwap), 1);

        // The legitimate owner can still come back.
        assert!(matches!(
            h.guardian.pre_login(id, HOME, 1),
            SessionDecision::Resumed(_)
        ));
    }

    #[test]
    fn test_swap_without_ban() {
        let mut config = SecurityConfig::default();
        config.session.ban_on_swap = false;
        let h = harness_with(config);
        let id = Uuid::new_v4();
        h.guardian.pre_login(id, HOME, 1);

        assert_eq!(
            h.guardian.pre_login(id, AWAY, 1),
            SessionDecision::Denied(DenyReason::SessionSwap)
        );
        assert!(h.bans.is_empty());
        assert_eq!(h.guardian.fingerprint(id).unwrap().suspicion(), 10);
    }

    #[test]
    fn test_ip_lock_disabled_rebinds() {
        let mut config = SecurityConfig::default();
        config.session.enforce_ip_lock = false;
        let h = harness_with(config);
        let id = Uuid::new_v4();
        h.guardian.pre_login(id, HOME, 1);

        assert!(matches!(
            h.guardian.pre_login(id, AWAY, 1),
            SessionDecision::Created(_)
        ));
        assert!(h.guardian.validate_session(id, AWAY));
        assert_eq!(h.sink.count(EventTag::SessionSwap), 0);
    }

    #[test]
    fn test_concurrent_logins_bind_once() {
        for _ in 0..50 {
            let h = Arc::new(harness());
            let id = Uuid::new_v4();
            let handles: Vec<_> = [HOME, AWAY]
                .into_iter()
                .map(|raw| {
                    let h = Arc::clone(&h);
                    thread::spawn(move || h.guardian.pre_login(id, raw, 1))
                })
                .collect();
            let decisions: Vec<SessionDecision> =
                handles.into_iter().map(|t| t.join().unwrap()).collect();

            let created: Vec<_> = decisions
                .iter()
                .filter_map(|d| match d {
                    SessionDecision::Created(fp) => Some(fp.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(created.len(), 1);
            assert!(decisions
                .iter()
                .any(|d| *d == SessionDecision::Denied(DenyReason::SessionSwap)));

            let bound = h.guardian.fingerprint(id).unwrap();
            assert_eq!(bound.bound_origin(), created[0].bound_origin());
            assert!(bound.suspicion() >= 10);
            assert_eq!(bound.status(), SessionStatus::Compromised);
        }
    }

    #[test]
    fn test_grace_period_purge() {
        let h = harness();
        let stays = Uuid::new_v4();
        let leaves = Uuid::new_v4();
        let returns = Uuid::new_v4();
        for id in [stays, leaves, returns] {
            h.guardian.pre_login(id, HOME, 1);
        }

        assert!(h.guardian.on_disconnect(leaves));
        assert!(h.guardian.on_disconnect(returns));
        assert!(!h.guardian.on_disconnect(Uuid::new_v4()));

        h.clock.advance(Duration::from_secs(120));
        assert!(matches!(
            h.guardian.pre_login(returns, HOME, 1),
            SessionDecision::Resumed(_)
        ));

        h.clock.advance(Duration::from_secs(179));
        assert_eq!(h.guardian.purge_disconnected(), 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.guardian.purge_disconnected(), 1);
        assert_eq!(h.guardian.purge_disconnected(), 0);

        assert!(h.guardian.fingerprint(leaves).is_none());
        assert!(h.guardian.fingerprint(stays).is_some());
        assert!(h.guardian.fingerprint(returns).is_some());
        assert_eq!(h.sink.count(EventTag::SessionPurged), 1);
    }

    #[test]
    fn test_operator_actions_on_missing_session_are_noops() {
        let h = harness();
        let ghost = Uuid::new_v4();
        assert!(!h.guardian.flag_for_investigation(ghost));
        assert!(!h.guardian.add_suspicion(ghost, 5));
        assert!(!h.guardian.clear_suspicion(ghost));
        assert_eq!(h.guardian.active_session_count(), 0);
        assert_eq!(h.sink.count(EventTag::SessionFlagged), 0);
    }

    #[test]
    fn test_operator_actions() {
        let h = harness();
        let id = Uuid::new_v4();
        h.guardian.pre_login(id, HOME, 1);

        assert!(h.guardian.flag_for_investigation(id));
        assert_eq!(
            h.guardian.fingerprint(id).unwrap().status(),
            SessionStatus::UnderInvestigation
        );
        assert!(h.guardian.add_suspicion(id, 12));
        assert_eq!(
            h.guardian.fingerprint(id).unwrap().status(),
            SessionStatus::Compromised
        );
        assert!(h.guardian.clear_suspicion(id));
        let fp = h.guardian.fingerprint(id).unwrap();
        assert_eq!(fp.status(), SessionStatus::Active);
        assert_eq!(fp.suspicion(), 0);
    }

    #[test]
    fn test_ensure_session_recreates_missing() {
        let h = harness();
        let id = Uuid::new_v4();
        let fp = h.guardian.ensure_session(id, HOME, 763);
        assert_eq!(fp.protocol_version(), 763);

        // Existing record is left alone.
        let again = h.guardian.ensure_session(id, AWAY, 1);
        assert_eq!(again.protocol_hash(), fp.protocol_hash());
        assert_eq!(again.bound_origin(), Some(origin(HOME)));

        let orphan = h.guardian.ensure_session(Uuid::new_v4(), "unknown", 763);
        assert_eq!(orphan.bound_origin(), None);
        assert_eq!(h.guardian.sessions().len(), 2);
    }
}
