//! Per-origin admission state machine.
//!
//! ```text
//! CLEAN ──attempt──▶ CHALLENGED ──success──▶ VERIFIED ──expiry──▶ CLEAN
//!                        │
//!                        └─failure─▶ FAILED(n) ──attempt──▶ CHALLENGED
//!                                       │
//!                                       └─n == max─▶ LOCKED_OUT ──expiry──▶ CLEAN
//! ```
//!
//! The record for an origin is spread over independent stores (pending
//! challenges, failure counts, lockouts, verifications). Each transition
//! touches one key in one store atomically; the stores are never locked
//! together.

use crate::challenge::{ChallengeEngine, ChallengeRefused, VerificationResult};
use crate::clock::{duration_millis, elapsed_millis, Clock};
use crate::config::{ConfigError, SecurityConfig};
use crate::enforcement::Enforcer;
use crate::events::{AuditSink, EventTag, SecurityEvent, Severity};
use crate::store::ShardedMap;
use log::debug;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use warden_shared::{ChallengePayload, Origin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Clean,
    Challenged,
    Failed(u32),
    Verified,
    LockedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidOrigin,
    LockedOut,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Origin holds an unexpired verification.
    Allow,
    /// Send this payload to the client and wait for its answer.
    Challenge(ChallengePayload),
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Verified,
    /// The connection must be terminated.
    Failed {
        result: VerificationResult,
        failures: u32,
        locked_out: bool,
    },
    /// Late, duplicate or unattributable message.
    Ignored,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSweep {
    pub challenges: usize,
    pub rate_limits: usize,
    pub verifications: usize,
    pub lockouts: usize,
}

impl AdmissionSweep {
    pub fn total(&self) -> usize {
        self.challenges + self.rate_limits + self.verifications + self.lockouts
    }
}

pub struct AdmissionController {
    challenges: ChallengeEngine,
    failures: ShardedMap<Origin, u32>,
    lockouts: ShardedMap<Origin, u64>,
    verified: ShardedMap<Origin, u64>,
    max_failures: u32,
    lockout_ms: u64,
    verification_ms: u64,
    lockout_duration: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AuditSink>,
    enforcer: Arc<dyn Enforcer>,
}

impl AdmissionController {
    /// Arms the admission path. Fails when the configuration is unsafe.
    pub fn new(
        config: &SecurityConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
        enforcer: Arc<dyn Enforcer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let challenges = ChallengeEngine::new(config, Arc::clone(&clock))?;
        Ok(Self {
            challenges,
            failures: ShardedMap::new(),
            lockouts: ShardedMap::new(),
            verified: ShardedMap::new(),
            max_failures: config.handshake.max_failures,
            lockout_ms: duration_millis(config.lockout_duration()),
            verification_ms: duration_millis(config.verification_validity()),
            lockout_duration: config.lockout_duration(),
            clock,
            sink,
            enforcer,
        })
    }

    fn emit(&self, severity: Severity, tag: EventTag, detail: String) {
        self.sink.record(SecurityEvent::new(severity, tag, detail));
    }

    /// Gate for a new connection attempt carrying an unvalidated origin.
    pub fn on_connection_attempt(&self, raw_origin: &str) -> AdmissionDecision {
        match Origin::parse(raw_origin) {
            Some(origin) => self.check_attempt(origin),
            None => {
                self.emit(
                    Severity::Warning,
                    EventTag::InvalidOrigin,
                    "Rejected invalid origin format on connection attempt".to_string(),
                );
                AdmissionDecision::Reject(RejectReason::InvalidOrigin)
            }
        }
    }

    /// Gate for a new connection attempt from a validated origin: reject,
    /// allow on an unexpired verification, or issue a challenge.
    pub fn check_attempt(&self, origin: Origin) -> AdmissionDecision {
        if self.is_locked_out(&origin) {
            self.emit(
                Severity::Warning,
                EventTag::LockedOutAttempt,
                format!("Blocked attempt from locked out origin {}", origin),
            );
            return AdmissionDecision::Reject(RejectReason::LockedOut);
        }

        if self.is_verified(&origin) {
            return AdmissionDecision::Allow;
        }

        match self.challenges.issue(origin) {
            Ok(challenge) => {
                debug!("Challenge created for {}: {}", origin, challenge.nonce);
                self.emit(
                    Severity::Info,
                    EventTag::ChallengeCreated,
                    format!("Origin: {}", origin),
                );
                AdmissionDecision::Challenge(challenge.payload())
            }
            Err(ChallengeRefused::RateLimited) => {
                self.emit(
                    Severity::Warning,
                    EventTag::RateLimited,
                    format!("Challenge rate limit exceeded by {}", origin),
                );
                AdmissionDecision::Reject(RejectReason::RateLimited)
            }
            Err(ChallengeRefused::InvalidOrigin) => {
                AdmissionDecision::Reject(RejectReason::InvalidOrigin)
            }
        }
    }

    /// Handles an answer received on the side channel.
    pub fn on_response(&self, raw_origin: &str, response: &str) -> ResponseOutcome {
        match Origin::parse(raw_origin) {
            Some(origin) => self.check_response(origin, response),
            None => ResponseOutcome::Ignored,
        }
    }

    /// Classifies an answer from a validated origin. Only answers that spend a
    /// pending challenge can fail; anything else is ignored.
    pub fn check_response(&self, origin: Origin, response: &str) -> ResponseOutcome {
        if self.is_locked_out(&origin) {
            return ResponseOutcome::Ignored;
        }
        let verification = self.challenges.verify(&origin, response);
        let result = verification.result;
        match result {
            VerificationResult::Success => {
                self.failures.remove(&origin);
                self.verified.insert(origin, self.clock.now_millis());
                self.emit(
                    Severity::Info,
                    EventTag::HandshakeSuccess,
                    format!("Origin: {}", origin),
                );
                ResponseOutcome::Verified
            }
            VerificationResult::NoChallenge => ResponseOutcome::Ignored,
            // Nothing was pending, so there is no handshake to fail.
            VerificationResult::InvalidFormat if !verification.spent => ResponseOutcome::Ignored,
            VerificationResult::Timeout
            | VerificationResult::InvalidFormat
            | VerificationResult::WrongAnswer => {
                let tag = if result == VerificationResult::Timeout {
                    EventTag::HandshakeTimeout
                } else {
                    EventTag::HandshakeInvalid
                };
                let (failures, locked_out) = self.record_failure(origin);
                self.emit(
                    Severity::Warning,
                    tag,
                    format!("Origin: {} result: {:?} failures: {}", origin, result, failures),
                );
                if locked_out {
                    self.lock_out(origin, failures);
                }
                ResponseOutcome::Failed {
                    result,
                    failures,
                    locked_out,
                }
            }
        }
    }

    /// Bumps the failure count. The caller that pushes the count to the
    /// maximum, and only that caller, gets `true` back.
    fn record_failure(&self, origin: Origin) -> (u32, bool) {
        let max = self.max_failures;
        self.failures.with_entry(origin, |entry| match entry {
            Entry::Occupied(mut occupied) => {
                let count = occupied.get().saturating_add(1);
                if count >= max {
                    occupied.remove();
                    (count, true)
                } else {
                    *occupied.get_mut() = count;
                    (count, false)
                }
            }
            Entry::Vacant(vacant) => {
                if 1 >= max {
                    (1, true)
                } else {
                    vacant.insert(1);
                    (1, false)
                }
            }
        })
    }

    fn lock_out(&self, origin: Origin, failures: u32) {
        self.lockouts.insert(origin, self.clock.now_millis());
        self.verified.remove(&origin);
        self.emit(
            Severity::Critical,
            EventTag::Lockout,
            format!(
                "Origin {} locked out after {} handshake failures",
                origin, failures
            ),
        );
        self.enforcer
            .block(&origin, self.lockout_duration, "repeated handshake failures");
    }

    /// Lockout check that also retires an expired lockout on the spot.
    pub fn is_locked_out(&self, origin: &Origin) -> bool {
        let now = self.clock.now_millis();
        let lockout_ms = self.lockout_ms;
        self.lockouts
            .remove_if(origin, |started| elapsed_millis(now, *started) > lockout_ms);
        self.lockouts.contains_key(origin)
    }

    /// True while the origin's last successful handshake is inside the
    /// verification window.
    pub fn is_verified(&self, origin: &Origin) -> bool {
        let now = self.clock.now_millis();
        let verification_ms = self.verification_ms;
        self.verified
            .get(origin)
            .map(|at| elapsed_millis(now, at) < verification_ms)
            .unwrap_or(false)
    }

    pub fn failure_count(&self, origin: &Origin) -> u32 {
        self.failures.get(origin).unwrap_or(0)
    }

    /// Current position of `origin` in the admission state machine.
    pub fn state(&self, origin: &Origin) -> AdmissionState {
        if self.is_locked_out(origin) {
            AdmissionState::LockedOut
        } else if self.is_verified(origin) {
            AdmissionState::Verified
        } else if self.challenges.has_pending_challenge(origin) {
            AdmissionState::Challenged
        } else {
            match self.failure_count(origin) {
                0 => AdmissionState::Clean,
                n => AdmissionState::Failed(n),
            }
        }
    }

    pub fn challenges(&self) -> &ChallengeEngine {
        &self.challenges
    }

    /// Periodic expiry pass, independent of traffic. A second call with no
    /// traffic in between removes nothing.
    pub fn sweep(&self) -> AdmissionSweep {
        let now = self.clock.now_millis();
        let verification_ms = self.verification_ms;
        let lockout_ms = self.lockout_ms;
        AdmissionSweep {
            challenges: self.challenges.cleanup_expired_challenges(),
            rate_limits: self.challenges.cleanup_rate_limits(),
            verifications: self
                .verified
                .retain(|_, at| elapsed_millis(now, *at) < verification_ms),
            lockouts: self
                .lockouts
                .retain(|_, started| elapsed_millis(now, *started) <= lockout_ms),
        }
    }
}
