//! Single-use proof challenges, one in flight per origin.
//!
//! A challenge binds a random nonce and entropy token to an origin. The client
//! proves knowledge of the pre-shared server secret by returning
//! `SHA-256(nonce ∥ secret ∥ difficulty ∥ entropy_token)`. Nothing here touches
//! the network or persistent storage; verification is one atomic
//! check-and-remove against an in-memory store.

use crate::clock::{elapsed_millis, Clock};
use crate::config::{ConfigError, SecurityConfig};
use crate::rate_limit::RateLimiter;
use crate::store::ShardedMap;
use crate::validation::{check_secret, generate_secure_token};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use warden_shared::{compute_answer, is_well_formed_answer, ChallengePayload, Origin};

/// Random bytes in each entropy token (hex encoded to twice this length).
pub const ENTROPY_TOKEN_BYTES: usize = 8;

#[derive(Debug, Clone)]
pub struct Challenge {
    pub origin: Origin,
    pub nonce: u64,
    pub entropy_token: String,
    expected_answer: String,
    pub created_at: u64,
    pub difficulty: u32,
}

impl Challenge {
    /// The part of the challenge the client gets to see.
    pub fn payload(&self) -> ChallengePayload {
        ChallengePayload {
            nonce: self.nonce,
            difficulty: self.difficulty,
            entropy_token: self.entropy_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    Success,
    NoChallenge,
    Timeout,
    InvalidFormat,
    WrongAnswer,
}

/// Outcome of a verification plus whether a pending challenge was consumed.
///
/// A malformed answer is `InvalidFormat` whether or not anything was pending;
/// `spent` tells the caller which of the two it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub result: VerificationResult,
    pub spent: bool,
}

/// Why no challenge was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeRefused {
    InvalidOrigin,
    RateLimited,
}

pub struct ChallengeEngine {
    secret: String,
    difficulty: u32,
    timeout_ms: u64,
    pending: ShardedMap<Origin, Challenge>,
    limiter: RateLimiter<Origin>,
    clock: Arc<dyn Clock>,
}

impl ChallengeEngine {
    /// Builds the engine, refusing secrets that fail the strength rules.
    pub fn new(config: &SecurityConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        check_secret(&config.handshake.secret_key)?;
        Ok(Self {
            secret: config.handshake.secret_key.clone(),
            difficulty: config.handshake.difficulty,
            timeout_ms: config.handshake.timeout_ms,
            pending: ShardedMap::new(),
            limiter: RateLimiter::new(
                config.handshake.rate_limit_attempts,
                config.rate_limit_window(),
                Arc::clone(&clock),
            ),
            clock,
        })
    }

    /// Validates `raw_origin` and issues a challenge for it.
    pub fn create_challenge(&self, raw_origin: &str) -> Result<Challenge, ChallengeRefused> {
        let origin = Origin::parse(raw_origin).ok_or(ChallengeRefused::InvalidOrigin)?;
        self.issue(origin)
    }

    /// Issues a challenge for an already validated origin, replacing any
    /// challenge still pending for it.
    pub fn issue(&self, origin: Origin) -> Result<Challenge, ChallengeRefused> {
        if !self.limiter.check(origin) {
            return Err(ChallengeRefused::RateLimited);
        }

        let nonce = OsRng.next_u64();
        let entropy_token = generate_secure_token(ENTROPY_TOKEN_BYTES);
        let expected_answer = compute_answer(nonce, &self.secret, self.difficulty, &entropy_token);

        let challenge = Challenge {
            origin,
            nonce,
            entropy_token,
            expected_answer,
            created_at: self.clock.now_millis(),
            difficulty: self.difficulty,
        };
        self.pending.insert(origin, challenge.clone());
        Ok(challenge)
    }

    /// Consumes the pending challenge for `origin` and classifies `response`.
    ///
    /// The challenge is removed before anything else is checked, so every call
    /// spends it regardless of outcome.
    pub fn verify_response(&self, origin: &Origin, response: &str) -> VerificationResult {
        self.verify(origin, response).result
    }

    /// Same as [`ChallengeEngine::verify_response`], also reporting whether a
    /// pending challenge was removed by this call.
    pub fn verify(&self, origin: &Origin, response: &str) -> Verification {
        let challenge = self.pending.remove(origin);
        let spent = challenge.is_some();
        let outcome = |result| Verification { result, spent };

        if !is_well_formed_answer(response) {
            return outcome(VerificationResult::InvalidFormat);
        }

        let challenge = match challenge {
            Some(challenge) => challenge,
            None => return outcome(VerificationResult::NoChallenge),
        };

        if elapsed_millis(self.clock.now_millis(), challenge.created_at) > self.timeout_ms {
            return outcome(VerificationResult::Timeout);
        }

        let normalized = response.to_ascii_lowercase();
        let matches: bool = normalized
            .as_bytes()
            .ct_eq(challenge.expected_answer.as_bytes())
            .into();
        if matches {
            outcome(VerificationResult::Success)
        } else {
            outcome(VerificationResult::WrongAnswer)
        }
    }

    /// Removes challenges older than twice the response window.
    pub fn cleanup_expired_challenges(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = self.timeout_ms.saturating_mul(2);
        self.pending
            .retain(|_, c| elapsed_millis(now, c.created_at) <= horizon)
    }

    /// Drops rate-limit windows that have gone idle.
    pub fn cleanup_rate_limits(&self) -> usize {
        self.limiter.cleanup()
    }

    pub fn has_pending_challenge(&self, origin: &Origin) -> bool {
        self.pending.contains_key(origin)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const SECRET: &str = "MySecureKey12345!";

    fn test_config() -> SecurityConfig {
        let mut config = SecurityConfig::default();
        config.handshake.secret_key = SECRET.to_string();
        config.handshake.timeout_ms = 1_000;
        config
    }

    fn engine() -> (ChallengeEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = ChallengeEngine::new(&test_config(), clock.clone()).unwrap();
        (engine, clock)
    }

    fn origin() -> Origin {
        Origin::parse("198.51.100.7").unwrap()
    }

    #[test]
    fn test_weak_secret_refused() {
        let mut config = test_config();
        config.handshake.secret_key = "DEFAULT_KEY".to_string();
        let result = ChallengeEngine::new(&config, Arc::new(ManualClock::new(0)));
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));
    }

    #[test]
    fn test_invalid_origin_gets_no_challenge() {
        let (engine, _) = engine();
        assert_eq!(
            engine.create_challenge("not-an-ip").unwrap_err(),
            ChallengeRefused::InvalidOrigin
        );
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_correct_answer_succeeds_exactly_once() {
        let (engine, _) = engine();
        let challenge = engine.create_challenge("198.51.100.7").unwrap();
        let answer = challenge.payload().solve(SECRET);

        assert_eq!(
            engine.verify_response(&origin(), &answer),
            VerificationResult::Success
        );
        assert_eq!(
            engine.verify_response(&origin(), &answer),
            VerificationResult::NoChallenge
        );
    }

    #[test]
    fn test_uppercase_answer_accepted() {
        let (engine, _) = engine();
        let challenge = engine.issue(origin()).unwrap();
        let answer = challenge.payload().solve(SECRET).to_ascii_uppercase();
        assert_eq!(
            engine.verify_response(&origin(), &answer),
            VerificationResult::Success
        );
    }

    #[test]
    fn test_wrong_answer() {
        let (engine, _) = engine();
        let challenge = engine.issue(origin()).unwrap();
        let answer = challenge.payload().solve("SomeOtherSecret99!");
        assert_eq!(
            engine.verify_response(&origin(), &answer),
            VerificationResult::WrongAnswer
        );
        assert!(!engine.has_pending_challenge(&origin()));
    }

    #[test]
    fn test_invalid_format_regardless_of_state() {
        let (engine, clock) = engine();
        let non_hex = "z".repeat(64);
        let too_long = "a".repeat(65);
        let malformed: [&str; 4] = ["", "abc", &non_hex, &too_long];

        for response in malformed {
            // no challenge pending
            assert_eq!(
                engine.verify_response(&origin(), response),
                VerificationResult::InvalidFormat
            );
            // fresh challenge pending
            engine.issue(origin()).unwrap();
            assert_eq!(
                engine.verify_response(&origin(), response),
                VerificationResult::InvalidFormat
            );
            // stale challenge pending
            engine.issue(origin()).unwrap();
            clock.advance(Duration::from_millis(5_000));
            assert_eq!(
                engine.verify_response(&origin(), response),
                VerificationResult::InvalidFormat
            );
        }
    }

    #[test]
    fn test_verify_reports_whether_challenge_was_spent() {
        let (engine, _) = engine();
        assert_eq!(
            engine.verify(&origin(), "junk"),
            Verification {
                result: VerificationResult::InvalidFormat,
                spent: false,
            }
        );

        engine.issue(origin()).unwrap();
        assert_eq!(
            engine.verify(&origin(), "junk"),
            Verification {
                result: VerificationResult::InvalidFormat,
                spent: true,
            }
        );
        assert!(!engine.has_pending_challenge(&origin()));
    }

    #[test]
    fn test_timeout_boundary() {
        let (engine, clock) = engine();

        let challenge = engine.issue(origin()).unwrap();
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(
            engine.verify_response(&origin(), &challenge.payload().solve(SECRET)),
            VerificationResult::Success
        );

        let challenge = engine.issue(origin()).unwrap();
        clock.advance(Duration::from_millis(1_001));
        assert_eq!(
            engine.verify_response(&origin(), &challenge.payload().solve(SECRET)),
            VerificationResult::Timeout
        );
    }

    #[test]
    fn test_new_challenge_replaces_pending() {
        let (engine, _) = engine();
        let first = engine.issue(origin()).unwrap();
        let second = engine.issue(origin()).unwrap();
        assert_eq!(engine.pending_count(), 1);

        // The first challenge's answer no longer matches anything.
        let stale = first.payload().solve(SECRET);
        if first.nonce != second.nonce || first.entropy_token != second.entropy_token {
            assert_eq!(
                engine.verify_response(&origin(), &stale),
                VerificationResult::WrongAnswer
            );
        }
    }

    #[test]
    fn test_challenges_are_unpredictable() {
        let (engine, _) = engine();
        let a = engine.issue(origin()).unwrap();
        let b = engine.issue(Origin::parse("198.51.100.8").unwrap()).unwrap();
        assert_ne!(a.entropy_token, b.entropy_token);
        assert_eq!(a.entropy_token.len(), ENTROPY_TOKEN_BYTES * 2);
    }

    #[test]
    fn test_rate_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = test_config();
        config.handshake.rate_limit_attempts = 2;
        let engine = ChallengeEngine::new(&config, clock.clone()).unwrap();

        assert!(engine.issue(origin()).is_ok());
        assert!(engine.issue(origin()).is_ok());
        assert_eq!(
            engine.issue(origin()).unwrap_err(),
            ChallengeRefused::RateLimited
        );

        clock.advance(config.rate_limit_window() + Duration::from_millis(1));
        assert!(engine.issue(origin()).is_ok());
    }

    #[test]
    fn test_cleanup_removes_only_abandoned() {
        let (engine, clock) = engine();
        engine.issue(origin()).unwrap();
        clock.advance(Duration::from_millis(1_500));
        engine.issue(Origin::parse("198.51.100.8").unwrap()).unwrap();

        clock.advance(Duration::from_millis(600));
        assert_eq!(engine.cleanup_expired_challenges(), 1);
        assert_eq!(engine.cleanup_expired_challenges(), 0);
        assert_eq!(engine.pending_count(), 1);
    }
}
