//! Input hygiene helpers: secret strength, log/shell sanitising and secure tokens.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;
use thiserror::Error;

pub const MIN_SECRET_LEN: usize = 16;
const MIN_DISTINCT_SECRET_CHARS: usize = 6;
const MAX_LOG_FIELD_LEN: usize = 200;

/// Values shipped in sample configs or commonly typed by operators.
pub const DENIED_SECRETS: &[&str] = &[
    "CHANGE_THIS_SECRET_KEY_NOW",
    "DEFAULT_KEY",
    "changeme",
    "secret",
    "password",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretWeakness {
    #[error("secret is empty")]
    Empty,
    #[error("secret is shorter than 16 characters")]
    TooShort,
    #[error("secret is a known default value")]
    KnownDefault,
    #[error("secret has too little entropy")]
    LowEntropy,
}

/// Checks a pre-shared server secret against the minimum strength rules.
pub fn check_secret(secret: &str) -> Result<(), SecretWeakness> {
    if secret.is_empty() {
        return Err(SecretWeakness::Empty);
    }
    if DENIED_SECRETS.iter().any(|d| d.eq_ignore_ascii_case(secret)) {
        return Err(SecretWeakness::KnownDefault);
    }
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(SecretWeakness::TooShort);
    }
    if secret.chars().all(|c| c.is_ascii_lowercase()) || secret.chars().all(|c| c.is_ascii_digit())
    {
        return Err(SecretWeakness::LowEntropy);
    }
    let distinct: HashSet<char> = secret.chars().collect();
    if distinct.len() < MIN_DISTINCT_SECRET_CHARS {
        return Err(SecretWeakness::LowEntropy);
    }
    Ok(())
}

/// Makes an untrusted string safe to embed in a single log line.
pub fn sanitize_for_log(input: &str) -> String {
    input
        .chars()
        .take(MAX_LOG_FIELD_LEN)
        .map(|c| match c {
            '\r' | '\n' => ' ',
            c if c.is_control() => '?',
            c => c,
        })
        .collect()
}

/// `len` random bytes from the OS generator, hex encoded.
pub fn generate_secure_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
