//! Block decisions handed to the enforcement layer.
//!
//! The engine calls [`Enforcer::block`] and moves on; it never waits for or
//! depends on the outcome. [`BanList`] is the in-process implementation the
//! UDP host consults before admitting any packet.

use crate::clock::{duration_millis, elapsed_millis, Clock};
use crate::store::ShardedMap;
use log::info;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use warden_shared::Origin;

pub trait Enforcer: Send + Sync {
    fn block(&self, origin: &Origin, duration: Duration, reason: &str);
}

/// Discards every block request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnforcer;

impl Enforcer for NoopEnforcer {
    fn block(&self, _origin: &Origin, _duration: Duration, _reason: &str) {}
}

#[derive(Debug, Clone)]
pub struct BanEntry {
    pub started_at: u64,
    pub duration_ms: u64,
    pub reason: String,
}

impl BanEntry {
    fn is_active(&self, now: u64) -> bool {
        elapsed_millis(now, self.started_at) < self.duration_ms
    }
}

/// Timed in-memory ban list keyed by origin.
pub struct BanList {
    entries: ShardedMap<Origin, BanEntry>,
    clock: Arc<dyn Clock>,
}

impl BanList {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: ShardedMap::new(),
            clock,
        }
    }

    /// True while a ban on `origin` is active. Expired bans are removed on
    /// the way.
    pub fn is_blocked(&self, origin: &Origin) -> bool {
        let now = self.clock.now_millis();
        self.entries.remove_if(origin, |entry| !entry.is_active(now));
        self.entries.contains_key(origin)
    }

    pub fn entry(&self, origin: &Origin) -> Option<BanEntry> {
        self.entries.get(origin)
    }

    /// Lifts a ban early. Returns false when there was none.
    pub fn unblock(&self, origin: &Origin) -> bool {
        self.entries.remove(origin).is_some()
    }

    /// Drops expired bans. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.retain(|_, entry| entry.is_active(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Enforcer for BanList {
    fn block(&self, origin: &Origin, duration: Duration, reason: &str) {
        info!("Blocking {} for {:?}: {}", origin, duration, reason);
        let entry = BanEntry {
            started_at: self.clock.now_millis(),
            duration_ms: duration_millis(duration),
            reason: reason.to_string(),
        };
        // Never shorten an existing ban.
        self.entries.with_entry(*origin, |slot| match slot {
            Entry::Occupied(mut existing) => {
                let now = entry.started_at;
                let remaining = existing
                    .get()
                    .duration_ms
                    .saturating_sub(elapsed_millis(now, existing.get().started_at));
                if entry.duration_ms >= remaining {
                    existing.insert(entry);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        });
    }
}
