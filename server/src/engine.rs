//! The assembled engine: admission controller and session guardian sharing
//! one clock, one audit sink and one ban list.

use crate::admission::{AdmissionController, AdmissionSweep};
use crate::clock::Clock;
use crate::config::{ConfigError, SecurityConfig};
use crate::enforcement::BanList;
use crate::events::AuditSink;
use crate::guardian::SessionGuardian;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub admission: AdmissionSweep,
    pub bans: usize,
    pub sessions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.admission.total() + self.bans + self.sessions
    }
}

pub struct Warden {
    pub admission: AdmissionController,
    pub guardian: SessionGuardian,
    pub bans: Arc<BanList>,
    sweep_interval: Duration,
}

impl Warden {
    /// Validates `config` and arms both components. Nothing is created when
    /// the configuration is rejected.
    pub fn new(
        config: &SecurityConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let bans = Arc::new(BanList::new(Arc::clone(&clock)));
        let admission = AdmissionController::new(
            config,
            Arc::clone(&clock),
            Arc::clone(&sink),
            bans.clone(),
        )?;
        let guardian = SessionGuardian::new(config, clock, sink, bans.clone());
        Ok(Self {
            admission,
            guardian,
            bans,
            sweep_interval: config.sweep_interval(),
        })
    }

    /// How often the host should call [`Warden::sweep`].
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// One full expiry pass over every store.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            admission: self.admission.sweep(),
            bans: self.bans.sweep(),
            sessions: self.guardian.purge_disconnected(),
        };
        if report.total() > 0 {
            debug!("Sweep removed {} expired entries: {:?}", report.total(), report);
        }
        report
    }
}
