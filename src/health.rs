use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Coarse detector condition reported by `/health`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    Ok,
    /// Recent jobs keep failing inside the detector.
    Degraded,
    /// The worker thread has exited.
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub detector_state: DetectorState,
    pub detector_ready: bool,
    pub jobs_processed: u64,
    pub job_failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Worker-side counters surfaced at the health-check boundary.
///
/// Per-job failures never stop the worker; a run of them shows up here as
/// `degraded` instead.
pub struct DetectorHealth {
    jobs_processed: AtomicU64,
    job_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    stopped: AtomicBool,
    last_error: Mutex<Option<String>>,
    failure_threshold: u32,
}

impl DetectorHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            jobs_processed: AtomicU64::new(0),
            job_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn record_success(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, message: &str) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.job_failures.fetch_add(1, Ordering::Relaxed);
        let run = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
        if run == self.failure_threshold {
            log::error!(
                "detector failed {} jobs in a row; reporting degraded",
                run
            );
        }
    }

    /// A job that ended before reaching the detector (bad client payload).
    pub fn record_rejected(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> DetectorState {
        if self.stopped.load(Ordering::SeqCst) {
            DetectorState::Stopped
        } else if self.consecutive_failures.load(Ordering::Relaxed) >= self.failure_threshold {
            DetectorState::Degraded
        } else {
            DetectorState::Ok
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let detector_state = self.state();
        HealthSnapshot {
            detector_state,
            detector_ready: detector_state == DetectorState::Ok,
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            job_failures: self.job_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
