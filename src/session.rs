//! Session registry.
//!
//! A session is a caller-named detection stream, distinct from the transport
//! connection currently carrying it. Registry membership is the sole authority
//! on whether a session may submit frames.
//!
//! Every operation takes the one registry lock for the duration of its map
//! access only. The lock is never held across network I/O or inference.
//!
//! Known scaling limit: `remove_by_transport` scans all sessions, which is
//! O(active sessions) per disconnect.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::detect::DetectionResult;
use crate::error::RelayError;
use crate::hub::TransportId;
use crate::unix_now;

/// Summary of the most recent published result for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LastDetection {
    pub detection_count: usize,
    pub processing_time: f64,
    pub completed_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LastDetection {
    pub fn from_result(result: &DetectionResult) -> Self {
        Self {
            detection_count: result.detection_count(),
            processing_time: result.processing_time,
            completed_at: result.processing_timestamp.unwrap_or_else(unix_now),
            error: result.error.clone(),
        }
    }
}

struct Session {
    transport: TransportId,
    joined_at: f64,
    joined_instant: Instant,
    frame_count: u64,
    last_detection: Option<LastDetection>,
}

impl Session {
    fn uptime(&self) -> f64 {
        self.joined_instant.elapsed().as_secs_f64()
    }
}

/// Returned by `join`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub joined_at: f64,
    /// Transport that owned this session before the join, if any.
    pub replaced: Option<TransportId>,
}

/// Point-in-time view of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub uptime: f64,
    pub frame_count: u64,
    pub last_detection: Option<LastDetection>,
    pub queue_size: usize,
    pub active_sessions: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub uptime: f64,
    pub frame_count: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid data.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or overwrite a session. A repeat join resets the counters.
    pub fn join(&self, session_id: &str, transport: TransportId) -> SessionInfo {
        let joined_at = unix_now();
        let previous = self.lock().insert(
            session_id.to_string(),
            Session {
                transport,
                joined_at,
                joined_instant: Instant::now(),
                frame_count: 0,
                last_detection: None,
            },
        );
        SessionInfo {
            session_id: session_id.to_string(),
            joined_at,
            replaced: previous.map(|s| s.transport),
        }
    }

    /// Count a frame for the session. Returns false if it is not registered.
    pub fn frame_received(&self, session_id: &str) -> bool {
        match self.lock().get_mut(session_id) {
            Some(session) => {
                session.frame_count += 1;
                true
            }
            None => false,
        }
    }

    /// Remove every session owned by a disconnecting transport.
    pub fn remove_by_transport(&self, transport: TransportId) -> Vec<String> {
        let mut sessions = self.lock();
        let owned: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.transport == transport)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            sessions.remove(id);
        }
        owned
    }

    pub fn stats(&self, session_id: &str) -> Result<SessionStats, RelayError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or(RelayError::SessionNotFound)?;
        Ok(SessionStats {
            session_id: session_id.to_string(),
            uptime: session.uptime(),
            frame_count: session.frame_count,
            last_detection: session.last_detection.clone(),
            queue_size: 0,
            active_sessions: sessions.len(),
        })
    }

    /// All live sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .lock()
            .iter()
            .map(|(id, s)| SessionSummary {
                session_id: id.clone(),
                uptime: s.uptime(),
                frame_count: s.frame_count,
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Transport currently owning the session.
    pub fn transport_of(&self, session_id: &str) -> Option<TransportId> {
        self.lock().get(session_id).map(|s| s.transport)
    }

    /// Delivery lookup for the publisher.
    ///
    /// Records `summary` as the session's `last_detection` and returns the
    /// owning transport, in one critical section. Membership is not changed.
    pub fn record_result(&self, session_id: &str, summary: LastDetection) -> Option<TransportId> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(session_id)?;
        session.last_detection = Some(summary);
        Some(session.transport)
    }

    /// Wall-clock join time, seconds since the Unix epoch.
    pub fn joined_at(&self, session_id: &str) -> Option<f64> {
        self.lock().get(session_id).map(|s| s.joined_at)
    }
}
