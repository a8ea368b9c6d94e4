//! Detection Relay
//!
//! This crate implements a session-aware object detection relay: clients stream
//! frames over a bidirectional socket channel, a single worker runs inference,
//! and results are routed back to the session that submitted each frame.
//!
//! # Architecture
//!
//! The relay is built around four guarantees:
//!
//! 1. **Bounded Ingress**: Pending work lives in a fixed-capacity queue. A full
//!    queue rejects new frames immediately; ingress never blocks on inference.
//! 2. **Single Inference Owner**: Exactly one worker thread owns the detector.
//!    Nothing else holds a handle to it, so it is never invoked concurrently.
//!    This is a design invariant carried by ownership, not a runtime check.
//! 3. **Session Routing**: Results are delivered to the transport that currently
//!    owns the submitting session, or dropped silently if the session is gone.
//! 4. **One Reply Per Request**: Every inbound event gets exactly one reply,
//!    success-shaped or error-shaped, except results for vanished sessions.
//!
//! # Module Structure
//!
//! - `config`: File, environment and validation layers for `RelayConfig`
//! - `detect`: Detector trait, result types, and backends
//! - `frame`: Frame decoding (data URIs, base64, raw RGB) and resizing
//! - `queue`: Bounded dispatch queue between ingress and the worker
//! - `worker`: The detection worker and its handle
//! - `health`: Worker-side counters behind `/health`
//! - `session`: Session registry (membership, counters, liveness)
//! - `publish`: Result routing to the owning transport
//! - `hub`: Per-connection outbound channels
//! - `gateway`: Event mapping from transport events to core calls
//! - `server`: Socket channel and REST listeners
//! - `annotate`: Drawing detections onto frames

use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod config;
pub mod detect;
pub mod frame;
pub mod gateway;
pub mod health;
pub mod hub;
pub mod publish;
pub mod queue;
pub mod server;
pub mod session;
pub mod worker;

mod error;

pub use config::{DetectorSettings, ModelSettings, QueueSettings, RelayConfig};
pub use detect::{
    BoundingBox, Detection, DetectionResult, Detector, DetectorInfo, ImageSize, StubBackend,
};
pub use error::RelayError;
pub use frame::{DecodeError, FrameDecoder, FrameInput};
pub use gateway::{InboundEvent, OutboundEvent, TransportGateway};
pub use health::{DetectorHealth, DetectorState};
pub use hub::{ConnectionHub, EventSink, TransportId};
pub use publish::ResultPublisher;
pub use queue::{DetectionJob, DispatchQueue, JobOrigin};
pub use server::{RelayHandle, RelayServer};
pub use session::{SessionInfo, SessionRegistry, SessionStats, SessionSummary};
pub use worker::{DetectionWorker, WorkerHandle};

/// Wall-clock seconds since the Unix epoch.
///
/// Timestamps on the wire are floating-point seconds. A clock set before the
/// epoch reads as zero rather than failing a frame.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
