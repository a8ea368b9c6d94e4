//! Transport gateway.
//!
//! Maps socket-channel events onto registry and queue calls. The gateway holds
//! no state of its own beyond handles to the shared components, and never
//! touches the detector: frames only ever reach inference through the queue.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::{DetectionResult, DetectorInfo};
use crate::error::RelayError;
use crate::frame::FrameInput;
use crate::hub::{ConnectionHub, EventSink, TransportId};
use crate::queue::{DetectionJob, DispatchQueue, QueueFull};
use crate::session::{SessionRegistry, SessionStats};
use crate::unix_now;

const SESSION_ID_REQUIRED: &str = "Session ID required";
const FRAME_FIELDS_REQUIRED: &str = "Session ID and image data required";
const IMAGE_REQUIRED: &str = "Image data required";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub image: Option<FrameInput>,
    /// Client capture time, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Client → relay events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    JoinDetectionSession(JoinRequest),
    ProcessFrame(FrameRequest),
    GetSessionStats(StatsRequest),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinedSession {
    pub session_id: String,
    pub status: String,
    pub detector_info: DetectorInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

impl ErrorMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<RelayError> for ErrorMessage {
    fn from(err: RelayError) -> Self {
        ErrorMessage::new(err.to_string())
    }
}

/// Relay → client events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinedSession(JoinedSession),
    DetectionResults(DetectionResult),
    SessionStats(SessionStats),
    Error(ErrorMessage),
}

impl OutboundEvent {
    fn error(err: RelayError) -> Self {
        OutboundEvent::Error(err.into())
    }
}

/// Loosely typed envelope, so a missing `data` object reads as empty fields
/// rather than a parse failure.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

const INBOUND_EVENTS: [&str; 3] = [
    "join_detection_session",
    "process_frame",
    "get_session_stats",
];

/// Decode one inbound line. The error is the message sent back to the client.
pub fn parse_inbound(line: &str) -> Result<InboundEvent, String> {
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|err| format!("invalid message: {}", err))?;
    if !INBOUND_EVENTS.contains(&envelope.event.as_str()) {
        return Err(format!("unknown event: {}", envelope.event));
    }
    let data = match envelope.data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let event = envelope.event;
    serde_json::from_value(serde_json::json!({ "event": &event, "data": data }))
        .map_err(|err| format!("invalid {} payload: {}", event, err))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

pub struct TransportGateway {
    registry: Arc<SessionRegistry>,
    queue: DispatchQueue,
    hub: Arc<ConnectionHub>,
    detector_info: DetectorInfo,
}

impl TransportGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: DispatchQueue,
        hub: Arc<ConnectionHub>,
        detector_info: DetectorInfo,
    ) -> Self {
        Self {
            registry,
            queue,
            hub,
            detector_info,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn detector_info(&self) -> &DetectorInfo {
        &self.detector_info
    }

    /// A new transport connection. No session exists for it yet.
    pub fn connect(&self) -> (TransportId, Receiver<OutboundEvent>) {
        let (transport, outbox) = self.hub.register();
        log::info!("client connected: {}", transport);
        (transport, outbox)
    }

    /// Tear down every session the transport owned. Returns their ids.
    pub fn disconnect(&self, transport: TransportId) -> Vec<String> {
        let removed = self.registry.remove_by_transport(transport);
        self.hub.unregister(transport);
        for session_id in &removed {
            log::info!("session {} ended with {}", session_id, transport);
        }
        log::info!("client disconnected: {}", transport);
        removed
    }

    /// Handle one raw inbound line and send the immediate reply, if any.
    pub fn dispatch(&self, transport: TransportId, line: &str) {
        if let Some(reply) = self.handle_line(transport, line) {
            self.hub.send(transport, reply);
        }
    }

    pub fn handle_line(&self, transport: TransportId, line: &str) -> Option<OutboundEvent> {
        match parse_inbound(line) {
            Ok(event) => self.handle(transport, event),
            Err(message) => {
                log::debug!("bad message from {}: {}", transport, message);
                Some(OutboundEvent::Error(ErrorMessage::new(message)))
            }
        }
    }

    /// Map one event onto the core. Returns the immediate reply; `None` means
    /// the frame was queued and its result will arrive through the publisher.
    pub fn handle(&self, transport: TransportId, event: InboundEvent) -> Option<OutboundEvent> {
        match event {
            InboundEvent::JoinDetectionSession(req) => Some(self.join(transport, req)),
            InboundEvent::ProcessFrame(req) => self.process_frame(req),
            InboundEvent::GetSessionStats(req) => Some(self.session_stats(req)),
        }
    }

    fn join(&self, transport: TransportId, req: JoinRequest) -> OutboundEvent {
        let Some(session_id) = non_empty(req.session_id) else {
            return OutboundEvent::error(RelayError::Validation(SESSION_ID_REQUIRED));
        };
        let info = self.registry.join(&session_id, transport);
        match info.replaced {
            Some(previous) if previous != transport => log::info!(
                "session {} moved from {} to {}",
                session_id,
                previous,
                transport
            ),
            Some(_) => log::info!("session {} re-joined on {}", session_id, transport),
            None => log::info!("session {} joined on {}", session_id, transport),
        }
        OutboundEvent::JoinedSession(JoinedSession {
            session_id,
            status: "ready".to_string(),
            detector_info: self.detector_info.clone(),
        })
    }

    fn process_frame(&self, req: FrameRequest) -> Option<OutboundEvent> {
        let session_id = non_empty(req.session_id);
        let image = req.image.filter(|image| !image.is_empty());
        let (Some(session_id), Some(image)) = (session_id, image) else {
            return Some(OutboundEvent::error(RelayError::Validation(
                FRAME_FIELDS_REQUIRED,
            )));
        };
        if !self.registry.frame_received(&session_id) {
            return Some(OutboundEvent::error(RelayError::SessionNotFound));
        }
        let submitted_at = req.timestamp.unwrap_or_else(unix_now);
        let job = DetectionJob::for_session(session_id, image, submitted_at);
        match self.queue.enqueue(job) {
            Ok(()) => None,
            Err(QueueFull(job)) => {
                let session_id = job.session_id().unwrap_or_default().to_string();
                log::warn!("queue full; frame for session {} skipped", session_id);
                // Direct reply: never published, so last_detection is untouched.
                let result = DetectionResult::degraded(RelayError::Overload.to_string())
                    .for_session(session_id, submitted_at);
                Some(OutboundEvent::DetectionResults(result))
            }
        }
    }

    fn session_stats(&self, req: StatsRequest) -> OutboundEvent {
        let Some(session_id) = non_empty(req.session_id) else {
            return OutboundEvent::error(RelayError::Validation(SESSION_ID_REQUIRED));
        };
        match self.registry.stats(&session_id) {
            Ok(mut stats) => {
                stats.queue_size = self.queue.len();
                OutboundEvent::SessionStats(stats)
            }
            Err(err) => OutboundEvent::error(err),
        }
    }

    /// Queue a session-less job whose result comes back on the returned channel.
    pub fn submit_direct(
        &self,
        image: Option<FrameInput>,
        annotate: bool,
    ) -> Result<Receiver<DetectionResult>, RelayError> {
        let image = image
            .filter(|image| !image.is_empty())
            .ok_or(RelayError::Validation(IMAGE_REQUIRED))?;
        let (job, reply) = DetectionJob::direct(image, unix_now(), annotate);
        self.queue.enqueue(job).map_err(|_| {
            log::warn!("queue full; direct detection rejected");
            RelayError::Overload
        })?;
        Ok(reply)
    }
}
