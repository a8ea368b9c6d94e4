use std::sync::Arc;

use crate::detect::DetectionResult;
use crate::gateway::OutboundEvent;
use crate::hub::EventSink;
use crate::session::{LastDetection, SessionRegistry};

/// Routes completed results to the transport that owns the submitting session.
///
/// If the session is no longer registered when its result completes (the
/// client disconnected or re-joined elsewhere mid-flight), the result is
/// dropped silently. That is expected behavior, not an error. Delivery is
/// fire-and-forget: no acknowledgement and no retry, since the next frame's
/// result supersedes this one.
///
/// Every published result, including error-tagged ones, becomes the session's
/// `last_detection`.
pub struct ResultPublisher {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
}

impl ResultPublisher {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    /// Returns true if the result was handed to a live transport.
    pub fn publish(&self, result: DetectionResult) -> bool {
        let Some(session_id) = result.session_id.clone() else {
            log::warn!("result without a session id cannot be published");
            return false;
        };
        let summary = LastDetection::from_result(&result);
        let Some(transport) = self.registry.record_result(&session_id, summary) else {
            log::debug!("session {} ended before its result was ready; dropped", session_id);
            return false;
        };
        let delivered = self
            .sink
            .send(transport, OutboundEvent::DetectionResults(result));
        if !delivered {
            log::debug!("result for session {} not delivered to {}", session_id, transport);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ConnectionHub, TransportId};

    fn setup() -> (Arc<SessionRegistry>, Arc<ConnectionHub>, ResultPublisher) {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let publisher = ResultPublisher::new(registry.clone(), hub.clone());
        (registry, hub, publisher)
    }

    #[test]
    fn result_goes_to_the_owning_transport() {
        let (registry, hub, publisher) = setup();
        let (t, rx) = hub.register();
        registry.join("s1", t);

        assert!(publisher.publish(DetectionResult::default().for_session("s1", 1.0)));
        match rx.try_recv() {
            Ok(OutboundEvent::DetectionResults(r)) => {
                assert_eq!(r.session_id.as_deref(), Some("s1"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.stats("s1").unwrap().last_detection.is_some());
    }

    #[test]
    fn vanished_session_is_dropped_silently() {
        let (registry, hub, publisher) = setup();
        let (t, rx) = hub.register();
        registry.join("s1", t);
        registry.remove_by_transport(t);

        assert!(!publisher.publish(DetectionResult::default().for_session("s1", 1.0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejoined_session_receives_on_new_transport_only() {
        let (registry, hub, publisher) = setup();
        let (old, rx_old) = hub.register();
        let (new, rx_new) = hub.register();
        registry.join("s1", old);
        registry.join("s1", new);

        assert!(publisher.publish(DetectionResult::default().for_session("s1", 1.0)));
        assert!(rx_old.try_recv().is_err());
        assert!(rx_new.try_recv().is_ok());
    }

    #[test]
    fn degraded_result_becomes_last_detection() {
        let (registry, hub, publisher) = setup();
        let (t, _rx) = hub.register();
        registry.join("s1", t);

        publisher.publish(DetectionResult::degraded("decode error: bad").for_session("s1", 1.0));
        let last = registry.stats("s1").unwrap().last_detection.unwrap();
        assert_eq!(last.detection_count, 0);
        assert_eq!(last.error.as_deref(), Some("decode error: bad"));
    }

    #[test]
    fn unregistered_transport_is_not_an_error() {
        let (registry, _hub, publisher) = setup();
        registry.join("s1", TransportId::next());
        assert!(!publisher.publish(DetectionResult::default().for_session("s1", 1.0)));
    }
}
