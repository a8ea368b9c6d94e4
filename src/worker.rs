//! Detection worker.
//!
//! The worker is the single consumer of the dispatch queue and the sole owner
//! of the detector. The detector is moved into the worker at construction and
//! no other handle to it exists, so inference is never concurrent. This is a
//! design invariant expressed through ownership; there is no runtime check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::annotate;
use crate::detect::{Detection, DetectionResult, Detector, ImageSize};
use crate::error::RelayError;
use crate::frame::{encode_jpeg_data_uri, FrameDecoder, FrameInput};
use crate::health::DetectorHealth;
use crate::publish::ResultPublisher;
use crate::queue::{DetectionJob, DispatchQueue, JobOrigin};
use crate::unix_now;

pub struct DetectionWorker {
    detector: Box<dyn Detector>,
    decoder: FrameDecoder,
    queue: DispatchQueue,
    publisher: ResultPublisher,
    health: Arc<DetectorHealth>,
    poll_interval: Duration,
}

impl DetectionWorker {
    pub fn new(
        detector: Box<dyn Detector>,
        decoder: FrameDecoder,
        queue: DispatchQueue,
        publisher: ResultPublisher,
        health: Arc<DetectorHealth>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            detector,
            decoder,
            queue,
            publisher,
            health,
            poll_interval,
        }
    }

    /// Move the worker onto its own thread.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("detection-worker".into())
            .spawn(move || self.run(&shutdown_thread))
            .context("failed to spawn detection worker thread")?;
        Ok(WorkerHandle {
            shutdown,
            join: Some(join),
        })
    }

    fn run(mut self, shutdown: &AtomicBool) {
        let _stopped = StoppedOnExit(self.health.clone());
        log::info!(
            "detection worker started (detector={}, poll={:?})",
            self.detector.name(),
            self.poll_interval
        );
        while !shutdown.load(Ordering::SeqCst) {
            // The timeout only bounds how long shutdown can go unnoticed.
            let Some(job) = self.queue.dequeue(self.poll_interval) else {
                continue;
            };
            self.process(job);
        }
        let dropped = self.queue.close();
        if dropped > 0 {
            log::info!("dropped {} queued jobs at shutdown", dropped);
        }
        log::info!("detection worker stopped");
    }

    /// Run one job to completion and route its result.
    pub fn process(&mut self, job: DetectionJob) {
        let annotate = matches!(job.origin, JobOrigin::Direct { annotate: true, .. });
        let result = self.run_job(&job.image, annotate);
        match job.origin {
            JobOrigin::Session(session_id) => {
                let mut result = result.for_session(session_id, job.submitted_at);
                result.processing_timestamp = Some(unix_now());
                self.publisher.publish(result);
            }
            JobOrigin::Direct { reply, .. } => {
                let mut result = result;
                let now = unix_now();
                result.timestamp = Some(now);
                result.processing_timestamp = Some(now);
                // The requester may have given up waiting; nothing to do then.
                let _ = reply.send(result);
            }
        }
    }

    /// Decode, detect and time one frame. Failures become error-tagged results.
    fn run_job(&mut self, image: &FrameInput, annotate: bool) -> DetectionResult {
        let started = Instant::now();
        let decoded = match self.decoder.decode(image) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("frame decode failed: {}", err);
                self.health.record_rejected();
                return DetectionResult::degraded(RelayError::from(err).to_string());
            }
        };
        let size = ImageSize::of(&decoded);
        match self.detector.detect(&decoded) {
            Ok(detections) => {
                let processing_time = started.elapsed().as_secs_f64();
                self.health.record_success();
                let detections: Vec<Detection> =
                    detections.into_iter().map(Detection::sanitized).collect();
                let annotated_image = if annotate {
                    self.render(&decoded, &detections)
                } else {
                    None
                };
                let mut result = DetectionResult::from_detections(detections, processing_time, size);
                result.annotated_image = annotated_image;
                result
            }
            Err(err) => {
                let err = RelayError::Detector(format!("{:#}", err));
                log::warn!("{}", err);
                self.health.record_failure(&err.to_string());
                DetectionResult::degraded(err.to_string())
            }
        }
    }
}

impl DetectionWorker {
    fn render(&self, image: &RgbImage, detections: &[Detection]) -> Option<String> {
        let drawn = annotate::annotate(image, detections);
        match encode_jpeg_data_uri(&drawn) {
            Ok(uri) => Some(uri),
            Err(err) => {
                log::warn!("annotated image encode failed: {:#}", err);
                None
            }
        }
    }
}

struct StoppedOnExit(Arc<DetectorHealth>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

/// Handle for the worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Signal the worker and wait for it. Returns within one poll interval
    /// plus the duration of any job in progress.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection worker thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, StubBackend};
    use crate::gateway::OutboundEvent;
    use crate::hub::ConnectionHub;
    use crate::session::SessionRegistry;

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Err(anyhow!("accelerator unavailable"))
        }
    }

    struct SloppyDetector;

    impl Detector for SloppyDetector {
        fn name(&self) -> &'static str {
            "sloppy"
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
            let mut d = Detection::new(0, 0.5, BoundingBox::from_corners(0.1, 0.1, 0.2, 0.2));
            d.bbox.x1 = -3.0;
            d.bbox.x2 = 9.0;
            Ok(vec![d])
        }
    }

    struct Fixture {
        worker: DetectionWorker,
        registry: Arc<SessionRegistry>,
        rx: crossbeam_channel::Receiver<OutboundEvent>,
        health: Arc<DetectorHealth>,
    }

    fn fixture(detector: Box<dyn Detector>) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let (t, rx) = hub.register();
        registry.join("s1", t);
        let health = Arc::new(DetectorHealth::new(2));
        let worker = DetectionWorker::new(
            detector,
            FrameDecoder::new(4, 4),
            DispatchQueue::new(4),
            ResultPublisher::new(registry.clone(), hub),
            health.clone(),
            Duration::from_millis(10),
        );
        Fixture {
            worker,
            registry,
            rx,
            health,
        }
    }

    fn frame() -> FrameInput {
        FrameInput::from_rgb(4, 4, &[0u8; 48])
    }

    fn next_result(rx: &crossbeam_channel::Receiver<OutboundEvent>) -> DetectionResult {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(OutboundEvent::DetectionResults(r)) => r,
            other => panic!("expected detection results, got {:?}", other),
        }
    }

    #[test]
    fn detector_failure_is_published_as_error_result() {
        let mut f = fixture(Box::new(FailingDetector));
        f.worker.process(DetectionJob::for_session("s1", frame(), 7.0));
        f.worker.process(DetectionJob::for_session("s1", frame(), 8.0));

        let r = next_result(&f.rx);
        assert!(r.detections().is_empty());
        assert_eq!(r.detection_count(), 0);
        assert!(r.error.as_deref().unwrap().contains("accelerator unavailable"));
        assert_eq!(r.timestamp, Some(7.0));
        assert_eq!(f.health.state(), crate::health::DetectorState::Degraded);
    }

    #[test]
    fn decode_failure_is_published_and_recorded() {
        let mut f = fixture(Box::new(StubBackend::new()));
        let corrupt = FrameInput::Encoded("data:image/jpeg;base64,AAAA".into());
        f.worker.process(DetectionJob::for_session("s1", corrupt, 1.0));

        let r = next_result(&f.rx);
        assert!(r.is_degraded());
        assert!(r.error.as_deref().unwrap().starts_with("decode error"));
        let last = f.registry.stats("s1").unwrap().last_detection.unwrap();
        assert!(last.error.is_some());
        assert_eq!(f.health.state(), crate::health::DetectorState::Ok);
    }

    #[test]
    fn detector_output_is_sanitized() {
        let mut f = fixture(Box::new(SloppyDetector));
        f.worker.process(DetectionJob::for_session("s1", frame(), 1.0));
        let r = next_result(&f.rx);
        let b = r.detections()[0].bbox;
        assert_eq!((b.x1, b.x2), (0.0, 1.0));
        assert_eq!(r.detection_count(), 1);
        assert_eq!(r.image_size, ImageSize { width: 4, height: 4 });
    }

    #[test]
    fn direct_jobs_reply_on_their_own_channel() {
        let mut f = fixture(Box::new(StubBackend::new()));
        let (job, reply) = DetectionJob::direct(frame(), 0.0, false);
        f.worker.process(job);
        let r = reply.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(r.session_id.is_none());
        assert!(r.timestamp.is_some());
        assert!(r.annotated_image.is_none());
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn direct_jobs_can_ask_for_an_annotated_frame() {
        let mut f = fixture(Box::new(SloppyDetector));
        let (job, reply) = DetectionJob::direct(frame(), 0.0, true);
        f.worker.process(job);
        let r = reply.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(r
            .annotated_image
            .as_deref()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn spawned_worker_stops_and_reports_stopped() {
        let f = fixture(Box::new(StubBackend::new()));
        let health = f.health.clone();
        let handle = f.worker.spawn().unwrap();
        assert!(handle.is_running());
        handle.stop().unwrap();
        assert_eq!(health.state(), crate::health::DetectorState::Stopped);
    }

    #[test]
    fn stopped_worker_closes_the_queue() {
        let f = fixture(Box::new(StubBackend::new()));
        let queue = f.worker.queue.clone();
        f.worker.spawn().unwrap().stop().unwrap();
        assert!(queue.is_closed());

        let (job, reply) = DetectionJob::direct(frame(), 0.0, false);
        queue.enqueue(job).unwrap();
        assert_eq!(
            reply.recv_timeout(Duration::from_secs(1)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
    }
}
