//! Process wiring: builds the shared components, starts the worker and both
//! listeners, and hands back a handle that stops them again.

mod http;
mod socket;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::RelayConfig;
use crate::detect::{Detector, DetectorInfo};
use crate::frame::FrameDecoder;
use crate::gateway::TransportGateway;
use crate::health::DetectorHealth;
use crate::hub::ConnectionHub;
use crate::publish::ResultPublisher;
use crate::queue::DispatchQueue;
use crate::session::SessionRegistry;
use crate::worker::{DetectionWorker, WorkerHandle};

/// Idle sleep for the nonblocking accept loops.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct RelayServer {
    config: RelayConfig,
    detector: Box<dyn Detector>,
}

impl RelayServer {
    /// `detector` must already be constructed and warmed up; the server takes
    /// sole ownership of it.
    pub fn new(config: RelayConfig, detector: Box<dyn Detector>) -> Self {
        Self { config, detector }
    }

    pub fn spawn(self) -> Result<RelayHandle> {
        let config = self.config;
        config.validate()?;

        let socket_listener = bind(&config.socket_addr, "socket channel")?;
        let http_listener = bind(&config.http_addr, "rest")?;
        let socket_addr = socket_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let queue = DispatchQueue::new(config.queue.capacity);
        let health = Arc::new(DetectorHealth::new(config.failure_threshold));
        let publisher = ResultPublisher::new(registry.clone(), hub.clone());
        let decoder = FrameDecoder::new(
            config.detector.target_width,
            config.detector.target_height,
        );
        let detector_name = self.detector.name();
        let worker = DetectionWorker::new(
            self.detector,
            decoder,
            queue.clone(),
            publisher,
            health.clone(),
            config.queue.poll_interval,
        )
        .spawn()?;

        let gateway = Arc::new(TransportGateway::new(
            registry,
            queue,
            hub,
            DetectorInfo::from_config(&config),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));

        let socket_join = {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("relay-socket".into())
                .spawn(move || {
                    if let Err(err) = socket::run(socket_listener, gateway, shutdown) {
                        log::error!("socket channel stopped: {:#}", err);
                    }
                })
                .context("failed to spawn socket listener thread")?
        };
        let http_join = {
            let ctx = http::HttpContext {
                gateway: gateway.clone(),
                health: health.clone(),
            };
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("relay-http".into())
                .spawn(move || {
                    if let Err(err) = http::run(http_listener, ctx, shutdown) {
                        log::error!("rest listener stopped: {:#}", err);
                    }
                })
                .context("failed to spawn rest listener thread")?
        };

        log::info!(
            "detection relay serving (socket={}, rest={}, detector={}, queue_capacity={})",
            socket_addr,
            http_addr,
            detector_name,
            config.queue.capacity
        );

        Ok(RelayHandle {
            socket_addr,
            http_addr,
            gateway,
            health,
            shutdown,
            worker: Some(worker),
            listeners: vec![socket_join, http_join],
        })
    }
}

fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let configured: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} address '{}'", what, addr))?;
    let listener = TcpListener::bind(configured)
        .with_context(|| format!("failed to bind {} listener on {}", what, configured))?;
    let bound = listener.local_addr()?;
    if configured.ip().is_loopback() && !bound.ip().is_loopback() {
        return Err(anyhow!(
            "{} configured for loopback address '{}', but bound to non-loopback address '{}'",
            what,
            configured,
            bound
        ));
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Running relay. Dropping the handle without `stop()` leaves threads running.
pub struct RelayHandle {
    pub socket_addr: SocketAddr,
    pub http_addr: SocketAddr,
    gateway: Arc<TransportGateway>,
    health: Arc<DetectorHealth>,
    shutdown: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
    listeners: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn gateway(&self) -> &Arc<TransportGateway> {
        &self.gateway
    }

    pub fn health(&self) -> &Arc<DetectorHealth> {
        &self.health
    }

    /// Stop accepting, close connections, stop the worker and join everything.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut panicked = false;
        for join in self.listeners.drain(..) {
            panicked |= join.join().is_err();
        }
        self.gateway.hub().close_all();
        if let Some(worker) = self.worker.take() {
            worker.stop()?;
        }
        log::info!("detection relay stopped");
        if panicked {
            return Err(anyhow!("relay listener thread panicked"));
        }
        Ok(())
    }
}
