//! Socket channel: newline-delimited JSON events over TCP.
//!
//! Each connection gets a reader thread that feeds lines to the gateway and a
//! writer thread that drains the connection's outbox. The reader never waits
//! on inference; replies and results reach the client only via the outbox.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use super::ACCEPT_BACKOFF;
use crate::gateway::{ErrorMessage, OutboundEvent, TransportGateway};
use crate::hub::{EventSink, TransportId};

/// Longest accepted inbound line. Longer lines close the connection.
pub(crate) const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// How often a blocked reader wakes to check for shutdown.
const READ_POLL: Duration = Duration::from_millis(200);

/// A client that accepts nothing for this long is disconnected.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn run(
    listener: TcpListener,
    gateway: Arc<TransportGateway>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let gateway = gateway.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("relay-conn".into())
                    .spawn(move || {
                        if let Err(err) = serve_connection(stream, peer, &gateway, &shutdown) {
                            log::warn!("connection from {} ended with error: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(join) => connections.push(join),
                    Err(err) => log::error!("failed to spawn connection thread: {}", err),
                }
                connections.retain(|join| !join.is_finished());
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for join in connections {
        let _ = join.join();
    }
    Ok(())
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: &TransportGateway,
    shutdown: &AtomicBool,
) -> Result<()> {
    // Accepted sockets can inherit the listener's nonblocking flag.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let _ = stream.set_nodelay(true);
    let writer_stream = stream.try_clone()?;
    writer_stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let (transport, outbox) = gateway.connect();
    log::debug!("{} is {}", transport, peer);
    let writer = std::thread::Builder::new()
        .name(format!("relay-writer-{}", transport.as_u64()))
        .spawn(move || write_events(writer_stream, outbox));
    let writer = match writer {
        Ok(writer) => writer,
        Err(err) => {
            gateway.disconnect(transport);
            return Err(err).context("failed to spawn connection writer");
        }
    };

    let result = read_events(&stream, transport, gateway, shutdown);
    // At relay shutdown the writer may be stuck on a client that stopped
    // reading; closing the socket first fails its pending write.
    let stopping = shutdown.load(Ordering::SeqCst);
    if stopping {
        let _ = stream.shutdown(Shutdown::Both);
    }
    // Unregistering drops the outbox sender, which ends the writer.
    gateway.disconnect(transport);
    let _ = writer.join();
    if !stopping {
        let _ = stream.shutdown(Shutdown::Both);
    }
    result
}

fn read_events(
    stream: &TcpStream,
    transport: TransportId,
    gateway: &TransportGateway,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line: Vec<u8> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        let available = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) if err.kind() == ErrorKind::ConnectionReset => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if available.is_empty() {
            return Ok(());
        }
        let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], true),
            None => (available, false),
        };
        line.extend_from_slice(chunk);
        let consumed = chunk.len() + usize::from(complete);
        reader.consume(consumed);

        if line.len() > MAX_LINE_BYTES {
            log::warn!("{} sent a line over {} bytes; closing", transport, MAX_LINE_BYTES);
            return Ok(());
        }
        if complete {
            handle_line(&line, transport, gateway);
            line.clear();
        }
    }
}

fn handle_line(raw: &[u8], transport: TransportId, gateway: &TransportGateway) {
    let Ok(text) = std::str::from_utf8(raw) else {
        gateway.hub().send(
            transport,
            OutboundEvent::Error(ErrorMessage::new("invalid message: not UTF-8")),
        );
        return;
    };
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    gateway.dispatch(transport, text);
}

fn write_events(mut stream: TcpStream, outbox: Receiver<OutboundEvent>) {
    for event in outbox.iter() {
        let mut payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("failed to encode outbound event: {}", err);
                continue;
            }
        };
        payload.push(b'\n');
        if let Err(err) = stream.write_all(&payload).and_then(|_| stream.flush()) {
            log::debug!("connection write failed: {}", err);
            // Unblock the reader so the connection is torn down.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }
}
