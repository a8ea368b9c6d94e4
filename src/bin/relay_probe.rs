//! relay_probe - stream an image file through a running detection relay
//!
//! Joins a session on the socket channel, sends the image as a frame the
//! requested number of times, and prints every reply as one JSON line.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::ImageFormat;

use detection_relay::annotate::annotate;
use detection_relay::gateway::{FrameRequest, JoinRequest};
use detection_relay::{unix_now, DetectionResult, FrameInput, InboundEvent, OutboundEvent};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream an image through a detection relay")]
struct Args {
    /// Socket channel address of the relay.
    #[arg(long, env = "RELAY_SOCKET_ADDR", default_value = "127.0.0.1:5000")]
    addr: String,

    /// Session id to join.
    #[arg(long, default_value = "relay-probe")]
    session: String,

    /// Image file (JPEG or PNG) to send.
    #[arg(long)]
    image: PathBuf,

    /// Number of frames to send.
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Pause between frames.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Write the last successful result drawn on the image to this path.
    #[arg(long)]
    annotate: Option<PathBuf>,
}

struct Channel {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Channel {
    fn connect(addr: &str) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("failed to connect to {}", addr))?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
        })
    }

    fn send(&mut self, event: &InboundEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<(String, OutboundEvent)> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(anyhow!("relay closed the connection"));
        }
        let event = serde_json::from_str(line.trim())
            .with_context(|| format!("unexpected reply: {}", line.trim()))?;
        Ok((line.trim().to_string(), event))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let format = ImageFormat::from_path(&args.image)
        .or_else(|_| image::guess_format(&bytes))
        .context("unrecognized image format")?;
    let frame = FrameInput::data_uri(format.to_mime_type(), &bytes);

    let mut channel = Channel::connect(&args.addr)?;
    channel.send(&InboundEvent::JoinDetectionSession(JoinRequest {
        session_id: Some(args.session.clone()),
    }))?;
    let (line, joined) = channel.recv()?;
    println!("{}", line);
    if let OutboundEvent::Error(err) = joined {
        return Err(anyhow!("join rejected: {}", err.message));
    }

    let mut last_success: Option<DetectionResult> = None;
    for n in 0..args.frames {
        if n > 0 {
            std::thread::sleep(Duration::from_millis(args.interval_ms));
        }
        channel.send(&InboundEvent::ProcessFrame(FrameRequest {
            session_id: Some(args.session.clone()),
            image: Some(frame.clone()),
            timestamp: Some(unix_now()),
        }))?;
        let (line, reply) = channel.recv()?;
        println!("{}", line);
        if let OutboundEvent::DetectionResults(result) = reply {
            if !result.is_degraded() {
                last_success = Some(result);
            }
        }
    }

    if let Some(out) = &args.annotate {
        let Some(result) = last_success else {
            return Err(anyhow!("no successful result to annotate"));
        };
        let image = image::load_from_memory(&bytes)?.to_rgb8();
        annotate(&image, result.detections())
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        log::info!(
            "wrote {} detections to {}",
            result.detection_count(),
            out.display()
        );
    }
    Ok(())
}
