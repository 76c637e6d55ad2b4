use base64::{engine::general_purpose::STANDARD, Engine};
use chirpdrop_core::frame::format_fingerprint;
use chirpdrop_core::template::template_text;
use chirpdrop_core::{
    decode_frame, encode_frame, extract_frame_fields, merge_frame_into_template, parse_sdp,
    write_sdp, DataChannel, FileReceiver, FileSender, FrameFields, FrameKind, ReceiveEvent,
    ReceivedFile, SendStep, SignalingError, TransferSummary, STATS_INTERVAL_MS,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// How often the simulated network drains the loopback channel
const DRAIN_TICK_MS: u64 = 10;

#[derive(Parser)]
#[command(name = "chirpdrop")]
#[command(about = "Acoustic signaling frames and data channel file transfer")]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Offer,
    Answer,
}

impl From<Kind> for FrameKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Offer => FrameKind::Offer,
            Kind::Answer => FrameKind::Answer,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a local session description into a 256-byte frame
    EncodeFrame {
        #[arg(short, long, value_enum)]
        kind: Kind,

        /// Address of the interface whose candidate is sent
        #[arg(long)]
        ip: Ipv4Addr,

        #[arg(value_name = "LOCAL.SDP")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT.BIN")]
        output: PathBuf,

        /// Write the frame as base64 text
        #[arg(long)]
        base64: bool,
    },

    /// Print the fields carried by a frame as JSON
    DecodeFrame {
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        /// Read the frame as base64 text
        #[arg(long)]
        base64: bool,
    },

    /// Rebuild the full session description a frame stands for
    Merge {
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        /// Output SDP file (stdout if omitted)
        #[arg(value_name = "OUTPUT.SDP")]
        output: Option<PathBuf>,

        /// Emit {"type", "sdp"} as handed to a WebRTC stack
        #[arg(long)]
        json: bool,

        #[arg(long)]
        base64: bool,
    },

    /// Print the canonical offer or answer template
    Template {
        #[arg(short, long, value_enum)]
        kind: Kind,
    },

    /// Send a file through an in-memory data channel and write what arrives
    Transfer {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Bytes the simulated network drains every 10 ms
        #[arg(long, default_value = "1048576")]
        drain_rate: NonZeroUsize,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Frame carries no offer or answer")]
    NoPayload,

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Channel closed after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::EncodeFrame {
            kind,
            ip,
            input,
            output,
            base64,
        } => encode_frame_command(kind.into(), ip, &input, &output, base64)?,
        Commands::DecodeFrame { input, base64 } => decode_frame_command(&input, base64)?,
        Commands::Merge {
            input,
            output,
            json,
            base64,
        } => merge_command(&input, output.as_deref(), json, base64)?,
        Commands::Template { kind } => print!("{}", template_text(kind.into())),
        Commands::Transfer {
            input,
            output,
            drain_rate,
        } => transfer_command(&input, &output, drain_rate)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Also installs the log bridge, so the core crate's records show up
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, data: &[u8]) -> Result<(), CliError> {
    std::fs::write(path, data).map_err(|source| CliError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn read_frame(path: &Path, base64: bool) -> Result<FrameFields, CliError> {
    let mut data = read(path)?;
    if base64 {
        let text = String::from_utf8_lossy(&data);
        data = STANDARD.decode(text.trim())?;
    }
    decode_frame(&data)?.ok_or(CliError::NoPayload)
}

fn encode_frame_command(
    kind: FrameKind,
    ip: Ipv4Addr,
    input_path: &Path,
    output_path: &Path,
    base64: bool,
) -> Result<(), CliError> {
    let text = String::from_utf8_lossy(&read(input_path)?).into_owned();
    let sdp = parse_sdp(&text)?;
    let fields = extract_frame_fields(&sdp, kind, ip)?;
    let frame = encode_frame(&fields)?;
    info!(
        "Encoded {} for {}:{} ({} payload bytes)",
        kind,
        fields.ip,
        fields.port,
        frame.payload_len()
    );

    if base64 {
        write(output_path, STANDARD.encode(frame.as_bytes()).as_bytes())?;
    } else {
        write(output_path, frame.as_bytes())?;
    }
    println!("Wrote {} frame to {}", kind, output_path.display());
    Ok(())
}

#[derive(Serialize)]
struct FrameReport {
    #[serde(rename = "type")]
    kind: &'static str,
    ip: String,
    port: u16,
    fingerprint: String,
    ice_ufrag: String,
    ice_pwd: String,
}

fn decode_frame_command(input_path: &Path, base64: bool) -> Result<(), CliError> {
    let fields = read_frame(input_path, base64)?;
    let report = FrameReport {
        kind: fields.kind.sdp_type(),
        ip: fields.ip.to_string(),
        port: fields.port,
        fingerprint: format_fingerprint(&fields.fingerprint),
        ice_ufrag: fields.ice_ufrag,
        ice_pwd: fields.ice_pwd,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Serialize)]
struct DescriptionJson<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sdp: &'a str,
}

fn merge_command(
    input_path: &Path,
    output_path: Option<&Path>,
    json: bool,
    base64: bool,
) -> Result<(), CliError> {
    let fields = read_frame(input_path, base64)?;
    let sdp = write_sdp(&merge_frame_into_template(&fields)?);

    let text = if json {
        serde_json::to_string_pretty(&DescriptionJson {
            kind: fields.kind.sdp_type(),
            sdp: &sdp,
        })?
    } else {
        sdp
    };

    match output_path {
        Some(path) => {
            write(path, text.as_bytes())?;
            println!("Wrote merged {} to {}", fields.kind, path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

/// Sending half of an in-process data channel
struct LoopbackChannel {
    tx: Option<UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
}

impl DataChannel for LoopbackChannel {
    fn send(&mut self, data: &[u8]) -> chirpdrop_core::Result<()> {
        let tx = self.tx.as_ref().ok_or(SignalingError::ChannelClosed)?;
        self.buffered.fetch_add(data.len(), Ordering::SeqCst);
        tx.send(data.to_vec())
            .map_err(|_| SignalingError::ChannelClosed)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

fn transfer_command(
    input_path: &Path,
    output_path: &Path,
    drain_rate: NonZeroUsize,
) -> Result<(), CliError> {
    let file = File::open(input_path).map_err(|source| CliError::File {
        path: input_path.to_path_buf(),
        source,
    })?;
    let size = file
        .metadata()
        .map_err(|source| CliError::File {
            path: input_path.to_path_buf(),
            source,
        })?
        .len();
    let name = input_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sender = FileSender::new(name, size, file)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(CliError::Runtime)?;

    let (file, summary) = runtime.block_on(run_transfer(sender, drain_rate))?;
    write(output_path, &file.data)?;

    println!(
        "Received '{}' ({} bytes) into {}",
        file.name,
        summary.bytes,
        output_path.display()
    );
    println!(
        "Average {} kbit/s, peak {} kbit/s",
        summary.average_kbps, summary.max_kbps
    );
    Ok(())
}

async fn run_transfer(
    sender: FileSender<File>,
    drain_rate: NonZeroUsize,
) -> Result<(ReceivedFile, TransferSummary), CliError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let channel = LoopbackChannel {
        tx: Some(tx),
        buffered: buffered.clone(),
    };

    let (sent, received) = tokio::join!(
        send_file(sender, channel),
        receive_file(rx, buffered, drain_rate)
    );
    let sent = sent?;
    let (file, summary) = received?;
    debug!("Sender pushed {} bytes, receiver got {}", sent, summary.bytes);
    Ok((file, summary))
}

async fn send_file(
    mut sender: FileSender<File>,
    mut channel: LoopbackChannel,
) -> Result<u64, CliError> {
    sender.start(&mut channel)?;
    loop {
        match sender.poll_send(&mut channel)? {
            SendStep::Sent { .. } => tokio::task::yield_now().await,
            SendStep::Deferred { retry_after } => tokio::time::sleep(retry_after).await,
            // poll_send closed the channel with the last chunk
            SendStep::Complete { bytes_sent } => return Ok(bytes_sent),
        }
    }
}

async fn receive_file(
    mut rx: UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    drain_rate: NonZeroUsize,
) -> Result<(ReceivedFile, TransferSummary), CliError> {
    let started = Instant::now();
    let elapsed_ms = || started.elapsed().as_millis() as u64;
    let mut receiver = FileReceiver::new(0);

    let mut stats = tokio::time::interval(Duration::from_millis(STATS_INTERVAL_MS));
    let mut drain = tokio::time::interval(Duration::from_millis(DRAIN_TICK_MS));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = stats.tick() => {
                if let Some(kbps) = receiver.sample_bitrate(elapsed_ms()) {
                    info!("{} kbit/s, {} bytes received", kbps, receiver.received());
                }
            }
            _ = drain.tick() => {
                let mut budget = drain_rate.get();
                while budget > 0 {
                    let message = match rx.try_recv() {
                        Ok(message) => message,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            return Err(CliError::Incomplete {
                                received: receiver.received(),
                                expected: receiver.size().unwrap_or_default(),
                            });
                        }
                    };
                    budget = budget.saturating_sub(message.len());
                    buffered.fetch_sub(message.len(), Ordering::SeqCst);

                    match receiver.on_message(&message)? {
                        ReceiveEvent::Name(name) => info!("Incoming file '{}'", name),
                        ReceiveEvent::SizeAnnounced(size) => info!("Expecting {} bytes", size),
                        ReceiveEvent::Chunk { received } => debug!("{} bytes received", received),
                        ReceiveEvent::Complete(file) => {
                            return Ok((file, receiver.summary(elapsed_ms())));
                        }
                    }
                }
            }
        }
    }
}
