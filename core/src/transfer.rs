use crate::error::{Result, SignalingError};
use crate::{BACKPRESSURE_RETRY_MS, CHUNK_SIZE, MAX_BUFFERED_AMOUNT};
use log::{debug, info};
use std::io::Read;
use std::time::Duration;

/// An open, reliable and ordered data channel
pub trait DataChannel {
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes queued by `send` but not yet handed to the transport
    fn buffered_amount(&self) -> usize;

    fn close(&mut self);
}

/// Encode text as UTF-16 code units, little-endian
pub fn encode_utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn decode_utf16(data: &[u8]) -> Result<String> {
    if data.len() % 2 != 0 {
        return Err(SignalingError::UnexpectedMessage(format!(
            "odd length {} for UTF-16 text",
            data.len()
        )));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| SignalingError::UnexpectedMessage("invalid UTF-16 text".to_string()))
}

/// Result of one attempt to push the next slice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStep {
    Sent { bytes_sent: u64 },
    /// Channel buffer is full; call again after `retry_after`
    Deferred { retry_after: Duration },
    Complete { bytes_sent: u64 },
}

/// Slices a file onto the data channel: name, size, then raw chunks
pub struct FileSender<R: Read> {
    name: String,
    size: u64,
    reader: R,
    bytes_sent: u64,
    started: bool,
}

impl<R: Read> FileSender<R> {
    pub fn new(name: impl Into<String>, size: u64, reader: R) -> Result<Self> {
        if size == 0 {
            return Err(SignalingError::EmptyFile);
        }
        Ok(Self {
            name: name.into(),
            size,
            reader,
            bytes_sent: 0,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.size
    }

    /// Announce the file name and size
    pub fn start<C: DataChannel>(&mut self, channel: &mut C) -> Result<()> {
        if self.started {
            return Err(SignalingError::InvalidState("transfer already started".to_string()));
        }
        channel.send(&encode_utf16(&self.name))?;
        channel.send(&encode_utf16(&self.size.to_string()))?;
        self.started = true;
        info!("Sending '{}' ({} bytes)", self.name, self.size);
        Ok(())
    }

    /// Send the next chunk unless the channel is backed up.
    ///
    /// The channel is closed right after the last chunk goes out.
    pub fn poll_send<C: DataChannel>(&mut self, channel: &mut C) -> Result<SendStep> {
        if !self.started {
            return Err(SignalingError::InvalidState("transfer not started".to_string()));
        }
        if self.is_complete() {
            return Ok(SendStep::Complete {
                bytes_sent: self.bytes_sent,
            });
        }

        let buffered = channel.buffered_amount();
        if buffered > MAX_BUFFERED_AMOUNT {
            debug!("Channel has {} bytes buffered, deferring", buffered);
            return Ok(SendStep::Deferred {
                retry_after: Duration::from_millis(BACKPRESSURE_RETRY_MS),
            });
        }

        let len = (self.size - self.bytes_sent).min(CHUNK_SIZE as u64) as usize;
        let mut chunk = vec![0u8; len];
        self.reader.read_exact(&mut chunk)?;
        channel.send(&chunk)?;
        self.bytes_sent += len as u64;

        if self.is_complete() {
            info!("Sent all {} bytes of '{}'", self.size, self.name);
            channel.close();
            Ok(SendStep::Complete {
                bytes_sent: self.bytes_sent,
            })
        } else {
            Ok(SendStep::Sent {
                bytes_sent: self.bytes_sent,
            })
        }
    }
}

/// Bitrate in kbit/s from byte counts sampled at millisecond timestamps
#[derive(Clone, Debug)]
pub struct BitrateMeter {
    start_ms: u64,
    prev_ms: u64,
    prev_bytes: u64,
    max_kbps: u64,
}

fn kbps(bytes: u64, elapsed_ms: u64) -> u64 {
    // bits per millisecond == kbit/s
    (8.0 * bytes as f64 / elapsed_ms as f64).round() as u64
}

impl BitrateMeter {
    pub fn new(now_ms: u64) -> Self {
        Self {
            start_ms: now_ms,
            prev_ms: now_ms,
            prev_bytes: 0,
            max_kbps: 0,
        }
    }

    /// Instantaneous bitrate since the previous sample
    pub fn sample(&mut self, now_ms: u64, bytes_now: u64) -> Option<u64> {
        let elapsed = now_ms.checked_sub(self.prev_ms).filter(|&ms| ms > 0)?;
        let bitrate = kbps(bytes_now.saturating_sub(self.prev_bytes), elapsed);

        self.prev_ms = now_ms;
        self.prev_bytes = bytes_now;
        self.max_kbps = self.max_kbps.max(bitrate);
        Some(bitrate)
    }

    pub fn max_kbps(&self) -> u64 {
        self.max_kbps
    }

    /// Average over the whole transfer
    pub fn average_kbps(&self, now_ms: u64, total_bytes: u64) -> u64 {
        match now_ms.saturating_sub(self.start_ms) {
            0 => 0,
            elapsed => kbps(total_bytes, elapsed),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveEvent {
    Name(String),
    SizeAnnounced(u64),
    Chunk { received: u64 },
    Complete(ReceivedFile),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub average_kbps: u64,
    pub max_kbps: u64,
}

/// Reassembles a file from the data channel messages in arrival order
pub struct FileReceiver {
    name: Option<String>,
    size: Option<u64>,
    buffer: Vec<Vec<u8>>,
    received: u64,
    complete: bool,
    meter: BitrateMeter,
}

impl FileReceiver {
    /// A fresh session for a channel that opened at `now_ms`
    pub fn new(now_ms: u64) -> Self {
        Self {
            name: None,
            size: None,
            buffer: Vec::new(),
            received: 0,
            complete: false,
            meter: BitrateMeter::new(now_ms),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn on_message(&mut self, data: &[u8]) -> Result<ReceiveEvent> {
        if self.complete {
            return Err(SignalingError::UnexpectedMessage(
                "message after transfer completed".to_string(),
            ));
        }

        let expected = match (self.name.is_some(), self.size) {
            (false, _) => {
                let name = decode_utf16(data)?;
                self.name = Some(name.clone());
                return Ok(ReceiveEvent::Name(name));
            }
            (true, None) => {
                let text = decode_utf16(data)?;
                let size = text
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|&size| size > 0)
                    .ok_or_else(|| {
                        SignalingError::UnexpectedMessage(format!("invalid file size {:?}", text))
                    })?;
                self.size = Some(size);
                info!("Receiving '{}' ({} bytes)", self.name().unwrap_or_default(), size);
                return Ok(ReceiveEvent::SizeAnnounced(size));
            }
            (true, Some(size)) => size,
        };

        let received = self.received + data.len() as u64;
        if received > expected {
            return Err(SignalingError::TransferOverrun { expected, received });
        }
        self.buffer.push(data.to_vec());
        self.received = received;

        if received < expected {
            return Ok(ReceiveEvent::Chunk { received });
        }

        self.complete = true;
        let data = std::mem::take(&mut self.buffer).concat();
        let name = self.name.clone().unwrap_or_default();
        info!("Received '{}' ({} bytes)", name, data.len());
        Ok(ReceiveEvent::Complete(ReceivedFile { name, data }))
    }

    /// Like [`FileReceiver::on_message`], closing `channel` once the file is complete
    pub fn receive<C: DataChannel>(&mut self, channel: &mut C, data: &[u8]) -> Result<ReceiveEvent> {
        let event = self.on_message(data)?;
        if let ReceiveEvent::Complete(_) = event {
            channel.close();
        }
        Ok(event)
    }

    /// Periodic telemetry sample
    pub fn sample_bitrate(&mut self, now_ms: u64) -> Option<u64> {
        self.meter.sample(now_ms, self.received)
    }

    pub fn summary(&self, now_ms: u64) -> TransferSummary {
        TransferSummary {
            bytes: self.received,
            average_kbps: self.meter.average_kbps(now_ms, self.received),
            max_kbps: self.meter.max_kbps(),
        }
    }
}
