//! Acoustic WebRTC signaling and file transfer core
//!
//! Compresses an SDP offer/answer into a 256-byte frame small enough for an
//! audio modem, rebuilds a full SDP from that frame on the other side, and
//! moves the file over the data channel once the peers are connected.

pub mod error;
pub mod frame;
pub mod sdp;
pub mod template;
pub mod inbox;
pub mod signaling;
pub mod transfer;

pub use error::{Result, SignalingError};
pub use frame::{decode_frame, encode_frame, FrameFields, FrameKind, SignalingFrame};
pub use inbox::{FrameInbox, InboxEvent};
pub use sdp::{parse_sdp, write_sdp, SessionDescriptor};
pub use signaling::{
    Modem, ModemProgress, ModemStatus, PeerConnection, PeerFactory, PeerRole, SignalEvent,
    SignalingSession, SignalingState,
};
pub use template::{
    extract_frame_fields, localize_description, merge_frame_into_template, SessionDescription,
    Template,
};
pub use transfer::{
    BitrateMeter, DataChannel, FileReceiver, FileSender, ReceiveEvent, ReceivedFile, SendStep,
    TransferSummary,
};

// Frame layout
pub const FRAME_SIZE: usize = 256;
pub const FRAME_HEADER_SIZE: usize = 40; // role (1) + length (1) + ipv4 (4) + port (2) + fingerprint (32)
pub const FINGERPRINT_LEN: usize = 32;
pub const FINGERPRINT_OFFSET: usize = 8;
pub const MAX_CREDENTIALS_LEN: usize = u8::MAX as usize - FRAME_HEADER_SIZE; // 215

// Templates
pub const NUM_TEMPLATE_CANDIDATES: usize = 5;
pub const TEMPLATE_PORT: u16 = 5400;
pub const TEMPLATE_CANDIDATE_PRIORITY: u32 = 2122252543;
pub const TEMPLATE_BUNDLE: &str = "sdparta_0";

// Modem
pub const DECODE_FAILED_SENTINEL: i32 = -1;

// Transfer
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";
pub const CHUNK_SIZE: usize = 16384;
pub const MAX_BUFFERED_AMOUNT: usize = 4 * 1024 * 1024;
pub const BACKPRESSURE_RETRY_MS: u64 = 100;
pub const STATS_INTERVAL_MS: u64 = 500;
