//! Offer/answer state machine driven by acoustic frames
//!
//! All transitions run on one logical thread: the WebRTC binding and the
//! modem report completions by calling back into [`SignalingSession`].

use crate::error::{Result, SignalingError};
use crate::frame::{encode_frame, FrameKind, SignalingFrame};
use crate::inbox::{FrameInbox, InboxEvent};
use crate::sdp::parse_sdp;
use crate::template::{extract_frame_fields, localize_description, SessionDescription};
use crate::{DATA_CHANNEL_LABEL, DECODE_FAILED_SENTINEL};
use log::{debug, info, warn};
use std::net::Ipv4Addr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl PeerRole {
    /// Kind of frame this role transmits
    pub fn frame_kind(self) -> FrameKind {
        match self {
            PeerRole::Sender => FrameKind::Offer,
            PeerRole::Receiver => FrameKind::Answer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    /// Sender: offer requested, waiting for ICE gathering
    OfferPending,
    /// Sender: offer transmitted
    AwaitingAnswer,
    /// Receiver: an offer was heard, waiting for the operator
    OfferReceived,
    /// Receiver: answer requested, waiting for ICE gathering
    AnswerPending,
    Connected,
}

/// The WebRTC peer connection, as seen by the state machine.
///
/// Asynchronous operations only start here; their results come back through
/// [`SignalingSession::on_local_description`] and
/// [`SignalingSession::on_ice_gathering_complete`].
pub trait PeerConnection {
    fn create_data_channel(&mut self, label: &str) -> Result<()>;
    fn create_offer(&mut self) -> Result<()>;
    fn create_answer(&mut self) -> Result<()>;
    fn set_local_description(&mut self, description: &SessionDescription) -> Result<()>;
    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;
    fn close(&mut self);
}

pub trait PeerFactory {
    type Peer: PeerConnection;

    fn create(&mut self, role: PeerRole) -> Result<Self::Peer>;
}

/// Recording/analysis counters reported by the modem
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModemProgress {
    pub frames_left_to_record: i32,
    pub frames_to_record: i32,
    pub frames_left_to_analyze: i32,
    pub frames_to_analyze: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModemStatus {
    Idle,
    Recording { recorded: i32, total: i32 },
    /// Recording finished, analysis not started yet
    AwaitingAnalysis,
    Analyzing { analyzed: i32, total: i32 },
    Failed,
}

impl ModemProgress {
    pub fn is_failed(&self) -> bool {
        self.frames_to_record == DECODE_FAILED_SENTINEL
    }

    pub fn status(&self) -> ModemStatus {
        // The last 5% of a recording is reported as done
        let tail = (self.frames_to_record as f32 * 0.05).max(0.0);

        if self.frames_to_analyze > 0 {
            ModemStatus::Analyzing {
                analyzed: self.frames_to_analyze - self.frames_left_to_analyze,
                total: self.frames_to_analyze,
            }
        } else if self.frames_left_to_record as f32 > tail {
            ModemStatus::Recording {
                recorded: self.frames_to_record - self.frames_left_to_record,
                total: self.frames_to_record,
            }
        } else if self.frames_to_record > 0 {
            ModemStatus::AwaitingAnalysis
        } else if self.is_failed() {
            ModemStatus::Failed
        } else {
            ModemStatus::Idle
        }
    }
}

/// The audio modem, used as a black box
pub trait Modem {
    fn transmit(&mut self, frame: &SignalingFrame) -> Result<()>;

    /// Most recently recovered payload, if any
    fn decoded_bytes(&mut self) -> Option<Vec<u8>>;

    fn progress(&self) -> ModemProgress;
}

/// Operator-visible outcome of a transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalEvent {
    /// An incoming file transfer waiting for [`SignalingSession::accept_offer`]
    OfferReceived { from: Ipv4Addr },
    AnswerApplied { from: Ipv4Addr },
    /// Heard an answer while no offer of ours is outstanding
    AnswerNotAddressed { from: Ipv4Addr },
    DecodeFailed,
    Failed(String),
}

pub struct SignalingSession<F: PeerFactory, M: Modem> {
    factory: F,
    modem: M,
    local_ip: Ipv4Addr,
    inbox: FrameInbox,
    state: SignalingState,
    sender: Option<F::Peer>,
    receiver: Option<F::Peer>,
    pending_offer: Option<SessionDescription>,
    last_answer: Option<SessionDescription>,
    modem_status: ModemStatus,
    decode_failure_armed: bool,
    incoming_channel_taken: bool,
}

impl<F: PeerFactory, M: Modem> SignalingSession<F, M> {
    pub fn new(factory: F, modem: M, local_ip: Ipv4Addr) -> Result<Self> {
        Ok(Self {
            factory,
            modem,
            local_ip,
            inbox: FrameInbox::new()?,
            state: SignalingState::Idle,
            sender: None,
            receiver: None,
            pending_offer: None,
            last_answer: None,
            modem_status: ModemStatus::Idle,
            decode_failure_armed: false,
            incoming_channel_taken: false,
        })
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn role(&self) -> Option<PeerRole> {
        if self.sender.is_some() {
            Some(PeerRole::Sender)
        } else if self.receiver.is_some() {
            Some(PeerRole::Receiver)
        } else {
            None
        }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Choose the interface whose address goes into outgoing frames
    pub fn set_local_ip(&mut self, local_ip: Ipv4Addr) {
        self.local_ip = local_ip;
    }

    pub fn modem(&self) -> &M {
        &self.modem
    }

    pub fn modem_mut(&mut self) -> &mut M {
        &mut self.modem
    }

    pub fn modem_status(&self) -> ModemStatus {
        self.modem_status
    }

    pub fn pending_offer(&self) -> Option<&SessionDescription> {
        self.pending_offer.as_ref()
    }

    pub fn last_answer(&self) -> Option<&SessionDescription> {
        self.last_answer.as_ref()
    }

    pub fn peer(&self, role: PeerRole) -> Option<&F::Peer> {
        match role {
            PeerRole::Sender => self.sender.as_ref(),
            PeerRole::Receiver => self.receiver.as_ref(),
        }
    }

    fn peer_mut(&mut self, role: PeerRole) -> Result<&mut F::Peer> {
        let peer = match role {
            PeerRole::Sender => self.sender.as_mut(),
            PeerRole::Receiver => self.receiver.as_mut(),
        };
        peer.ok_or_else(|| SignalingError::InvalidState(format!("no {:?} peer", role)))
    }

    fn expect_state(&self, expected: SignalingState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SignalingError::InvalidState(format!(
                "expected {:?}, session is {:?}",
                expected, self.state
            )))
        }
    }

    /// Start offering a file: create the sending peer and request an offer
    pub fn start_sender(&mut self) -> Result<()> {
        self.close();

        let mut peer = self.factory.create(PeerRole::Sender)?;
        peer.create_data_channel(DATA_CHANNEL_LABEL)?;
        peer.create_offer()?;

        self.sender = Some(peer);
        self.last_answer = None;
        self.state = SignalingState::OfferPending;
        info!("Sender started, waiting for offer");
        Ok(())
    }

    /// The binding finished creating an offer or answer
    pub fn on_local_description(&mut self, role: PeerRole, sdp: &str) -> Result<()> {
        self.expect_state(match role {
            PeerRole::Sender => SignalingState::OfferPending,
            PeerRole::Receiver => SignalingState::AnswerPending,
        })?;

        let kind = role.frame_kind();
        let mut descriptor = parse_sdp(sdp)?;
        localize_description(&mut descriptor, kind, self.local_ip);
        let description = SessionDescription::from_descriptor(kind, &descriptor);

        self.peer_mut(role)?.set_local_description(&description)?;
        debug!("Local {} set", kind);
        Ok(())
    }

    /// All local candidates are known: compress the description and send it
    pub fn on_ice_gathering_complete(&mut self, role: PeerRole, local_sdp: &str) -> Result<SignalingFrame> {
        let next = match role {
            PeerRole::Sender => {
                self.expect_state(SignalingState::OfferPending)?;
                SignalingState::AwaitingAnswer
            }
            PeerRole::Receiver => {
                self.expect_state(SignalingState::AnswerPending)?;
                SignalingState::Connected
            }
        };
        self.peer_mut(role)?;

        let descriptor = parse_sdp(local_sdp)?;
        let fields = extract_frame_fields(&descriptor, role.frame_kind(), self.local_ip)?;
        let frame = encode_frame(&fields)?;
        self.modem.transmit(&frame)?;

        info!(
            "Transmitted {} for {}:{}",
            fields.kind, fields.ip, fields.port
        );
        self.state = next;
        Ok(frame)
    }

    /// Handle one buffer recovered by the modem
    pub fn on_frame(&mut self, data: &[u8]) -> Result<Option<SignalEvent>> {
        let event = match self.inbox.process(data)? {
            Some(event) => event,
            None => return Ok(None),
        };

        match event.kind() {
            FrameKind::Offer => Ok(Some(self.offer_heard(event))),
            FrameKind::Answer => self.answer_heard(event).map(Some),
        }
    }

    fn offer_heard(&mut self, event: InboxEvent) -> SignalEvent {
        let from = event.fields.ip;
        self.pending_offer = Some(event.description);
        if self.state == SignalingState::Idle {
            self.state = SignalingState::OfferReceived;
        }
        SignalEvent::OfferReceived { from }
    }

    fn answer_heard(&mut self, event: InboxEvent) -> Result<SignalEvent> {
        let from = event.fields.ip;
        self.last_answer = Some(event.description.clone());

        let expecting = matches!(
            self.state,
            SignalingState::OfferPending | SignalingState::AwaitingAnswer
        );
        match self.sender.as_mut() {
            Some(peer) if expecting => {
                peer.set_remote_description(&event.description)?;
                self.state = SignalingState::Connected;
                info!("Applied answer from {}, connecting", from);
                Ok(SignalEvent::AnswerApplied { from })
            }
            _ => {
                let mismatch = SignalingError::NegotiationMismatch(format!(
                    "answer from {} while {:?}",
                    from, self.state
                ));
                warn!("{}", mismatch);
                Ok(SignalEvent::AnswerNotAddressed { from })
            }
        }
    }

    /// Operator confirmed the pending offer: answer it
    pub fn accept_offer(&mut self) -> Result<()> {
        let offer = self
            .pending_offer
            .clone()
            .ok_or_else(|| SignalingError::InvalidState("no offer to accept".to_string()))?;

        if let Some(mut sender) = self.sender.take() {
            sender.close();
        }
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }

        let mut peer = self.factory.create(PeerRole::Receiver)?;
        peer.set_remote_description(&offer)?;
        peer.create_answer()?;

        self.receiver = Some(peer);
        self.incoming_channel_taken = false;
        self.state = SignalingState::AnswerPending;
        info!("Accepted offer, waiting for answer");
        Ok(())
    }

    /// Poll the modem once; meant to run from a periodic timer
    pub fn poll_modem(&mut self) -> Vec<SignalEvent> {
        let mut events = Vec::new();

        let status = self.modem.progress().status();
        match status {
            ModemStatus::Recording { .. } => self.decode_failure_armed = true,
            ModemStatus::Failed if self.decode_failure_armed => {
                self.decode_failure_armed = false;
                warn!("{}", SignalingError::DecodeFailed);
                events.push(SignalEvent::DecodeFailed);
            }
            _ => {}
        }
        self.modem_status = status;

        if let Some(data) = self.modem.decoded_bytes() {
            match self.on_frame(&data) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(SignalingError::MalformedFrame(reason)) => {
                    debug!("Dropping malformed frame: {}", reason);
                }
                Err(e) => {
                    warn!("Failed to handle frame: {}", e);
                    events.push(SignalEvent::Failed(e.to_string()));
                }
            }
        }

        events
    }

    /// The sending data channel opened; only a negotiated sender may use it
    pub fn on_send_channel_open(&self) -> Result<()> {
        if self.sender.is_some() && self.state == SignalingState::Connected {
            Ok(())
        } else {
            Err(SignalingError::NegotiationMismatch(format!(
                "send channel opened while {:?}",
                self.state
            )))
        }
    }

    /// An incoming data channel appeared; true if it should be read
    pub fn on_incoming_channel(&mut self) -> bool {
        if self.receiver.is_none() || self.incoming_channel_taken {
            return false;
        }
        self.incoming_channel_taken = true;
        true
    }

    /// The file transfer finished on this side: drop the peers
    pub fn on_transfer_complete(&mut self) {
        info!("Transfer complete, tearing down");
        self.close();
    }

    /// Tear down both peers; remembered frames are kept
    pub fn close(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.close();
        }
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }
        if self.state != SignalingState::Idle {
            info!("Closed peer connections");
        }
        self.pending_offer = None;
        self.incoming_channel_taken = false;
        self.state = SignalingState::Idle;
    }
}
