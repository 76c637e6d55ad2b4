//! Deduplication and classification of decoded acoustic frames
//!
//! The modem keeps reporting the last payload it recovered for as long as it
//! hears the same transmission, so each distinct frame must only be acted
//! on once.

use crate::error::{Result, SignalingError};
use crate::frame::{decode_frame, FrameFields, FrameKind};
use crate::template::{SessionDescription, Template};
use log::{debug, info};

/// A frame seen for the first time, already merged into its template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxEvent {
    pub fields: FrameFields,
    pub description: SessionDescription,
}

impl InboxEvent {
    pub fn kind(&self) -> FrameKind {
        self.fields.kind
    }
}

pub struct FrameInbox {
    offer_template: Template,
    answer_template: Template,
    last_offer: Option<Vec<u8>>,
    last_answer: Option<Vec<u8>>,
}

impl FrameInbox {
    pub fn new() -> Result<Self> {
        Self::with_templates(
            Template::builtin(FrameKind::Offer)?,
            Template::builtin(FrameKind::Answer)?,
        )
    }

    pub fn with_templates(offer_template: Template, answer_template: Template) -> Result<Self> {
        if offer_template.kind() != FrameKind::Offer || answer_template.kind() != FrameKind::Answer {
            return Err(SignalingError::InvalidTemplate(
                "offer and answer templates swapped".to_string(),
            ));
        }
        Ok(Self {
            offer_template,
            answer_template,
            last_offer: None,
            last_answer: None,
        })
    }

    /// Classify one decoded buffer.
    ///
    /// Returns `Ok(None)` for repeats of the cached frame and for buffers
    /// with no signaling payload. A malformed buffer is an error and leaves
    /// both caches untouched.
    pub fn process(&mut self, data: &[u8]) -> Result<Option<InboxEvent>> {
        let fields = match decode_frame(data)? {
            Some(fields) => fields,
            None => {
                // Peer stopped advertising either half of the handshake
                self.clear();
                return Ok(None);
            }
        };

        let (cache, other, template) = match fields.kind {
            FrameKind::Offer => (&mut self.last_offer, &mut self.last_answer, &self.offer_template),
            FrameKind::Answer => (&mut self.last_answer, &mut self.last_offer, &self.answer_template),
        };
        *other = None;

        if cache.as_deref() == Some(data) {
            debug!("Ignoring repeated {} frame", fields.kind);
            return Ok(None);
        }

        let descriptor = template.merge(&fields)?;
        *cache = Some(data.to_vec());
        info!("Received {} from {}:{}", fields.kind, fields.ip, fields.port);

        Ok(Some(InboxEvent {
            description: SessionDescription::from_descriptor(fields.kind, &descriptor),
            fields,
        }))
    }

    /// Last accepted frame of the given kind
    pub fn cached(&self, kind: FrameKind) -> Option<&[u8]> {
        match kind {
            FrameKind::Offer => self.last_offer.as_deref(),
            FrameKind::Answer => self.last_answer.as_deref(),
        }
    }

    pub fn clear(&mut self) {
        self.last_offer = None;
        self.last_answer = None;
    }
}
