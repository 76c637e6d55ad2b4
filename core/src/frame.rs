use crate::error::{Result, SignalingError};
use crate::{FINGERPRINT_LEN, FINGERPRINT_OFFSET, FRAME_HEADER_SIZE, FRAME_SIZE, MAX_CREDENTIALS_LEN};
use std::fmt;
use std::net::Ipv4Addr;

/// Which half of the handshake a frame carries, stored as the role byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Offer,
    Answer,
}

impl FrameKind {
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Offer => b'O',
            FrameKind::Answer => b'A',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'O' => Some(FrameKind::Offer),
            b'A' => Some(FrameKind::Answer),
            _ => None,
        }
    }

    /// SDP type string used by RTCSessionDescription
    pub fn sdp_type(self) -> &'static str {
        match self {
            FrameKind::Offer => "offer",
            FrameKind::Answer => "answer",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdp_type())
    }
}

/// Everything the acoustic channel carries about one session description
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameFields {
    pub kind: FrameKind,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub fingerprint: [u8; FINGERPRINT_LEN],
    pub ice_ufrag: String,
    pub ice_pwd: String,
}

impl FrameFields {
    /// Fingerprint hash in SDP notation (`AA:BB:...`)
    pub fn fingerprint_hash(&self) -> String {
        format_fingerprint(&self.fingerprint)
    }
}

/// Encoded signaling frame, immutable once built
#[derive(Clone, PartialEq, Eq)]
pub struct SignalingFrame([u8; FRAME_SIZE]);

impl SignalingFrame {
    /// Encode a frame from the raw SDP-level values
    pub fn encode(
        kind: FrameKind,
        local_ip: Ipv4Addr,
        port: u16,
        fingerprint_hash: &str,
        ice_ufrag: &str,
        ice_pwd: &str,
    ) -> Result<Self> {
        let fields = FrameFields {
            kind,
            ip: local_ip,
            port,
            fingerprint: parse_fingerprint(fingerprint_hash)?,
            ice_ufrag: ice_ufrag.to_string(),
            ice_pwd: ice_pwd.to_string(),
        };
        encode_frame(&fields)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// End offset of the credential string (byte 1)
    pub fn payload_len(&self) -> usize {
        self.0[1] as usize
    }

    pub fn decode(&self) -> Result<Option<FrameFields>> {
        decode_frame(&self.0)
    }
}

impl fmt::Debug for SignalingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingFrame")
            .field("role", &(self.0[0] as char))
            .field("len", &self.0[1])
            .finish()
    }
}

/// Pack frame fields at their fixed offsets
pub fn encode_frame(fields: &FrameFields) -> Result<SignalingFrame> {
    for (name, value) in [("ufrag", &fields.ice_ufrag), ("pwd", &fields.ice_pwd)] {
        if value.is_empty() {
            return Err(SignalingError::EncodingError(format!("ICE {} is empty", name)));
        }
        if !value.is_ascii() || value.contains(' ') {
            return Err(SignalingError::EncodingError(format!(
                "ICE {} must be ASCII without spaces",
                name
            )));
        }
    }

    let credentials = format!("{} {}", fields.ice_ufrag, fields.ice_pwd);
    if credentials.len() > MAX_CREDENTIALS_LEN {
        return Err(SignalingError::EncodingError(format!(
            "credentials are {} bytes, at most {} fit in a frame",
            credentials.len(),
            MAX_CREDENTIALS_LEN
        )));
    }

    let mut frame = [0u8; FRAME_SIZE];
    let end = FRAME_HEADER_SIZE + credentials.len();

    frame[0] = fields.kind.tag();
    frame[1] = end as u8;
    frame[2..6].copy_from_slice(&fields.ip.octets());

    // Port (2 bytes, big-endian)
    frame[6] = (fields.port >> 8) as u8;
    frame[7] = fields.port as u8;

    frame[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_LEN]
        .copy_from_slice(&fields.fingerprint);
    frame[FRAME_HEADER_SIZE..end].copy_from_slice(credentials.as_bytes());

    Ok(SignalingFrame(frame))
}

/// Unpack a received frame.
///
/// Returns `Ok(None)` when the role byte is neither `'O'` nor `'A'`, which
/// means the buffer holds no signaling payload. The role byte is checked
/// before anything else, so silence (all zeros) is never malformed.
pub fn decode_frame(data: &[u8]) -> Result<Option<FrameFields>> {
    let tag = *data
        .first()
        .ok_or_else(|| SignalingError::MalformedFrame("empty buffer".to_string()))?;
    let kind = match FrameKind::from_tag(tag) {
        Some(kind) => kind,
        None => return Ok(None),
    };

    if data.len() < FRAME_HEADER_SIZE {
        return Err(SignalingError::MalformedFrame(format!(
            "{} bytes is shorter than the {}-byte header",
            data.len(),
            FRAME_HEADER_SIZE
        )));
    }

    let end = data[1] as usize;
    if end < FRAME_HEADER_SIZE {
        return Err(SignalingError::MalformedFrame(format!(
            "length byte {} is inside the header",
            end
        )));
    }
    if end > data.len() {
        return Err(SignalingError::MalformedFrame(format!(
            "length byte {} exceeds buffer of {} bytes",
            end,
            data.len()
        )));
    }

    let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
    let port = ((data[6] as u16) << 8) | (data[7] as u16);

    let mut fingerprint = [0u8; FINGERPRINT_LEN];
    fingerprint.copy_from_slice(&data[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_LEN]);

    let credentials = &data[FRAME_HEADER_SIZE..end];
    if !credentials.is_ascii() {
        return Err(SignalingError::MalformedFrame(
            "credentials are not ASCII".to_string(),
        ));
    }
    // ASCII was checked above, so this cannot fail
    let credentials = String::from_utf8_lossy(credentials);

    let mut parts = credentials.split(' ');
    let (ice_ufrag, ice_pwd) = match (parts.next(), parts.next(), parts.next()) {
        (Some(ufrag), Some(pwd), None) => (ufrag.to_string(), pwd.to_string()),
        _ => {
            return Err(SignalingError::MalformedFrame(
                "credentials must be exactly \"<ufrag> <pwd>\"".to_string(),
            ))
        }
    };

    Ok(Some(FrameFields {
        kind,
        ip,
        port,
        fingerprint,
        ice_ufrag,
        ice_pwd,
    }))
}

/// Decode a colon-separated hex fingerprint into exactly 32 bytes
pub fn parse_fingerprint(hash: &str) -> Result<[u8; FINGERPRINT_LEN]> {
    let parts: Vec<&str> = hash.trim().split(':').collect();
    if parts.len() != FINGERPRINT_LEN {
        return Err(SignalingError::EncodingError(format!(
            "fingerprint has {} hex pairs, expected {}",
            parts.len(),
            FINGERPRINT_LEN
        )));
    }

    let mut bytes = [0u8; FINGERPRINT_LEN];
    for (byte, part) in bytes.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(SignalingError::EncodingError(format!(
                "invalid fingerprint pair {:?}",
                part
            )));
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| {
            SignalingError::EncodingError(format!("invalid fingerprint pair {:?}", part))
        })?;
    }
    Ok(bytes)
}

/// Upper-case colon-separated hex, the notation browsers emit
pub fn format_fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields(kind: FrameKind) -> FrameFields {
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        for (i, b) in fingerprint.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        FrameFields {
            kind,
            ip: Ipv4Addr::new(192, 168, 1, 5),
            port: 5400,
            fingerprint,
            ice_ufrag: "bc105aa9".to_string(),
            ice_pwd: "52f0a329e7fd93662f50828f617b408d".to_string(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&sample_fields(FrameKind::Offer)).unwrap();
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], b'O');
        assert_eq!(bytes[1] as usize, FRAME_HEADER_SIZE + 8 + 1 + 32);
        assert_eq!(&bytes[2..6], &[192, 168, 1, 5]);
        assert_eq!(bytes[6], 0x15);
        assert_eq!(bytes[7], 0x18);
        assert_eq!(bytes[8 + 1], 7);
        assert_eq!(&bytes[40..48], b"bc105aa9");
        assert_eq!(bytes[48], b' ');
        assert!(bytes[frame.payload_len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_encode_decode() {
        for kind in [FrameKind::Offer, FrameKind::Answer] {
            let fields = sample_fields(kind);
            let frame = encode_frame(&fields).unwrap();
            let decoded = decode_frame(frame.as_bytes()).unwrap().unwrap();
            assert_eq!(decoded, fields);
        }
    }

    #[test]
    fn test_encode_from_hash_string() {
        let hash = vec!["AA"; 32].join(":");
        let frame =
            SignalingFrame::encode(FrameKind::Answer, Ipv4Addr::LOCALHOST, 1, &hash, "u", "p")
                .unwrap();
        let decoded = frame.decode().unwrap().unwrap();
        assert_eq!(decoded.fingerprint, [0xAA; 32]);
        assert_eq!(decoded.fingerprint_hash(), hash);
    }

    #[test]
    fn test_credentials_too_long() {
        let mut fields = sample_fields(FrameKind::Offer);
        fields.ice_pwd = "x".repeat(MAX_CREDENTIALS_LEN - fields.ice_ufrag.len());

        match encode_frame(&fields) {
            Err(SignalingError::EncodingError(_)) => {} // Expected
            _ => panic!("Expected EncodingError for oversized credentials"),
        }

        // One byte shorter fits exactly
        fields.ice_pwd.pop();
        let frame = encode_frame(&fields).unwrap();
        assert_eq!(frame.payload_len(), u8::MAX as usize);
        assert_eq!(decode_frame(frame.as_bytes()).unwrap().unwrap(), fields);
    }

    #[test]
    fn test_credentials_with_space_rejected() {
        let mut fields = sample_fields(FrameKind::Offer);
        fields.ice_ufrag = "a b".to_string();
        assert!(matches!(
            encode_frame(&fields),
            Err(SignalingError::EncodingError(_))
        ));
    }

    #[test]
    fn test_bad_fingerprint_rejected() {
        let short = vec!["AA"; 31].join(":");
        assert!(matches!(
            SignalingFrame::encode(FrameKind::Offer, Ipv4Addr::LOCALHOST, 1, &short, "u", "p"),
            Err(SignalingError::EncodingError(_))
        ));

        let mut bad = vec!["AA"; 32];
        bad[3] = "ZZ";
        assert!(parse_fingerprint(&bad.join(":")).is_err());

        let mut long_pair = vec!["AA"; 32];
        long_pair[0] = "AAA";
        assert!(parse_fingerprint(&long_pair.join(":")).is_err());
    }

    #[test]
    fn test_short_buffer_rejected() {
        match decode_frame(&[b'O'; 39]) {
            Err(SignalingError::MalformedFrame(_)) => {} // Expected
            _ => panic!("Expected MalformedFrame for short buffer"),
        }
    }

    #[test]
    fn test_length_inside_header_rejected() {
        let mut frame = encode_frame(&sample_fields(FrameKind::Offer))
            .unwrap()
            .to_vec();
        frame[1] = 39;
        assert!(matches!(
            decode_frame(&frame),
            Err(SignalingError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_length_past_buffer_rejected() {
        let frame = encode_frame(&sample_fields(FrameKind::Offer)).unwrap();
        let truncated = &frame.as_bytes()[..60];
        assert!(matches!(
            decode_frame(truncated),
            Err(SignalingError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_missing_separator_rejected() {
        let mut frame = encode_frame(&sample_fields(FrameKind::Offer))
            .unwrap()
            .to_vec();
        frame[48] = b'x';
        assert!(matches!(
            decode_frame(&frame),
            Err(SignalingError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_role_is_not_an_error() {
        let mut frame = encode_frame(&sample_fields(FrameKind::Offer))
            .unwrap()
            .to_vec();
        frame[0] = b'X';
        assert_eq!(decode_frame(&frame).unwrap(), None);
    }

    #[test]
    fn test_silence_is_not_an_error() {
        assert_eq!(decode_frame(&[0u8; FRAME_SIZE]).unwrap(), None);
        // Role byte decides before the length checks
        assert_eq!(decode_frame(&[0u8; 2]).unwrap(), None);
        assert!(matches!(
            decode_frame(&[]),
            Err(SignalingError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_does_not_mutate_input() {
        let frame = encode_frame(&sample_fields(FrameKind::Answer)).unwrap();
        let before = frame.to_vec();
        let _ = decode_frame(&before).unwrap();
        assert_eq!(before, frame.to_vec());
    }

    #[test]
    fn test_format_fingerprint_pads_small_bytes() {
        assert_eq!(format_fingerprint(&[0x00, 0x0A, 0xFF]), "00:0A:FF");
    }
}
