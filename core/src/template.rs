use crate::error::{Result, SignalingError};
use crate::frame::{format_fingerprint, parse_fingerprint, FrameFields, FrameKind};
use crate::sdp::{parse_sdp, write_sdp, Connection, Fingerprint, SessionDescriptor};
use crate::{NUM_TEMPLATE_CANDIDATES, TEMPLATE_BUNDLE, TEMPLATE_CANDIDATE_PRIORITY, TEMPLATE_PORT};
use log::debug;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

const TEMPLATE_NAME: &str = "-";
const TEMPLATE_USERNAME: &str = "-";
const TEMPLATE_SESSION_VERSION: &str = "0";
const TEMPLATE_LOCALHOST: &str = "0.0.0.0";
const PLACEHOLDER_FINGERPRINT: [u8; 32] = [0u8; 32];

/// Per-kind values baked into the canonical templates
struct TemplateConstants {
    session_id: &'static str,
    ufrag: &'static str,
    pwd: &'static str,
    setup: &'static str,
}

fn constants(kind: FrameKind) -> TemplateConstants {
    match kind {
        FrameKind::Offer => TemplateConstants {
            session_id: "1337",
            ufrag: "bc105aa9",
            pwd: "52f0a329e7fd93662f50828f617b408d",
            setup: "actpass",
        },
        FrameKind::Answer => TemplateConstants {
            session_id: "1338",
            ufrag: "c417de3e",
            pwd: "1aa0e1241c16687064c4fd31b8fc367a",
            setup: "active",
        },
    }
}

/// Canonical SDP text for one side of the handshake
pub fn template_text(kind: FrameKind) -> String {
    let c = constants(kind);
    let mut text = String::new();

    text.push_str("v=0\r\n");
    text.push_str(&format!(
        "o={} {} {} IN IP4 {}\r\n",
        TEMPLATE_USERNAME, c.session_id, TEMPLATE_SESSION_VERSION, TEMPLATE_LOCALHOST
    ));
    text.push_str(&format!("s={}\r\n", TEMPLATE_NAME));
    text.push_str("t=0 0\r\n");
    text.push_str("a=sendrecv\r\n");
    text.push_str(&format!(
        "a=fingerprint:sha-256 {}\r\n",
        format_fingerprint(&PLACEHOLDER_FINGERPRINT)
    ));
    text.push_str(&format!("a=group:BUNDLE {}\r\n", TEMPLATE_BUNDLE));
    text.push_str("a=ice-options:trickle\r\n");
    text.push_str("a=msid-semantic:WMS *\r\n");
    text.push_str(&format!("m=application {} DTLS/SCTP 5000\r\n", TEMPLATE_PORT));
    text.push_str(&format!("c=IN IP4 {}\r\n", TEMPLATE_LOCALHOST));
    for foundation in 0..NUM_TEMPLATE_CANDIDATES {
        text.push_str(&format!(
            "a=candidate:{} 1 UDP {} {} {} typ host\r\n",
            foundation, TEMPLATE_CANDIDATE_PRIORITY, TEMPLATE_LOCALHOST, TEMPLATE_PORT
        ));
    }
    text.push_str("a=sendrecv\r\n");
    text.push_str("a=end-of-candidates\r\n");
    text.push_str(&format!("a=ice-pwd:{}\r\n", c.pwd));
    text.push_str(&format!("a=ice-ufrag:{}\r\n", c.ufrag));
    text.push_str(&format!("a=mid:{}\r\n", TEMPLATE_BUNDLE));
    text.push_str("a=sctpmap:5000 webrtc-datachannel 256\r\n");
    text.push_str(&format!("a=setup:{}\r\n", c.setup));
    text.push_str("a=max-message-size:1073741823\r\n");

    text
}

/// Where a template keeps a field that may live at either SDP level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Session,
    Media,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateLayout {
    pub fingerprint: Placement,
    pub candidates: Placement,
}

impl TemplateLayout {
    fn resolve(sdp: &SessionDescriptor) -> Result<Self> {
        let media = sdp
            .media
            .first()
            .ok_or_else(|| SignalingError::InvalidTemplate("no media section".to_string()))?;

        let fingerprint = if sdp.fingerprint.is_some() {
            Placement::Session
        } else if media.fingerprint.is_some() {
            Placement::Media
        } else {
            return Err(SignalingError::InvalidTemplate("no fingerprint".to_string()));
        };

        let (candidates, count) = if !sdp.candidates.is_empty() {
            (Placement::Session, sdp.candidates.len())
        } else {
            (Placement::Media, media.candidates.len())
        };
        if count != NUM_TEMPLATE_CANDIDATES {
            return Err(SignalingError::InvalidTemplate(format!(
                "{} placeholder candidates, expected {}",
                count, NUM_TEMPLATE_CANDIDATES
            )));
        }

        Ok(Self {
            fingerprint,
            candidates,
        })
    }
}

/// A parsed template together with its resolved layout
#[derive(Clone, Debug)]
pub struct Template {
    kind: FrameKind,
    descriptor: SessionDescriptor,
    layout: TemplateLayout,
}

impl Template {
    /// Parse a template document and resolve where its fields live
    pub fn load(kind: FrameKind, text: &str) -> Result<Self> {
        let descriptor = parse_sdp(text)?;
        let layout = TemplateLayout::resolve(&descriptor)?;
        Ok(Self {
            kind,
            descriptor,
            layout,
        })
    }

    /// The canonical offer or answer template
    pub fn builtin(kind: FrameKind) -> Result<Self> {
        Self::shared(kind).cloned()
    }

    /// Builtin templates are parsed once per process
    fn shared(kind: FrameKind) -> Result<&'static Template> {
        static OFFER: OnceLock<Template> = OnceLock::new();
        static ANSWER: OnceLock<Template> = OnceLock::new();

        let cell = match kind {
            FrameKind::Offer => &OFFER,
            FrameKind::Answer => &ANSWER,
        };
        if let Some(template) = cell.get() {
            return Ok(template);
        }
        let template = Self::load(kind, &template_text(kind))?;
        Ok(cell.get_or_init(|| template))
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn layout(&self) -> TemplateLayout {
        self.layout
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Rebuild a full session description from the transmitted fields.
    ///
    /// Every placeholder candidate gets the single transmitted address; the
    /// frame carries no other candidates.
    pub fn merge(&self, fields: &FrameFields) -> Result<SessionDescriptor> {
        if fields.kind != self.kind {
            return Err(SignalingError::InvalidTemplate(format!(
                "{} frame merged into {} template",
                fields.kind, self.kind
            )));
        }

        let c = constants(self.kind);
        let ip = fields.ip.to_string();
        let hash = fields.fingerprint_hash();
        let mut sdp = self.descriptor.clone();

        sdp.origin.username = TEMPLATE_USERNAME.to_string();
        sdp.origin.session_id = c.session_id.to_string();

        match self.layout.fingerprint {
            Placement::Session => set_hash(&mut sdp.fingerprint, hash),
            Placement::Media => set_hash(&mut sdp.media[0].fingerprint, hash),
        }

        let candidates = match self.layout.candidates {
            Placement::Session => &mut sdp.candidates,
            Placement::Media => &mut sdp.media[0].candidates,
        };
        for candidate in candidates.iter_mut() {
            candidate.ip = ip.clone();
            candidate.port = fields.port;
            candidate.priority = TEMPLATE_CANDIDATE_PRIORITY;
        }

        let media = &mut sdp.media[0];
        media.ice_ufrag = Some(fields.ice_ufrag.clone());
        media.ice_pwd = Some(fields.ice_pwd.clone());
        media.port = fields.port;
        media.connection = Some(Connection { version: 4, ip });

        debug!(
            "Merged {} frame from {}:{} into template",
            fields.kind, fields.ip, fields.port
        );
        Ok(sdp)
    }
}

fn set_hash(slot: &mut Option<Fingerprint>, hash: String) {
    slot.get_or_insert_with(|| Fingerprint {
        hash_type: "sha-256".to_string(),
        hash: String::new(),
    })
    .hash = hash;
}

/// Rebuild the session description a received frame stands for
pub fn merge_frame_into_template(fields: &FrameFields) -> Result<SessionDescriptor> {
    Template::shared(fields.kind)?.merge(fields)
}

/// Pull the frame fields out of a locally generated session description.
///
/// The port comes from the candidate whose address is `local_ip`. A
/// description with no such candidate is rejected rather than sending a
/// port that belongs to another interface.
pub fn extract_frame_fields(
    sdp: &SessionDescriptor,
    kind: FrameKind,
    local_ip: Ipv4Addr,
) -> Result<FrameFields> {
    let media = sdp
        .media
        .first()
        .ok_or_else(|| SignalingError::Sdp("no media section".to_string()))?;

    let port = sdp
        .all_candidates()
        .find(|c| c.ip.parse::<Ipv4Addr>().ok() == Some(local_ip))
        .map(|c| c.port)
        .ok_or(SignalingError::MissingCandidate(local_ip))?;

    let fingerprint = sdp
        .fingerprint
        .as_ref()
        .or(media.fingerprint.as_ref())
        .ok_or_else(|| SignalingError::Sdp("no fingerprint".to_string()))?;

    let ice_ufrag = media
        .ice_ufrag
        .clone()
        .ok_or_else(|| SignalingError::Sdp("no ice-ufrag".to_string()))?;
    let ice_pwd = media
        .ice_pwd
        .clone()
        .ok_or_else(|| SignalingError::Sdp("no ice-pwd".to_string()))?;

    Ok(FrameFields {
        kind,
        ip: local_ip,
        port,
        fingerprint: parse_fingerprint(&fingerprint.hash)?,
        ice_ufrag,
        ice_pwd,
    })
}

/// Rewrite a freshly created local offer/answer so its session identity
/// matches the template the remote side will rebuild it from.
pub fn localize_description(sdp: &mut SessionDescriptor, kind: FrameKind, local_ip: Ipv4Addr) {
    let c = constants(kind);

    sdp.name = TEMPLATE_NAME.to_string();
    sdp.origin.username = TEMPLATE_USERNAME.to_string();
    sdp.origin.session_id = c.session_id.to_string();
    sdp.origin.session_version = TEMPLATE_SESSION_VERSION.to_string();
    if let Some(group) = sdp.groups.first_mut() {
        group.mids = vec![TEMPLATE_BUNDLE.to_string()];
    }
    if let Some(media) = sdp.media.first_mut() {
        media.mid = Some(TEMPLATE_BUNDLE.to_string());
        media.connection = Some(Connection {
            version: 4,
            ip: local_ip.to_string(),
        });
    }
}

/// A session description as handed to the WebRTC binding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: FrameKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn from_descriptor(kind: FrameKind, descriptor: &SessionDescriptor) -> Self {
        Self {
            kind,
            sdp: write_sdp(descriptor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::Candidate;

    fn fields(kind: FrameKind) -> FrameFields {
        FrameFields {
            kind,
            ip: Ipv4Addr::new(10, 0, 0, 7),
            port: 61000,
            fingerprint: [0xAB; 32],
            ice_ufrag: "ufrag".to_string(),
            ice_pwd: "password".to_string(),
        }
    }

    #[test]
    fn test_builtin_templates_use_session_fingerprint() {
        for kind in [FrameKind::Offer, FrameKind::Answer] {
            let template = Template::builtin(kind).unwrap();
            assert_eq!(
                template.layout(),
                TemplateLayout {
                    fingerprint: Placement::Session,
                    candidates: Placement::Media,
                }
            );
            assert_eq!(template.descriptor().media[0].candidates.len(), 5);
        }
    }

    #[test]
    fn test_cached_template_matches_fresh_parse() {
        for kind in [FrameKind::Offer, FrameKind::Answer] {
            let fresh = Template::load(kind, &template_text(kind)).unwrap();
            assert_eq!(Template::builtin(kind).unwrap().descriptor(), fresh.descriptor());
            assert_eq!(Template::builtin(kind).unwrap().layout(), fresh.layout());

            let fields = fields(kind);
            let merged = merge_frame_into_template(&fields).unwrap();
            assert_eq!(merged, fresh.merge(&fields).unwrap());
            // A merge must not leak into the cached copy
            assert_eq!(Template::builtin(kind).unwrap().descriptor(), fresh.descriptor());
        }
    }

    #[test]
    fn test_merge_overwrites_every_candidate() {
        let sdp = merge_frame_into_template(&fields(FrameKind::Answer)).unwrap();
        let reparsed = parse_sdp(&write_sdp(&sdp)).unwrap();

        let media = &reparsed.media[0];
        assert_eq!(media.candidates.len(), 5);
        for candidate in &media.candidates {
            assert_eq!(candidate.ip, "10.0.0.7");
            assert_eq!(candidate.port, 61000);
            assert_eq!(candidate.priority, TEMPLATE_CANDIDATE_PRIORITY);
        }
        assert_eq!(media.port, 61000);
        assert_eq!(media.ice_pwd.as_deref(), Some("password"));
        assert_eq!(reparsed.origin.session_id, "1338");
        assert_eq!(
            reparsed.fingerprint.unwrap().hash,
            vec!["AB"; 32].join(":")
        );
        assert!(write_sdp(&sdp).contains("a=setup:active"));
    }

    #[test]
    fn test_merge_media_level_template() {
        let text = template_text(FrameKind::Offer).replace(
            "a=fingerprint:sha-256",
            "a=x-moved:sha-256",
        );
        let text = text.replace(
            "a=mid:sdparta_0\r\n",
            &format!(
                "a=mid:sdparta_0\r\na=fingerprint:sha-256 {}\r\n",
                format_fingerprint(&[0u8; 32])
            ),
        );
        let template = Template::load(FrameKind::Offer, &text).unwrap();
        assert_eq!(template.layout().fingerprint, Placement::Media);

        let sdp = template.merge(&fields(FrameKind::Offer)).unwrap();
        assert!(sdp.fingerprint.is_none());
        assert_eq!(
            sdp.media[0].fingerprint.as_ref().unwrap().hash,
            vec!["AB"; 32].join(":")
        );
    }

    #[test]
    fn test_merge_session_level_candidates() {
        let mut descriptor = parse_sdp(&template_text(FrameKind::Offer)).unwrap();
        descriptor.candidates = std::mem::take(&mut descriptor.media[0].candidates);
        let template = Template::load(FrameKind::Offer, &write_sdp(&descriptor)).unwrap();
        assert_eq!(template.layout().candidates, Placement::Session);

        let sdp = template.merge(&fields(FrameKind::Offer)).unwrap();
        assert_eq!(sdp.candidates.len(), 5);
        assert!(sdp.candidates.iter().all(|c| c.ip == "10.0.0.7" && c.port == 61000));
    }

    #[test]
    fn test_template_with_wrong_candidate_count_rejected() {
        let text = template_text(FrameKind::Offer)
            .replace("a=candidate:4 1 UDP 2122252543 0.0.0.0 5400 typ host\r\n", "");
        assert!(matches!(
            Template::load(FrameKind::Offer, &text),
            Err(SignalingError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_merge_rejects_kind_mismatch() {
        let template = Template::builtin(FrameKind::Offer).unwrap();
        assert!(template.merge(&fields(FrameKind::Answer)).is_err());
    }

    fn local_sdp() -> SessionDescriptor {
        let mut sdp = parse_sdp(&template_text(FrameKind::Offer)).unwrap();
        sdp.fingerprint.as_mut().unwrap().hash = vec!["1F"; 32].join(":");
        sdp.media[0].candidates = vec![
            Candidate {
                foundation: "1".to_string(),
                component: 1,
                transport: "UDP".to_string(),
                priority: 1,
                ip: "172.17.0.1".to_string(),
                port: 40000,
                typ: "host".to_string(),
                extra: Vec::new(),
            },
            Candidate {
                foundation: "2".to_string(),
                component: 1,
                transport: "UDP".to_string(),
                priority: 1,
                ip: "192.168.1.5".to_string(),
                port: 40001,
                typ: "host".to_string(),
                extra: Vec::new(),
            },
        ];
        sdp
    }

    #[test]
    fn test_extract_picks_matching_candidate() {
        let fields =
            extract_frame_fields(&local_sdp(), FrameKind::Offer, Ipv4Addr::new(192, 168, 1, 5))
                .unwrap();
        assert_eq!(fields.port, 40001);
        assert_eq!(fields.fingerprint, [0x1F; 32]);
        assert_eq!(fields.ice_ufrag, "bc105aa9");
    }

    #[test]
    fn test_extract_without_matching_candidate_fails() {
        let ip = Ipv4Addr::new(10, 1, 1, 1);
        match extract_frame_fields(&local_sdp(), FrameKind::Offer, ip) {
            Err(SignalingError::MissingCandidate(missing)) => assert_eq!(missing, ip),
            other => panic!("Expected MissingCandidate, got {:?}", other),
        }
    }

    #[test]
    fn test_localize_description() {
        let mut sdp = local_sdp();
        sdp.name = "browser".to_string();
        sdp.origin.session_id = "99".to_string();
        sdp.groups[0].mids = vec!["0".to_string()];
        sdp.media[0].mid = Some("0".to_string());

        localize_description(&mut sdp, FrameKind::Answer, Ipv4Addr::new(192, 168, 1, 5));

        assert_eq!(sdp.name, "-");
        assert_eq!(sdp.origin.session_id, "1338");
        assert_eq!(sdp.groups[0].mids, vec![TEMPLATE_BUNDLE]);
        assert_eq!(sdp.media[0].mid.as_deref(), Some(TEMPLATE_BUNDLE));
        assert_eq!(sdp.media[0].connection.as_ref().unwrap().ip, "192.168.1.5");
    }
}
