//! Minimal SDP text codec
//!
//! Parses only what the signaling protocol rewrites (origin, name,
//! connection, groups, fingerprint, ICE credentials, mid, candidates).
//! Every other line is kept verbatim so a parsed description writes back
//! to an equivalent document.

use crate::error::{Result, SignalingError};
use std::fmt::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub version: u8,
    pub ip: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash_type: String,
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub semantics: String,
    pub mids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u32,
    pub transport: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub typ: String,
    /// Trailing `key value` tokens (raddr, rport, generation, ...)
    pub extra: Vec<String>,
}

/// Any `a=` line the codec does not interpret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Media {
    pub kind: String,
    pub port: u16,
    pub protocol: String,
    pub formats: String,
    pub connection: Option<Connection>,
    pub mid: Option<String>,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub candidates: Vec<Candidate>,
    pub attributes: Vec<Attribute>,
    /// Non-attribute lines such as `b=`, kept in order
    pub other_lines: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub version: u32,
    pub origin: Origin,
    pub name: String,
    pub connection: Option<Connection>,
    pub timing: String,
    pub groups: Vec<Group>,
    pub fingerprint: Option<Fingerprint>,
    pub candidates: Vec<Candidate>,
    pub attributes: Vec<Attribute>,
    pub other_lines: Vec<String>,
    pub media: Vec<Media>,
}

impl SessionDescriptor {
    /// All candidates in document order, session level first
    pub fn all_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .chain(self.media.iter().flat_map(|m| m.candidates.iter()))
    }
}

impl Candidate {
    fn parse(value: &str) -> Result<Self> {
        let tokens: Vec<&str> = value.split_whitespace().collect();
        if tokens.len() < 8 || tokens[6] != "typ" {
            return Err(SignalingError::Sdp(format!("invalid candidate {:?}", value)));
        }
        Ok(Self {
            foundation: tokens[0].to_string(),
            component: parse_number(tokens[1], "candidate component")?,
            transport: tokens[2].to_string(),
            priority: parse_number(tokens[3], "candidate priority")?,
            ip: tokens[4].to_string(),
            port: parse_number(tokens[5], "candidate port")?,
            typ: tokens[7].to_string(),
            extra: tokens[8..].iter().map(|t| t.to_string()).collect(),
        })
    }

    fn write(&self, out: &mut String) {
        let _ = write!(
            out,
            "a=candidate:{} {} {} {} {} {} typ {}",
            self.foundation, self.component, self.transport, self.priority, self.ip, self.port, self.typ
        );
        for token in &self.extra {
            out.push(' ');
            out.push_str(token);
        }
        out.push_str("\r\n");
    }
}

fn parse_number<T: std::str::FromStr>(token: &str, what: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| SignalingError::Sdp(format!("invalid {} {:?}", what, token)))
}

fn parse_connection(value: &str) -> Result<Connection> {
    // c=IN IP4 0.0.0.0
    let tokens: Vec<&str> = value.split_whitespace().collect();
    match tokens.as_slice() {
        ["IN", addr_type, ip, ..] => {
            let version = match *addr_type {
                "IP4" => 4,
                "IP6" => 6,
                other => return Err(SignalingError::Sdp(format!("unknown address type {}", other))),
            };
            // Multicast TTL suffixes are irrelevant for data channels
            let ip = ip.split('/').next().unwrap_or_default().to_string();
            Ok(Connection { version, ip })
        }
        _ => Err(SignalingError::Sdp(format!("invalid connection {:?}", value))),
    }
}

fn parse_fingerprint_attr(value: &str) -> Result<Fingerprint> {
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(hash_type), Some(hash)) if !hash.trim().is_empty() => Ok(Fingerprint {
            hash_type: hash_type.to_string(),
            hash: hash.trim().to_string(),
        }),
        _ => Err(SignalingError::Sdp(format!("invalid fingerprint {:?}", value))),
    }
}

fn split_attribute(line: &str) -> (&str, Option<&str>) {
    match line.split_once(':') {
        Some((name, value)) => (name, Some(value)),
        None => (line, None),
    }
}

/// Parse SDP text into a descriptor
pub fn parse_sdp(text: &str) -> Result<SessionDescriptor> {
    let mut version = None;
    let mut origin = None;
    let mut name = None;
    let mut connection = None;
    let mut timing = None;
    let mut groups = Vec::new();
    let mut fingerprint = None;
    let mut candidates = Vec::new();
    let mut attributes = Vec::new();
    let mut other_lines = Vec::new();
    let mut media: Vec<Media> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (kind, value) = line
            .split_once('=')
            .ok_or_else(|| SignalingError::Sdp(format!("invalid line {:?}", line)))?;

        if kind == "m" {
            let tokens: Vec<&str> = value.splitn(4, ' ').collect();
            if tokens.len() < 3 {
                return Err(SignalingError::Sdp(format!("invalid media line {:?}", value)));
            }
            media.push(Media {
                kind: tokens[0].to_string(),
                port: parse_number(tokens[1], "media port")?,
                protocol: tokens[2].to_string(),
                formats: tokens.get(3).unwrap_or(&"").to_string(),
                connection: None,
                mid: None,
                ice_ufrag: None,
                ice_pwd: None,
                fingerprint: None,
                candidates: Vec::new(),
                attributes: Vec::new(),
                other_lines: Vec::new(),
            });
            continue;
        }

        if let Some(m) = media.last_mut() {
            match kind {
                "c" => m.connection = Some(parse_connection(value)?),
                "a" => {
                    let (attr, attr_value) = split_attribute(value);
                    match (attr, attr_value) {
                        ("candidate", Some(v)) => m.candidates.push(Candidate::parse(v)?),
                        ("fingerprint", Some(v)) => m.fingerprint = Some(parse_fingerprint_attr(v)?),
                        ("ice-ufrag", Some(v)) => m.ice_ufrag = Some(v.to_string()),
                        ("ice-pwd", Some(v)) => m.ice_pwd = Some(v.to_string()),
                        ("mid", Some(v)) => m.mid = Some(v.to_string()),
                        _ => m.attributes.push(Attribute {
                            name: attr.to_string(),
                            value: attr_value.map(str::to_string),
                        }),
                    }
                }
                _ => m.other_lines.push(line.to_string()),
            }
            continue;
        }

        match kind {
            "v" => version = Some(parse_number(value, "version")?),
            "o" => {
                let tokens: Vec<&str> = value.split_whitespace().collect();
                if tokens.len() != 6 {
                    return Err(SignalingError::Sdp(format!("invalid origin {:?}", value)));
                }
                origin = Some(Origin {
                    username: tokens[0].to_string(),
                    session_id: tokens[1].to_string(),
                    session_version: tokens[2].to_string(),
                    net_type: tokens[3].to_string(),
                    addr_type: tokens[4].to_string(),
                    address: tokens[5].to_string(),
                });
            }
            "s" => name = Some(value.to_string()),
            "c" => connection = Some(parse_connection(value)?),
            "t" => timing = Some(value.to_string()),
            "a" => {
                let (attr, attr_value) = split_attribute(value);
                match (attr, attr_value) {
                    ("candidate", Some(v)) => candidates.push(Candidate::parse(v)?),
                    ("fingerprint", Some(v)) => fingerprint = Some(parse_fingerprint_attr(v)?),
                    ("group", Some(v)) => {
                        let mut tokens = v.split_whitespace();
                        let semantics = tokens.next().unwrap_or_default().to_string();
                        groups.push(Group {
                            semantics,
                            mids: tokens.map(str::to_string).collect(),
                        });
                    }
                    _ => attributes.push(Attribute {
                        name: attr.to_string(),
                        value: attr_value.map(str::to_string),
                    }),
                }
            }
            _ => other_lines.push(line.to_string()),
        }
    }

    Ok(SessionDescriptor {
        version: version.ok_or_else(|| SignalingError::Sdp("missing v= line".to_string()))?,
        origin: origin.ok_or_else(|| SignalingError::Sdp("missing o= line".to_string()))?,
        name: name.ok_or_else(|| SignalingError::Sdp("missing s= line".to_string()))?,
        connection,
        timing: timing.unwrap_or_else(|| "0 0".to_string()),
        groups,
        fingerprint,
        candidates,
        attributes,
        other_lines,
        media,
    })
}

fn write_connection(out: &mut String, connection: &Connection) {
    let _ = write!(out, "c=IN IP{} {}\r\n", connection.version, connection.ip);
}

fn write_attribute(out: &mut String, attribute: &Attribute) {
    match &attribute.value {
        Some(value) => {
            let _ = write!(out, "a={}:{}\r\n", attribute.name, value);
        }
        None => {
            let _ = write!(out, "a={}\r\n", attribute.name);
        }
    }
}

fn write_fingerprint(out: &mut String, fingerprint: &Fingerprint) {
    let _ = write!(out, "a=fingerprint:{} {}\r\n", fingerprint.hash_type, fingerprint.hash);
}

/// Serialize a descriptor to SDP text with CRLF line endings
pub fn write_sdp(sdp: &SessionDescriptor) -> String {
    let mut out = String::new();
    let o = &sdp.origin;

    let _ = write!(out, "v={}\r\n", sdp.version);
    let _ = write!(
        out,
        "o={} {} {} {} {} {}\r\n",
        o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.address
    );
    let _ = write!(out, "s={}\r\n", sdp.name);
    if let Some(connection) = &sdp.connection {
        write_connection(&mut out, connection);
    }
    let _ = write!(out, "t={}\r\n", sdp.timing);
    for line in &sdp.other_lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    if let Some(fingerprint) = &sdp.fingerprint {
        write_fingerprint(&mut out, fingerprint);
    }
    for group in &sdp.groups {
        let _ = write!(out, "a=group:{} {}\r\n", group.semantics, group.mids.join(" "));
    }
    for attribute in &sdp.attributes {
        write_attribute(&mut out, attribute);
    }
    for candidate in &sdp.candidates {
        candidate.write(&mut out);
    }

    for m in &sdp.media {
        let _ = write!(out, "m={} {} {}", m.kind, m.port, m.protocol);
        if !m.formats.is_empty() {
            out.push(' ');
            out.push_str(&m.formats);
        }
        out.push_str("\r\n");
        if let Some(connection) = &m.connection {
            write_connection(&mut out, connection);
        }
        for line in &m.other_lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        for candidate in &m.candidates {
            candidate.write(&mut out);
        }
        if let Some(pwd) = &m.ice_pwd {
            let _ = write!(out, "a=ice-pwd:{}\r\n", pwd);
        }
        if let Some(ufrag) = &m.ice_ufrag {
            let _ = write!(out, "a=ice-ufrag:{}\r\n", ufrag);
        }
        if let Some(fingerprint) = &m.fingerprint {
            write_fingerprint(&mut out, fingerprint);
        }
        if let Some(mid) = &m.mid {
            let _ = write!(out, "a=mid:{}\r\n", mid);
        }
        for attribute in &m.attributes {
            write_attribute(&mut out, attribute);
        }
    }

    out
}
