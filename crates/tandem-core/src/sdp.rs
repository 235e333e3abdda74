//! Session descriptions
//!
//! [`SessionDescription`] is the immutable (type, text) pair exchanged between
//! peers. [`parse`] validates the structure of a description and extracts what
//! the engine needs from it; [`DescriptionBuilder`] writes the descriptions this
//! engine produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

use crate::candidate::IceCandidate;
use crate::codec::CodecSpec;
use crate::error::{Error, Result};
use crate::types::{MediaKind, TransceiverDirection};

const LINE_END: &str = "\r\n";

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            other => Err(Error::malformed(format!(
                "unsupported description type '{}'",
                other
            ))),
        }
    }
}

/// Immutable session description value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    sdp_type: SdpType,
    sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn into_sdp(self) -> String {
        self.sdp
    }

    /// Validate and parse the text for the declared type
    pub fn parse(&self) -> Result<ParsedDescription> {
        parse(&self.sdp, self.sdp_type)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sdp)
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    /// Media token of the `m=` line (`video`, `audio`, `application`, ...)
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub mid: Option<String>,
    pub direction: TransceiverDirection,
    pub codecs: Vec<CodecSpec>,
    pub setup: Option<String>,
}

impl MediaSection {
    pub fn kind(&self) -> Option<MediaKind> {
        self.media.parse().ok()
    }
}

/// What the engine reads out of a description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescription {
    pub session_id: String,
    pub session_version: u64,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub media: Vec<MediaSection>,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
}

impl ParsedDescription {
    pub fn section(&self, kind: MediaKind) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind() == Some(kind))
    }
}

/// Structurally validate `text` as a description of type `sdp_type`.
pub fn parse(text: &str, sdp_type: SdpType) -> Result<ParsedDescription> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return Err(Error::malformed("empty description"));
    }
    if lines[0] != "v=0" {
        return Err(Error::malformed(format!(
            "first line must be 'v=0', got '{}'",
            lines[0]
        )));
    }

    let mut origin: Option<(String, u64)> = None;
    let mut has_session_name = false;
    let mut has_timing = false;
    let mut session_ufrag = None;
    let mut session_pwd = None;
    let mut media: Vec<MediaSection> = Vec::new();
    let mut media_ufrag = None;
    let mut media_pwd = None;
    let mut candidates = Vec::new();
    let mut end_of_candidates = false;

    for line in &lines {
        let bytes = line.as_bytes();
        if bytes.len() < 2 || bytes[1] != b'=' || !bytes[0].is_ascii_lowercase() {
            return Err(Error::malformed(format!("bad line '{}'", line)));
        }
        let (key, value) = (bytes[0], &line[2..]);

        match key {
            b'o' => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.len() != 6 {
                    return Err(Error::malformed(format!("bad origin '{}'", line)));
                }
                let version = fields[2]
                    .parse::<u64>()
                    .map_err(|_| Error::malformed(format!("bad session version '{}'", line)))?;
                origin = Some((fields[1].to_string(), version));
            }
            b's' => has_session_name = true,
            b't' => has_timing = true,
            b'm' => {
                if origin.is_none() || !has_session_name || !has_timing {
                    return Err(Error::malformed(
                        "o=, s= and t= must precede the first media section",
                    ));
                }
                media.push(parse_media_line(line, value)?);
            }
            b'a' => {
                let (name, attr) = match value.split_once(':') {
                    Some((n, v)) => (n, Some(v)),
                    None => (value, None),
                };
                let current = media.last_mut();
                match (name, attr) {
                    ("ice-ufrag", Some(v)) => match current {
                        Some(_) => media_ufrag = media_ufrag.or(Some(v.to_string())),
                        None => session_ufrag = Some(v.to_string()),
                    },
                    ("ice-pwd", Some(v)) => match current {
                        Some(_) => media_pwd = media_pwd.or(Some(v.to_string())),
                        None => session_pwd = Some(v.to_string()),
                    },
                    ("candidate", Some(_)) => {
                        if let Some(reason) = unusable_candidate(value) {
                            debug!("Skipping {} candidate '{}'", reason, value);
                            continue;
                        }
                        let c = IceCandidate::parse(value)?;
                        if !candidates.contains(&c) {
                            candidates.push(c);
                        }
                    }
                    ("end-of-candidates", None) => end_of_candidates = true,
                    ("mid", Some(v)) => {
                        if let Some(m) = current {
                            m.mid = Some(v.to_string());
                        }
                    }
                    ("setup", Some(v)) => {
                        if let Some(m) = current {
                            m.setup = Some(v.to_string());
                        }
                    }
                    ("rtpmap", Some(v)) => {
                        if let Some(m) = current {
                            let codec = parse_rtpmap(m, v)?;
                            m.codecs.push(codec);
                        }
                    }
                    ("fmtp", Some(v)) => {
                        if let Some(m) = current {
                            if let Some((pt, params)) = v.split_once(' ') {
                                if let Ok(pt) = pt.parse::<u8>() {
                                    let codec = m.codecs.iter_mut().find(|c| c.payload_type == pt);
                                    if let Some(c) = codec {
                                        c.fmtp = Some(params.to_string());
                                    }
                                }
                            }
                        }
                    }
                    (dir, None) => {
                        if let (Some(m), Some(d)) = (current, TransceiverDirection::parse(dir)) {
                            m.direction = d;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let (session_id, session_version) =
        origin.ok_or_else(|| Error::malformed("missing origin line"))?;
    if !has_session_name {
        return Err(Error::malformed("missing session name line"));
    }
    if !has_timing {
        return Err(Error::malformed("missing timing line"));
    }
    if media.is_empty() {
        return Err(Error::malformed("no media sections"));
    }

    if sdp_type == SdpType::Answer {
        if let Some(m) = media.iter().find(|m| m.setup.as_deref() == Some("actpass")) {
            return Err(Error::malformed(format!(
                "answer must choose an active or passive setup role (section '{}')",
                m.mid.as_deref().unwrap_or(&m.media)
            )));
        }
    }

    Ok(ParsedDescription {
        session_id,
        session_version,
        ice_ufrag: session_ufrag.or(media_ufrag),
        ice_pwd: session_pwd.or(media_pwd),
        media,
        candidates,
        end_of_candidates,
    })
}

fn parse_media_line(line: &str, value: &str) -> Result<MediaSection> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::malformed(format!("bad media line '{}'", line)));
    }
    let port_field = fields[1].split('/').next().unwrap_or(fields[1]);
    let port = port_field
        .parse::<u16>()
        .map_err(|_| Error::malformed(format!("bad media port '{}'", line)))?;

    Ok(MediaSection {
        media: fields[0].to_string(),
        port,
        protocol: fields[2].to_string(),
        mid: None,
        direction: TransceiverDirection::SendRecv,
        codecs: Vec::new(),
        setup: None,
    })
}

fn parse_rtpmap(section: &MediaSection, value: &str) -> Result<CodecSpec> {
    let bad = || Error::malformed(format!("bad rtpmap '{}'", value));
    let (pt, encoding) = value.split_once(' ').ok_or_else(bad)?;
    let payload_type = pt.parse::<u8>().map_err(|_| bad())?;
    let mut parts = encoding.split('/');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
    let clock_rate = parts
        .next()
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(bad)?;
    let channels = parts.next().and_then(|c| c.parse::<u8>().ok());

    // Codecs of non-audio/video sections still need a kind; they are never
    // matched against the registry.
    let kind = section.kind().unwrap_or(MediaKind::Video);
    let mut codec = CodecSpec::new(kind, payload_type, name, clock_rate);
    codec.channels = channels;
    Ok(codec)
}

/// A media section to be written by [`DescriptionBuilder`]
#[derive(Debug, Clone)]
pub struct MediaLine {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: TransceiverDirection,
    pub codecs: Vec<CodecSpec>,
}

/// Writes descriptions in the shape browsers and WHEP servers expect
#[derive(Debug, Clone)]
pub struct DescriptionBuilder {
    sdp_type: SdpType,
    session_id: u64,
    session_version: u64,
    ice_ufrag: String,
    ice_pwd: String,
    media: Vec<MediaLine>,
    candidates: Vec<IceCandidate>,
    gathering_complete: bool,
}

impl DescriptionBuilder {
    pub fn new(sdp_type: SdpType, session_id: u64, ice_ufrag: &str, ice_pwd: &str) -> Self {
        Self {
            sdp_type,
            session_id,
            session_version: 2,
            ice_ufrag: ice_ufrag.to_string(),
            ice_pwd: ice_pwd.to_string(),
            media: Vec::new(),
            candidates: Vec::new(),
            gathering_complete: false,
        }
    }

    pub fn session_version(mut self, version: u64) -> Self {
        self.session_version = version;
        self
    }

    pub fn media(mut self, line: MediaLine) -> Self {
        self.media.push(line);
        self
    }

    pub fn candidates(mut self, candidates: &[IceCandidate], complete: bool) -> Self {
        self.candidates = candidates.to_vec();
        self.gathering_complete = complete;
        self
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        let mut push = |line: String| {
            out.push_str(&line);
            out.push_str(LINE_END);
        };

        push("v=0".into());
        push(format!(
            "o=- {} {} IN IP4 127.0.0.1",
            self.session_id, self.session_version
        ));
        push("s=-".into());
        push("t=0 0".into());
        if !self.media.is_empty() {
            let mids: Vec<&str> = self.media.iter().map(|m| m.mid.as_str()).collect();
            push(format!("a=group:BUNDLE {}", mids.join(" ")));
        }
        push("a=msid-semantic: WMS".into());

        let setup = match self.sdp_type {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };

        for line in &self.media {
            let formats: Vec<String> = line
                .codecs
                .iter()
                .map(|c| c.payload_type.to_string())
                .collect();
            push(format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}",
                line.kind,
                formats.join(" ")
            ));
            push("c=IN IP4 0.0.0.0".into());
            push("a=rtcp:9 IN IP4 0.0.0.0".into());
            push(format!("a=ice-ufrag:{}", self.ice_ufrag));
            push(format!("a=ice-pwd:{}", self.ice_pwd));
            push(format!("a=setup:{}", setup));
            push(format!("a=mid:{}", line.mid));
            push(format!("a={}", line.direction));
            push("a=rtcp-mux".into());
            for codec in &line.codecs {
                push(format!("a=rtpmap:{}", codec.rtpmap()));
                if let Some(fmtp) = &codec.fmtp {
                    push(format!("a=fmtp:{} {}", codec.payload_type, fmtp));
                }
            }
            for candidate in &self.candidates {
                push(candidate.to_sdp_line());
            }
            if self.gathering_complete {
                push("a=end-of-candidates".into());
            }
        }

        out
    }
}

/// Rewrite `sdp` so that every media section lists exactly `candidates`,
/// followed by `a=end-of-candidates` when `complete`.
pub fn with_candidates(sdp: &str, candidates: &[IceCandidate], complete: bool) -> String {
    let mut out = String::with_capacity(sdp.len() + candidates.len() * 80);
    let mut in_media = false;

    let flush = |out: &mut String| {
        for c in candidates {
            out.push_str(&c.to_sdp_line());
            out.push_str(LINE_END);
        }
        if complete {
            out.push_str("a=end-of-candidates");
            out.push_str(LINE_END);
        }
    };

    for line in sdp.split('\n').map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("a=candidate:") || line == "a=end-of-candidates" {
            continue;
        }
        if line.starts_with("m=") {
            if in_media {
                flush(&mut out);
            }
            in_media = true;
        }
        out.push_str(line);
        out.push_str(LINE_END);
    }
    if in_media {
        flush(&mut out);
    }
    out
}

/// Candidates that are well formed but cannot be used here: TCP ones, and
/// host candidates hidden behind a hostname (mDNS `<uuid>.local`) that this
/// engine does not resolve.
fn unusable_candidate(value: &str) -> Option<&'static str> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    if fields[2].eq_ignore_ascii_case("tcp") {
        return Some("tcp");
    }
    let address = fields[4];
    let hostname = address.parse::<IpAddr>().is_err()
        && address.bytes().any(|b| b.is_ascii_alphabetic())
        && address
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    hostname.then_some("hostname")
}
