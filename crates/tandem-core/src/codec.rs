//! Codec registry
//!
//! The codecs a factory can negotiate. Codec implementations themselves live
//! outside the engine; the registry only describes them for session
//! descriptions.

use serde::{Deserialize, Serialize};

use crate::types::MediaKind;

/// One negotiable codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fmtp: Option<String>,
}

impl CodecSpec {
    pub fn new(kind: MediaKind, payload_type: u8, name: &str, clock_rate: u32) -> Self {
        Self {
            kind,
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels: None,
            fmtp: None,
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.fmtp = Some(fmtp.to_string());
        self
    }

    pub fn vp8(payload_type: u8) -> Self {
        Self::new(MediaKind::Video, payload_type, "VP8", 90000)
    }

    pub fn vp9(payload_type: u8) -> Self {
        Self::new(MediaKind::Video, payload_type, "VP9", 90000).with_fmtp("profile-id=0")
    }

    pub fn h264(payload_type: u8) -> Self {
        Self::new(MediaKind::Video, payload_type, "H264", 90000).with_fmtp(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        )
    }

    pub fn opus(payload_type: u8) -> Self {
        Self::new(MediaKind::Audio, payload_type, "opus", 48000)
            .with_channels(2)
            .with_fmtp("minptime=10;useinbandfec=1")
    }

    /// `a=rtpmap` value: `<pt> <name>/<clock>[/<channels>]`
    pub fn rtpmap(&self) -> String {
        match self.channels {
            Some(ch) => format!(
                "{} {}/{}/{}",
                self.payload_type, self.name, self.clock_rate, ch
            ),
            None => format!("{} {}/{}", self.payload_type, self.name, self.clock_rate),
        }
    }

    /// Same codec regardless of payload type number
    pub fn matches(&self, other: &CodecSpec) -> bool {
        self.kind == other.kind
            && self.name.eq_ignore_ascii_case(&other.name)
            && self.clock_rate == other.clock_rate
    }
}

/// Immutable set of codecs shared by every connection of a factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecRegistry {
    codecs: Vec<CodecSpec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(vec![
            CodecSpec::vp8(96),
            CodecSpec::vp9(98),
            CodecSpec::h264(102),
            CodecSpec::opus(111),
        ])
    }
}

impl CodecRegistry {
    pub fn new(codecs: Vec<CodecSpec>) -> Self {
        Self { codecs }
    }

    /// Codecs of one kind, in preference order
    pub fn for_kind(&self, kind: MediaKind) -> impl Iterator<Item = &CodecSpec> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }

    pub fn supports(&self, codec: &CodecSpec) -> bool {
        self.codecs.iter().any(|c| c.matches(codec))
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }
}
