//! Shared value types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::DEFAULT_STUN_PORT;

/// Identity of one peer connection.
///
/// Passed to every observer callback so that a single observer can serve many
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media carried by a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(Error::malformed(format!("unsupported media kind '{}'", other))),
        }
    }
}

/// Direction of a media line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    #[default]
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    /// Direction an answerer uses in reply to this offered direction
    pub fn answer_direction(self) -> Self {
        match self {
            TransceiverDirection::SendRecv => TransceiverDirection::SendRecv,
            TransceiverDirection::SendOnly => TransceiverDirection::RecvOnly,
            TransceiverDirection::RecvOnly => TransceiverDirection::SendOnly,
            TransceiverDirection::Inactive => TransceiverDirection::Inactive,
        }
    }

    pub fn receives(self) -> bool {
        matches!(
            self,
            TransceiverDirection::SendRecv | TransceiverDirection::RecvOnly
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransceiverDirection::SendRecv => "sendrecv",
            TransceiverDirection::SendOnly => "sendonly",
            TransceiverDirection::RecvOnly => "recvonly",
            TransceiverDirection::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(TransceiverDirection::SendRecv),
            "sendonly" => Some(TransceiverDirection::SendOnly),
            "recvonly" => Some(TransceiverDirection::RecvOnly),
            "inactive" => Some(TransceiverDirection::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for TransceiverDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// Whether `self -> next` is an edge of the connection state machine.
    ///
    /// `closed` is reachable from every other state and leaves nothing behind it.
    /// `failed` only leaves to `closed`.
    pub fn can_transition_to(self, next: IceConnectionState) -> bool {
        use IceConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Checking) => true,
            (Checking, Connected) | (Checking, Failed) => true,
            (Connected, Completed) | (Connected, Disconnected) | (Connected, Failed) => true,
            (Completed, Disconnected) => true,
            (Disconnected, Connected) | (Disconnected, Failed) => true,
            _ => false,
        }
    }

    /// Whether media can flow in this state
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE gathering state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

impl IceGatheringState {
    pub fn can_transition_to(self, next: IceGatheringState) -> bool {
        matches!(
            (self, next),
            (IceGatheringState::New, IceGatheringState::Gathering)
                | (IceGatheringState::Gathering, IceGatheringState::Complete)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IceGatheringState::New => "new",
            IceGatheringState::Gathering => "gathering",
            IceGatheringState::Complete => "complete",
        }
    }
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer/answer progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// ICE role. The offerer controls nomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// Address of the STUN server a connection gathers reflexive candidates from.
///
/// Accepts `stun:host:port`, `host:port` or a bare `host` (port 3478).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form, suitable for socket address resolution
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for StunServer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix("stuns:")
            .or_else(|| trimmed.strip_prefix("stun:"))
            .unwrap_or(trimmed);

        if rest.is_empty() {
            return Err(Error::InvalidArgument("empty STUN server address".into()));
        }

        // [v6]:port or [v6]
        if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(|| {
                Error::InvalidArgument(format!("unterminated IPv6 host in '{}'", s))
            })?;
            let port = match after.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if after.is_empty() => DEFAULT_STUN_PORT,
                None => return Err(Error::InvalidArgument(format!("bad STUN address '{}'", s))),
            };
            return Ok(StunServer::new(host, port));
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(Error::InvalidArgument(format!("missing host in '{}'", s)));
                }
                Ok(StunServer::new(host, parse_port(port, s)?))
            }
            // Bare IPv6 literal without brackets carries no port
            Some(_) => Ok(StunServer::new(rest, DEFAULT_STUN_PORT)),
            None => Ok(StunServer::new(rest, DEFAULT_STUN_PORT)),
        }
    }
}

fn parse_port(port: &str, original: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::InvalidArgument(format!(
            "invalid port in STUN address '{}'",
            original
        ))),
        Ok(p) => Ok(p),
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stun:{}", self.authority())
    }
}
