//! ICE candidates and their `a=candidate` wire form

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};
use crate::RTP_COMPONENT;

/// Candidate type, ordered by preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    /// RFC 8445 recommended type preference
    pub fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::Prflx => 110,
            CandidateType::Srflx => 100,
            CandidateType::Relay => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::Srflx),
            "prflx" => Some(CandidateType::Prflx),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

/// One network endpoint a peer proposes for connectivity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateType,
    /// Base address for reflexive candidates
    pub related: Option<SocketAddr>,
}

impl IceCandidate {
    /// Host candidate on a local interface base
    pub fn host(address: SocketAddr, local_preference: u16) -> Self {
        Self {
            foundation: foundation_for(CandidateType::Host, address.ip()),
            component: RTP_COMPONENT,
            priority: compute_priority(CandidateType::Host, local_preference, RTP_COMPONENT),
            address,
            kind: CandidateType::Host,
            related: None,
        }
    }

    /// Server-reflexive candidate learned through STUN for `base`
    pub fn server_reflexive(address: SocketAddr, base: SocketAddr, local_preference: u16) -> Self {
        Self {
            foundation: foundation_for(CandidateType::Srflx, base.ip()),
            component: RTP_COMPONENT,
            priority: compute_priority(CandidateType::Srflx, local_preference, RTP_COMPONENT),
            address,
            kind: CandidateType::Srflx,
            related: Some(base),
        }
    }

    /// The attribute value, without the leading `a=`
    pub fn to_attribute(&self) -> String {
        let mut line = format!(
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_str()
        );
        if let Some(related) = self.related {
            line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        line
    }

    pub fn to_sdp_line(&self) -> String {
        format!("a={}", self.to_attribute())
    }

    /// Parse `candidate:...` or `a=candidate:...`.
    ///
    /// Only UDP candidates are accepted; TCP candidates are rejected so the
    /// caller can skip them.
    pub fn parse(line: &str) -> Result<Self> {
        let value = line.trim();
        let value = value.strip_prefix("a=").unwrap_or(value);
        let value = value
            .strip_prefix("candidate:")
            .ok_or_else(|| Error::malformed(format!("not a candidate line: '{}'", line)))?;

        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::malformed(format!("truncated candidate: '{}'", line)));
        }

        let foundation = fields[0].to_string();
        let component = fields[1]
            .parse::<u16>()
            .map_err(|_| Error::malformed(format!("bad component in '{}'", line)))?;
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(Error::malformed(format!(
                "unsupported transport '{}'",
                fields[2]
            )));
        }
        let priority = fields[3]
            .parse::<u32>()
            .map_err(|_| Error::malformed(format!("bad priority in '{}'", line)))?;
        let ip = fields[4]
            .parse::<IpAddr>()
            .map_err(|_| Error::malformed(format!("bad address in '{}'", line)))?;
        let port = fields[5]
            .parse::<u16>()
            .map_err(|_| Error::malformed(format!("bad port in '{}'", line)))?;
        if fields[6] != "typ" {
            return Err(Error::malformed(format!("missing 'typ' in '{}'", line)));
        }
        let kind = CandidateType::parse(fields[7])
            .ok_or_else(|| Error::malformed(format!("unknown candidate type '{}'", fields[7])))?;

        let mut raddr = None;
        let mut rport = None;
        let mut rest = fields[8..].iter();
        while let Some(key) = rest.next() {
            let Some(val) = rest.next() else { break };
            match *key {
                "raddr" => raddr = val.parse::<IpAddr>().ok(),
                "rport" => rport = val.parse::<u16>().ok(),
                _ => {}
            }
        }
        let related = match (raddr, rport) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(Self {
            foundation,
            component,
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            related,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.address)
    }
}

/// RFC 8445 §5.1.2.1 candidate priority
pub fn compute_priority(kind: CandidateType, local_preference: u16, component: u16) -> u32 {
    (kind.type_preference() << 24)
        + ((local_preference as u32) << 8)
        + (256 - component.min(256) as u32)
}

// Same type and base share a foundation
fn foundation_for(kind: CandidateType, base: IpAddr) -> String {
    let mut hash: u32 = 2166136261;
    for byte in kind.as_str().bytes().chain(base.to_string().into_bytes()) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash.to_string()
}
