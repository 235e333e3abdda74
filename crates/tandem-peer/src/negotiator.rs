//! Offer/answer bookkeeping
//!
//! Holds the applied local and remote descriptions and decides which
//! transitions are legal. It never touches ICE itself; the connection reads
//! [`Applied`] and [`Negotiator::ready_to_check`] and drives the agent.

use tandem_core::sdp::{DescriptionBuilder, MediaLine};
use tandem_core::{
    CodecRegistry, Error, IceCandidate, IceRole, MediaKind, ParsedDescription, Result, SdpType,
    SessionDescription, SignalingState, TransceiverDirection,
};
use tandem_ice::IceCredentials;
use tracing::debug;
use uuid::Uuid;

/// A negotiated media lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transceiver {
    pub kind: MediaKind,
    pub direction: TransceiverDirection,
    pub mid: String,
}

/// Result of applying a description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// Same text as the one already applied
    Unchanged,
    Stored,
}

#[derive(Debug)]
pub(crate) struct Negotiator {
    session_id: u64,
    session_version: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_parsed: Option<ParsedDescription>,
    checking: bool,
}

impl Negotiator {
    pub fn new() -> Self {
        let (high, _) = Uuid::new_v4().as_u64_pair();
        Self {
            // Kept below 2^62 so it survives peers that parse it as i64
            session_id: high >> 2,
            session_version: 2,
            local: None,
            remote: None,
            remote_parsed: None,
            checking: false,
        }
    }

    pub fn local(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn remote_parsed(&self) -> Option<&ParsedDescription> {
        self.remote_parsed.as_ref()
    }

    pub fn signaling_state(&self) -> SignalingState {
        match (&self.local, &self.remote) {
            (Some(l), None) if l.sdp_type() == SdpType::Offer => SignalingState::HaveLocalOffer,
            (None, Some(r)) if r.sdp_type() == SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        }
    }

    /// Both sides are known; no more transceivers can be added
    pub fn is_complete(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }

    /// Both descriptions are applied and checks have not started yet
    pub fn ready_to_check(&self) -> bool {
        self.is_complete() && !self.checking
    }

    pub fn mark_checking(&mut self) {
        self.checking = true;
    }

    /// The offerer controls
    pub fn role(&self) -> IceRole {
        match self.local.as_ref().map(|d| d.sdp_type()) {
            Some(SdpType::Answer) => IceRole::Controlled,
            _ => IceRole::Controlling,
        }
    }

    /// Remote ICE credentials and candidates
    pub fn remote_ice(&self) -> (Option<IceCredentials>, Vec<IceCandidate>) {
        let Some(parsed) = &self.remote_parsed else {
            return (None, Vec::new());
        };
        let credentials = match (&parsed.ice_ufrag, &parsed.ice_pwd) {
            (Some(ufrag), Some(pwd)) => Some(IceCredentials {
                ufrag: ufrag.clone(),
                pwd: pwd.clone(),
            }),
            _ => None,
        };
        (credentials, parsed.candidates.clone())
    }

    pub fn create_offer(
        &self,
        transceivers: &[Transceiver],
        codecs: &CodecRegistry,
        credentials: &IceCredentials,
        candidates: &[IceCandidate],
        gathering_complete: bool,
    ) -> Result<SessionDescription> {
        if self.remote.is_some() {
            return Err(Error::PreconditionViolated(
                "cannot create an offer after a remote description was applied".into(),
            ));
        }
        if self.local.is_some() {
            return Err(Error::PreconditionViolated(
                "a local offer is already applied".into(),
            ));
        }
        if transceivers.is_empty() {
            return Err(Error::PreconditionViolated(
                "no transceivers to negotiate".into(),
            ));
        }

        let mut builder = self.builder(SdpType::Offer, credentials);
        for t in transceivers {
            builder = builder.media(MediaLine {
                kind: t.kind,
                mid: t.mid.clone(),
                direction: t.direction,
                codecs: codecs.for_kind(t.kind).cloned().collect(),
            });
        }
        let sdp = builder.candidates(candidates, gathering_complete).build();
        Ok(SessionDescription::offer(sdp))
    }

    pub fn create_answer(
        &self,
        transceivers: &[Transceiver],
        codecs: &CodecRegistry,
        credentials: &IceCredentials,
        candidates: &[IceCandidate],
        gathering_complete: bool,
    ) -> Result<SessionDescription> {
        let parsed = match (&self.remote, &self.remote_parsed) {
            (Some(remote), Some(parsed)) if remote.sdp_type() == SdpType::Offer => parsed,
            _ => {
                return Err(Error::PreconditionViolated(
                    "an answer requires a remote offer".into(),
                ))
            }
        };
        if self.local.is_some() {
            return Err(Error::PreconditionViolated(
                "a local answer is already applied".into(),
            ));
        }

        let mut builder = self.builder(SdpType::Answer, credentials);
        for (index, section) in parsed.media.iter().enumerate() {
            let Some(kind) = section.kind() else {
                debug!("Not answering unsupported section '{}'", section.media);
                continue;
            };
            let mid = section.mid.clone().unwrap_or_else(|| index.to_string());
            let direction = transceivers
                .iter()
                .find(|t| t.kind == kind)
                .map(|t| t.direction)
                .unwrap_or_else(|| section.direction.answer_direction());

            let mut accepted: Vec<_> = section
                .codecs
                .iter()
                .filter(|c| codecs.supports(c))
                .cloned()
                .collect();
            let direction = if accepted.is_empty() {
                debug!("No common {} codec; answering inactive", kind);
                accepted = section.codecs.iter().take(1).cloned().collect();
                TransceiverDirection::Inactive
            } else {
                direction
            };

            builder = builder.media(MediaLine {
                kind,
                mid,
                direction,
                codecs: accepted,
            });
        }
        let sdp = builder.candidates(candidates, gathering_complete).build();
        Ok(SessionDescription::answer(sdp))
    }

    /// Apply the local description.
    ///
    /// Re-applying the same text is a no-op. A different text replaces the
    /// previous one until connectivity checks have started.
    pub fn set_local(&mut self, description: SessionDescription) -> Result<Applied> {
        if self.local.as_ref() == Some(&description) {
            return Ok(Applied::Unchanged);
        }
        description.parse()?;

        match description.sdp_type() {
            SdpType::Offer => {
                if self.remote.is_some() {
                    return Err(Error::PreconditionViolated(
                        "cannot apply a local offer after a remote description".into(),
                    ));
                }
            }
            SdpType::Answer => {
                let remote_offer = self
                    .remote
                    .as_ref()
                    .is_some_and(|r| r.sdp_type() == SdpType::Offer);
                if !remote_offer {
                    return Err(Error::PreconditionViolated(
                        "cannot apply a local answer without a remote offer".into(),
                    ));
                }
            }
        }
        self.ensure_replaceable(self.local.is_some(), "local")?;

        debug!("Local {} applied", description.sdp_type());
        self.local = Some(description);
        Ok(Applied::Stored)
    }

    /// Apply the remote description. Same replacement rules as
    /// [`Negotiator::set_local`].
    pub fn set_remote(&mut self, description: SessionDescription) -> Result<Applied> {
        if self.remote.as_ref() == Some(&description) {
            return Ok(Applied::Unchanged);
        }
        let parsed = description.parse()?;

        match description.sdp_type() {
            SdpType::Offer => {
                if self.local.is_some() {
                    return Err(Error::PreconditionViolated(
                        "cannot apply a remote offer after a local description".into(),
                    ));
                }
            }
            SdpType::Answer => {
                let local_offer = self
                    .local
                    .as_ref()
                    .is_some_and(|l| l.sdp_type() == SdpType::Offer);
                if !local_offer {
                    return Err(Error::PreconditionViolated(
                        "cannot apply a remote answer without a local offer".into(),
                    ));
                }
            }
        }
        self.ensure_replaceable(self.remote.is_some(), "remote")?;

        debug!(
            "Remote {} applied: {} sections, {} candidates",
            description.sdp_type(),
            parsed.media.len(),
            parsed.candidates.len()
        );
        self.remote = Some(description);
        self.remote_parsed = Some(parsed);
        Ok(Applied::Stored)
    }

    fn ensure_replaceable(&self, present: bool, side: &str) -> Result<()> {
        if present && self.checking {
            return Err(Error::PreconditionViolated(format!(
                "{} description cannot change once connectivity checks started",
                side
            )));
        }
        Ok(())
    }

    fn builder(&self, sdp_type: SdpType, credentials: &IceCredentials) -> DescriptionBuilder {
        DescriptionBuilder::new(sdp_type, self.session_id, &credentials.ufrag, &credentials.pwd)
            .session_version(self.session_version)
    }
}
