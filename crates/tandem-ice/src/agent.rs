//! ICE agent state machines
//!
//! The agent is plain state: it is owned by a peer connection and mutated
//! under that connection's lock through [`AgentHost`]. Every accepted
//! transition is queued as an [`IceEvent`]; the owner drains the queue with
//! [`IceAgent::take_events`] before releasing its lock, which keeps the
//! reported order identical to the order transitions happened in.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_core::{
    IceCandidate, IceConnectionState, IceGatheringState, IceRole, StunServer,
};

use crate::config::IceConfig;
use crate::pair::{form_pairs, CandidatePair};

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Random credentials (8 character ufrag, 24 character password)
    pub fn generate() -> Self {
        let ufrag = Uuid::new_v4().simple().to_string();
        let pwd = Uuid::new_v4().simple().to_string();
        Self {
            ufrag: ufrag[..8].to_string(),
            pwd: pwd[..24].to_string(),
        }
    }
}

/// A state transition, in the order it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceEvent {
    ConnectionState(IceConnectionState),
    GatheringState(IceGatheringState),
}

/// Owner of an [`IceAgent`] that the async drivers call back into.
pub trait AgentHost: Send + Sync + 'static {
    /// Run `f` against the agent while holding the owner's lock.
    ///
    /// Returns `None` once the owner has shut the agent down; drivers stop
    /// when they see it.
    fn with_agent<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut IceAgent) -> R;
}

impl AgentHost for parking_lot::Mutex<IceAgent> {
    fn with_agent<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut IceAgent) -> R,
    {
        let mut agent = self.lock();
        if agent.connection_state() == IceConnectionState::Closed {
            return None;
        }
        Some(f(&mut agent))
    }
}

/// Connection and gathering state machines for one peer connection
#[derive(Debug)]
pub struct IceAgent {
    stun: StunServer,
    config: IceConfig,
    role: IceRole,
    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    connection_state: IceConnectionState,
    gathering_state: IceGatheringState,
    gathering_tx: watch::Sender<IceGatheringState>,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    selected: Option<CandidatePair>,
    events: Vec<IceEvent>,
}

impl IceAgent {
    pub fn new(stun: StunServer, config: IceConfig) -> Self {
        let (gathering_tx, _) = watch::channel(IceGatheringState::New);
        Self {
            stun,
            config,
            role: IceRole::Controlling,
            local_credentials: IceCredentials::generate(),
            remote_credentials: None,
            connection_state: IceConnectionState::New,
            gathering_state: IceGatheringState::New,
            gathering_tx,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            selected: None,
            events: Vec::new(),
        }
    }

    pub fn stun_server(&self) -> &StunServer {
        &self.stun
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn set_role(&mut self, role: IceRole) {
        self.role = role;
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn remote_credentials(&self) -> Option<&IceCredentials> {
        self.remote_credentials.as_ref()
    }

    pub fn connection_state(&self) -> IceConnectionState {
        self.connection_state
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    pub fn selected_pair(&self) -> Option<&CandidatePair> {
        self.selected.as_ref()
    }

    /// Watch gathering progress from a driver task
    pub fn subscribe_gathering(&self) -> watch::Receiver<IceGatheringState> {
        self.gathering_tx.subscribe()
    }

    /// Drain the transitions queued since the last call
    pub fn take_events(&mut self) -> Vec<IceEvent> {
        std::mem::take(&mut self.events)
    }

    /// The current check list
    pub fn candidate_pairs(&self) -> Vec<CandidatePair> {
        form_pairs(&self.local_candidates, &self.remote_candidates, self.role)
    }

    // ------------------------------------------------------------------
    // Gathering
    // ------------------------------------------------------------------

    /// `new -> gathering`. Returns false if gathering already started.
    pub fn start_gathering(&mut self) -> bool {
        self.set_gathering_state(IceGatheringState::Gathering)
    }

    /// Record a gathered candidate. Ignored outside `gathering` and for duplicates.
    pub fn add_local_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.gathering_state != IceGatheringState::Gathering {
            return false;
        }
        if self.local_candidates.contains(&candidate) {
            return false;
        }
        debug!("Gathered local candidate {}", candidate);
        self.local_candidates.push(candidate);
        true
    }

    /// `gathering -> complete`
    pub fn finish_gathering(&mut self) -> bool {
        self.set_gathering_state(IceGatheringState::Complete)
    }

    // ------------------------------------------------------------------
    // Checking
    // ------------------------------------------------------------------

    /// Take the remote side's credentials and candidates from its description.
    ///
    /// The remote candidate set only grows.
    pub fn set_remote(&mut self, credentials: Option<IceCredentials>, candidates: &[IceCandidate]) {
        if credentials.is_some() {
            self.remote_credentials = credentials;
        }
        for candidate in candidates {
            if !self.remote_candidates.contains(candidate) {
                self.remote_candidates.push(candidate.clone());
            }
        }
    }

    /// `new -> checking`
    pub fn start_checking(&mut self) -> bool {
        self.set_connection_state(IceConnectionState::Checking)
    }

    /// A check on `pair` succeeded.
    ///
    /// The first success while checking selects the pair; a success while
    /// disconnected recovers the connection.
    pub fn check_succeeded(&mut self, pair: CandidatePair, rtt: Duration) {
        match self.connection_state {
            IceConnectionState::Checking => {
                info!("ICE pair selected: {} (rtt {:?})", pair, rtt);
                self.selected = Some(pair);
                self.set_connection_state(IceConnectionState::Connected);
            }
            IceConnectionState::Disconnected => {
                info!("ICE connectivity recovered on {}", pair);
                self.set_connection_state(IceConnectionState::Connected);
            }
            _ => debug!("Check on {} succeeded (rtt {:?})", pair, rtt),
        }
    }

    /// Every pair in the check list has been tried
    pub fn checks_exhausted(&mut self) {
        match self.connection_state {
            IceConnectionState::Checking => {
                warn!(
                    "ICE failed: no working pair among {} local / {} remote candidates",
                    self.local_candidates.len(),
                    self.remote_candidates.len()
                );
                self.set_connection_state(IceConnectionState::Failed);
            }
            IceConnectionState::Connected => {
                self.set_connection_state(IceConnectionState::Completed);
            }
            _ => {}
        }
    }

    /// Consent on the selected pair expired. Returns false if the agent was
    /// not in a connected state.
    pub fn consent_lost(&mut self) -> bool {
        if !self.connection_state.is_connected() {
            return false;
        }
        warn!("ICE consent lost on selected pair");
        self.set_connection_state(IceConnectionState::Disconnected)
    }

    /// The recovery window after `disconnected` elapsed
    pub fn recovery_expired(&mut self) {
        if self.connection_state == IceConnectionState::Disconnected {
            warn!("ICE did not recover within {:?}", self.config.disconnected_timeout());
            self.set_connection_state(IceConnectionState::Failed);
        }
    }

    /// Any state `-> closed`
    pub fn close(&mut self) -> bool {
        self.set_connection_state(IceConnectionState::Closed)
    }

    fn set_connection_state(&mut self, next: IceConnectionState) -> bool {
        let current = self.connection_state;
        if !current.can_transition_to(next) {
            debug!("Ignoring ICE transition {} -> {}", current, next);
            return false;
        }
        debug!("ICE connection state: {} -> {}", current, next);
        self.connection_state = next;
        self.events.push(IceEvent::ConnectionState(next));
        true
    }

    fn set_gathering_state(&mut self, next: IceGatheringState) -> bool {
        let current = self.gathering_state;
        if !current.can_transition_to(next) {
            return false;
        }
        debug!("ICE gathering state: {} -> {}", current, next);
        self.gathering_state = next;
        self.gathering_tx.send_replace(next);
        self.events.push(IceEvent::GatheringState(next));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> IceAgent {
        IceAgent::new("stun:127.0.0.1:3478".parse().unwrap(), IceConfig::default())
    }

    fn pair() -> CandidatePair {
        let local = IceCandidate::host("10.0.0.1:1000".parse().unwrap(), 1);
        let remote = IceCandidate::host("10.0.0.2:2000".parse().unwrap(), 1);
        CandidatePair {
            priority: crate::pair_priority(local.priority, remote.priority),
            local,
            remote,
        }
    }

    #[test]
    fn gathering_is_monotonic() {
        let mut a = agent();
        assert!(!a.finish_gathering());
        assert!(a.start_gathering());
        assert!(!a.start_gathering());
        assert!(a.finish_gathering());
        assert!(!a.start_gathering());
        assert_eq!(
            a.take_events(),
            vec![
                IceEvent::GatheringState(IceGatheringState::Gathering),
                IceEvent::GatheringState(IceGatheringState::Complete),
            ]
        );
    }

    #[test]
    fn candidates_only_accepted_while_gathering() {
        let mut a = agent();
        let c = IceCandidate::host("10.0.0.1:1000".parse().unwrap(), 1);
        assert!(!a.add_local_candidate(c.clone()));
        a.start_gathering();
        assert!(a.add_local_candidate(c.clone()));
        assert!(!a.add_local_candidate(c.clone()));
        a.finish_gathering();
        assert!(!a.add_local_candidate(IceCandidate::host("10.0.0.9:1".parse().unwrap(), 1)));
        assert_eq!(a.local_candidates(), &[c]);
    }

    #[test]
    fn success_path_reaches_completed() {
        let mut a = agent();
        assert!(a.start_checking());
        a.check_succeeded(pair(), Duration::from_millis(3));
        a.check_succeeded(pair(), Duration::from_millis(3));
        a.checks_exhausted();
        assert_eq!(a.connection_state(), IceConnectionState::Completed);
        assert_eq!(
            a.take_events(),
            vec![
                IceEvent::ConnectionState(IceConnectionState::Checking),
                IceEvent::ConnectionState(IceConnectionState::Connected),
                IceEvent::ConnectionState(IceConnectionState::Completed),
            ]
        );
    }

    #[test]
    fn failure_is_terminal() {
        let mut a = agent();
        a.start_checking();
        a.checks_exhausted();
        assert_eq!(a.connection_state(), IceConnectionState::Failed);
        a.check_succeeded(pair(), Duration::ZERO);
        assert_eq!(a.connection_state(), IceConnectionState::Failed);
        assert!(a.close());
        assert!(!a.close());
    }

    #[test]
    fn disconnect_and_recover() {
        let mut a = agent();
        a.start_checking();
        a.check_succeeded(pair(), Duration::ZERO);
        assert!(a.consent_lost());
        assert_eq!(a.connection_state(), IceConnectionState::Disconnected);
        assert!(!a.consent_lost());
        a.check_succeeded(pair(), Duration::ZERO);
        assert_eq!(a.connection_state(), IceConnectionState::Connected);
        a.consent_lost();
        a.recovery_expired();
        assert_eq!(a.connection_state(), IceConnectionState::Failed);
    }

    #[test]
    fn new_cannot_fail_directly() {
        let mut a = agent();
        a.checks_exhausted();
        a.recovery_expired();
        assert_eq!(a.connection_state(), IceConnectionState::New);
        assert!(a.take_events().is_empty());
    }

    #[test]
    fn credentials_have_expected_lengths() {
        let c = IceCredentials::generate();
        assert_eq!(c.ufrag.len(), 8);
        assert_eq!(c.pwd.len(), 24);
        assert_ne!(c, IceCredentials::generate());
    }
}
