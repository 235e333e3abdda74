//! Peer connection
//!
//! All mutable state of a connection sits behind one lock. Nothing the
//! consumer supplies is ever called while that lock is held: ICE transitions
//! are queued under the lock and handed, in order, to a dispatcher task that
//! invokes the observer through the connection's event [`DeliveryGate`].
//! Media callbacks pass through a second gate so that close can stop media
//! before queueing the final `closed` notification.

use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_core::sdp::with_candidates;
use tandem_core::{
    ConnectionId, Error, IceCandidate, IceConnectionState, IceGatheringState, MediaKind, Result,
    SessionDescription, SignalingState, StunServer, TransceiverDirection,
};
use tandem_ice::{driver, AgentHost, CandidatePair, IceAgent, IceEvent};

use crate::factory::{Factory, FactoryContext};
use crate::negotiator::{Applied, Negotiator, Transceiver};
use crate::observer::{self, DeliveryGate, PeerObserver};
use crate::pipeline::{MediaIngress, MediaPipeline, PipelineStats};

/// Upper bound on how long `close()` waits for queued notifications to drain
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Dispatch {
    Event(IceEvent),
    /// Everything queued before this has been delivered; the dispatcher stops
    Drained(std_mpsc::Sender<()>),
}

struct ConnectionState {
    closed: bool,
    transceivers: Vec<Transceiver>,
    negotiator: Negotiator,
    agent: IceAgent,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    id: ConnectionId,
    stun: StunServer,
    observer: Arc<dyn PeerObserver>,
    context: Arc<FactoryContext>,
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<Dispatch>,
    event_gate: DeliveryGate,
    media_gate: Arc<DeliveryGate>,
    pipeline: MediaPipeline,
}

impl Shared {
    /// Hand queued ICE transitions to the dispatcher. Called with the state
    /// lock held so the dispatch order is the transition order.
    fn flush_events(&self, state: &mut ConnectionState) {
        for event in state.agent.take_events() {
            if let IceEvent::ConnectionState(s) = event {
                match s {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.pipeline.activate()
                    }
                    IceConnectionState::Disconnected
                    | IceConnectionState::Failed
                    | IceConnectionState::Closed => self.pipeline.deactivate(),
                    _ => {}
                }
            }
            if self.events.send(Dispatch::Event(event)).is_err() {
                debug!("{} dispatcher gone, dropping {:?}", self.id, event);
            }
        }
    }

    fn deliver(&self, event: IceEvent) {
        match event {
            IceEvent::ConnectionState(s) => self.observer.on_ice_connection_state(self.id, s),
            IceEvent::GatheringState(s) => self.observer.on_ice_gathering_state(self.id, s),
        }
    }

    fn deliver_closed(&self) {
        self.observer
            .on_ice_connection_state(self.id, IceConnectionState::Closed);
    }

    /// Second half of a close started inside a callback. Runs off the
    /// runtime workers so that waiting here never holds one up.
    fn finish_close(&self) {
        self.media_gate.seal();
        self.event_gate.seal_with(|| self.deliver_closed());
        info!("Peer connection {} closed", self.id);
    }
}

impl AgentHost for Shared {
    fn with_agent<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut IceAgent) -> R,
    {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let result = f(&mut state.agent);
        self.flush_events(&mut state);
        Some(result)
    }
}

async fn dispatch(shared: std::sync::Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Event(event) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.event_gate.run(|| shared.deliver(event)) {
                    break;
                }
            }
            Dispatch::Drained(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// One call.
///
/// Created by a [`Factory`]; owned exclusively by the consumer. Every method
/// may be called from any thread. Dropping the connection closes it.
pub struct PeerConnection {
    shared: Arc<Shared>,
}

impl PeerConnection {
    /// Create a connection that gathers reflexive candidates via `stun_server`
    pub fn create(
        factory: &Factory,
        stun_server: &str,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Self> {
        let stun: StunServer = stun_server.parse()?;
        let context = factory.context().clone();
        let id = ConnectionId::new();
        let media_gate = Arc::new(DeliveryGate::default());
        let pipeline =
            MediaPipeline::start(&context.handle, id, observer.clone(), media_gate.clone());
        let (events, events_rx) = mpsc::unbounded_channel();

        let agent = IceAgent::new(stun.clone(), context.ice.clone());
        let shared = Arc::new(Shared {
            id,
            stun,
            observer,
            context,
            state: Mutex::new(ConnectionState {
                closed: false,
                transceivers: Vec::new(),
                negotiator: Negotiator::new(),
                agent,
                tasks: Vec::new(),
            }),
            events,
            event_gate: DeliveryGate::default(),
            media_gate,
            pipeline,
        });

        // Not tracked with the other tasks: it must outlive them to drain on close
        shared
            .context
            .handle
            .spawn(dispatch(Arc::downgrade(&shared), events_rx));

        info!("Peer connection {} created (stun {})", id, shared.stun);
        Ok(Self { shared })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn stun_server(&self) -> &StunServer {
        &self.shared.stun
    }

    // ------------------------------------------------------------------
    // Transceivers
    // ------------------------------------------------------------------

    /// Receive-only video lane
    pub fn add_video_transceiver(&self) -> Result<Transceiver> {
        self.add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly)
    }

    /// Receive-only audio lane
    pub fn add_audio_transceiver(&self) -> Result<Transceiver> {
        self.add_transceiver(MediaKind::Audio, TransceiverDirection::RecvOnly)
    }

    /// Declare a media lane. At most one per kind, and only before
    /// negotiation completes.
    pub fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Transceiver> {
        let mut state = self.lock_open()?;
        if state.transceivers.iter().any(|t| t.kind == kind) {
            return Err(Error::PreconditionViolated(format!(
                "a {} transceiver already exists",
                kind
            )));
        }
        if state.negotiator.is_complete() {
            return Err(Error::PreconditionViolated(
                "negotiation is already complete".into(),
            ));
        }

        let transceiver = Transceiver {
            kind,
            direction,
            mid: state.transceivers.len().to_string(),
        };
        debug!("{} added {} transceiver", self.shared.id, transceiver.kind);
        state.transceivers.push(transceiver.clone());

        if state.negotiator.local().is_some() {
            self.start_gathering(&mut state);
        }
        Ok(transceiver)
    }

    pub fn transceivers(&self) -> Vec<Transceiver> {
        self.shared.state.lock().transceivers.clone()
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    /// Build an offer describing the current transceivers. Nothing is applied.
    pub fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.lock_open()?;
        let agent = &state.agent;
        state.negotiator.create_offer(
            &state.transceivers,
            &self.shared.context.codecs,
            agent.local_credentials(),
            agent.local_candidates(),
            agent.gathering_state() == IceGatheringState::Complete,
        )
    }

    /// Build an answer to the applied remote offer. Nothing is applied.
    pub fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.lock_open()?;
        let agent = &state.agent;
        state.negotiator.create_answer(
            &state.transceivers,
            &self.shared.context.codecs,
            agent.local_credentials(),
            agent.local_candidates(),
            agent.gathering_state() == IceGatheringState::Complete,
        )
    }

    /// Apply the local description. On failure nothing changes.
    pub fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.lock_open()?;
        if state.negotiator.set_local(description)? == Applied::Unchanged {
            return Ok(());
        }
        if !state.transceivers.is_empty() {
            self.start_gathering(&mut state);
        }
        self.maybe_start_checking(&mut state);
        Ok(())
    }

    /// Apply the remote description. On failure nothing changes.
    pub fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.lock_open()?;
        if state.negotiator.set_remote(description)? == Applied::Unchanged {
            return Ok(());
        }

        // A remote offer brings lanes we may not have declared
        let offered: Vec<_> = state
            .negotiator
            .remote_parsed()
            .filter(|_| state.negotiator.local().is_none())
            .map(|parsed| {
                parsed
                    .media
                    .iter()
                    .enumerate()
                    .filter_map(|(i, m)| {
                        let kind = m.kind()?;
                        let mid = m.mid.clone().unwrap_or_else(|| i.to_string());
                        Some((kind, mid, m.direction.answer_direction()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (kind, mid, direction) in offered {
            match state.transceivers.iter_mut().find(|t| t.kind == kind) {
                Some(existing) => existing.mid = mid,
                None => {
                    debug!("{} remote offer adds {} transceiver", self.shared.id, kind);
                    state.transceivers.push(Transceiver {
                        kind,
                        direction,
                        mid,
                    });
                }
            }
        }

        self.maybe_start_checking(&mut state);
        Ok(())
    }

    /// Exactly the text last applied locally, if any
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().negotiator.local().cloned()
    }

    /// The applied local description with every gathered candidate, ending
    /// with `a=end-of-candidates` once gathering is complete
    pub fn current_local_description(&self) -> Option<SessionDescription> {
        let state = self.shared.state.lock();
        let local = state.negotiator.local()?;
        let complete = state.agent.gathering_state() == IceGatheringState::Complete;
        let sdp = with_candidates(local.sdp(), state.agent.local_candidates(), complete);
        Some(SessionDescription::new(local.sdp_type(), sdp))
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().negotiator.remote().cloned()
    }

    pub fn signaling_state(&self) -> SignalingState {
        let state = self.shared.state.lock();
        if state.closed {
            return SignalingState::Closed;
        }
        state.negotiator.signaling_state()
    }

    // ------------------------------------------------------------------
    // ICE
    // ------------------------------------------------------------------

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.shared.state.lock().agent.connection_state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.shared.state.lock().agent.gathering_state()
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.shared.state.lock().agent.local_candidates().to_vec()
    }

    pub fn selected_candidate_pair(&self) -> Option<CandidatePair> {
        self.shared.state.lock().agent.selected_pair().cloned()
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// Producer handle for the decode layer
    pub fn media_ingress(&self) -> MediaIngress {
        self.shared.pipeline.ingress()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.shared.pipeline.stats()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the connection.
    ///
    /// Idempotent. When this returns, the `closed` notification has been
    /// delivered as the connection's last callback, and no other callback is
    /// still running.
    ///
    /// Called from inside any observer callback (of this or another
    /// connection), close does not wait: it stops further callbacks at once,
    /// drops notifications still queued, and delivers `closed` from a
    /// background thread once the running callbacks have returned.
    pub fn close(&self) {
        let shared = &self.shared;
        let nested = observer::in_callback();
        let pending = {
            let mut state = shared.state.lock();
            if state.closed {
                drop(state);
                if !nested {
                    // Another thread is closing; return once it is done
                    shared.event_gate.wait_sealed();
                }
                return;
            }
            state.closed = true;
            state.agent.close();
            for task in state.tasks.drain(..) {
                task.abort();
            }
            state.agent.take_events()
        };
        shared.pipeline.shutdown();

        if nested {
            shared.media_gate.stop();
            shared.event_gate.stop();
            let finisher = shared.clone();
            shared
                .context
                .handle
                .spawn_blocking(move || finisher.finish_close());
            debug!("{} closing from inside a callback", shared.id);
            return;
        }

        // Media stops before the final notifications are queued
        shared.media_gate.seal();
        for event in pending {
            let _ = shared.events.send(Dispatch::Event(event));
        }
        if self.drain_dispatcher() {
            shared.event_gate.seal();
        } else {
            shared.event_gate.seal_with(|| shared.deliver_closed());
        }
        info!("Peer connection {} closed", shared.id);
    }

    /// Wait for queued notifications to be delivered. Returns false if the
    /// dispatcher is gone and could not deliver them.
    fn drain_dispatcher(&self) -> bool {
        let shared = &self.shared;
        let (ack_tx, ack_rx) = std_mpsc::channel();
        if shared.events.send(Dispatch::Drained(ack_tx)).is_err() {
            return false;
        }
        match ack_rx.recv_timeout(CLOSE_DRAIN_TIMEOUT) {
            Ok(()) => true,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "{} close timed out waiting for notifications to drain",
                    shared.id
                );
                true
            }
            // Runtime already gone with its tasks
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                debug!("{} dispatcher stopped before close", shared.id);
                false
            }
        }
    }

    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, ConnectionState>> {
        let state = self.shared.state.lock();
        if state.closed {
            return Err(Error::InvalidHandle);
        }
        Ok(state)
    }

    fn start_gathering(&self, state: &mut ConnectionState) {
        if !state.agent.start_gathering() {
            return;
        }
        self.shared.flush_events(state);
        let context = &self.shared.context;
        let task = context.handle.spawn(driver::gather(
            self.shared.clone(),
            context.transport.clone(),
            context.interfaces.clone(),
        ));
        state.tasks.push(task);
    }

    fn maybe_start_checking(&self, state: &mut ConnectionState) {
        if !state.negotiator.ready_to_check() {
            return;
        }
        // Checks need local candidates even if no lane was declared
        self.start_gathering(state);

        let role = state.negotiator.role();
        let (credentials, candidates) = state.negotiator.remote_ice();
        state.agent.set_role(role);
        state.agent.set_remote(credentials, &candidates);
        if !state.agent.start_checking() {
            return;
        }
        state.negotiator.mark_checking();
        self.shared.flush_events(state);

        info!(
            "{} checking {} remote candidates as {:?}",
            self.shared.id,
            candidates.len(),
            role
        );
        let context = &self.shared.context;
        let task = context
            .handle
            .spawn(driver::run_checks(self.shared.clone(), context.transport.clone()));
        state.tasks.push(task);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.shared.id)
            .field("stun", &self.shared.stun)
            .finish_non_exhaustive()
    }
}
