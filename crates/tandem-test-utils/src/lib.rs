//! Common test helpers for Tandem tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - A scripted lower transport with controllable reachability and timing
//! - A recording observer that multiplexes many connections
//! - Remote descriptions to negotiate against

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use tandem_core::sdp::{DescriptionBuilder, MediaLine};
use tandem_core::{
    CodecRegistry, ConnectionId, EncodedAudioPacket, Error, IceCandidate, IceConnectionState,
    IceGatheringState, MediaKind, Result, SdpType, SessionDescription, StunServer,
    TransceiverDirection, VideoFrame,
};
use tandem_ice::{CandidatePair, CheckRequest, IceConfig, IceCredentials, IceTransport};
use tandem_peer::{Factory, FactoryConfig, PeerConnection, PeerObserver};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Tracing
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Block the current thread until `check` holds or `max_wait` elapses
pub fn wait_until<F>(max_wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        std::thread::sleep(DEFAULT_CHECK_INTERVAL);
    }
    check()
}

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F>(max_wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        tokio::time::sleep(DEFAULT_CHECK_INTERVAL).await;
    }
    check()
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// In-memory [`IceTransport`].
///
/// Binds hand out sequential ports on the requested interface. Reflexive
/// mappings, reachability of remote addresses, and delays are set by the
/// test, and may be changed while a connection is running.
pub struct ScriptedTransport {
    next_port: AtomicU16,
    reflexive: Mutex<HashMap<IpAddr, IpAddr>>,
    unbindable: Mutex<HashSet<IpAddr>>,
    unreachable: Mutex<HashSet<SocketAddr>>,
    all_unreachable: AtomicBool,
    stun_down: AtomicBool,
    check_delay: Mutex<Duration>,
    check_delays: Mutex<HashMap<SocketAddr, Duration>>,
    gather_delay: Mutex<Duration>,
    consent: Notify,
    binds: AtomicU32,
    checks: AtomicU32,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            next_port: AtomicU16::new(50000),
            reflexive: Mutex::new(HashMap::new()),
            unbindable: Mutex::new(HashSet::new()),
            unreachable: Mutex::new(HashSet::new()),
            all_unreachable: AtomicBool::new(false),
            stun_down: AtomicBool::new(false),
            check_delay: Mutex::new(Duration::from_millis(1)),
            check_delays: Mutex::new(HashMap::new()),
            gather_delay: Mutex::new(Duration::ZERO),
            consent: Notify::new(),
            binds: AtomicU32::new(0),
            checks: AtomicU32::new(0),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// STUN reports `public` for bases on `interface`
    pub fn set_reflexive(&self, interface: IpAddr, public: IpAddr) {
        self.reflexive.lock().insert(interface, public);
    }

    /// Reflexive queries fail
    pub fn set_stun_down(&self, down: bool) {
        self.stun_down.store(down, Ordering::SeqCst);
    }

    /// Binding on `interface` fails
    pub fn fail_bind(&self, interface: IpAddr) {
        self.unbindable.lock().insert(interface);
    }

    /// Checks towards `remote` fail (or succeed again)
    pub fn set_reachable(&self, remote: SocketAddr, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(&remote);
        } else {
            unreachable.insert(remote);
        }
    }

    /// Every check fails (or the per-address settings apply again)
    pub fn set_all_unreachable(&self, unreachable: bool) {
        self.all_unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock() = delay;
    }

    /// Checks towards `remote` take `delay` instead of the common delay
    pub fn set_check_delay_for(&self, remote: SocketAddr, delay: Duration) {
        self.check_delays.lock().insert(remote, delay);
    }

    pub fn set_gather_delay(&self, delay: Duration) {
        *self.gather_delay.lock() = delay;
    }

    /// Signal consent loss on the selected pair of one waiting connection
    pub fn lose_consent(&self) {
        self.consent.notify_one();
    }

    pub fn bind_count(&self) -> u32 {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn check_count(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    fn reachable(&self, remote: SocketAddr) -> bool {
        !self.all_unreachable.load(Ordering::SeqCst) && !self.unreachable.lock().contains(&remote)
    }
}

#[async_trait]
impl IceTransport for ScriptedTransport {
    async fn bind(&self, interface: IpAddr) -> Result<SocketAddr> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.unbindable.lock().contains(&interface) {
            return Err(Error::Transient(format!("cannot bind {}", interface)));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(SocketAddr::new(interface, port))
    }

    async fn server_reflexive(
        &self,
        _stun: &StunServer,
        base: SocketAddr,
    ) -> Result<Option<SocketAddr>> {
        let delay = *self.gather_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.stun_down.load(Ordering::SeqCst) {
            return Err(Error::Transient("stun server unreachable".into()));
        }
        let public = self.reflexive.lock().get(&base.ip()).copied();
        Ok(public.map(|ip| SocketAddr::new(ip, base.port())))
    }

    async fn check(&self, request: &CheckRequest) -> Result<Duration> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let remote = request.pair.remote.address;
        let delay = match self.check_delays.lock().get(&remote) {
            Some(delay) => *delay,
            None => *self.check_delay.lock(),
        };
        tokio::time::sleep(delay).await;
        if self.reachable(remote) {
            Ok(delay)
        } else {
            Err(Error::Transient(format!("no response from {}", remote)))
        }
    }

    async fn consent_lost(&self, _pair: &CandidatePair) {
        self.consent.notified().await;
    }
}

/// Config with short timers so failure paths finish quickly
pub fn fast_ice_config() -> IceConfig {
    IceConfig {
        check_timeout_ms: 200,
        disconnected_timeout_ms: 400,
        recovery_interval_ms: 20,
        gather_timeout_ms: 200,
    }
}

/// Factory on loopback over `transport`, with fast ICE timers
pub fn test_factory(transport: Arc<ScriptedTransport>) -> Factory {
    let config = FactoryConfig {
        interfaces: vec![IpAddr::from([127, 0, 0, 1])],
        ice: fast_ice_config(),
        ..FactoryConfig::default()
    };
    Factory::builder()
        .config(config)
        .transport(transport)
        .build()
        .expect("test factory")
}

// ============================================================================
// Recording Observer
// ============================================================================

/// One callback, as seen by [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    IceConnection(IceConnectionState),
    IceGathering(IceGatheringState),
    Video { timestamp_us: i64, width: usize, height: usize },
    Audio { sequence_number: u16, rtp_timestamp: u32 },
}

/// Observer that records every callback per connection
#[derive(Default)]
pub struct RecordingObserver {
    events: DashMap<ConnectionId, Vec<Recorded>>,
    total: AtomicU64,
    after_close: AtomicU64,
    delay: Mutex<Option<Duration>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every callback take at least `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    fn record(&self, connection: ConnectionId, event: Recorded) {
        if let Some(delay) = *self.delay.lock() {
            std::thread::sleep(delay);
        }
        let mut events = self.events.entry(connection).or_default();
        if events.contains(&Recorded::IceConnection(IceConnectionState::Closed)) {
            self.after_close.fetch_add(1, Ordering::SeqCst);
        }
        events.push(event);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn events(&self, connection: ConnectionId) -> Vec<Recorded> {
        self.events
            .get(&connection)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn ice_states(&self, connection: ConnectionId) -> Vec<IceConnectionState> {
        self.events(connection)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::IceConnection(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn gathering_states(&self, connection: ConnectionId) -> Vec<IceGatheringState> {
        self.events(connection)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::IceGathering(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn video_timestamps(&self, connection: ConnectionId) -> Vec<i64> {
        self.events(connection)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Video { timestamp_us, .. } => Some(timestamp_us),
                _ => None,
            })
            .collect()
    }

    pub fn audio_sequences(&self, connection: ConnectionId) -> Vec<u16> {
        self.events(connection)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Audio { sequence_number, .. } => Some(sequence_number),
                _ => None,
            })
            .collect()
    }

    pub fn has_ice_state(&self, connection: ConnectionId, state: IceConnectionState) -> bool {
        self.ice_states(connection).contains(&state)
    }

    pub fn count(&self, connection: ConnectionId) -> usize {
        self.events.get(&connection).map(|e| e.len()).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Callbacks that arrived after `closed` for the same connection
    pub fn callbacks_after_close(&self) -> u64 {
        self.after_close.load(Ordering::SeqCst)
    }
}

impl PeerObserver for RecordingObserver {
    fn on_ice_connection_state(&self, connection: ConnectionId, state: IceConnectionState) {
        self.record(connection, Recorded::IceConnection(state));
    }

    fn on_ice_gathering_state(&self, connection: ConnectionId, state: IceGatheringState) {
        self.record(connection, Recorded::IceGathering(state));
    }

    fn on_video_frame(&self, connection: ConnectionId, frame: &VideoFrame) {
        self.record(
            connection,
            Recorded::Video {
                timestamp_us: frame.timestamp_us,
                width: frame.width,
                height: frame.height,
            },
        );
    }

    fn on_encoded_audio(&self, connection: ConnectionId, packet: &EncodedAudioPacket) {
        self.record(
            connection,
            Recorded::Audio {
                sequence_number: packet.sequence_number,
                rtp_timestamp: packet.rtp_timestamp,
            },
        );
    }
}

// ============================================================================
// Remote Descriptions
// ============================================================================

/// The far end of a negotiation: credentials and candidates it advertises
pub struct RemotePeer {
    pub credentials: IceCredentials,
    pub candidates: Vec<IceCandidate>,
    pub codecs: CodecRegistry,
}

impl RemotePeer {
    /// A peer reachable on the given addresses (host candidates)
    pub fn at(addresses: &[SocketAddr]) -> Self {
        let candidates = addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| IceCandidate::host(*addr, u16::MAX - i as u16))
            .collect();
        Self {
            credentials: IceCredentials::generate(),
            candidates,
            codecs: CodecRegistry::default(),
        }
    }

    /// Answer mirroring `offer`: same mids, mirrored directions
    pub fn answer(&self, offer: &SessionDescription) -> SessionDescription {
        let parsed = offer.parse().expect("offer under test must parse");
        let mut builder = self.builder(SdpType::Answer);
        for (i, section) in parsed.media.iter().enumerate() {
            let Some(kind) = section.kind() else { continue };
            builder = builder.media(MediaLine {
                kind,
                mid: section.mid.clone().unwrap_or_else(|| i.to_string()),
                direction: section.direction.answer_direction(),
                codecs: section.codecs.clone(),
            });
        }
        SessionDescription::answer(builder.build())
    }

    /// Offer sending the given media kinds
    pub fn offer(&self, kinds: &[MediaKind]) -> SessionDescription {
        let mut builder = self.builder(SdpType::Offer);
        for (i, kind) in kinds.iter().enumerate() {
            builder = builder.media(MediaLine {
                kind: *kind,
                mid: i.to_string(),
                direction: TransceiverDirection::SendOnly,
                codecs: self.codecs.for_kind(*kind).cloned().collect(),
            });
        }
        SessionDescription::offer(builder.build())
    }

    fn builder(&self, sdp_type: SdpType) -> DescriptionBuilder {
        DescriptionBuilder::new(
            sdp_type,
            4_611_686_018_427_387,
            &self.credentials.ufrag,
            &self.credentials.pwd,
        )
        .candidates(&self.candidates, true)
    }
}

/// Remote address used by tests that need one reachable peer
pub fn remote_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 10], port))
}

/// Run the offerer side of a negotiation against `remote`
pub fn negotiate(pc: &PeerConnection, remote: &RemotePeer) -> Result<()> {
    let offer = pc.create_offer()?;
    pc.set_local_description(offer.clone())?;
    pc.set_remote_description(remote.answer(&offer))
}

/// Negotiate a video+audio connection and wait until ICE completes
pub fn connect(pc: &PeerConnection) -> bool {
    let ok = pc.add_video_transceiver().is_ok()
        && pc.add_audio_transceiver().is_ok()
        && negotiate(pc, &RemotePeer::at(&[remote_addr(40000)])).is_ok();
    ok && wait_until(DEFAULT_TIMEOUT, || {
        pc.ice_connection_state() == IceConnectionState::Completed
    })
}
