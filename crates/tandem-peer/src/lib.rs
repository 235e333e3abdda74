//! Tandem Peer
//!
//! The consumer-facing side of the engine: a [`Factory`] that owns the
//! internal runtime, and [`PeerConnection`]s that negotiate offer/answer,
//! drive ICE and deliver media to a [`PeerObserver`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_peer::{Factory, ObserverCallbacks};
//! # fn run(transport: Arc<dyn tandem_peer::IceTransport>) -> tandem_peer::Result<()> {
//! let factory = Factory::create(transport)?;
//! let observer = ObserverCallbacks::new()
//!     .on_ice_connection_state(|id, state| println!("{}: {}", id, state));
//! let pc = factory.create_peer_connection("stun:stun.l.google.com:19302", Arc::new(observer))?;
//! pc.add_video_transceiver()?;
//! let offer = pc.create_offer()?;
//! pc.set_local_description(offer)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod factory;
pub mod negotiator;
pub mod observer;
pub mod peer;
pub mod pipeline;

pub use config::FactoryConfig;
pub use factory::{Factory, FactoryBuilder};
pub use negotiator::Transceiver;
pub use observer::{ObserverCallbacks, PeerObserver};
pub use peer::PeerConnection;
pub use pipeline::{LaneStats, MediaIngress, PipelineStats, PushOutcome};

pub use tandem_core::{
    CodecRegistry, CodecSpec, ConnectionId, EncodedAudioPacket, Error, ErrorCode, IceCandidate,
    IceConnectionState, IceGatheringState, MediaKind, Result, SdpType, SessionDescription,
    SignalingState, StunServer, TransceiverDirection, VideoFrame,
};
pub use tandem_ice::{CandidatePair, IceConfig, IceTransport};
