//! Tandem Core
//!
//! Core types and primitives shared by the Tandem peer-to-peer media engine.
//!
//! This crate provides:
//! - The error taxonomy ([`Error`], [`ErrorCode`])
//! - Connection and negotiation states ([`IceConnectionState`], [`IceGatheringState`])
//! - Session descriptions ([`SessionDescription`], [`sdp`])
//! - ICE candidates as they appear on the wire ([`IceCandidate`])
//! - Media units handed to observers ([`VideoFrame`], [`EncodedAudioPacket`])
//! - Planar to packed pixel conversion ([`convert`])
//! - The codec registry used to describe media sections ([`CodecRegistry`])

pub mod candidate;
pub mod codec;
pub mod convert;
pub mod error;
pub mod frame;
pub mod sdp;
pub mod types;

pub use candidate::{CandidateType, IceCandidate};
pub use codec::{CodecRegistry, CodecSpec};
pub use convert::{i420_to_rgba, rgba_stride};
pub use error::{Error, ErrorCode, Result};
pub use frame::{EncodedAudioPacket, VideoFrame};
pub use sdp::{ParsedDescription, SdpType, SessionDescription};
pub use types::*;

/// Default STUN port (RFC 5389)
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// ICE component used for every candidate (RTP and RTCP are multiplexed)
pub const RTP_COMPONENT: u16 = 1;
