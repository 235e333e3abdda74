//! Tandem ICE
//!
//! Interactive Connectivity Establishment for one peer connection:
//! - [`IceAgent`] - the connection and gathering state machines
//! - [`IceTransport`] - the seam to the lower network layer (sockets, STUN wire format)
//! - [`driver`] - async tasks that gather candidates, run checks and watch consent
//!
//! The agent never talks to the network itself. Everything that touches a
//! socket goes through an [`IceTransport`] implementation.

pub mod agent;
pub mod config;
pub mod driver;
pub mod pair;
pub mod traits;

pub use agent::{AgentHost, IceAgent, IceCredentials, IceEvent};
pub use config::IceConfig;
pub use pair::{form_pairs, pair_priority, CandidatePair};
pub use traits::{CheckRequest, IceTransport};
