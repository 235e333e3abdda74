//! Lower network layer trait

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tandem_core::{IceRole, Result, StunServer};

use crate::agent::IceCredentials;
use crate::pair::CandidatePair;

/// Everything a transport needs to run one connectivity check
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub pair: CandidatePair,
    pub local_credentials: IceCredentials,
    pub remote_credentials: Option<IceCredentials>,
    pub role: IceRole,
}

/// The UDP/STUN layer underneath the agent.
///
/// Implementations own sockets and the STUN wire format. All methods are
/// called from the factory's internal runtime, never from the consumer's
/// thread.
#[async_trait]
pub trait IceTransport: Send + Sync {
    /// Allocate a local base address on `interface`
    async fn bind(&self, interface: IpAddr) -> Result<SocketAddr>;

    /// Ask `stun` for the public mapping of `base`.
    ///
    /// `Ok(None)` means the server answered but no distinct mapping exists.
    async fn server_reflexive(&self, stun: &StunServer, base: SocketAddr)
        -> Result<Option<SocketAddr>>;

    /// Run one connectivity check and return its round-trip time.
    ///
    /// A failed check is `Err(Error::Transient(..))`.
    async fn check(&self, request: &CheckRequest) -> Result<Duration>;

    /// Resolve once consent freshness on `pair` has been lost
    async fn consent_lost(&self, pair: &CandidatePair);
}
