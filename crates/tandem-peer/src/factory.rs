//! Factory: owner of the internal runtime and shared connection resources

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use tandem_core::{CodecRegistry, Error, Result};
use tandem_ice::{IceConfig, IceTransport};

use crate::config::FactoryConfig;
use crate::observer::PeerObserver;
use crate::peer::PeerConnection;

const MIN_WORKER_THREADS: usize = 2;

/// What every connection of a factory shares
pub(crate) struct FactoryContext {
    pub handle: Handle,
    pub transport: Arc<dyn IceTransport>,
    pub codecs: Arc<CodecRegistry>,
    pub interfaces: Arc<[IpAddr]>,
    pub ice: IceConfig,
}

/// Builder for [`Factory`]
pub struct FactoryBuilder {
    config: FactoryConfig,
    transport: Option<Arc<dyn IceTransport>>,
    codecs: CodecRegistry,
}

impl FactoryBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: FactoryConfig::default(),
            transport: None,
            codecs: CodecRegistry::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the lower network layer (required)
    pub fn transport(mut self, transport: Arc<dyn IceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the codecs offered and accepted
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Gather on these interfaces instead of discovering them
    pub fn interfaces(mut self, interfaces: Vec<IpAddr>) -> Self {
        self.config.interfaces = interfaces;
        self
    }

    /// Set ICE timers for the connections this factory creates
    pub fn ice(mut self, ice: IceConfig) -> Self {
        self.config.ice = ice;
        self
    }

    /// Start the runtime and build the factory
    pub fn build(self) -> Result<Factory> {
        let transport = self.transport.ok_or_else(|| {
            Error::PreconditionViolated("a factory needs an ICE transport".into())
        })?;
        if self.codecs.is_empty() {
            return Err(Error::InvalidArgument("codec registry is empty".into()));
        }

        let workers = self.config.worker_threads.max(MIN_WORKER_THREADS);
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(self.config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| Error::ResourceExhausted(format!("cannot start runtime: {}", e)))?;

        let interfaces: Arc<[IpAddr]> = if self.config.interfaces.is_empty() {
            discover_interfaces().into()
        } else {
            self.config.interfaces.clone().into()
        };

        info!(
            "Factory started: {} workers, interfaces {:?}",
            workers, interfaces
        );

        let context = Arc::new(FactoryContext {
            handle: runtime.handle().clone(),
            transport,
            codecs: Arc::new(self.codecs),
            interfaces,
            ice: self.config.ice.clone(),
        });

        Ok(Factory {
            runtime: Some(runtime),
            context,
            config: self.config,
        })
    }
}

impl Default for FactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level resource owner.
///
/// Owns the internal runtime every connection runs on. Connections keep the
/// runtime's handle, not the runtime: destroy the factory only after closing
/// its connections.
pub struct Factory {
    runtime: Option<Runtime>,
    context: Arc<FactoryContext>,
    config: FactoryConfig,
}

impl Factory {
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::new()
    }

    /// Factory with default settings on top of `transport`
    pub fn create(transport: Arc<dyn IceTransport>) -> Result<Self> {
        FactoryBuilder::new().transport(transport).build()
    }

    /// Create a connection bound to `stun_server` reporting to `observer`
    pub fn create_peer_connection(
        &self,
        stun_server: &str,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<PeerConnection> {
        PeerConnection::create(self, stun_server, observer)
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.context.codecs
    }

    /// Interfaces host candidates are gathered on
    pub fn interfaces(&self) -> &[IpAddr] {
        &self.context.interfaces
    }

    /// Shut the runtime down. Same as dropping the factory.
    pub fn destroy(self) {}

    pub(crate) fn context(&self) -> &Arc<FactoryContext> {
        &self.context
    }
}

impl Drop for Factory {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            info!("Factory destroyed");
        }
    }
}

/// Local interfaces to gather on: the one holding the default route, plus
/// loopback.
fn discover_interfaces() -> Vec<IpAddr> {
    let mut found = Vec::new();

    // connect() on a UDP socket only selects a route; nothing is sent
    match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).map(|_| socket))
        .and_then(|socket| socket.local_addr())
    {
        Ok(addr) if !addr.ip().is_unspecified() && !addr.ip().is_loopback() => {
            found.push(addr.ip());
        }
        Ok(_) => {}
        Err(e) => debug!("No default route interface: {}", e),
    }
    found.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    found
}
