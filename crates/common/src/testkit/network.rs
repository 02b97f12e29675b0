use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::address::Address;
use crate::config::SecurityConfig;
use crate::endpoint::EndpointRegistry;
use crate::security::EndpointSecurityBuilder;
use crate::transport::RetryPolicy;

use super::loopback::{LoopbackTransport, Switchboard};
use super::peer::TestPeer;

/// A set of peers sharing one loopback switchboard and endpoint registry
///
/// TestNetwork owns the switchboard the peers' transports are attached to and
/// a registry shared by all of them, so tests never touch the process-wide one.
pub struct TestNetwork {
    switchboard: Arc<Switchboard>,
    registry: Arc<EndpointRegistry>,
    config: SecurityConfig,
    /// All peers in the network, indexed by address key
    peers: HashMap<String, TestPeer>,
}

impl TestNetwork {
    /// Create a network with short timeouts suited to tests
    pub fn new() -> Self {
        Self::with_config(SecurityConfig {
            retry: RetryPolicy::once(Duration::from_secs(2)),
            request_timeout: Duration::from_secs(5),
            ..SecurityConfig::default()
        })
    }

    /// Create a network whose peers all use `config`
    pub fn with_config(config: SecurityConfig) -> Self {
        Self::with_registry(Arc::new(EndpointRegistry::new()), config)
    }

    /// Create a network whose peers draw their endpoints from `registry`
    pub fn with_registry(registry: Arc<EndpointRegistry>, config: SecurityConfig) -> Self {
        Self {
            switchboard: Arc::new(Switchboard::default()),
            registry,
            config,
            peers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Attach a transport and wrap it in an endpoint security manager
    ///
    /// # Arguments
    /// * `address` - Full address of the new peer, e.g. `alice@example.org/phone`
    pub fn add_peer(&mut self, address: &str) -> Result<TestPeer> {
        let transport = self.add_transport(address)?;
        let security = EndpointSecurityBuilder::new()
            .registry(self.registry.clone())
            .config(self.config.clone())
            .build(transport.clone())?;

        let peer = TestPeer::new(transport, security);
        self.peers.insert(peer.address().key(), peer.clone());
        tracing::debug!("added test peer {}", peer.address());
        Ok(peer)
    }

    /// Attach a bare transport without a security manager
    pub fn add_transport(&mut self, address: &str) -> Result<Arc<LoopbackTransport>> {
        let address: Address = address.parse()?;
        let transport = LoopbackTransport::new(address.clone(), &self.switchboard);
        if !self.switchboard.attach(transport.clone()) {
            return Err(anyhow!("Peer '{}' already exists", address));
        }
        Ok(transport)
    }

    /// Get a peer by address
    pub fn peer(&self, address: &str) -> Option<&TestPeer> {
        let address: Address = address.parse().ok()?;
        self.peers.get(&address.key())
    }

    /// Make every pair of peers roster contacts
    pub fn befriend_all(&self) {
        for a in self.peers.values() {
            for b in self.peers.values() {
                if a.address() != b.address() {
                    a.befriend(&b.address());
                }
            }
        }
    }

    /// Detach a peer and dispose its manager
    pub fn remove_peer(&mut self, address: &str) -> Result<()> {
        let address: Address = address.parse()?;
        self.switchboard.detach(&address);
        if let Some(peer) = self.peers.remove(&address.key()) {
            peer.dispose();
        }
        Ok(())
    }

    /// Dispose every peer and detach every transport
    pub fn shutdown(&mut self) {
        tracing::info!("tearing down {} loopback peers", self.peers.len());
        for peer in self.peers.values() {
            peer.dispose();
        }
        self.peers.clear();
        self.switchboard.clear();
    }

    /// Re-check `condition` every 20ms until it holds or `timeout` passes
    ///
    /// # Example
    /// ```rust,ignore
    /// net.eventually(Duration::from_secs(1), || async {
    ///     Ok(bob.security().contains_peer(&alice.address())?)
    /// }).await?;
    /// ```
    pub async fn eventually<F, Fut>(&self, timeout: Duration, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(20);

        loop {
            match condition().await {
                Ok(true) => {
                    tracing::debug!("condition held after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("condition check failed: {}", e),
            }

            if start.elapsed() > timeout {
                return Err(anyhow!("Condition not met within timeout ({:?})", timeout));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}
