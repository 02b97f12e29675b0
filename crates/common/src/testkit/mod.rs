/// Lightweight test harness for multi-peer integration tests
///
/// Peers talk over an in-process loopback transport, so two or more
/// endpoint security managers can exchange encrypted stanzas inside one
/// tokio runtime without any external infrastructure.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::TestNetwork;
///
/// #[tokio::test]
/// async fn test_ping() -> anyhow::Result<()> {
///     let mut net = TestNetwork::new();
///
///     let alice = net.add_peer("alice@example.org/phone")?;
///     let bob = net.add_peer("bob@example.org/meter")?;
///     net.befriend_all();
///
///     // Alice learns Bob's endpoints and Bob learns hers
///     alice.security().synchronize(&bob.address()).await?;
///
///     net.shutdown();
///     Ok(())
/// }
/// ```
mod loopback;
mod network;
mod peer;

pub use loopback::{LoopbackTransport, RequestHandler};
pub use network::TestNetwork;
pub use peer::TestPeer;
