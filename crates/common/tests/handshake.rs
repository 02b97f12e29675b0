//! End-to-end handshake, encrypted exchange and teardown over the loopback network

mod common;

use std::time::Duration;

use ::common::security::{E2ePolicy, Envelope, IqResponse, PeerEvent, SecurityError, SendOutcome};
use ::common::stanza::{Element, ErrorCondition, Iq, MessageType};
use ::common::testkit::TestNetwork;

use crate::common::{counted_registry, init_tracing, ping, pong, test_config, CountedCapability};

#[tokio::test]
async fn test_synchronize_then_encrypted_ping() -> anyhow::Result<()> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("meter@example.org/basement")?;
    net.befriend_all();
    bob.serve(|iq| Some(Iq::result_for(&iq, Some(pong()))));

    let record = alice.security().synchronize(&bob.address()).await?;
    assert!(record.e2e);
    assert!(!record.p2p);
    assert!(alice.security().contains_peer(&bob.address())?);
    assert!(bob.security().contains_peer(&alice.address())?);

    let response = alice
        .security()
        .send_iq_get(&bob.address(), ping(), E2ePolicy::RequireE2E)
        .await?;
    match response {
        IqResponse::Result {
            from,
            payload,
            encrypted,
        } => {
            assert_eq!(from, bob.address());
            assert_eq!(payload, Some(pong()));
            assert!(encrypted);
        }
        other => panic!("unexpected response {:?}", other),
    }

    // the request itself never crossed the wire in the clear
    let sent = alice.transport().sent_requests();
    let last = sent.last().unwrap();
    assert!(Envelope::is_envelope(last.payload.as_ref().unwrap()));
    assert_eq!(alice.transport().requests_named("synchronize"), 1);

    net.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_awaitable_request() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("meter@example.org/basement")?;
    net.befriend_all();
    bob.serve(|iq| Some(Iq::result_for(&iq, Some(pong()))));

    // no prior handshake: the first attempt synchronizes on its own
    let payload = alice
        .security()
        .iq_set(&bob.address(), ping(), E2ePolicy::RequireE2E)
        .await?;
    assert_eq!(payload, Some(pong()));
    assert_eq!(alice.transport().requests_named("synchronize"), 1);
    Ok(())
}

#[tokio::test]
async fn test_encrypted_message_delivery() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();
    alice.security().synchronize(&bob.address()).await?;

    let body = Element::new("body", "jabber:client").with_text("hello bob");
    let outcome = alice
        .security()
        .send_message(
            E2ePolicy::RequireE2E,
            MessageType::Chat,
            &bob.address(),
            vec![body.clone()],
        )
        .await?;
    assert_eq!(outcome, SendOutcome::Encrypted(vec![bob.address()]));

    let wire = alice.transport().sent_messages();
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].kind, MessageType::Normal);
    assert!(Envelope::is_envelope(&wire[0].payload[0]));

    let received = bob.next_message(Duration::from_secs(1)).await.unwrap();
    assert_eq!(received.kind, MessageType::Chat);
    assert_eq!(received.from, alice.address());
    assert_eq!(received.payload, vec![body]);
    Ok(())
}

#[tokio::test]
async fn test_presence_bundle_teaches_endpoints() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    let mut events = bob.security().subscribe();

    alice.announce().await?;
    assert!(bob.security().contains_peer(&alice.address())?);
    assert_eq!(
        events.try_recv()?,
        PeerEvent::Available {
            peer: alice.address(),
            e2e: true,
            p2p: false,
        }
    );

    // departure is reported but the cached endpoints stay
    alice.depart().await?;
    assert_eq!(
        events.try_recv()?,
        PeerEvent::Unavailable {
            peer: alice.address()
        }
    );
    assert!(bob.security().contains_peer(&alice.address())?);

    // our own presence is ignored
    assert!(!alice.security().contains_peer(&alice.address())?);
    Ok(())
}

#[tokio::test]
async fn test_synchronize_emits_updates_on_both_sides() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();
    let mut alice_events = alice.security().subscribe();
    let mut bob_events = bob.security().subscribe();

    alice.security().synchronize(&bob.address()).await?;
    assert_eq!(
        alice_events.try_recv()?,
        PeerEvent::Updated {
            peer: bob.address(),
            e2e: true,
            p2p: false,
        }
    );
    assert_eq!(
        bob_events.try_recv()?,
        PeerEvent::Updated {
            peer: alice.address(),
            e2e: true,
            p2p: false,
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_strangers_cannot_synchronize() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let mallory = net.add_peer("mallory@evil.example/x")?;

    let result = mallory.security().synchronize(&alice.address()).await;
    assert!(matches!(
        result,
        Err(SecurityError::Stanza(ref e)) if e.condition == ErrorCondition::NotAuthorized
    ));
    assert!(!alice.security().contains_peer(&mallory.address())?);
    assert!(!mallory.security().contains_peer(&alice.address())?);
    Ok(())
}

#[tokio::test]
async fn test_own_account_may_synchronize() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let phone = net.add_peer("alice@example.org/phone")?;
    let laptop = net.add_peer("alice@example.org/laptop")?;

    phone.security().synchronize(&laptop.address()).await?;
    assert!(laptop.security().contains_peer(&phone.address())?);
    Ok(())
}

#[tokio::test]
async fn test_dispose_tears_down() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();
    bob.security().synchronize(&alice.address()).await?;
    assert!(alice.transport().handler_count() > 0);

    alice.security().dispose();
    assert!(alice.security().is_disposed());
    assert_eq!(alice.transport().handler_count(), 0);

    assert!(matches!(
        alice.security().local_endpoints(),
        Err(SecurityError::Disposed)
    ));
    assert!(matches!(
        alice.security().generate_new_key(),
        Err(SecurityError::Disposed)
    ));
    assert!(matches!(
        alice
            .security()
            .send_message(E2ePolicy::NormalIfNotE2E, MessageType::Chat, &bob.address(), vec![])
            .await,
        Err(SecurityError::Disposed)
    ));
    assert!(matches!(
        alice.security().synchronize(&bob.address()).await,
        Err(SecurityError::Disposed)
    ));
    // disposing twice is harmless
    alice.security().dispose();

    // bob still reaches the transport, but nothing there decrypts any more
    let response = bob
        .security()
        .send_iq_get(&alice.address(), ping(), E2ePolicy::RequireE2E)
        .await?;
    assert!(matches!(
        response,
        IqResponse::Error { ref error, .. } if error.condition == ErrorCondition::ServiceUnavailable
    ));
    Ok(())
}

#[tokio::test]
async fn test_signatures_verify_against_cached_endpoints() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();

    let data = b"firmware v2.1";
    let (reference, signature) = alice.security().sign(data)?.unwrap();

    // bob has not learned alice's endpoints yet
    assert!(!bob
        .security()
        .verify(&alice.address(), Some(&reference), data, &signature)?);

    bob.security().synchronize(&alice.address()).await?;
    assert!(bob
        .security()
        .verify(&alice.address(), Some(&reference), data, &signature)?);
    assert!(!bob
        .security()
        .verify(&alice.address(), Some(&reference), b"firmware v6.6", &signature)?);

    // alice checks her own signature against her own public endpoints
    assert!(alice
        .security()
        .verify(&alice.address(), Some(&reference), data, &signature)?);
    Ok(())
}

#[tokio::test]
async fn test_local_endpoint_lookups() -> anyhow::Result<()> {
    let mut net = TestNetwork::new();
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();
    alice.security().synchronize(&bob.address()).await?;

    let local = alice.security().local_endpoints()?;
    assert_eq!(local.len(), 3);
    assert!(local.iter().all(|e| e.has_private_key()));

    let by_name = alice
        .security()
        .find_local_endpoint_by_name("x25519", Some("urn:ieee:iot:e2e:1.0"))?
        .unwrap();
    assert_eq!(by_name.id().local_name, "x25519");
    assert!(alice
        .security()
        .find_local_endpoint_by_name("x25519", Some(""))?
        .is_some());
    assert!(alice
        .security()
        .find_local_endpoint_by_name("rsa", None)?
        .is_none());

    let remote = alice.security().peer_endpoints(&bob.address())?.unwrap();
    for endpoint in remote.iter() {
        assert!(!endpoint.has_private_key());
        let matching = alice.security().find_local_endpoint(endpoint)?.unwrap();
        assert!(matching.same_algorithm(endpoint));
    }

    // our own address resolves to the public half of the local set
    let own = alice.security().peer_endpoints(&alice.address())?.unwrap();
    assert_eq!(own.len(), 3);
    assert!(own.iter().all(|e| !e.has_private_key()));
    Ok(())
}

#[tokio::test]
async fn test_ping_pong_then_every_endpoint_disposed_once() -> anyhow::Result<()> {
    let capability = CountedCapability::new("counted", 128);
    let mut net = TestNetwork::with_registry(counted_registry(&capability), test_config());
    let alice = net.add_peer("alice@example.org/phone")?;
    let bob = net.add_peer("bob@example.org/laptop")?;
    net.befriend_all();
    bob.serve(|iq| Some(Iq::result_for(&iq, Some(pong()))));
    assert_eq!(capability.created(), 2);

    alice.security().synchronize(&bob.address()).await?;
    let response = alice
        .security()
        .send_iq_get(&bob.address(), ping(), E2ePolicy::RequireE2E)
        .await?;
    assert_eq!(
        response,
        IqResponse::Result {
            from: bob.address(),
            payload: Some(pong()),
            encrypted: true,
        }
    );
    let channel = alice.security().channel(&bob.address()).unwrap();
    assert_eq!(channel.local.id().local_name, "counted");
    drop(channel);
    assert_eq!(capability.live(), 2);
    assert_eq!(capability.disposed(), 0);

    net.shutdown();
    assert!(alice.security().is_disposed());
    assert!(bob.security().is_disposed());
    assert_eq!(capability.live(), 0);
    assert_eq!(capability.disposed(), capability.created());
    Ok(())
}
