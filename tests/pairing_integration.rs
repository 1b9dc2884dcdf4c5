mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;
use tokio::time::{sleep, timeout, Duration};

use clipmesh::sync::ConnectionState;
use common::{connected_pair, next_token, states_until, TestNode, WAIT};

#[tokio::test]
async fn test_trusted_peers_connect() -> Result<()> {
    let a = TestNode::start("node-a").await?;
    let b = TestNode::start("node-b").await?;
    a.trust_mutually(&b).await?;
    a.discover(&b).await;
    assert_eq!(a.node.manager().pairing_candidates().len(), 1);

    let mut a_events = a.node.subscribe();
    let mut b_events = b.node.subscribe();
    a.node.manager().add_peer("node-b").await?;

    let states = states_until(&mut a_events, "node-b", ConnectionState::Connected).await?;
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert!(a.node.manager().pairing_candidates().is_empty());

    // The responder starts tracking the initiator on its own
    states_until(&mut b_events, "node-a", ConnectionState::Connected).await?;
    let peers = b.node.manager().peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].device_name, "device-node-a");

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_token_pairing() -> Result<()> {
    let a = TestNode::start("node-a").await?;
    let b = TestNode::start("node-b").await?;
    a.discover(&b).await;

    let mut a_events = a.node.subscribe();
    let mut b_events = b.node.subscribe();
    a.node.manager().add_peer("node-b").await?;

    states_until(&mut a_events, "node-b", ConnectionState::Unverified).await?;
    let token = next_token(&mut b_events, "node-a").await?;

    // A wrong token leaves the peer unverified
    assert!(a
        .node
        .manager()
        .trust_by_token("node-b", "not-the-token")
        .await
        .is_err());
    assert_eq!(a.state_of("node-b").await, Some(ConnectionState::Unverified));

    let state = a.node.manager().trust_by_token("node-b", &token).await?;
    assert_eq!(state, ConnectionState::Connected);
    states_until(&mut b_events, "node-a", ConnectionState::Connected).await?;

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_removed_peer_must_pair_again() -> Result<()> {
    let (a, b) = connected_pair().await?;
    let mut b_events = b.node.subscribe();

    a.node.manager().remove_handler("node-b").await?;
    assert!(a.node.manager().handler("node-b").await.is_none());
    assert!(!a.node.channel().has_session("node-b").await?);
    assert_eq!(a.node.manager().pairing_candidates().len(), 1);

    states_until(&mut b_events, "node-a", ConnectionState::Unverified).await?;
    assert!(!b.node.channel().has_session("node-a").await?);

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_blocked_peer_is_not_tracked() -> Result<()> {
    let a = TestNode::start("node-a").await?;
    let b = TestNode::start("node-b").await?;
    a.trust_mutually(&b).await?;
    a.discover(&b).await;

    b.node.manager().block("node-a").await?;
    let mut a_events = a.node.subscribe();
    a.node.manager().add_peer("node-b").await?;

    // The session is accepted, but the responder never starts tracking
    states_until(&mut a_events, "node-b", ConnectionState::Connected).await?;
    sleep(Duration::from_millis(300)).await;
    assert!(b.node.manager().handler("node-a").await.is_none());
    assert_eq!(b.node.manager().blocked().await, vec!["node-a".to_string()]);

    a.node.shutdown().await;
    b.node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_exit_notice_disconnects_peer() -> Result<()> {
    let (a, b) = connected_pair().await?;
    let mut b_events = b.node.subscribe();

    a.node.shutdown().await;
    states_until(&mut b_events, "node-a", ConnectionState::Disconnected).await?;

    let state = timeout(WAIT, b.node.manager().resolve_sync("node-a")).await??;
    assert_eq!(state, ConnectionState::Disconnected);

    b.node.shutdown().await;
    Ok(())
}
