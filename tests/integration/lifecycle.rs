use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Startup & shutdown
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_listen_failed_on_occupied_port() -> Result<()> {
    let a = start_node(&[]).await?;
    let err = Node::start(NodeConfig::local(a.listen_port()))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ListenFailed { .. }), "{err}");

    a.close().await;
    Ok(())
}

#[tokio::test]
async fn test_no_peers_reachable() -> Result<()> {
    let a = start_node(&[]).await?;
    let port = a.listen_port();
    a.close().await;

    let err = Node::start(NodeConfig::local(0).with_seed(LOCALHOST, port.to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::NoPeersReachable), "{err}");
    Ok(())
}

/// Closing twice (and concurrently) is harmless, and peers notice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_idempotent() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    let a2 = a.clone();
    tokio::join!(a.close(), a2.close());
    a.close().await;
    assert_eq!(a.status(), NodeState::Closed);
    assert_eq!(a.peer_count(), 0);

    wait_for_condition(SETTLE, || b.peer_count() == 0).await?;

    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_status_transitions() -> Result<()> {
    let a = start_node(&[]).await?;
    let mut status = a.subscribe_status();
    assert_eq!(*status.borrow(), NodeState::Running);

    let closer = a.clone();
    let closing = tokio::spawn(async move { closer.close().await });

    status
        .wait_for(|s| *s == NodeState::Closed)
        .await
        .context("status channel dropped")?;
    closing.await?;
    a.wait_closed().await;
    Ok(())
}

/// A closed node no longer accepts connections.
#[tokio::test]
async fn test_closed_node_stops_listening() -> Result<()> {
    let a = start_node(&[]).await?;
    let addr = a.local_addr();
    a.close().await;

    let dialed = Connection::dial(addr, std::time::Duration::from_secs(2)).await;
    assert!(dialed.is_err(), "listener still accepting");
    Ok(())
}
