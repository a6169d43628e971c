use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Connection failures
// ══════════════════════════════════════════════════════════════════════════════

/// An unknown packet tag ends that one link; the rest of the mesh keeps
/// working.
#[tokio::test]
async fn test_malformed_tag_drops_only_that_connection() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    let client = raw_peer(&a, 1).await?;
    wait_for_condition(SETTLE, || a.peer_count() == 2).await?;

    client.send(&[0x03]).await?;
    let ended = drain_until_closed(&client).await?;
    assert!(matches!(ended, ConnectionError::ShortRead), "{ended}");

    wait_for_condition(SETTLE, || a.peer_count() == 1).await?;
    assert_eq!(b.peer_count(), 1);

    a.set_state(true).await;
    wait_for_agreement(&[&a, &b], true).await?;

    close_all(&[&a, &b]).await;
    Ok(())
}

/// A peer that closes is removed on the other side.
#[tokio::test]
async fn test_closed_peer_is_removed() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    let c = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b, &c], 2).await?;

    c.close().await;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    close_all(&[&a, &b]).await;
    Ok(())
}

/// An inbound connection that never sends its listen port is dropped after
/// the handshake timeout and never registered.
#[tokio::test]
async fn test_silent_inbound_times_out() -> Result<()> {
    let mut config = NodeConfig::local(0);
    config.handshake_timeout = Duration::from_millis(200);
    let a = Node::start(config).await?;

    let mut stream = tokio::net::TcpStream::connect(a.local_addr()).await?;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(SETTLE, stream.read(&mut buf))
        .await
        .context("silent connection was never dropped")?;
    // EOF or reset, either way nothing was sent.
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(a.peer_count(), 0);

    a.close().await;
    Ok(())
}

/// A peer hanging up mid-preamble is never registered.
#[tokio::test]
async fn test_truncated_preamble_is_dropped() -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let a = start_node(&[]).await?;
    let mut stream = tokio::net::TcpStream::connect(a.local_addr()).await?;
    stream.write_all(&[0x20]).await?;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.peer_count(), 0);

    a.close().await;
    Ok(())
}

/// Announcing a node's own address back to it never produces a self-link.
#[tokio::test]
async fn test_self_announcement_is_ignored() -> Result<()> {
    let a = start_node(&[]).await?;
    let client = raw_peer(&a, 1).await?;
    wait_for_condition(SETTLE, || a.peer_count() == 1).await?;

    let own = Peer::parse(LOCALHOST, &a.listen_port().to_string())?;
    client.send_packet(&AddPeer { peer: own }.into()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.peer_count(), 1);
    assert!(!a.peers().contains(&own));

    let err = a.connect_peer(own).await.unwrap_err();
    assert!(matches!(err, NodeError::SelfConnect(_)), "{err}");

    client.close().await;
    a.close().await;
    Ok(())
}
