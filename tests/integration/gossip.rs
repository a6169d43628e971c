use std::sync::{Arc, Mutex};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  State replication
// ══════════════════════════════════════════════════════════════════════════════

/// A local change reaches the peer with the identical timestamp.
#[tokio::test]
async fn test_state_propagates_with_same_timestamp() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    assert!(a.set_state(true).await);
    let ts = wait_for_agreement(&[&a, &b], true).await?;
    assert_eq!(b.timestamp(), a.timestamp());
    assert!(ts > Timestamp::EPOCH);

    assert!(b.set_state(false).await);
    wait_for_agreement(&[&a, &b], false).await?;
    assert!(a.timestamp() > ts);

    close_all(&[&a, &b]).await;
    Ok(())
}

/// Changes flood the whole mesh from any member.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_floods_mesh() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    let c = start_node(&[&b]).await?;
    wait_for_peer_counts(&[&a, &b, &c], 2).await?;

    c.set_state(true).await;
    wait_for_agreement(&[&a, &b, &c], true).await?;

    close_all(&[&a, &b, &c]).await;
    Ok(())
}

/// Two conflicting writes with one timestamp, injected at different nodes,
/// settle on `true` everywhere.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tie_converges_to_true() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    // Announce ports nobody listens on; these clients never get dialed.
    let to_a = raw_peer(&a, 1).await?;
    let to_b = raw_peer(&b, 2).await?;
    wait_for_peer_counts(&[&a, &b], 2).await?;

    let ts = Timestamp::now();
    let packet_a: Packet = ChangeState::new(false, ts).into();
    let packet_b: Packet = ChangeState::new(true, ts).into();
    let (sent_a, sent_b) = tokio::join!(
        to_a.send_packet(&packet_a),
        to_b.send_packet(&packet_b),
    );
    sent_a?;
    sent_b?;

    let agreed = wait_for_agreement(&[&a, &b], true).await?;
    assert_eq!(agreed, ts);

    to_a.close().await;
    to_b.close().await;
    close_all(&[&a, &b]).await;
    Ok(())
}

/// Older writes arriving late never roll a node back.
#[tokio::test]
async fn test_stale_update_is_ignored() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    a.set_state(true).await;
    let ts = wait_for_agreement(&[&a, &b], true).await?;

    let client = raw_peer(&b, 1).await?;
    let stale = Timestamp::from_nanos(ts.as_nanos() - 1);
    client.send_packet(&ChangeState::new(false, stale).into()).await?;

    // Give B time to process it, then make sure nothing moved.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(a.state() && b.state());
    assert_eq!(b.timestamp(), ts);

    client.close().await;
    close_all(&[&a, &b]).await;
    Ok(())
}

/// A node joining late is handed the current state during the handshake.
#[tokio::test]
async fn test_newcomer_receives_current_state() -> Result<()> {
    let a = start_node(&[]).await?;
    a.set_state(true).await;

    let b = start_node(&[&a]).await?;
    wait_for_agreement(&[&a, &b], true).await?;

    close_all(&[&a, &b]).await;
    Ok(())
}

/// The change handler fires for remote updates, in order.
#[tokio::test]
async fn test_on_change_sees_remote_updates() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    b.on_change(move |value| log.lock().unwrap().push(value));

    a.set_state(true).await;
    wait_for_agreement(&[&a, &b], true).await?;
    a.set_state(false).await;
    wait_for_agreement(&[&a, &b], false).await?;

    assert_eq!(*seen.lock().unwrap(), vec![true, false]);

    close_all(&[&a, &b]).await;
    Ok(())
}
