use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Mesh formation
// ══════════════════════════════════════════════════════════════════════════════

fn peer_of(node: &Node) -> Peer {
    Peer::parse(LOCALHOST, &node.listen_port().to_string()).unwrap()
}

/// A alone, B seeded with A, C seeded with B. C learns about A through B's
/// introduction and everyone ends up linked to everyone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_form_full_mesh() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    let c = start_node(&[&b]).await?;

    wait_for_peer_counts(&[&a, &b, &c], 2).await?;

    let mut a_peers = a.peers();
    a_peers.sort();
    let mut expected = vec![peer_of(&b), peer_of(&c)];
    expected.sort();
    assert_eq!(a_peers, expected);
    assert!(c.peers().contains(&peer_of(&a)), "C never linked to A");

    close_all(&[&a, &b, &c]).await;
    Ok(())
}

/// The six-node bootstrap layout: each node seeds with one or two earlier
/// nodes and the whole set converges to a full mesh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_six_node_bootstrap() -> Result<()> {
    let seeds: [&[usize]; 6] = [&[], &[0], &[0, 1], &[0, 2], &[1, 3], &[0, 2]];
    let mut nodes: Vec<Node> = Vec::new();

    for (i, seed_ids) in seeds.iter().enumerate() {
        let seed_nodes: Vec<&Node> = seed_ids.iter().map(|&s| &nodes[s]).collect();
        let node = start_node(&seed_nodes).await?;
        nodes.push(node);

        // Settle before the next join so its seeds know everyone.
        let all: Vec<&Node> = nodes.iter().collect();
        wait_for_peer_counts(&all, i).await?;
    }

    let all: Vec<&Node> = nodes.iter().collect();
    wait_for_peer_counts(&all, 5).await?;
    close_all(&all).await;
    Ok(())
}

/// Reconnecting to a peer that is already registered is refused and leaves
/// the registry unchanged.
#[tokio::test]
async fn test_duplicate_connect_is_refused() -> Result<()> {
    let a = start_node(&[]).await?;
    let b = start_node(&[&a]).await?;
    wait_for_peer_counts(&[&a, &b], 1).await?;

    let err = b
        .connect(LOCALHOST, &a.listen_port().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::AlreadyConnected(_)), "{err}");
    assert_eq!(b.peer_count(), 1);

    close_all(&[&a, &b]).await;
    Ok(())
}

/// An unreachable first seed stops bootstrap under the default policy but is
/// skipped under `TryAll`.
#[tokio::test]
async fn test_seed_policy() -> Result<()> {
    let a = start_node(&[]).await?;
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };

    let stop_first = NodeConfig::local(0)
        .with_seed(LOCALHOST, dead_port.to_string())
        .with_seed(LOCALHOST, a.listen_port().to_string());
    let err = Node::start(stop_first.clone()).await.unwrap_err();
    assert!(matches!(err, NodeError::NoPeersReachable), "{err}");

    let b = Node::start(stop_first.with_seed_policy(SeedPolicy::TryAll)).await?;
    assert_eq!(b.peers(), vec![peer_of(&a)]);

    close_all(&[&a, &b]).await;
    Ok(())
}

/// A malformed seed entry is skipped without aborting bootstrap.
#[tokio::test]
async fn test_invalid_seed_is_skipped() -> Result<()> {
    let a = start_node(&[]).await?;
    let config = NodeConfig::local(0)
        .with_seed("not-an-address", "2020")
        .with_seed(LOCALHOST, a.listen_port().to_string());
    let b = Node::start(config).await?;
    assert_eq!(b.peer_count(), 1);

    close_all(&[&a, &b]).await;
    Ok(())
}
