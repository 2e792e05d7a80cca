use std::net::SocketAddr;
use std::time::Duration;

use cohort_context::RequestContext;
use cohort_node::{
    ChannelTransport,
    CohortNode,
    CohortNodeBuilder,
    ConnectionConfig,
    MemberId,
    MembershipSettings,
    LEADER_ROLE,
};
use cohort_replication::test_utils::MemTransactionLog;
use cohort_replication::{
    CommitError,
    CommitNetwork,
    Conflict,
    ReplicationExtension,
    Transaction,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

fn settings() -> MembershipSettings {
    MembershipSettings {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(600),
        fail_threshold: Duration::from_secs(1),
        round_timeout: Duration::from_millis(500),
        join_retry_interval: Duration::from_millis(250),
        max_backoff: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn connect(
    transport: &ChannelTransport,
    id: u64,
    addr: SocketAddr,
    seeds: Vec<SocketAddr>,
) -> anyhow::Result<CohortNode> {
    let node = CohortNodeBuilder::new(MemberId::new(id), ConnectionConfig::new(addr, addr, seeds))
        .with_cluster_name("test-cluster")
        .with_settings(settings())
        .connect(transport)
        .await?;
    Ok(node)
}

async fn wait_for_leader(node: &CohortNode, num_members: usize) {
    node.wait_for_members(
        |config| {
            config.members().len() == num_members
                && config.role_holder(LEADER_ROLE) == Some(MemberId::new(1))
        },
        WAIT_TIMEOUT,
    )
    .await
    .expect("Leader should be elected within timeout.");
}

#[tokio::test(start_paused = true)]
async fn test_other_sessions_do_not_make_context_stale() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let addr = test_helper::get_unused_addr();
    let node = connect(&transport, 1, addr, vec![addr]).await?;
    wait_for_leader(&node, 1).await;

    let replication = node
        .add_extension(ReplicationExtension::new(
            MemTransactionLog::with_transactions(100),
            CommitNetwork::default(),
        ))
        .await?;
    let log = replication.service().log().clone();

    // The session last saw tx 100 and is about to send its 7th event.
    let checksum = log.checksum_at(100).expect("Checksum should exist.");
    let session = replication.session_from(42, 100, checksum);
    let context = session.tracker().context_for_event(7);

    let other = replication.session(43);
    for n in 0..5u8 {
        other.commit(Transaction::new(vec![n])).await?;
    }
    assert_eq!(log.len(), 105);

    let outcome = session
        .commit_with_context(context, Transaction::new(b"CREATE (n)".to_vec()))
        .await?;
    assert_eq!(outcome.tx_id, 106);
    assert!(!outcome.duplicate);
    assert_eq!(session.tracker().last_observed(), 106);

    // A retry of the same event is answered with the original outcome.
    let retried = session
        .commit_with_context(context, Transaction::new(b"CREATE (n)".to_vec()))
        .await?;
    assert!(retried.duplicate);
    assert_eq!(retried.tx_id, 106);
    assert_eq!(retried.checksum, outcome.checksum);
    assert_eq!(log.len(), 106);

    // The next event must build on the session's own write.
    let checksum = log.checksum_at(105).expect("Checksum should exist.");
    let outdated = RequestContext::new(42, node.me().get(), 8, 105, checksum);
    let err = session
        .commit_with_context(outdated, Transaction::new(b"CREATE (m)".to_vec()))
        .await
        .expect_err("Context predating the session's write should be stale.");
    assert!(matches!(
        err,
        CommitError::Conflict(Conflict::Stale {
            observed: 105,
            required: 106
        })
    ));

    let next = session.commit(Transaction::new(b"CREATE (m)".to_vec())).await?;
    assert_eq!(next.tx_id, 107);

    drop(replication);
    node.shutdown().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_follower_commits_are_applied_by_leader() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = ChannelTransport::default();
    let [addr_1, addr_2]: [SocketAddr; 2] = test_helper::get_unused_addrs(2)
        .try_into()
        .expect("Two addresses should be allocated.");

    let node_1 = connect(&transport, 1, addr_1, vec![addr_1]).await?;
    let node_2 = connect(&transport, 2, addr_2, vec![addr_1]).await?;
    wait_for_leader(&node_1, 2).await;
    wait_for_leader(&node_2, 2).await;

    let network = CommitNetwork::default();
    let leader = node_1
        .add_extension(ReplicationExtension::new(
            MemTransactionLog::default(),
            network.clone(),
        ))
        .await?;
    let follower = node_2
        .add_extension(ReplicationExtension::new(
            MemTransactionLog::default(),
            network.clone(),
        ))
        .await?;
    assert!(leader.service().is_leader());
    assert!(!follower.service().is_leader());

    let session = follower.session(1);
    assert_eq!(session.leader_addr(), Some(addr_1));

    let first = session.commit(Transaction::new(b"CREATE (a)".to_vec())).await?;
    let second = session.commit(Transaction::new(b"CREATE (b)".to_vec())).await?;
    assert_eq!((first.tx_id, second.tx_id), (1, 2));
    assert_eq!(second.context.last_applied_tx_id(), 1);

    assert_eq!(leader.service().log().len(), 2);
    assert!(
        follower.service().log().is_empty(),
        "Followers must never apply commits themselves."
    );
    assert_eq!(follower.statistics().num_forwarded(), 2);
    assert_eq!(leader.statistics().num_applied(), 2);

    // The leader's own sessions take the same path.
    let local = leader.session(1).commit(Transaction::new(b"CREATE (c)".to_vec())).await?;
    assert_eq!(local.tx_id, 3);

    drop(follower);
    drop(leader);
    node_1.shutdown().await;
    node_2.shutdown().await;

    Ok(())
}
