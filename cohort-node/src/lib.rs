//! The membership core of a cohort cluster.
//!
//! A node joins a cluster through its seeds, keeps the members it can no
//! longer hear from under suspicion and takes part in agreeing on every
//! change to the membership and its elected roles. The agreed
//! configuration is published to any number of readers as immutable
//! snapshots.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cohort_node::{ChannelTransport, CohortNodeBuilder, ConnectionConfig, MemberId};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = ChannelTransport::default();
//! let addr = "127.0.0.1:7000".parse()?;
//! let node = CohortNodeBuilder::new(MemberId::new(1), ConnectionConfig::new(addr, addr, [addr]))
//!     .connect(&transport)
//!     .await?;
//!
//! node.wait_for_members(|config| config.members().len() == 1, Duration::from_secs(5))
//!     .await?;
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod extension;
mod failure_detector;
mod identity;
mod member;
pub mod membership;
mod node;
mod routing;
mod statistics;
pub mod topology;
mod transport;

use std::collections::BTreeSet;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use config::{ConnectionConfig, MembershipSettings, LEADER_ROLE};
pub use error::NodeError;
pub use extension::ClusterExtension;
pub use failure_detector::{FailureDetector, LivenessEvent};
pub use identity::{IdentityStore, IDENTITY_FILE};
pub use member::{MemberId, MemberInfo, MemberStatus};
pub use membership::{ClusterConfiguration, ClusterEvent};
pub use routing::{
    ConnectRandomlyToServerGroup,
    ConnectToRandomMember,
    RolePreference,
    RoutingTable,
    UpstreamStrategy,
};
pub use statistics::ClusterStatistics;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use topology::TopologyStore;
use tracing::info;
pub use transport::{
    ChannelTransport,
    Envelope,
    Socket,
    Transport,
    TransportError,
    DEFAULT_CHANNEL_CAPACITY,
};

use crate::membership::Membership;
use crate::node::{Command, Executor, Published, Subscribers};

pub static DEFAULT_CLUSTER_NAME: &str = "cohort-cluster-unknown";
pub static DEFAULT_DATABASE: &str = "default";

/// The smallest interval the membership timers are checked at.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Build a cohort node using provided settings.
pub struct CohortNodeBuilder {
    member_id: MemberId,
    connection_cfg: ConnectionConfig,
    cluster_name: String,
    database: String,
    groups: BTreeSet<String>,
    settings: MembershipSettings,
}

impl CohortNodeBuilder {
    /// Create a new node builder.
    pub fn new(member_id: MemberId, connection_cfg: ConnectionConfig) -> Self {
        Self {
            member_id,
            connection_cfg,
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            groups: BTreeSet::new(),
            settings: MembershipSettings::default(),
        }
    }

    /// Set the name of the cluster the node belongs to.
    pub fn with_cluster_name(mut self, name: impl Display) -> Self {
        self.cluster_name = name.to_string();
        self
    }

    /// Set the database the node serves.
    pub fn with_database(mut self, database: impl Display) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set the server groups the node belongs to.
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Set custom timings for the membership protocol.
    pub fn with_settings(mut self, settings: MembershipSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Starts the node, bootstrapping a new cluster or joining through the seeds.
    ///
    /// The `member_id` **must be unique** among the live members, a node
    /// reusing the id of a live member is refused and stays joining.
    ///
    /// No seeds need to be live when connecting, the node keeps retrying
    /// to join until one of them answers.
    pub async fn connect(self, transport: &dyn Transport) -> Result<CohortNode, NodeError> {
        self.connection_cfg.validate()?;
        self.settings.validate()?;

        let socket = transport.open(self.connection_cfg.listen_addr).await?;

        let info = MemberInfo::new(self.connection_cfg.public_addr, self.database)
            .with_groups(self.groups);
        let membership = Membership::new(
            self.member_id,
            info.clone(),
            self.cluster_name.clone(),
            self.connection_cfg.seed_nodes.iter().copied(),
            self.settings.clone(),
            Instant::now(),
        );

        let (configuration_tx, configuration_rx) =
            watch::channel(membership.configuration().clone());
        let (status_tx, status_rx) = watch::channel(membership.status());
        let topology = Arc::new(TopologyStore::default());
        let statistics = ClusterStatistics::default();
        let subscribers = Subscribers::default();
        let (commands_tx, commands_rx) = flume::bounded(self.settings.inbound_queue_capacity);

        let published = Published {
            configuration: configuration_tx,
            status: status_tx,
            topology: topology.clone(),
            statistics: statistics.clone(),
            subscribers: subscribers.clone(),
        };

        let tick_interval = (self.settings.heartbeat_interval / 4).max(MIN_TICK_INTERVAL);
        Executor::new(
            membership,
            socket,
            self.connection_cfg.seed_nodes.iter().copied(),
            tick_interval,
            published,
        )
        .spawn(commands_rx, self.settings.inbound_queue_capacity);

        info!(
            member_id = %self.member_id,
            cluster = %self.cluster_name,
            listen_addr = %self.connection_cfg.listen_addr,
            public_addr = %self.connection_cfg.public_addr,
            bootstrap = self.connection_cfg.is_bootstrap(),
            "Cohort node connected."
        );

        Ok(CohortNode {
            handle: CohortHandle {
                me: self.member_id,
                info,
                configuration: configuration_rx,
                status: status_rx,
                topology,
                statistics,
                subscribers,
                event_capacity: self.settings.inbound_queue_capacity,
            },
            commands: commands_tx,
        })
    }
}

/// A running member of a cohort cluster.
///
/// Dropping the node stops its membership executor without leaving the
/// cluster, the rest of the cluster eventually agrees it has failed.
pub struct CohortNode {
    handle: CohortHandle,
    commands: flume::Sender<Command>,
}

impl CohortNode {
    /// Asks the cluster to remove this member, waiting until the removal is agreed.
    pub async fn leave(&self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send_async(Command::Leave(tx))
            .await
            .map_err(|_| NodeError::Shutdown)?;

        rx.await.map_err(|_| NodeError::Shutdown)
    }

    /// Shuts down the node's membership executor.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send_async(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Initialises an extension with this node.
    pub async fn add_extension<E>(&self, extension: E) -> Result<E::Output, E::Error>
    where
        E: ClusterExtension,
    {
        extension.init_extension(self).await
    }

    #[inline]
    /// Creates a handle to the node providing read access to its state.
    pub fn handle(&self) -> CohortHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for CohortNode {
    type Target = CohortHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

#[derive(Clone)]
/// A cheap handle observing the state of a [CohortNode].
pub struct CohortHandle {
    me: MemberId,
    info: MemberInfo,
    configuration: watch::Receiver<Arc<ClusterConfiguration>>,
    status: watch::Receiver<MemberStatus>,
    topology: Arc<TopologyStore<MemberInfo>>,
    statistics: ClusterStatistics,
    subscribers: Subscribers,
    event_capacity: usize,
}

impl CohortHandle {
    #[inline]
    /// The id of the node itself.
    pub fn me(&self) -> MemberId {
        self.me
    }

    #[inline]
    /// The metadata the node advertises to the cluster.
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    #[inline]
    pub fn public_addr(&self) -> SocketAddr {
        self.info.address
    }

    /// The current status of the node.
    pub fn status(&self) -> MemberStatus {
        *self.status.borrow()
    }

    /// The latest configuration the node has adopted.
    pub fn configuration(&self) -> Arc<ClusterConfiguration> {
        self.configuration.borrow().clone()
    }

    /// Returns a handle which observes every configuration the node adopts.
    pub fn configuration_watcher(&self) -> watch::Receiver<Arc<ClusterConfiguration>> {
        self.configuration.clone()
    }

    /// The member currently holding the given role.
    pub fn role_holder(&self, role: &str) -> Option<MemberId> {
        self.configuration.borrow().role_holder(role)
    }

    /// Builds a routing table from the latest configuration.
    pub fn routing_table(&self, ttl: Duration) -> RoutingTable {
        RoutingTable::build(&self.configuration.borrow(), ttl)
    }

    #[inline]
    /// The topology derived from the agreed configuration.
    pub fn topology(&self) -> &TopologyStore<MemberInfo> {
        &self.topology
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.statistics.clone()
    }

    /// Subscribes to the membership events observed by the node.
    ///
    /// Events are never skipped. A subscriber which lags behind by more than
    /// the inbound queue capacity is disconnected instead: it receives the
    /// events queued so far and then sees the channel close, after which it
    /// should resynchronise from [CohortHandle::configuration_watcher] and
    /// subscribe again.
    pub fn subscribe(&self) -> flume::Receiver<ClusterEvent> {
        self.subscribers.subscribe(self.event_capacity)
    }

    /// Waits for the node's configuration to satisfy the predicate.
    pub async fn wait_for_members<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(&ClusterConfiguration) -> bool,
    {
        use tokio::time::timeout;

        timeout(
            timeout_after,
            WatchStream::new(self.configuration.clone())
                .skip_while(|config| !predicate(config.as_ref()))
                .next(),
        )
        .await?;
        Ok(())
    }

    /// Waits for the node to reach the given status.
    pub async fn wait_for_status(
        &self,
        status: MemberStatus,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error> {
        use tokio::time::timeout;

        timeout(
            timeout_after,
            WatchStream::new(self.status.clone())
                .skip_while(|current| *current != status)
                .next(),
        )
        .await?;
        Ok(())
    }
}
