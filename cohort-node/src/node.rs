use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::membership::{ClusterConfiguration, ClusterEvent, ClusterMessage, Membership, Output};
use crate::statistics::ClusterStatistics;
use crate::topology::TopologyStore;
use crate::transport::{Envelope, Socket};
use crate::{MemberInfo, MemberStatus};

/// The capacity of the queue of messages waiting to be sent to a single member.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A request from a node handle to its membership executor.
pub(crate) enum Command {
    /// Leave the cluster, notifying the sender once the leave was agreed.
    Leave(oneshot::Sender<()>),
    /// Stop the executor, notifying the sender once it has stopped.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Default)]
/// The listeners of a node's [ClusterEvent]s.
pub(crate) struct Subscribers(Arc<Mutex<Vec<flume::Sender<ClusterEvent>>>>);

impl Subscribers {
    pub(crate) fn subscribe(&self, capacity: usize) -> flume::Receiver<ClusterEvent> {
        let (tx, rx) = flume::bounded(capacity);
        self.0.lock().push(tx);
        rx
    }

    fn publish(&self, event: ClusterEvent) {
        self.0.lock().retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    // Subscribers never observe a gap in the stream.
                    warn!(event = ?event, "Subscriber is lagging behind, disconnecting it.");
                    false
                },
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

/// The watch channels the executor publishes its state over.
pub(crate) struct Published {
    pub(crate) configuration: watch::Sender<Arc<ClusterConfiguration>>,
    pub(crate) status: watch::Sender<MemberStatus>,
    pub(crate) topology: Arc<TopologyStore<MemberInfo>>,
    pub(crate) statistics: ClusterStatistics,
    pub(crate) subscribers: Subscribers,
}

/// Runs the membership protocol of a node.
///
/// Every input is applied to the state machine from this single task,
/// sends are handed to one worker per target so the executor never awaits
/// the network.
pub(crate) struct Executor {
    membership: Membership,
    socket: Arc<dyn Socket>,
    seeds: BTreeSet<SocketAddr>,
    tick_interval: Duration,
    published: Published,
    /// The last configuration published, a diverged history may be replaced
    /// at the same version.
    last_published: Option<Arc<ClusterConfiguration>>,
    outbound: HashMap<SocketAddr, flume::Sender<ClusterMessage>>,
    connection_lost_tx: flume::Sender<SocketAddr>,
    connection_lost_rx: flume::Receiver<SocketAddr>,
    leave_waiters: Vec<oneshot::Sender<()>>,
}

impl Executor {
    pub(crate) fn new(
        membership: Membership,
        socket: Arc<dyn Socket>,
        seeds: impl IntoIterator<Item = SocketAddr>,
        tick_interval: Duration,
        published: Published,
    ) -> Self {
        let (connection_lost_tx, connection_lost_rx) = flume::unbounded();

        Self {
            membership,
            socket,
            seeds: seeds.into_iter().collect(),
            tick_interval,
            published,
            last_published: None,
            outbound: HashMap::new(),
            connection_lost_tx,
            connection_lost_rx,
            leave_waiters: Vec::new(),
        }
    }

    /// Spawns the executor along with the task reading the node's socket.
    pub(crate) fn spawn(
        self,
        commands: flume::Receiver<Command>,
        inbound_capacity: usize,
    ) -> JoinHandle<()> {
        let (inbound_tx, inbound_rx) = flume::bounded(inbound_capacity);
        let reader = tokio::spawn(read_socket(self.socket.clone(), inbound_tx));

        tokio::spawn(async move {
            self.run(inbound_rx, commands).await;
            reader.abort();
        })
    }

    async fn run(
        mut self,
        inbound: flume::Receiver<Envelope>,
        commands: flume::Receiver<Command>,
    ) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.membership.start(Instant::now());
        self.flush();

        let mut shutdown = None;
        loop {
            tokio::select! {
                envelope = inbound.recv_async() => {
                    let Ok((from, message)) = envelope else {
                        warn!(
                            member_id = %self.membership.me(),
                            "Socket has been closed, stopping membership executor."
                        );
                        break;
                    };

                    trace!(from = %from, message = ?message, "Received message.");
                    self.membership.handle_message(from, message, Instant::now());
                },
                Ok(addr) = self.connection_lost_rx.recv_async() => {
                    self.membership.connection_lost(addr, Instant::now());
                },
                command = commands.recv_async() => {
                    match command {
                        Ok(Command::Leave(tx)) => {
                            self.leave_waiters.push(tx);
                            self.membership.leave(Instant::now());
                        },
                        Ok(Command::Shutdown(tx)) => {
                            shutdown = Some(tx);
                            break;
                        },
                        Err(_) => {
                            debug!("All node handles have been dropped, stopping membership executor.");
                            break;
                        },
                    }
                },
                _ = ticker.tick() => {
                    self.membership.tick(Instant::now());
                },
            }

            self.flush();
        }

        info!(member_id = %self.membership.me(), "Membership executor has stopped.");

        // Dropping the queues stops the outbound workers once they drain.
        self.outbound.clear();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
    }

    /// Performs every output of the state machine and publishes the new state.
    fn flush(&mut self) {
        for output in self.membership.take_outputs() {
            match output {
                Output::Send { to, message } => self.send(to, message),
                Output::Event(event) => self.published.subscribers.publish(event),
            }
        }

        self.publish_state();

        if self.membership.status() == MemberStatus::Left {
            for tx in self.leave_waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    fn send(&mut self, to: SocketAddr, message: ClusterMessage) {
        let message = match self.outbound.get(&to) {
            Some(tx) => match tx.try_send(message) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(_)) => {
                    warn!(target_addr = %to, "Outbound queue is full, dropping message.");
                    return;
                },
                Err(flume::TrySendError::Disconnected(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = flume::bounded(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(send_worker(
            self.socket.clone(),
            to,
            rx,
            self.connection_lost_tx.clone(),
        ));

        // The queue was just created so this cannot fail.
        let _ = tx.try_send(message);
        self.outbound.insert(to, tx);
    }

    fn publish_state(&mut self) {
        let me = self.membership.me();
        let config = self.membership.configuration().clone();
        let status = self.membership.status();

        let is_new = self
            .last_published
            .as_ref()
            .map(|published| !Arc::ptr_eq(published, &config))
            .unwrap_or(true);
        if is_new {
            self.last_published = Some(config.clone());
            self.published.configuration.send_replace(config.clone());

            let difference = self.published.topology.apply(config.topology());
            for member in difference.added.iter() {
                info!(
                    self_member_id = %me,
                    target_member_id = %member.member,
                    target_addr = %member.info.address,
                    "Member has joined the cluster."
                );
            }
            for member in difference.removed.iter() {
                info!(
                    self_member_id = %me,
                    target_member_id = %member.member,
                    target_addr = %member.info.address,
                    "Member is no longer part of cluster."
                );
            }
            for member in difference.updated.iter() {
                debug!(
                    self_member_id = %me,
                    target_member_id = %member.member,
                    "Member information has changed."
                );
            }

            let seeds = &self.seeds;
            self.outbound.retain(|addr, _| {
                seeds.contains(addr)
                    || config.members().values().any(|info| info.address == *addr)
            });
        }

        if *self.published.status.borrow() != status {
            self.published.status.send_replace(status);
        }

        let num_suspected = self.membership.suspected_members().len() as u64;
        let num_members = config.members().len() as u64;
        let statistics = &self.published.statistics;
        statistics
            .num_live_members
            .store(num_members.saturating_sub(num_suspected), Ordering::Relaxed);
        statistics
            .num_suspected_members
            .store(num_suspected, Ordering::Relaxed);
        statistics
            .num_failed_members
            .store(config.failed().len() as u64, Ordering::Relaxed);
        statistics
            .configuration_version
            .store(config.version(), Ordering::Relaxed);
        statistics
            .num_abandoned_rounds
            .store(self.membership.abandoned_rounds(), Ordering::Relaxed);
    }
}

/// Moves messages from the socket into the executor's bounded inbound queue.
async fn read_socket(socket: Arc<dyn Socket>, inbound: flume::Sender<Envelope>) {
    loop {
        let envelope = match socket.recv().await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = ?e, "Failed to receive message from socket.");
                break;
            },
        };

        if inbound.send_async(envelope).await.is_err() {
            break;
        }
    }
}

/// Sends the queued messages for a single member in order.
async fn send_worker(
    socket: Arc<dyn Socket>,
    to: SocketAddr,
    queue: flume::Receiver<ClusterMessage>,
    connection_lost: flume::Sender<SocketAddr>,
) {
    while let Ok(message) = queue.recv_async().await {
        if let Err(e) = socket.send(to, message).await {
            debug!(target_addr = %to, error = %e, "Failed to deliver message.");
            let _ = connection_lost.send_async(to).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemberId;

    #[test]
    fn test_lagging_subscriber_is_disconnected() {
        let subscribers = Subscribers::default();
        let lagging = subscribers.subscribe(1);
        let keeping_up = subscribers.subscribe(8);

        for id in 1..=3 {
            subscribers.publish(ClusterEvent::Suspected {
                member: MemberId::new(id),
            });
        }

        assert_eq!(
            lagging.try_recv(),
            Ok(ClusterEvent::Suspected {
                member: MemberId::new(1)
            })
        );
        assert_eq!(lagging.try_recv(), Err(flume::TryRecvError::Disconnected));
        assert_eq!(subscribers.0.lock().len(), 1);

        let received = keeping_up.try_iter().collect::<Vec<_>>();
        assert_eq!(received.len(), 3);
        assert_eq!(
            received[2],
            ClusterEvent::Suspected {
                member: MemberId::new(3)
            }
        );
    }
}
