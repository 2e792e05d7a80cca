use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, trace};

use crate::membership::ClusterMessage;

/// A message together with the address of the member which sent it.
pub type Envelope = (SocketAddr, ClusterMessage);

/// The default capacity of each in-memory socket's queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("The address {0} is already in use.")]
    /// Another socket is already bound to the address.
    AddrInUse(SocketAddr),

    #[error("The member at {0} is unreachable.")]
    /// The message could not be delivered to the target.
    Unreachable(SocketAddr),

    #[error("The socket has been closed.")]
    Closed,

    #[error("{0}")]
    IO(#[from] io::Error),
}

#[async_trait]
/// Delivers membership messages between members.
///
/// Messages between two members are expected to arrive in the order they
/// were sent, the encoding and framing is left to the implementation.
pub trait Transport: Send + Sync + 'static {
    /// Binds a new socket to the given address.
    async fn open(
        &self,
        listen_addr: SocketAddr,
    ) -> Result<Arc<dyn Socket>, TransportError>;
}

#[async_trait]
/// A bound endpoint of a [Transport].
pub trait Socket: Send + Sync + 'static {
    /// The address the socket is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Sends a message to the socket bound to `to`.
    async fn send(
        &self,
        to: SocketAddr,
        message: ClusterMessage,
    ) -> Result<(), TransportError>;

    /// Waits for the next message addressed to this socket.
    async fn recv(&self) -> Result<Envelope, TransportError>;
}

#[derive(Clone, Default)]
/// An in-memory transport connecting every socket opened through it.
///
/// Sockets can be cut off from the rest of the network with
/// [ChannelTransport::isolate] to simulate partitions.
pub struct ChannelTransport(Arc<ChannelTransportInner>);

impl Deref for ChannelTransport {
    type Target = ChannelTransportInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Default)]
pub struct ChannelTransportInner {
    /// The open sockets, tagged with the generation they were opened in.
    sockets: Mutex<HashMap<SocketAddr, (u64, flume::Sender<Envelope>)>>,
    isolated: Mutex<HashSet<SocketAddr>>,
    generation: AtomicU64,
}

impl ChannelTransportInner {
    /// Drops all messages sent from or to the given address.
    pub fn isolate(&self, addr: SocketAddr) {
        info!(addr = %addr, "Isolating socket from the network.");
        self.isolated.lock().insert(addr);
    }

    /// Reconnects a previously isolated address.
    pub fn heal(&self, addr: SocketAddr) {
        info!(addr = %addr, "Reconnecting socket to the network.");
        self.isolated.lock().remove(&addr);
    }

    pub fn is_isolated(&self, addr: SocketAddr) -> bool {
        self.isolated.lock().contains(&addr)
    }

    fn route(
        &self,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<flume::Sender<Envelope>, TransportError> {
        {
            let isolated = self.isolated.lock();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(TransportError::Unreachable(to));
            }
        }

        self.sockets
            .lock()
            .get(&to)
            .map(|(_, tx)| tx)
            .filter(|tx| !tx.is_disconnected())
            .cloned()
            .ok_or(TransportError::Unreachable(to))
    }

    /// Whether a live socket is bound to the given address.
    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.sockets
            .lock()
            .get(&addr)
            .map(|(_, tx)| !tx.is_disconnected())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(
        &self,
        listen_addr: SocketAddr,
    ) -> Result<Arc<dyn Socket>, TransportError> {
        let (tx, rx) = flume::bounded(DEFAULT_CHANNEL_CAPACITY);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut sockets = self.sockets.lock();
            if let Some((_, existing)) = sockets.get(&listen_addr) {
                if !existing.is_disconnected() {
                    return Err(TransportError::AddrInUse(listen_addr));
                }
            }
            sockets.insert(listen_addr, (generation, tx));
        }

        trace!(
            listen_addr = %listen_addr,
            generation = generation,
            "Opened in-memory socket."
        );

        Ok(Arc::new(ChannelSocket {
            addr: listen_addr,
            transport: self.clone(),
            generation,
            rx,
        }))
    }
}

pub struct ChannelSocket {
    addr: SocketAddr,
    transport: ChannelTransport,
    generation: u64,
    rx: flume::Receiver<Envelope>,
}

#[async_trait]
impl Socket for ChannelSocket {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(
        &self,
        to: SocketAddr,
        message: ClusterMessage,
    ) -> Result<(), TransportError> {
        let tx = self.transport.route(self.addr, to)?;
        tx.send_async((self.addr, message))
            .await
            .map_err(|_| TransportError::Unreachable(to))
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for ChannelSocket {
    fn drop(&mut self) {
        let mut sockets = self.transport.sockets.lock();
        let is_ours = sockets
            .get(&self.addr)
            .map(|(generation, _)| *generation == self.generation)
            .unwrap_or(false);

        if is_ours {
            sockets.remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemberId;

    fn ping(version: u64) -> ClusterMessage {
        ClusterMessage::SyncRequest {
            member: MemberId::new(1),
            version,
        }
    }

    #[tokio::test]
    async fn test_send_and_recv() -> anyhow::Result<()> {
        let transport = ChannelTransport::default();
        let addr_1 = test_helper::get_unused_addr();
        let addr_2 = test_helper::get_unused_addr();

        let socket_1 = transport.open(addr_1).await?;
        let socket_2 = transport.open(addr_2).await?;

        socket_1.send(addr_2, ping(1)).await?;
        socket_1.send(addr_2, ping(2)).await?;

        let (from, msg) = socket_2.recv().await?;
        assert_eq!(from, addr_1);
        assert!(matches!(msg, ClusterMessage::SyncRequest { version: 1, .. }));

        let (_, msg) = socket_2.recv().await?;
        assert!(matches!(msg, ClusterMessage::SyncRequest { version: 2, .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_isolate_and_heal() -> anyhow::Result<()> {
        let transport = ChannelTransport::default();
        let addr_1 = test_helper::get_unused_addr();
        let addr_2 = test_helper::get_unused_addr();

        let socket_1 = transport.open(addr_1).await?;
        let socket_2 = transport.open(addr_2).await?;

        transport.isolate(addr_2);
        assert!(transport.is_isolated(addr_2));
        let err = socket_1.send(addr_2, ping(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(addr) if addr == addr_2));
        assert!(socket_2.send(addr_1, ping(1)).await.is_err());

        transport.heal(addr_2);
        socket_1.send(addr_2, ping(3)).await?;
        let (_, msg) = socket_2.recv().await?;
        assert!(matches!(msg, ClusterMessage::SyncRequest { version: 3, .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_addr_in_use_and_closed_sockets() -> anyhow::Result<()> {
        let transport = ChannelTransport::default();
        let addr_1 = test_helper::get_unused_addr();
        let addr_2 = test_helper::get_unused_addr();

        let socket_1 = transport.open(addr_1).await?;
        let socket_2 = transport.open(addr_2).await?;
        assert!(matches!(
            transport.open(addr_2).await,
            Err(TransportError::AddrInUse(_))
        ));

        drop(socket_2);
        assert!(matches!(
            socket_1.send(addr_2, ping(1)).await,
            Err(TransportError::Unreachable(_))
        ));

        // The address can be bound again once the old socket is gone.
        let socket_2 = transport.open(addr_2).await?;
        socket_1.send(addr_2, ping(4)).await?;
        assert!(socket_2.recv().await.is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn test_stale_socket_does_not_unbind_its_successor() -> anyhow::Result<()> {
        let transport = ChannelTransport::default();
        let addr_1 = test_helper::get_unused_addr();
        let addr_2 = test_helper::get_unused_addr();

        let socket_1 = transport.open(addr_1).await?;
        let stale = transport.open(addr_2).await?;

        // Rebind the address while the old socket is still alive.
        transport.sockets.lock().remove(&addr_2);
        let current = transport.open(addr_2).await?;
        assert!(transport.is_bound(addr_2));

        drop(stale);
        assert!(transport.is_bound(addr_2));
        socket_1.send(addr_2, ping(5)).await?;
        let (from, msg) = current.recv().await?;
        assert_eq!(from, addr_1);
        assert!(matches!(msg, ClusterMessage::SyncRequest { version: 5, .. }));

        drop(current);
        assert!(!transport.is_bound(addr_2));

        Ok(())
    }
}
