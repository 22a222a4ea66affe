//! Datagram sockets with multicast group membership.
//!
//! A [`Socket`] reads and writes [`Packet`]s through a
//! [`DatagramTransport`]. Reads may run concurrently from any number of
//! tasks; each datagram is delivered to exactly one of them. Closing the
//! socket fails pending and later reads and writes with [`Error::Closed`] and
//! ends every [`Socket::reads`] stream.
//!
//! Closing the socket also releases its transport once in-flight operations
//! have observed the close, so the local address can be bound again.
//!
//! Source filters are applied to received datagrams, so a
//! [`GroupMembership`] can block and unblock sources without rejoining. A
//! membership's filters apply to datagrams sent to its group. When the
//! transport cannot tell where a datagram was sent, it is dropped only if
//! every membership rejects its source; with a single membership this filters
//! unicast datagrams as well.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use spout::{Chunk, Data, Error, Pull, Result, Stream};
use tokio::select;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UdpConfig;
use crate::metrics::{
    describe_io_metrics, DATAGRAMS_FILTERED, DATAGRAMS_RECEIVED, DATAGRAMS_SENT,
};

pub mod transport;

pub use transport::{DatagramTransport, Interface, Received, TokioTransport};

/// A datagram and its peer: the sender of a received packet or the
/// destination of a packet to write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub remote: SocketAddr,
    pub bytes: Chunk<u8>,
}

impl Packet {
    pub fn new(remote: SocketAddr, bytes: impl Into<Chunk<u8>>) -> Self {
        Self {
            remote,
            bytes: bytes.into(),
        }
    }
}

struct Membership {
    group: IpAddr,
    interface: Interface,
    /// Only source accepted by a source-specific membership.
    source: Option<IpAddr>,
    blocked: Mutex<BTreeSet<IpAddr>>,
    active: AtomicBool,
}

impl Membership {
    fn admits(&self, source: IpAddr) -> bool {
        !self.blocked.lock().unwrap().contains(&source)
            && self.source.is_none_or(|only| only == source)
    }
}

type SharedTransport = Arc<dyn DatagramTransport>;

struct Shared {
    /// `None` once the socket is closed. Operations hold a read guard while
    /// they use the transport, so `close` takes it only after they return.
    transport: RwLock<Option<SharedTransport>>,
    config: UdpConfig,
    closed: CancellationToken,
    closing: AtomicBool,
    memberships: Mutex<Vec<Arc<Membership>>>,
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed("socket"));
        }
        Ok(())
    }

    /// Applies the source filters of the memberships a datagram may belong
    /// to: those of its destination group, or all of them if the destination
    /// is unknown. It is accepted if any of them admits its source.
    fn accepts(&self, source: IpAddr, destination: Option<IpAddr>) -> bool {
        if destination.is_some_and(|destination| !destination.is_multicast()) {
            return true;
        }
        let memberships = self.memberships.lock().unwrap();
        let mut candidates = memberships
            .iter()
            .filter(|membership| destination.is_none_or(|group| membership.group == group))
            .peekable();
        candidates.peek().is_none() || candidates.any(|membership| membership.admits(source))
    }

    /// The transport, unless the socket is closed or closing.
    fn try_transport(&self) -> Result<RwLockReadGuard<'_, Option<SharedTransport>>> {
        self.check_open()?;
        self.transport.try_read().map_err(|_| Error::Closed("socket"))
    }

    fn unregister(&self, membership: &Arc<Membership>) {
        self.memberships
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, membership));
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .unwrap_or(Err(Error::Timeout)),
        None => future.await,
    }
}

/// A datagram socket.
///
/// Clones share the underlying transport.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

impl Socket {
    /// Binds a UDP socket as described by `config`.
    pub async fn bind(config: UdpConfig) -> Result<Self> {
        let transport = TokioTransport::bind(&config).await?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn with_transport(transport: Arc<dyn DatagramTransport>, config: UdpConfig) -> Self {
        describe_io_metrics();
        Self {
            shared: Arc::new(Shared {
                transport: RwLock::new(Some(transport)),
                config,
                closed: CancellationToken::new(),
                closing: AtomicBool::new(false),
                memberships: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        let transport = self.shared.try_transport()?;
        match transport.as_ref() {
            Some(transport) => transport.local_addr(),
            None => Err(Error::Closed("socket")),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Receives one datagram along with its destination, if known.
    async fn receive(&self) -> Result<(Packet, Option<IpAddr>)> {
        self.shared.check_open()?;
        let transport = self.shared.transport.read().await;
        let Some(transport) = transport.as_ref() else {
            return Err(Error::Closed("socket"));
        };
        let mut buffer = vec![0; self.shared.config.max_datagram_bytes];
        let received = with_timeout(
            self.shared.config.read_timeout(),
            transport.recv_from(&mut buffer),
        );
        let received = select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(Error::Closed("socket")),
            received = received => received?,
        };
        buffer.truncate(received.len);
        Ok((Packet::new(received.source, buffer), received.destination))
    }

    /// Reads the next datagram that passes the membership filters.
    pub async fn read(&self) -> Result<Packet> {
        loop {
            let (packet, destination) = self.receive().await?;
            if self.shared.accepts(packet.remote.ip(), destination) {
                counter!(DATAGRAMS_RECEIVED).increment(1);
                return Ok(packet);
            }
            counter!(DATAGRAMS_FILTERED).increment(1);
        }
    }

    /// Streams received datagrams until the socket is closed.
    ///
    /// The stream can be restarted by calling `reads` again.
    pub fn reads(&self) -> Stream<Packet> {
        let socket = self.clone();
        Pull::from_fn(move |ctx| async move {
            loop {
                match socket.read().await {
                    Ok(packet) => ctx.output1(packet).await,
                    Err(Error::Closed(_)) => return Ok(()),
                    Err(error) => return Err(error),
                }
            }
        })
        .stream()
    }

    pub async fn write(&self, packet: &Packet) -> Result<()> {
        self.shared.check_open()?;
        let transport = self.shared.transport.read().await;
        let Some(transport) = transport.as_ref() else {
            return Err(Error::Closed("socket"));
        };
        let sent = with_timeout(
            self.shared.config.write_timeout(),
            transport.send_to(packet.bytes.as_slice(), packet.remote),
        );
        let sent = select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(Error::Closed("socket")),
            sent = sent => sent?,
        };
        if sent < packet.bytes.len() {
            return Err(Error::Io {
                kind: std::io::ErrorKind::WriteZero,
                message: format!(
                    "sent {sent} of {} bytes to {}",
                    packet.bytes.len(),
                    packet.remote
                ),
            });
        }
        counter!(DATAGRAMS_SENT).increment(1);
        Ok(())
    }

    /// Writes every packet of `input`. The returned stream emits nothing and
    /// ends once `input` does.
    pub fn writes(&self, input: Stream<Packet>) -> Stream<()> {
        let socket = self.clone();
        Pull::from_fn(move |ctx| async move {
            let input = ctx.consume(input);
            while let Some(packets) = input.pull().await? {
                for packet in packets.iter() {
                    socket.write(packet).await?;
                }
            }
            Ok(())
        })
        .stream()
    }

    /// Joins multicast `group` on `interface`.
    pub fn join(&self, group: IpAddr, interface: Interface) -> Result<GroupMembership> {
        self.join_inner(group, None, interface)
    }

    /// Joins multicast `group` on `interface`, accepting datagrams from
    /// `source` only.
    pub fn join_source(
        &self,
        group: IpAddr,
        source: IpAddr,
        interface: Interface,
    ) -> Result<GroupMembership> {
        self.join_inner(group, Some(source), interface)
    }

    fn join_inner(
        &self,
        group: IpAddr,
        source: Option<IpAddr>,
        interface: Interface,
    ) -> Result<GroupMembership> {
        let transport = self.shared.try_transport()?;
        let Some(transport) = transport.as_ref() else {
            return Err(Error::Closed("socket"));
        };
        if !group.is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "{group} is not a multicast address"
            )));
        }
        transport.join_multicast(group, interface)?;
        info!("joined multicast group {group} on {interface:?}");
        let membership = Arc::new(Membership {
            group,
            interface,
            source,
            blocked: Mutex::new(BTreeSet::new()),
            active: AtomicBool::new(true),
        });
        self.shared
            .memberships
            .lock()
            .unwrap()
            .push(membership.clone());
        Ok(GroupMembership {
            shared: self.shared.clone(),
            membership,
        })
    }

    /// Closes the socket, leaves every multicast group it joined and
    /// releases the transport.
    ///
    /// Pending reads and writes fail with [`Error::Closed`]; the transport is
    /// released once they have returned. Closing an already closed socket
    /// does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.closed.cancel();
        let mut transport = self.shared.transport.write().await;
        let memberships = std::mem::take(&mut *self.shared.memberships.lock().unwrap());
        let mut outcome = Ok(());
        for membership in memberships {
            membership.active.store(false, Ordering::Release);
            let Some(transport) = transport.as_ref() else {
                continue;
            };
            if let Err(error) = transport.leave_multicast(membership.group, membership.interface) {
                warn!("failed to leave multicast group {}: {error}", membership.group);
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }
        *transport = None;
        info!("closed UDP socket");
        outcome
    }
}

/// One active multicast subscription of a [`Socket`].
pub struct GroupMembership {
    shared: Arc<Shared>,
    membership: Arc<Membership>,
}

impl std::fmt::Debug for GroupMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMembership")
            .field("group", &self.membership.group)
            .field("source", &self.membership.source)
            .field("active", &self.is_active())
            .finish()
    }
}

impl GroupMembership {
    pub fn group(&self) -> IpAddr {
        self.membership.group
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.membership.source
    }

    /// Returns false once the membership is dropped or its socket is closed.
    pub fn is_active(&self) -> bool {
        self.membership.active.load(Ordering::Acquire)
    }

    fn check_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Closed("group membership"));
        }
        Ok(())
    }

    /// Leaves the group. Dropping an inactive membership does nothing.
    pub fn drop(&self) -> Result<()> {
        let Ok(transport) = self.shared.transport.try_read() else {
            // The socket is closing and leaves every registered group.
            return Ok(());
        };
        if !self.membership.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.unregister(&self.membership);
        let Some(transport) = transport.as_ref() else {
            return Ok(());
        };
        transport.leave_multicast(self.membership.group, self.membership.interface)?;
        info!("left multicast group {}", self.membership.group);
        Ok(())
    }

    /// Stops delivering datagrams sent by `source`.
    pub fn block(&self, source: IpAddr) -> Result<()> {
        self.check_active()?;
        if self.membership.blocked.lock().unwrap().insert(source) {
            debug!("blocked {source} in group {}", self.membership.group);
        }
        Ok(())
    }

    pub fn unblock(&self, source: IpAddr) -> Result<()> {
        self.check_active()?;
        if self.membership.blocked.lock().unwrap().remove(&source) {
            debug!("unblocked {source} in group {}", self.membership.group);
        }
        Ok(())
    }

    /// Currently blocked sources, in ascending order.
    pub fn blocked(&self) -> Vec<IpAddr> {
        self.membership
            .blocked
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }
}

/// Binds a socket as described by `config`. The socket is closed when the
/// enclosing scope ends.
pub fn open<O: Data>(config: UdpConfig) -> Pull<O, Socket> {
    Pull::acquire(Socket::bind(config), |socket: Socket| async move {
        socket.close().await
    })
}
