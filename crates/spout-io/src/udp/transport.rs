//! Datagram transports.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use spout::{Error, Result};
use tokio::net::UdpSocket;
use tracing::info;

use crate::config::UdpConfig;

/// Network interface used for a multicast membership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Let the system choose.
    #[default]
    Any,

    /// IPv4 interface identified by its address.
    V4(Ipv4Addr),

    /// IPv6 interface identified by its index.
    Index(u32),
}

/// One datagram received into a caller's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    /// Number of bytes written to the buffer.
    pub len: usize,
    pub source: SocketAddr,
    /// Address the datagram was sent to, if the transport can tell.
    pub destination: Option<IpAddr>,
}

/// The operations a [`Socket`](super::Socket) needs from the network.
///
/// Implementations must allow concurrent calls to `recv_from` and `send_to`.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Receives one datagram into `buffer`.
    async fn recv_from(&self, buffer: &mut [u8]) -> Result<Received>;

    /// Sends one datagram, returning the number of bytes sent.
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<usize>;

    fn join_multicast(&self, group: IpAddr, interface: Interface) -> Result<()>;

    fn leave_multicast(&self, group: IpAddr, interface: Interface) -> Result<()>;
}

fn mismatched(group: IpAddr, interface: Interface) -> Error {
    Error::InvalidConfig(format!(
        "interface {interface:?} cannot be used with multicast group {group}"
    ))
}

/// A [`DatagramTransport`] over a tokio UDP socket.
pub struct TokioTransport {
    socket: UdpSocket,
    /// Set when the socket is bound to a specific address, which then is
    /// the only destination it receives for.
    destination: Option<IpAddr>,
}

impl TokioTransport {
    pub async fn bind(config: &UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_address).await?;
        socket.set_broadcast(config.broadcast)?;
        match config.bind_address {
            SocketAddr::V4(_) => {
                socket.set_multicast_loop_v4(config.multicast_loopback)?;
                if let Some(ttl) = config.multicast_ttl {
                    socket.set_multicast_ttl_v4(ttl)?;
                }
            }
            SocketAddr::V6(_) => socket.set_multicast_loop_v6(config.multicast_loopback)?,
        }
        let local = socket.local_addr()?;
        info!("bound UDP socket to {local}");
        let destination = (!local.ip().is_unspecified()).then_some(local.ip());
        Ok(Self {
            socket,
            destination,
        })
    }
}

#[async_trait]
impl DatagramTransport for TokioTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> Result<Received> {
        let (len, source) = self.socket.recv_from(buffer).await?;
        Ok(Received {
            len,
            source,
            destination: self.destination,
        })
    }

    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(bytes, target).await?)
    }

    fn join_multicast(&self, group: IpAddr, interface: Interface) -> Result<()> {
        match (group, interface) {
            (IpAddr::V4(group), Interface::Any) => {
                self.socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?
            }
            (IpAddr::V4(group), Interface::V4(interface)) => {
                self.socket.join_multicast_v4(group, interface)?
            }
            (IpAddr::V6(group), Interface::Any) => self.socket.join_multicast_v6(&group, 0)?,
            (IpAddr::V6(group), Interface::Index(index)) => {
                self.socket.join_multicast_v6(&group, index)?
            }
            (group, interface) => return Err(mismatched(group, interface)),
        }
        Ok(())
    }

    fn leave_multicast(&self, group: IpAddr, interface: Interface) -> Result<()> {
        match (group, interface) {
            (IpAddr::V4(group), Interface::Any) => {
                self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?
            }
            (IpAddr::V4(group), Interface::V4(interface)) => {
                self.socket.leave_multicast_v4(group, interface)?
            }
            (IpAddr::V6(group), Interface::Any) => self.socket.leave_multicast_v6(&group, 0)?,
            (IpAddr::V6(group), Interface::Index(index)) => {
                self.socket.leave_multicast_v6(&group, index)?
            }
            (group, interface) => return Err(mismatched(group, interface)),
        }
        Ok(())
    }
}
