//! File and datagram resources for `spout` streams.
//!
//! [`file`] reads and writes files in chunks through a pluggable
//! [`FileBackend`], and [`udp`] exchanges datagrams over a [`Socket`] with
//! multicast group membership. Every resource opened through a pull is
//! released when the enclosing scope ends.

pub mod config;
pub mod file;
pub mod metrics;
pub mod udp;

pub use config::{FileBackendConfig, FileConfig, MemoryBackendConfig, UdpConfig};
pub use file::{FileBackend, FileHandle, OpenFlags};
pub use udp::{GroupMembership, Interface, Packet, Socket};
