//! Configuration of file and datagram resources.

use std::fmt::{self, Display};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default size of the chunks emitted while reading a file: 64 KiB.
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 64 * 1024;

/// Largest payload of an IPv4 UDP datagram.
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = 65_507;

/// File I/O configuration.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Backend that opens files.
    pub backend: FileBackendConfig,

    /// Maximum number of bytes per chunk emitted by reads.
    ///
    /// The default is 64 KiB.
    pub chunk_size_bytes: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            backend: FileBackendConfig::default(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
        }
    }
}

/// File backend selection.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "config", rename_all = "snake_case")]
pub enum FileBackendConfig {
    /// Files in the local file system, accessed with positional I/O.
    #[default]
    Posix,

    /// Files kept in process memory.
    Memory(MemoryBackendConfig),
}

impl Display for FileBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileBackendConfig::Posix => write!(f, "posix"),
            FileBackendConfig::Memory(_) => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBackendConfig {
    /// Upper bound on the bytes accepted by a single write call.
    ///
    /// Larger writes are truncated and reported as partial writes. Unbounded
    /// by default.
    pub max_write_bytes: Option<usize>,
}

/// Datagram socket configuration.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address to bind. The default, `0.0.0.0:0`, binds an ephemeral
    /// port on every IPv4 interface.
    pub bind_address: SocketAddr,

    /// Allow sending to broadcast addresses.
    pub broadcast: bool,

    /// Time-to-live of outgoing IPv4 multicast datagrams. The system default
    /// (usually 1) applies when unset.
    pub multicast_ttl: Option<u32>,

    /// Deliver multicast datagrams sent by this host back to it.
    pub multicast_loopback: bool,

    /// Fail reads that receive nothing within this many milliseconds.
    pub read_timeout_ms: Option<u64>,

    /// Fail writes that do not complete within this many milliseconds.
    pub write_timeout_ms: Option<u64>,

    /// Size of the receive buffer. Longer datagrams are truncated.
    pub max_datagram_bytes: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            broadcast: false,
            multicast_ttl: None,
            multicast_loopback: true,
            read_timeout_ms: None,
            write_timeout_ms: None,
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM_BYTES,
        }
    }
}

impl UdpConfig {
    pub fn with_bind_address(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{
        FileBackendConfig, FileConfig, MemoryBackendConfig, UdpConfig, DEFAULT_CHUNK_SIZE_BYTES,
        DEFAULT_MAX_DATAGRAM_BYTES,
    };

    #[test]
    fn file_config_defaults() {
        let config: FileConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, FileConfig::default());
        assert_eq!(config.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert_eq!(config.backend.to_string(), "posix");
    }

    #[test]
    fn memory_backend_from_yaml() {
        let config: FileConfig = serde_yaml::from_str(
            r#"
chunk_size_bytes: 4096
backend:
  name: memory
  config:
    max_write_bytes: 7
"#,
        )
        .unwrap();
        assert_eq!(
            config,
            FileConfig {
                backend: FileBackendConfig::Memory(MemoryBackendConfig {
                    max_write_bytes: Some(7)
                }),
                chunk_size_bytes: 4096,
            }
        );
        assert_eq!(config.backend.to_string(), "memory");
    }

    #[test]
    fn file_backend_round_trips_through_json() {
        let json = serde_json::to_string(&FileBackendConfig::Posix).unwrap();
        assert_eq!(json, r#"{"name":"posix"}"#);
        assert_eq!(
            serde_json::from_str::<FileBackendConfig>(&json).unwrap(),
            FileBackendConfig::Posix
        );
    }

    #[test]
    fn udp_config() {
        let config: UdpConfig = serde_yaml::from_str(
            r#"
bind_address: "127.0.0.1:5000"
multicast_ttl: 4
read_timeout_ms: 250
"#,
        )
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.multicast_ttl, Some(4));
        assert!(config.multicast_loopback);
        assert!(!config.broadcast);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.write_timeout(), None);
        assert_eq!(config.max_datagram_bytes, DEFAULT_MAX_DATAGRAM_BYTES);
    }
}
