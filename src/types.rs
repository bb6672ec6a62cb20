//! Core types shared across the shard-map management crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a shard map: discrete point mappings or key ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardMapKind {
    /// Maps discrete key values to shards. Internally each point is
    /// stored as the unit range `[k, successor(k))`.
    List,
    /// Maps half-open key ranges `[low, high)` to shards.
    Range,
}

impl std::fmt::Display for ShardMapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardMapKind::List => write!(f, "list"),
            ShardMapKind::Range => write!(f, "range"),
        }
    }
}

/// Availability status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// The shard accepts routed connections.
    Online,
    /// The shard is administratively disabled.
    Offline,
}

/// Availability status of a mapping.
///
/// A mapping must be `Offline` before it can be deleted or moved to a
/// different shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    /// The mapping serves routing lookups.
    Online,
    /// The mapping is hidden from routing; management lookups still
    /// return it.
    Offline,
}

/// Wire protocol used to reach a shard's data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardProtocol {
    /// Provider default protocol.
    Default,
    /// TCP with an explicit port.
    Tcp,
}

/// A physical data-source location: protocol, server, port and database.
///
/// Two shards are considered the same endpoint when their locations are
/// equal; a shard map allows at most one shard per location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardLocation {
    /// Wire protocol.
    pub protocol: ShardProtocol,
    /// Server host name.
    pub server: String,
    /// Port, 0 for the protocol default.
    pub port: u16,
    /// Database name on the server.
    pub database: String,
}

impl ShardLocation {
    /// Create a location with the default protocol and port.
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            protocol: ShardProtocol::Default,
            server: server.into(),
            port: 0,
            database: database.into(),
        }
    }

    /// Create a TCP location with an explicit port.
    pub fn with_port(server: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            protocol: ShardProtocol::Tcp,
            server: server.into(),
            port,
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port == 0 {
            write!(f, "{}/{}", self.server, self.database)
        } else {
            write!(f, "{}:{}/{}", self.server, self.port, self.database)
        }
    }
}

/// Advisory lock token for compare-and-swap locking of mappings.
///
/// The nil token means "unlocked"; any other value identifies the holder.
pub type LockOwnerId = Uuid;
