//! Connection and peer identifiers.

use crate::error::PeerwireError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a compressed secp256k1 public key, the node identity used by
/// the peer-to-peer engines this transport is written for.
pub const PEER_ID_LEN: usize = 33;

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// Unique identifier for one transport connection.
///
/// Generated once when the connection is constructed and never changed.
/// Connection equality and hashing are defined over this value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Generate a new random ConnectionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Public identity of a remote peer, as handed to the engine when dialing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerwireError> {
        let arr: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            PeerwireError::InvalidPeerId(format!(
                "expected {PEER_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl std::str::FromStr for PeerId {
    type Err = PeerwireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| PeerwireError::InvalidPeerId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const NODE_KEY: &str = "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619";

    #[test]
    fn test_connection_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..1000).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_connection_id_parse_display() {
        let id = ConnectionId::new();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_from_hex() {
        let peer: PeerId = NODE_KEY.parse().unwrap();
        assert_eq!(peer.as_bytes()[0], 0x02);
        assert_eq!(peer.to_string(), NODE_KEY);
    }

    #[test]
    fn test_peer_id_rejects_wrong_length() {
        let err = "02eec7".parse::<PeerId>().unwrap_err();
        assert!(matches!(err, PeerwireError::InvalidPeerId(_)));
        assert!(err.to_string().contains("expected 33 bytes"));
    }

    #[test]
    fn test_peer_id_rejects_non_hex() {
        assert!("zz".repeat(33).parse::<PeerId>().is_err());
    }
}
