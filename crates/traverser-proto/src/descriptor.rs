//! Peer descriptors exchanged in `peer` replies.
//!
//! The JSON field names (`PublicKey`, `CIDR`, `Endpoint`) are part of the wire
//! format and must not change.

use crate::error::ProtoError;
use crate::key::PublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;

/// Everything a host needs to configure a remote tunnel peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    #[serde(rename = "PublicKey")]
    public_key: PublicKey,

    #[serde(rename = "CIDR")]
    allowed_range: IpNet,

    #[serde(
        rename = "Endpoint",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_endpoint"
    )]
    endpoint: Option<SocketAddr>,
}

impl PeerDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub fn new(public_key: PublicKey, allowed_range: IpNet, endpoint: Option<SocketAddr>) -> Self {
        Self {
            public_key,
            allowed_range,
            endpoint,
        }
    }

    /// Peer's public key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Range the peer may originate traffic from
    #[must_use]
    pub fn allowed_range(&self) -> IpNet {
        self.allowed_range
    }

    /// Externally reachable handshake address, if one has been observed
    #[must_use]
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// Same peer with a different allowed range.
    ///
    /// The key never changes; consumers rewrite the range to route all traffic
    /// through the peer.
    #[must_use]
    pub fn with_allowed_range(self, allowed_range: IpNet) -> Self {
        Self {
            allowed_range,
            ..self
        }
    }

    /// Compact JSON form, guaranteed to contain no whitespace.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::InvalidDescriptor` if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::InvalidDescriptor(e.to_string()))
    }

    /// Parse the JSON form.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::InvalidDescriptor` for malformed JSON, keys,
    /// ranges or endpoints.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::InvalidDescriptor(e.to_string()))
    }
}

// Older peers send an empty string rather than omitting the field.
fn deserialize_endpoint<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
