//! Peer records.
//!
//! Peers are stored by a content-derived identifier and indexed by chain,
//! protocol, advertised services, reachable transports, and the time they
//! were last contacted.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto;

use super::{Chain, HASH_LEN, Hash32};

/// Content-derived peer identifier.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Hash32);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Hash32::from_slice(bytes).map(PeerId)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Peer-to-peer protocol family spoken by a peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Bitcoin,
    Ethereum,
}

impl Protocol {
    pub fn id(&self) -> u32 {
        match self {
            Protocol::Bitcoin => 0,
            Protocol::Ethereum => 1,
        }
    }
}

/// Transport over which a peer is reachable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Transport {
    Ipv4,
    Ipv6,
    Onion,
    Eep,
}

impl Transport {
    pub fn id(&self) -> u32 {
        match self {
            Transport::Ipv4 => 0,
            Transport::Ipv6 => 1,
            Transport::Onion => 2,
            Transport::Eep => 3,
        }
    }
}

/// Service bits a peer advertises.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Service {
    Network,
    Limited,
    Bloom,
    Witness,
    CompactFilters,
    Graphene,
    Xthin,
}

impl Service {
    pub fn id(&self) -> u32 {
        match self {
            Service::Network => 0,
            Service::Limited => 1,
            Service::Bloom => 2,
            Service::Witness => 3,
            Service::CompactFilters => 4,
            Service::Graphene => 5,
            Service::Xthin => 6,
        }
    }
}

/// A known peer address with its capabilities and contact history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub chain: Chain,
    pub protocol: Protocol,
    pub transports: BTreeSet<Transport>,
    pub services: BTreeSet<Service>,
    /// Raw address bytes; length depends on the transport.
    pub address: Vec<u8>,
    pub port: u16,
    /// Unix timestamp of the last successful contact, `0` if never.
    pub last_connected: u64,
}

impl Peer {
    /// Builds a peer record, deriving its identifier from the immutable
    /// fields so repeated imports of the same endpoint deduplicate.
    pub fn new(
        chain: Chain,
        protocol: Protocol,
        transports: BTreeSet<Transport>,
        services: BTreeSet<Service>,
        address: Vec<u8>,
        port: u16,
    ) -> Self {
        let id = Self::derive_id(chain, protocol, &address, port);
        Self {
            id,
            chain,
            protocol,
            transports,
            services,
            address,
            port,
            last_connected: 0,
        }
    }

    fn derive_id(chain: Chain, protocol: Protocol, address: &[u8], port: u16) -> PeerId {
        let mut preimage = Vec::with_capacity(address.len() + 10);
        preimage.extend_from_slice(&chain.id().to_le_bytes());
        preimage.extend_from_slice(&protocol.id().to_le_bytes());
        preimage.extend_from_slice(address);
        preimage.extend_from_slice(&port.to_le_bytes());
        PeerId(crypto::sha256d(&preimage))
    }

    /// Day bucket used by the last-connected index.
    pub fn connected_bucket(&self) -> u64 {
        self.last_connected / 86_400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(address: &[u8], port: u16) -> Peer {
        Peer::new(
            Chain::UnitTest,
            Protocol::Bitcoin,
            [Transport::Ipv4].into_iter().collect(),
            [Service::Network, Service::CompactFilters]
                .into_iter()
                .collect(),
            address.to_vec(),
            port,
        )
    }

    #[test]
    fn id_is_derived_from_endpoint() {
        let a = peer(&[127, 0, 0, 1], 8333);
        let b = peer(&[127, 0, 0, 1], 8333);
        let c = peer(&[127, 0, 0, 2], 8333);
        let d = peer(&[127, 0, 0, 1], 8334);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
    }

    #[test]
    fn connected_bucket_is_daily() {
        let mut p = peer(&[10, 0, 0, 1], 8333);
        p.last_connected = 86_400 * 3 + 12;
        assert_eq!(p.connected_bucket(), 3);
    }
}
