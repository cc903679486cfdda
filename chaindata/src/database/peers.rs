//! Peer address store.
//!
//! The primary table maps peer id → serialized record. Secondary
//! duplicate-value tables index peers by chain, protocol, advertised
//! service, reachable transport, and the day they were last contacted, so
//! `find` can answer "least recently tried peer matching these filters"
//! without a full scan.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, trace};

use crate::kv::{Kv, Table, Txn};
use crate::types::{Chain, Peer, PeerId, Protocol, Service, Transport};
use crate::util::int_key;

pub struct Peers {
    kv: Arc<Kv>,
}

impl Peers {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    pub fn exists(&self, id: &PeerId) -> bool {
        self.kv.exists(Table::Peers, id.as_bytes())
    }

    /// Loads a peer by id.
    pub fn load(&self, id: &PeerId) -> Option<Peer> {
        self.kv
            .load(Table::Peers, id.as_bytes(), |raw| {
                match bincode::serde::decode_from_slice::<Peer, _>(raw, bincode::config::standard())
                {
                    Ok((peer, _)) => Some(peer),
                    Err(e) => {
                        error!("peer {id} failed to deserialize: {e}");
                        None
                    }
                }
            })
            .flatten()
    }

    /// Inserts or updates a peer, refreshing every secondary index row in
    /// the same transaction.
    pub fn insert(&self, peer: &Peer) -> bool {
        let txn = self.kv.txn_rw();
        if !self.insert_in(&txn, peer) {
            txn.finalize(false);
            return false;
        }
        txn.finalize(true)
    }

    /// Bulk import, skipping records whose id is already known.
    pub fn import(&self, peers: &[Peer]) -> bool {
        let txn = self.kv.txn_rw();
        for peer in peers {
            if self.exists(&peer.id) {
                trace!("skipping known peer {}", peer.id);
                continue;
            }
            if !self.insert_in(&txn, peer) {
                txn.finalize(false);
                return false;
            }
        }
        txn.finalize(true)
    }

    fn insert_in(&self, txn: &Txn<'_>, peer: &Peer) -> bool {
        let id = peer.id;
        if let Some(previous) = self.load(&id) {
            if !self.unindex(txn, &previous) {
                return false;
            }
        }

        let encoded = match bincode::serde::encode_to_vec(peer, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize peer {id}: {e}");
                return false;
            }
        };
        if !self.kv.store_in(txn, Table::Peers, id.as_bytes(), &encoded) {
            return false;
        }

        let id_bytes = id.as_bytes();
        let mut ok = self.kv.store_in(
            txn,
            Table::PeerChainIndex,
            &int_key(peer.chain.id() as u64),
            id_bytes,
        ) && self.kv.store_in(
            txn,
            Table::PeerProtocolIndex,
            &int_key(peer.protocol.id() as u64),
            id_bytes,
        ) && self.kv.store_in(
            txn,
            Table::PeerConnectedIndex,
            &int_key(peer.connected_bucket()),
            id_bytes,
        );
        for service in &peer.services {
            ok = ok
                && self.kv.store_in(
                    txn,
                    Table::PeerServiceIndex,
                    &int_key(service.id() as u64),
                    id_bytes,
                );
        }
        for transport in &peer.transports {
            ok = ok
                && self.kv.store_in(
                    txn,
                    Table::PeerNetworkIndex,
                    &int_key(transport.id() as u64),
                    id_bytes,
                );
        }

        if !ok {
            error!("failed to index peer {id}");
        }
        ok
    }

    fn unindex(&self, txn: &Txn<'_>, peer: &Peer) -> bool {
        let id_bytes = peer.id.as_bytes();
        let mut ok = self.kv.delete_in(
            txn,
            Table::PeerChainIndex,
            &int_key(peer.chain.id() as u64),
            Some(id_bytes),
        ) && self.kv.delete_in(
            txn,
            Table::PeerProtocolIndex,
            &int_key(peer.protocol.id() as u64),
            Some(id_bytes),
        ) && self.kv.delete_in(
            txn,
            Table::PeerConnectedIndex,
            &int_key(peer.connected_bucket()),
            Some(id_bytes),
        );
        for service in &peer.services {
            ok = ok
                && self.kv.delete_in(
                    txn,
                    Table::PeerServiceIndex,
                    &int_key(service.id() as u64),
                    Some(id_bytes),
                );
        }
        for transport in &peer.transports {
            ok = ok
                && self.kv.delete_in(
                    txn,
                    Table::PeerNetworkIndex,
                    &int_key(transport.id() as u64),
                    Some(id_bytes),
                );
        }
        ok
    }

    fn index_set(&self, table: Table, key: u64) -> BTreeSet<PeerId> {
        let mut out = BTreeSet::new();
        let result = self.kv.read_prefix(table, &int_key(key), |value| {
            if let Some(id) = PeerId::from_slice(value) {
                out.insert(id);
            }
            true
        });
        if let Err(e) = result {
            error!("peer index scan failed: {e}");
        }
        out
    }

    /// Picks the least recently tried peer that is on `chain`, speaks
    /// `protocol`, is reachable over at least one of `transports`, and
    /// advertises every service in `services`. Ties break on peer id for
    /// determinism.
    pub fn find(
        &self,
        chain: Chain,
        protocol: Protocol,
        transports: &BTreeSet<Transport>,
        services: &BTreeSet<Service>,
    ) -> Option<Peer> {
        if transports.is_empty() {
            return None;
        }

        let mut candidates = self.index_set(Table::PeerChainIndex, chain.id() as u64);
        if candidates.is_empty() {
            return None;
        }

        candidates = candidates
            .intersection(&self.index_set(Table::PeerProtocolIndex, protocol.id() as u64))
            .copied()
            .collect();

        let mut reachable = BTreeSet::new();
        for transport in transports {
            reachable.extend(self.index_set(Table::PeerNetworkIndex, transport.id() as u64));
        }
        candidates = candidates.intersection(&reachable).copied().collect();

        for service in services {
            candidates = candidates
                .intersection(&self.index_set(Table::PeerServiceIndex, service.id() as u64))
                .copied()
                .collect();
            if candidates.is_empty() {
                return None;
            }
        }

        candidates
            .into_iter()
            .filter_map(|id| self.load(&id))
            .min_by(|a, b| {
                a.last_connected
                    .cmp(&b.last_connected)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}
