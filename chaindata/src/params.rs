//! Per-chain genesis parameters.
//!
//! The sync stream for every supported chain starts from the packet built
//! out of these constants, so a freshly created database can serve height 0
//! without talking to the network.

use crate::types::{BlockHash, Chain, FilterType};

/// Static parameters of one chain.
pub struct ChainParams {
    pub chain: Chain,
    /// Hex-encoded hash of the genesis block.
    pub genesis_hash_hex: &'static str,
    /// Hex-encoded 80-byte serialized genesis header.
    pub genesis_header_hex: &'static str,
    /// Hex-encoded genesis compact filter body (coded element stream).
    pub genesis_filter_hex: &'static str,
    /// Number of elements in the genesis filter.
    pub genesis_filter_elements: u32,
    /// Filter flavor the sync stream carries for this chain.
    pub sync_filter_type: FilterType,
}

const BITCOIN_GENESIS_HEADER: &str = "01000000000000000000000000000000000000000000000000000000000000000000\
                                      00003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a\
                                      29ab5f49ffff001d1dac2b7c";

const TESTNET_GENESIS_HEADER: &str = "01000000000000000000000000000000000000000000000000000000000000000000\
                                      00003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a\
                                      dae5494dffff001d1aa4ae18";

const UNIT_TEST_GENESIS_HEADER: &str = "01000000000000000000000000000000000000000000000000000000000000000000\
                                        00003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a\
                                        dae5494dffff7f2002000000";

static PARAMS: &[ChainParams] = &[
    ChainParams {
        chain: Chain::Bitcoin,
        genesis_hash_hex: "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000",
        genesis_header_hex: BITCOIN_GENESIS_HEADER,
        genesis_filter_hex: "019dfca8",
        genesis_filter_elements: 1,
        sync_filter_type: FilterType::Es,
    },
    ChainParams {
        chain: Chain::BitcoinTestnet,
        genesis_hash_hex: "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000",
        genesis_header_hex: TESTNET_GENESIS_HEADER,
        genesis_filter_hex: "019dfca8",
        genesis_filter_elements: 1,
        sync_filter_type: FilterType::Es,
    },
    ChainParams {
        chain: Chain::BitcoinCash,
        genesis_hash_hex: "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000",
        genesis_header_hex: BITCOIN_GENESIS_HEADER,
        genesis_filter_hex: "019dfca8",
        genesis_filter_elements: 1,
        sync_filter_type: FilterType::BasicBchVariant,
    },
    ChainParams {
        chain: Chain::BitcoinCashTestnet,
        genesis_hash_hex: "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000",
        genesis_header_hex: TESTNET_GENESIS_HEADER,
        genesis_filter_hex: "019dfca8",
        genesis_filter_elements: 1,
        sync_filter_type: FilterType::BasicBchVariant,
    },
    ChainParams {
        chain: Chain::UnitTest,
        genesis_hash_hex: "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f",
        genesis_header_hex: UNIT_TEST_GENESIS_HEADER,
        genesis_filter_hex: "019dfca8",
        genesis_filter_elements: 1,
        sync_filter_type: FilterType::Es,
    },
];

/// Looks up the parameters for `chain`.
pub fn chain_params(chain: Chain) -> &'static ChainParams {
    PARAMS
        .iter()
        .find(|p| p.chain == chain)
        .expect("every defined chain has parameters")
}

impl ChainParams {
    pub fn genesis_hash(&self) -> BlockHash {
        let bytes = decode_hex(self.genesis_hash_hex);
        BlockHash::from_slice(&bytes).expect("genesis hash constant is 32 bytes")
    }

    pub fn genesis_header(&self) -> Vec<u8> {
        decode_hex(self.genesis_header_hex)
    }

    pub fn genesis_filter(&self) -> Vec<u8> {
        decode_hex(self.genesis_filter_hex)
    }
}

fn decode_hex(input: &'static str) -> Vec<u8> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).expect("chain parameter constants are valid hex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_defined_chain_has_params() {
        for chain in Chain::defined() {
            let params = chain_params(*chain);
            assert_eq!(params.chain, *chain);
            assert_eq!(params.genesis_header().len(), 80);
            assert_eq!(params.genesis_hash().as_bytes().len(), 32);
            assert!(!params.genesis_filter().is_empty());
        }
    }

    #[test]
    fn genesis_hash_matches_header() {
        for chain in Chain::defined() {
            let params = chain_params(*chain);
            let hashed = crate::crypto::sha256d(&params.genesis_header());
            assert_eq!(
                hashed.as_bytes(),
                params.genesis_hash().as_bytes(),
                "genesis constants disagree for {chain}"
            );
        }
    }

    #[test]
    fn mainnet_and_testnet_genesis_differ() {
        let mainnet = chain_params(Chain::Bitcoin);
        let testnet = chain_params(Chain::BitcoinTestnet);
        assert_ne!(mainnet.genesis_hash(), testnet.genesis_hash());
        assert_ne!(mainnet.genesis_header(), testnet.genesis_header());
    }
}
