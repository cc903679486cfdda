//! State-owning oracles driving the storage layer.
//!
//! Each oracle is a single-consumer actor: the block oracle serves block
//! futures and feeds the block store, the filter oracle syncs cfilters and
//! cfheaders, and the fee oracle aggregates rolling fee samples.

pub mod block;
pub mod fee;
pub mod filter;

pub use block::{AcceptAllValidator, BlockFuture, BlockOracle, BlockValidator, BlockWork};
pub use fee::{FeeOracle, FeeWork};
pub use filter::{FilterOracle, FilterWork};
