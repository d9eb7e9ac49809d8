mod b58;
mod election;
mod hash;
mod keys;
mod time;

pub use {
  b58::ToBase58String,
  election::{BlockNonce, ElectionProof},
  hash::{content_hash, merkle_root, sha256, sha256_concat},
  keys::{Keypair, KeypairError, Pubkey},
  time::Timestamp,
};

/// Integer time index of the chain; blocks are baked for slots.
pub type Slot = u64;

/// Distance of a block from the first genesis, counted in blocks.
pub type Height = u64;

/// Group of consecutive slots over which the leadership election
/// nonce stays fixed.
pub type Epoch = u64;

/// Smallest unit of the chain's currency.
pub type Amount = u64;

/// Execution cost unit charged to transactions.
pub type Energy = u64;

/// Per-account transaction sequence number. The first valid
/// nonce of a fresh account is 1.
pub type Nonce = u64;

/// Identity of a staking participant eligible to bake blocks.
pub type BakerId = u64;

/// Sequence number of chain-parameter updates, per update type.
pub type UpdateSequence = u64;
