//! The seed state: the beacon deciding baker eligibility per slot.
//!
//! Within an epoch the leadership election nonce is fixed; every block
//! folds its VRF output into the updated nonce, and at epoch boundaries
//! the updated nonce is re-keyed into the next election nonce. This
//! means the nonce of a future epoch depends on blocks not yet baked,
//! which is exactly why pre-flight checks of pending blocks can verify
//! leadership only within the epoch of the last finalized block.

use {
  crate::primitives::{sha256_concat, BlockNonce, Epoch, Slot},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedState {
  pub epoch: Epoch,
  /// Slots per epoch, constant over an era.
  pub epoch_length: u64,
  pub election_nonce: Multihash,
  pub updated_nonce: Multihash,
}

impl SeedState {
  pub fn genesis(epoch_length: u64, seed: Multihash) -> Self {
    Self {
      epoch: 0,
      epoch_length,
      election_nonce: seed,
      updated_nonce: seed,
    }
  }

  pub fn epoch_of(&self, slot: Slot) -> Epoch {
    slot / self.epoch_length
  }

  /// Rotates the nonce across epoch boundaries up to the epoch of
  /// `slot` without contributing a block. Used to learn the election
  /// nonce a block at `slot` must be checked against.
  fn rotated_to(&self, slot: Slot) -> Self {
    let mut next = self.clone();
    let target = self.epoch_of(slot);
    while next.epoch < target {
      next.election_nonce = sha256_concat(&[
        next.updated_nonce.digest(),
        &(next.epoch + 1).to_be_bytes(),
      ]);
      next.updated_nonce = next.election_nonce;
      next.epoch += 1;
    }
    next
  }

  /// The election nonce leadership proofs at `slot` verify against.
  pub fn nonce_for(&self, slot: Slot) -> Multihash {
    self.rotated_to(slot).election_nonce
  }

  /// The nonce for `slot` if it is already determined by this state;
  /// `None` once the slot crosses into a later epoch, because the
  /// re-keyed nonce depends on blocks this state has not seen.
  pub fn predictable_nonce_for(&self, slot: Slot) -> Option<Multihash> {
    (self.epoch_of(slot) == self.epoch).then(|| self.election_nonce)
  }

  /// The successor seed state after a block at `slot` carrying
  /// `nonce` is applied.
  pub fn update(&self, slot: Slot, nonce: &BlockNonce) -> Self {
    let mut next = self.rotated_to(slot);
    next.updated_nonce = sha256_concat(&[
      next.updated_nonce.digest(),
      &slot.to_be_bytes(),
      nonce.output().digest(),
    ]);
    next
  }

  /// The seed state of a new era derived from the terminal state of
  /// the previous one.
  pub fn regenesis(prior: &SeedState) -> Self {
    let nonce =
      sha256_concat(&[b"Regenesis", prior.updated_nonce.digest()]);
    Self {
      epoch: 0,
      epoch_length: prior.epoch_length,
      election_nonce: nonce,
      updated_nonce: nonce,
    }
  }
}
