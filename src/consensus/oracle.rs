//! The finalization oracle boundary.
//!
//! The BFT message algebra that produces finalization records lives
//! outside this crate; the tree state only needs to hand records in
//! and read a verdict back. [`StakeOracle`] is the bundled
//! implementation used when the host runs no separate finalization
//! component: it accepts a record when signers holding at least two
//! thirds of the committee stake vouch for it.

use {
  super::block::FinalizationRecord,
  crate::{
    primitives::{BakerId, Height},
    state::EpochBakers,
  },
  multihash::Multihash,
  std::{collections::HashSet, sync::Arc},
  tracing::warn,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleVerdict {
  /// The record was consumed; these committee members signed it and
  /// take part in the finalization reward.
  Consumed { finalizers: Vec<BakerId> },
  /// The oracle has already seen this record.
  Duplicate,
  /// The proof does not hold.
  Rejected,
}

pub trait FinalizationOracle: Send {
  fn receive_record(&mut self, record: &FinalizationRecord) -> OracleVerdict;

  /// Notification that a block became live.
  fn block_arrived(&mut self, hash: &Multihash, height: Height);

  /// Notification that a finalization advanced the tree.
  fn finalized(&mut self, record: &FinalizationRecord);
}

/// Stake-threshold oracle over a fixed committee.
pub struct StakeOracle {
  committee: Arc<EpochBakers>,
  seen: HashSet<u64>,
}

impl StakeOracle {
  pub fn new(committee: Arc<EpochBakers>) -> Self {
    Self {
      committee,
      seen: HashSet::new(),
    }
  }

  fn signed_message(record: &FinalizationRecord) -> Vec<u8> {
    bincode::serialize(&(record.index, &record.block, record.delay)).unwrap()
  }
}

impl FinalizationOracle for StakeOracle {
  fn receive_record(&mut self, record: &FinalizationRecord) -> OracleVerdict {
    if self.seen.contains(&record.index) {
      return OracleVerdict::Duplicate;
    }

    let message = Self::signed_message(record);
    let mut finalizers = vec![];
    let mut stake = 0u64;
    let mut counted = HashSet::new();
    for (id, signature) in &record.proof {
      if !counted.insert(*id) {
        continue;
      }
      if let Some(member) = self.committee.get(*id) {
        if member.sign_key.verify(&message, signature) {
          stake += member.stake;
          finalizers.push(*id);
        }
      }
    }

    // two-thirds majority, rounded up
    let threshold = (self.committee.total_stake * 2 + 2) / 3;
    if stake < threshold {
      warn!(
        index = record.index,
        stake, threshold, "finalization proof under threshold"
      );
      return OracleVerdict::Rejected;
    }

    self.seen.insert(record.index);
    OracleVerdict::Consumed { finalizers }
  }

  fn block_arrived(&mut self, _hash: &Multihash, _height: Height) {}

  fn finalized(&mut self, _record: &FinalizationRecord) {}
}

#[cfg(test)]
mod tests {
  use {
    super::{FinalizationOracle, OracleVerdict, StakeOracle},
    crate::{primitives::sha256, test},
  };

  #[test]
  fn threshold_and_duplicates() {
    let chain = test::TestChain::new();
    let committee = chain.genesis_state().epoch_bakers.clone();
    let mut oracle = StakeOracle::new(committee);

    let record = chain.finalization_record(1, sha256(b"some-block"), 0);
    assert!(matches!(
      oracle.receive_record(&record),
      OracleVerdict::Consumed { .. }
    ));
    assert_eq!(oracle.receive_record(&record), OracleVerdict::Duplicate);

    let mut unsigned = chain.finalization_record(2, sha256(b"other"), 0);
    unsigned.proof.clear();
    assert_eq!(oracle.receive_record(&unsigned), OracleVerdict::Rejected);
  }
}
