//! The transaction table: every item the node knows about, indexed by
//! hash and by its (sender, nonce) or (update type, sequence) stream.
//!
//! The non-finalized part of each stream is kept contiguous: for every
//! sender the nonces present form an interval starting at the next
//! admissible nonce, with possibly several competing items per nonce
//! until finalization picks one.

use {
  super::{BlockItem, VerificationOutcome},
  crate::{
    primitives::{Nonce, Pubkey, Slot, Timestamp, UpdateSequence},
    results::UpdateResult,
    state::UpdateType,
  },
  multihash::Multihash,
  std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
  },
  tracing::debug,
};

/// Lifecycle of an item in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
  /// Known, not yet part of any live block. `slot` is the slot the
  /// item was received as of.
  Received {
    slot: Slot,
    verres: VerificationOutcome,
  },
  /// Part of one or more live blocks; the map records the item's
  /// index within each of them.
  Committed {
    slot: Slot,
    verres: VerificationOutcome,
    blocks: HashMap<Multihash, usize>,
  },
  /// Part of a finalized block, permanently.
  Finalized {
    slot: Slot,
    block: Multihash,
    index: usize,
  },
  /// Lost the nonce race to a finalized competitor; kept only until
  /// the next purge so status queries stay answerable.
  Dropped,
}

impl TransactionStatus {
  pub fn verification(&self) -> Option<VerificationOutcome> {
    match self {
      TransactionStatus::Received { verres, .. }
      | TransactionStatus::Committed { verres, .. } => Some(*verres),
      _ => None,
    }
  }

  fn latest_slot(&self) -> Slot {
    match self {
      TransactionStatus::Received { slot, .. }
      | TransactionStatus::Committed { slot, .. }
      | TransactionStatus::Finalized { slot, .. } => *slot,
      TransactionStatus::Dropped => 0,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TransactionEntry {
  pub item: Arc<BlockItem>,
  pub status: TransactionStatus,
  pub arrival: Timestamp,
}

/// Outcome of [`TransactionTable::add_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
  Added(VerificationOutcome),
  Duplicate(Option<VerificationOutcome>),
  ObsoleteNonce,
  NotAdded(UpdateResult),
}

#[derive(Debug, Default)]
struct NonFinalizedStream {
  next: u64,
  by_nonce: BTreeMap<u64, BTreeSet<Multihash>>,
}

impl NonFinalizedStream {
  /// Highest nonce the interval may be extended with while staying
  /// contiguous.
  fn admissible_upper(&self) -> u64 {
    self
      .by_nonce
      .keys()
      .next_back()
      .map(|hi| hi + 1)
      .unwrap_or(self.next)
  }
}

#[derive(Default)]
pub struct TransactionTable {
  by_hash: HashMap<Multihash, TransactionEntry>,
  accounts: HashMap<Pubkey, NonFinalizedStream>,
  updates: HashMap<UpdateType, NonFinalizedStream>,
  insertions: u32,
}

impl TransactionTable {
  pub fn lookup(&self, hash: &Multihash) -> Option<&TransactionEntry> {
    self.by_hash.get(hash)
  }

  pub fn len(&self) -> usize {
    self.by_hash.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_hash.is_empty()
  }

  /// Next admissible nonce for a sender, folding in the state's view
  /// when the table has no stream yet.
  pub fn next_account_nonce(&self, sender: &Pubkey, state_next: Nonce) -> Nonce {
    self
      .accounts
      .get(sender)
      .map(|s| s.next.max(state_next))
      .unwrap_or(state_next)
  }

  /// Adds an item to the table, verifying placement in its stream.
  ///
  /// `stream_start` is the next nonce / sequence of the stream in the
  /// last finalized state. `individual` marks items received on their
  /// own rather than inside a block; those must verify cleanly, while
  /// block-borne items are kept with whatever verdict they got so the
  /// scheduler can recheck them later.
  pub fn add_commit(
    &mut self,
    item: Arc<BlockItem>,
    verres: VerificationOutcome,
    arrival: Timestamp,
    slot: Slot,
    stream_start: u64,
    individual: bool,
  ) -> AddResult {
    let hash = item.hash();
    if let Some(entry) = self.by_hash.get(&hash) {
      return AddResult::Duplicate(entry.status.verification());
    }

    // place the item in its stream first: an obsolete position is
    // reported as such even when verification also had complaints
    let stream = if let Some((sender, _)) = item.sender_nonce() {
      Some(
        self
          .accounts
          .entry(sender.clone())
          .or_insert_with(|| NonFinalizedStream {
            next: stream_start,
            ..NonFinalizedStream::default()
          }),
      )
    } else if let Some((ty, _)) = item.update_sequence() {
      Some(self.updates.entry(ty).or_insert_with(|| {
        NonFinalizedStream {
          next: stream_start,
          ..NonFinalizedStream::default()
        }
      }))
    } else {
      None
    };

    let position = item
      .sender_nonce()
      .map(|(_, nonce)| nonce)
      .or_else(|| item.update_sequence().map(|(_, seq)| seq));

    if let (Some(stream), Some(position)) = (&stream, position) {
      if position < stream.next.max(stream_start) {
        return AddResult::ObsoleteNonce;
      }
      if position > stream.admissible_upper().max(stream_start) {
        return AddResult::NotAdded(UpdateResult::NonceTooLarge);
      }
    }

    if !verres.future_valid() {
      return AddResult::NotAdded(verres.reject_code());
    }
    if individual && !verres.is_valid() {
      return AddResult::NotAdded(verres.reject_code());
    }

    if let (Some(stream), Some(position)) = (stream, position) {
      stream.next = stream.next.max(stream_start);
      stream.by_nonce.entry(position).or_default().insert(hash);
    }

    self.by_hash.insert(hash, TransactionEntry {
      item,
      status: TransactionStatus::Received { slot, verres },
      arrival,
    });
    self.insertions += 1;
    AddResult::Added(verres)
  }

  /// Records that a live block at `slot` carries the item at
  /// position `index`.
  pub fn commit_in_block(
    &mut self,
    block: Multihash,
    slot: Slot,
    tx: &Multihash,
    index: usize,
  ) {
    if let Some(entry) = self.by_hash.get_mut(tx) {
      match &mut entry.status {
        TransactionStatus::Received { verres, .. } => {
          let verres = *verres;
          let mut blocks = HashMap::new();
          blocks.insert(block, index);
          entry.status = TransactionStatus::Committed {
            slot,
            verres,
            blocks,
          };
        }
        TransactionStatus::Committed {
          slot: latest,
          blocks,
          ..
        } => {
          *latest = (*latest).max(slot);
          blocks.insert(block, index);
        }
        _ => {}
      }
    }
  }

  /// Forgets the association between a now-dead block and an item.
  pub fn mark_dead_in_block(&mut self, block: &Multihash, tx: &Multihash) {
    if let Some(entry) = self.by_hash.get_mut(tx) {
      if let TransactionStatus::Committed {
        slot,
        verres,
        blocks,
      } = &mut entry.status
      {
        blocks.remove(block);
        if blocks.is_empty() {
          entry.status = TransactionStatus::Received {
            slot: *slot,
            verres: *verres,
          };
        }
      }
    }
  }

  /// Moves an item into the finalized state and retires every
  /// competitor at the same nonce or below. Returns the hashes that
  /// lost the race, now `Dropped`.
  pub fn finalize(
    &mut self,
    tx: &Multihash,
    block: Multihash,
    slot: Slot,
  ) -> Vec<Multihash> {
    let Some(entry) = self.by_hash.get_mut(tx) else {
      return vec![];
    };

    let index = match &entry.status {
      TransactionStatus::Committed { blocks, .. } => {
        blocks.get(&block).copied().unwrap_or(0)
      }
      _ => 0,
    };
    entry.status = TransactionStatus::Finalized { slot, block, index };
    let item = Arc::clone(&entry.item);

    let mut dropped = vec![];
    let mut retire = |stream: &mut NonFinalizedStream, upto: u64| {
      let keep = stream.by_nonce.split_off(&(upto + 1));
      for (_, competitors) in std::mem::replace(&mut stream.by_nonce, keep) {
        for hash in competitors {
          if hash != *tx {
            dropped.push(hash);
          }
        }
      }
      stream.next = stream.next.max(upto + 1);
    };

    if let Some((sender, nonce)) = item.sender_nonce() {
      if let Some(stream) = self.accounts.get_mut(sender) {
        retire(stream, nonce);
      }
    } else if let Some((ty, sequence)) = item.update_sequence() {
      if let Some(stream) = self.updates.get_mut(&ty) {
        retire(stream, sequence);
      }
    }

    for hash in &dropped {
      if let Some(loser) = self.by_hash.get_mut(hash) {
        debug!(dropped = %loser.item, "transaction lost its nonce race");
        loser.status = TransactionStatus::Dropped;
      }
    }
    dropped
  }

  /// Whether enough insertions happened to warrant a purge.
  pub fn purge_due(&self, cadence: u32) -> bool {
    self.insertions >= cadence
  }

  /// Deletes items that can no longer make it into any live block:
  /// their latest slot is at or below the last finalized slot and
  /// they have been sitting untouched past the keep-alive horizon.
  pub fn purge(
    &mut self,
    now: Timestamp,
    keep_alive: Duration,
    last_finalized_slot: Slot,
  ) {
    let horizon = now.saturating_sub(keep_alive);
    let mut removed = vec![];

    self.by_hash.retain(|hash, entry| {
      let purgeable = match &entry.status {
        TransactionStatus::Received { slot, .. } => {
          *slot <= last_finalized_slot
        }
        TransactionStatus::Dropped => true,
        _ => false,
      };
      if purgeable && entry.arrival <= horizon {
        removed.push((*hash, Arc::clone(&entry.item)));
        false
      } else {
        true
      }
    });

    for (hash, item) in &removed {
      if let Some((sender, nonce)) = item.sender_nonce() {
        if let Some(stream) = self.accounts.get_mut(sender) {
          if let Some(set) = stream.by_nonce.get_mut(&nonce) {
            set.remove(hash);
            if set.is_empty() {
              stream.by_nonce.remove(&nonce);
            }
          }
        }
      } else if let Some((ty, sequence)) = item.update_sequence() {
        if let Some(stream) = self.updates.get_mut(&ty) {
          if let Some(set) = stream.by_nonce.get_mut(&sequence) {
            set.remove(hash);
            if set.is_empty() {
              stream.by_nonce.remove(&sequence);
            }
          }
        }
      }
    }

    self.accounts.retain(|_, s| !s.by_nonce.is_empty() || s.next > 1);
    self.insertions = 0;
    if !removed.is_empty() {
      debug!(count = removed.len(), "purged transactions");
    }
  }

  /// All non-finalized items of a sender from a nonce on, in nonce
  /// order.
  pub fn account_non_finalized(
    &self,
    sender: &Pubkey,
    from: Nonce,
  ) -> Vec<(Nonce, Vec<Multihash>)> {
    self
      .accounts
      .get(sender)
      .map(|stream| {
        stream
          .by_nonce
          .range(from..)
          .map(|(nonce, set)| (*nonce, set.iter().copied().collect()))
          .collect()
      })
      .unwrap_or_default()
  }

  /// All non-finalized chain updates of a type from a sequence on.
  pub fn non_finalized_updates(
    &self,
    ty: UpdateType,
    from: UpdateSequence,
  ) -> Vec<(UpdateSequence, Vec<Multihash>)> {
    self
      .updates
      .get(&ty)
      .map(|stream| {
        stream
          .by_nonce
          .range(from..)
          .map(|(seq, set)| (*seq, set.iter().copied().collect()))
          .collect()
      })
      .unwrap_or_default()
  }

  /// Checks the contiguity invariant for every sender; test hook.
  #[cfg(test)]
  pub fn nonces_contiguous(&self) -> bool {
    self.accounts.values().all(|stream| {
      stream
        .by_nonce
        .keys()
        .enumerate()
        .all(|(i, nonce)| *nonce == stream.next + i as u64)
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{AddResult, TransactionStatus, TransactionTable},
    crate::{
      primitives::Timestamp,
      results::UpdateResult,
      test,
      transactions::VerificationOutcome,
    },
    std::{sync::Arc, time::Duration},
  };

  const KEEP_ALIVE: Duration = Duration::from_secs(600);

  fn add(
    table: &mut TransactionTable,
    nonce: u64,
    pay: u8,
  ) -> (multihash::Multihash, AddResult) {
    let item = Arc::new(test::transfer(1, nonce, pay as u64));
    let hash = item.hash();
    let result = table.add_commit(
      item,
      VerificationOutcome::Valid,
      Timestamp(0),
      0,
      1,
      true,
    );
    (hash, result)
  }

  #[test]
  fn duplicate_returns_cached_verdict() {
    let mut table = TransactionTable::default();
    let (_, first) = add(&mut table, 1, 10);
    assert_eq!(first, AddResult::Added(VerificationOutcome::Valid));
    let (_, second) = add(&mut table, 1, 10);
    assert_eq!(
      second,
      AddResult::Duplicate(Some(VerificationOutcome::Valid))
    );
  }

  #[test]
  fn nonce_interval_stays_contiguous() {
    let mut table = TransactionTable::default();
    assert!(matches!(add(&mut table, 1, 1).1, AddResult::Added(_)));
    assert!(matches!(add(&mut table, 2, 2).1, AddResult::Added(_)));
    // competing item at an occupied nonce is fine
    assert!(matches!(add(&mut table, 2, 3).1, AddResult::Added(_)));
    // a gap is not
    assert_eq!(
      add(&mut table, 5, 4).1,
      AddResult::NotAdded(UpdateResult::NonceTooLarge)
    );
    assert!(table.nonces_contiguous());
  }

  #[test]
  fn obsolete_nonce_rejected() {
    let mut table = TransactionTable::default();
    let item = Arc::new(test::transfer(1, 1, 1));
    let result = table.add_commit(
      item,
      VerificationOutcome::Valid,
      Timestamp(0),
      0,
      // the finalized state already expects nonce 3
      3,
      true,
    );
    assert_eq!(result, AddResult::ObsoleteNonce);
  }

  #[test]
  fn finalize_drops_competitors_and_advances_nonce() {
    let mut table = TransactionTable::default();
    let (winner, _) = add(&mut table, 7, 1);
    let (loser, _) = add(&mut table, 7, 2);

    let block = crate::primitives::sha256(b"block");
    table.commit_in_block(block, 9, &winner, 0);
    let dropped = table.finalize(&winner, block, 9);

    assert_eq!(dropped, vec![loser]);
    assert!(matches!(
      table.lookup(&winner).unwrap().status,
      TransactionStatus::Finalized { .. }
    ));
    assert!(matches!(
      table.lookup(&loser).unwrap().status,
      TransactionStatus::Dropped
    ));
    let sender = test::pubkey(1);
    assert_eq!(table.next_account_nonce(&sender, 1), 8);
  }

  #[test]
  fn dead_block_association_reverts_to_received() {
    let mut table = TransactionTable::default();
    let (hash, _) = add(&mut table, 1, 1);
    let block = crate::primitives::sha256(b"doomed");

    table.commit_in_block(block, 3, &hash, 0);
    assert!(matches!(
      table.lookup(&hash).unwrap().status,
      TransactionStatus::Committed { .. }
    ));

    table.mark_dead_in_block(&block, &hash);
    assert!(matches!(
      table.lookup(&hash).unwrap().status,
      TransactionStatus::Received { .. }
    ));
  }

  #[test]
  fn purge_takes_only_stale_and_old() {
    let mut table = TransactionTable::default();
    let (old_stale, _) = add(&mut table, 1, 1);
    let fresh = Arc::new(test::transfer(2, 1, 2));
    let fresh_hash = fresh.hash();
    table.add_commit(
      fresh,
      VerificationOutcome::Valid,
      Timestamp(10_000_000),
      100,
      1,
      true,
    );

    // old_stale: arrival 0, slot 0 <= finalized slot 50 -> goes
    // fresh: slot 100 > 50 -> survives regardless of age
    table.purge(Timestamp(10_000_000), KEEP_ALIVE, 50);
    assert!(table.lookup(&old_stale).is_none());
    assert!(table.lookup(&fresh_hash).is_some());
  }
}
