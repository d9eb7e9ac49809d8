//! Pending transactions relative to the focus block.
//!
//! For each sender the table keeps the inclusive nonce interval
//! `[low, high]` of transactions that are known but not yet reached by
//! the focus block. Moving the focus forward over a block consumes
//! nonces from the low end; rolling it back across a fork re-opens
//! them.

use {
  super::BlockItem,
  crate::{
    primitives::{Nonce, Pubkey, UpdateSequence},
    state::UpdateType,
  },
  std::collections::HashMap,
};

#[derive(Debug, Default, Clone)]
pub struct PendingTransactionTable {
  accounts: HashMap<Pubkey, (Nonce, Nonce)>,
  updates: HashMap<UpdateType, (UpdateSequence, UpdateSequence)>,
}

impl PendingTransactionTable {
  /// Registers a newly admitted transaction.
  pub fn add(&mut self, item: &BlockItem) {
    if let Some((sender, nonce)) = item.sender_nonce() {
      let entry = self
        .accounts
        .entry(sender.clone())
        .or_insert((nonce, nonce));
      entry.0 = entry.0.min(nonce);
      entry.1 = entry.1.max(nonce);
    } else if let Some((ty, sequence)) = item.update_sequence() {
      let entry = self.updates.entry(ty).or_insert((sequence, sequence));
      entry.0 = entry.0.min(sequence);
      entry.1 = entry.1.max(sequence);
    }
  }

  /// Consumes the items of a block the focus moved over.
  pub fn forward_block<'a>(
    &mut self,
    items: impl Iterator<Item = &'a BlockItem>,
  ) {
    for item in items {
      if let Some((sender, nonce)) = item.sender_nonce() {
        if let Some(entry) = self.accounts.get_mut(sender) {
          entry.0 = entry.0.max(nonce + 1);
          if entry.0 > entry.1 {
            self.accounts.remove(sender);
          }
        }
      } else if let Some((ty, sequence)) = item.update_sequence() {
        if let Some(entry) = self.updates.get_mut(&ty) {
          entry.0 = entry.0.max(sequence + 1);
          if entry.0 > entry.1 {
            self.updates.remove(&ty);
          }
        }
      }
    }
  }

  /// Re-opens the items of a block the focus backed out of.
  pub fn rollback_block<'a>(
    &mut self,
    items: impl Iterator<Item = &'a BlockItem>,
  ) {
    for item in items {
      if let Some((sender, nonce)) = item.sender_nonce() {
        let entry = self
          .accounts
          .entry(sender.clone())
          .or_insert((nonce, nonce));
        entry.0 = entry.0.min(nonce);
        entry.1 = entry.1.max(nonce);
      } else if let Some((ty, sequence)) = item.update_sequence() {
        let entry = self.updates.entry(ty).or_insert((sequence, sequence));
        entry.0 = entry.0.min(sequence);
        entry.1 = entry.1.max(sequence);
      }
    }
  }

  /// Pending nonce interval for a sender, if any.
  pub fn account_range(&self, sender: &Pubkey) -> Option<(Nonce, Nonce)> {
    self.accounts.get(sender).copied()
  }

  pub fn update_range(
    &self,
    ty: UpdateType,
  ) -> Option<(UpdateSequence, UpdateSequence)> {
    self.updates.get(&ty).copied()
  }

  pub fn is_empty(&self) -> bool {
    self.accounts.is_empty() && self.updates.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use {super::PendingTransactionTable, crate::test};

  #[test]
  fn forward_consumes_and_rollback_reopens() {
    let mut pending = PendingTransactionTable::default();
    let t1 = test::transfer(1, 1, 10);
    let t2 = test::transfer(1, 2, 10);
    let t3 = test::transfer(1, 3, 10);
    pending.add(&t1);
    pending.add(&t2);
    pending.add(&t3);

    let sender = test::pubkey(1);
    assert_eq!(pending.account_range(&sender), Some((1, 3)));

    pending.forward_block([&t1, &t2].into_iter());
    assert_eq!(pending.account_range(&sender), Some((3, 3)));

    pending.forward_block([&t3].into_iter());
    assert_eq!(pending.account_range(&sender), None);
    assert!(pending.is_empty());

    pending.rollback_block([&t2, &t3].into_iter());
    assert_eq!(pending.account_range(&sender), Some((2, 3)));
  }
}
