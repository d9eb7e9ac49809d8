//! Blocks waiting for their parent.
//!
//! A block whose parent is unknown or itself pending cannot be
//! executed yet. It is parked here, keyed by the missing parent, and
//! additionally enqueued by slot so that finalization progress can
//! cheaply drop everything that became too old to ever go live.

use {
  super::block::BakedBlock,
  crate::primitives::{Slot, Timestamp},
  multihash::Multihash,
  std::{
    cmp::Reverse,
    collections::{hash_map::Entry, BinaryHeap, HashMap},
    sync::Arc,
  },
  tracing::debug,
};

/// A parked block together with its reception bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingBlock {
  pub block: Arc<BakedBlock>,
  pub hash: Multihash,
  pub received: Timestamp,
}

impl PendingBlock {
  pub fn new(block: Arc<BakedBlock>, received: Timestamp) -> Self {
    Self {
      hash: block.hash(),
      block,
      received,
    }
  }
}

#[derive(Default)]
pub struct PendingBlockTable {
  /// parent hash → blocks waiting for it
  possibly_pending: HashMap<Multihash, Vec<PendingBlock>>,
  /// (slot, child, parent) min-heap used for stale expiry. Entries
  /// are not removed when a block is resolved through its parent, so
  /// consumers must treat missing map entries as stale.
  queue: BinaryHeap<Reverse<(Slot, Multihash, Multihash)>>,
}

impl PendingBlockTable {
  /// Parks a block under its (unknown or pending) parent.
  pub fn add_pending(&mut self, pending: PendingBlock) {
    let parent = pending.block.parent;
    self
      .queue
      .push(Reverse((pending.block.slot, pending.hash, parent)));
    match self.possibly_pending.entry(parent) {
      Entry::Occupied(mut children) => children.get_mut().push(pending),
      Entry::Vacant(slot) => {
        slot.insert(vec![pending]);
      }
    }
  }

  /// Removes and returns every block waiting for `parent`.
  pub fn take_children_of(&mut self, parent: &Multihash) -> Vec<PendingBlock> {
    let children = self.possibly_pending.remove(parent).unwrap_or_default();
    if !children.is_empty() {
      debug!(count = children.len(), "pending children resolved");
    }
    children
  }

  /// Drains the slot queue up to `slot_cap` and returns the next
  /// block that is still actually pending, skipping entries whose
  /// block was already resolved some other way.
  pub fn take_next_until(&mut self, slot_cap: Slot) -> Option<PendingBlock> {
    while let Some(Reverse((slot, child, parent))) = self.queue.peek().copied()
    {
      if slot > slot_cap {
        return None;
      }
      self.queue.pop();

      if let Some(children) = self.possibly_pending.get_mut(&parent) {
        if let Some(at) = children.iter().position(|p| p.hash == child) {
          let pending = children.swap_remove(at);
          if children.is_empty() {
            self.possibly_pending.remove(&parent);
          }
          return Some(pending);
        }
      }
      // stale: the same block was resolved through its parent before
      // the queue got to it
    }
    None
  }

  pub fn is_empty(&self) -> bool {
    self.possibly_pending.is_empty()
  }

  pub fn len(&self) -> usize {
    self.possibly_pending.values().map(Vec::len).sum()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{PendingBlock, PendingBlockTable},
    crate::{primitives::Timestamp, test},
  };

  #[test]
  fn children_resolve_by_parent() {
    let chain = test::TestChain::new();
    let parent = chain.bake(&chain.genesis_hash(), 1, vec![]);
    let child_a = chain.bake_child(&parent, 2, vec![]);
    let child_b = chain.bake_child(&parent, 3, vec![]);

    let mut table = PendingBlockTable::default();
    table.add_pending(PendingBlock::new(child_a.clone(), Timestamp(0)));
    table.add_pending(PendingBlock::new(child_b.clone(), Timestamp(0)));
    assert_eq!(table.len(), 2);

    let taken = table.take_children_of(&parent.hash());
    assert_eq!(taken.len(), 2);
    assert!(table.is_empty());
    assert!(table.take_children_of(&parent.hash()).is_empty());
  }

  #[test]
  fn slot_queue_skips_stale_entries() {
    let chain = test::TestChain::new();
    let parent = chain.bake(&chain.genesis_hash(), 1, vec![]);
    let early = chain.bake_child(&parent, 2, vec![]);
    let late = chain.bake_child(&parent, 40, vec![]);

    let mut table = PendingBlockTable::default();
    table.add_pending(PendingBlock::new(early.clone(), Timestamp(0)));
    table.add_pending(PendingBlock::new(late.clone(), Timestamp(0)));

    // resolving via the parent leaves the queue entries behind
    let _ = table.take_children_of(&parent.hash());
    assert!(table.take_next_until(100).is_none());

    // fresh pending entry is still returned, respecting the cap
    let other = chain.bake_child(&parent, 7, vec![]);
    table.add_pending(PendingBlock::new(other.clone(), Timestamp(0)));
    assert!(table.take_next_until(5).is_none());
    let taken = table.take_next_until(10).unwrap();
    assert_eq!(taken.hash, other.hash());
  }
}
