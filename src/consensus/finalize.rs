//! The finalization processor.
//!
//! A trusted record (one the oracle vouched for) advances the last
//! finalized block, finalizes the ancestor chain up to it, prunes
//! every competing branch and archives the states that fell strictly
//! below the new LFB. The persistent half of the step (statuses,
//! record, outcomes) commits as a single LMDB transaction.

use {
  super::{
    block::FinalizationRecord,
    receive::HostContext,
    tree::{BlockStatus, Skov, StateRef, StoredBlock, StoredBlockRecord},
  },
  crate::{
    primitives::{BakerId, ToBase58String},
    results::UpdateResult,
    state::ThawedState,
    storage::FinalizationCommit,
  },
  multihash::Multihash,
  std::collections::HashSet,
  tracing::{error, info},
};

impl Skov {
  /// Advances finalization by one validated record.
  ///
  /// The record must carry the next expected index and finalize an
  /// alive block; both were already checked by the reception paths,
  /// and are re-checked here because this is the boundary that
  /// guards the tree invariants.
  pub(crate) fn do_trusted_finalize(
    &mut self,
    record: FinalizationRecord,
    _finalizers: &[BakerId],
    host: &mut HostContext,
  ) -> Result<(), UpdateResult> {
    if record.index != self.next_finalization_index() {
      return Err(UpdateResult::Invalid);
    }
    let new_lfb = record.block;
    if !matches!(self.status(&new_lfb), Some(BlockStatus::Alive)) {
      return Err(UpdateResult::Unverifiable);
    }

    let old_lfb = self.last_finalized().1;
    let old_height = self.last_finalized_height();
    let new_height = self
      .entries
      .get(&new_lfb)
      .map(|e| e.height)
      .ok_or(UpdateResult::Unverifiable)?;
    let prune_layers = (new_height - old_height) as usize;

    // a focus block on a branch about to be pruned moves to the new
    // LFB; one on the surviving trunk (or deeper on it) stays
    let focus = self.focus;
    if !self.is_ancestor(&focus, &new_lfb)
      && !self.is_ancestor(&new_lfb, &focus)
    {
      self.set_focus(new_lfb);
    }

    // ancestors from just above the old LFB up to the new one
    let mut to_finalize = vec![];
    let mut at = new_lfb;
    while at != old_lfb {
      to_finalize.push(at);
      at = self
        .entries
        .get(&at)
        .and_then(|e| e.parent())
        .ok_or(UpdateResult::Invalid)?;
    }
    to_finalize.reverse();

    let finalized_set: HashSet<Multihash> =
      to_finalize.iter().copied().collect();
    let mut to_remove: Vec<Multihash> = vec![];
    for layer in self.branches.iter().take(prune_layers) {
      for hash in layer {
        if !finalized_set.contains(hash) {
          to_remove.push(*hash);
        }
      }
    }

    // mark finalized, settle transactions, advance nonce streams
    self.finalization_list.push((record.clone(), new_lfb));
    for hash in &to_finalize {
      let (height, slot, items) = {
        let entry = self.entries.get(hash).ok_or(UpdateResult::Invalid)?;
        let items: Vec<Multihash> =
          entry.block.items().iter().map(|i| i.hash()).collect();
        (entry.height, entry.slot(), items)
      };
      self.statuses.insert(*hash, BlockStatus::Finalized { height });
      self.finalized_height_index.insert(height, *hash);
      for item in items {
        for dropped in self.transactions.finalize(&item, *hash, slot) {
          host.verification.forget(&dropped);
        }
      }
    }

    // write states to the era segment and build the atomic commit;
    // everything strictly below the new LFB loses its mutable state
    let mut commit = FinalizationCommit {
      index: record.index,
      record: bincode::serialize(&(&record, &new_lfb))
        .map_err(|_| UpdateResult::Invalid)?,
      ..FinalizationCommit::default()
    };
    let mut archive_list = to_finalize.clone();
    archive_list.push(old_lfb);

    for hash in &to_finalize {
      let entry = self.entries.get(hash).ok_or(UpdateResult::Invalid)?;
      let state = match &entry.state {
        StateRef::Cached(state) => state.clone(),
        StateRef::Archived { .. } => continue,
      };
      let key = match entry.state_key {
        Some(key) => key,
        None => self.state_file.append(state.as_ref()).map_err(|e| {
          error!("cannot persist block state: {e}");
          UpdateResult::Invalid
        })?,
      };

      let stored = StoredBlockRecord {
        block: match &entry.block {
          super::block::AnyBlock::Genesis(g) => {
            StoredBlock::Genesis((**g).clone())
          }
          super::block::AnyBlock::Baked(b) => {
            StoredBlock::Baked((**b).clone())
          }
        },
        height: entry.height,
        state_key: key.0,
      };
      commit.blocks.push((
        *hash,
        entry.height,
        bincode::serialize(&stored).map_err(|_| UpdateResult::Invalid)?,
      ));
      for outcome in entry.outcomes.iter() {
        commit.outcomes.push((
          outcome.hash,
          bincode::serialize(outcome).map_err(|_| UpdateResult::Invalid)?,
        ));
      }

      let entry = self.entries.get_mut(hash).unwrap();
      entry.state_key = Some(key);
    }

    if let Err(e) = self.store.commit_finalization(&commit) {
      // the journal is the source of truth at restart; if it cannot
      // advance, stop accepting writes and let the host terminate
      error!("finalization step failed to persist: {e}");
      self.finalization_list.pop();
      self.shutdown = true;
      return Err(UpdateResult::Invalid);
    }

    for hash in &archive_list {
      if *hash == new_lfb {
        continue;
      }
      if let Some(entry) = self.entries.get_mut(hash) {
        if let (StateRef::Cached(state), Some(key)) =
          (&entry.state, entry.state_key)
        {
          entry.state = StateRef::Archived {
            hash: state.hash(),
            key,
          };
        }
      }
    }

    // prune the surviving branches above the new LFB
    let upper = if prune_layers <= self.branches.len() {
      self.branches.split_off(prune_layers)
    } else {
      vec![]
    };
    self.branches.clear();

    let mut kept_prev: HashSet<Multihash> = HashSet::new();
    kept_prev.insert(new_lfb);
    for layer in upper {
      let mut kept = vec![];
      for hash in layer {
        let parent = self.entries.get(&hash).and_then(|e| e.parent());
        match parent {
          Some(parent) if kept_prev.contains(&parent) => kept.push(hash),
          _ => to_remove.push(hash),
        }
      }
      kept_prev = kept.iter().copied().collect();
      self.branches.push(kept);
    }
    while self.branches.last().map(Vec::is_empty).unwrap_or(false) {
      self.branches.pop();
    }

    // kill the losers, deepest first so no parent is touched after
    // its children are gone
    let mut doomed: Vec<(u64, Multihash, Vec<Multihash>)> = to_remove
      .iter()
      .filter_map(|hash| {
        self.entries.get(hash).map(|e| {
          let items = e.block.items().iter().map(|i| i.hash()).collect();
          (e.height, *hash, items)
        })
      })
      .collect();
    doomed.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, hash, items) in doomed {
      for item in items {
        self.transactions.mark_dead_in_block(&hash, &item);
      }
      self.mark_dead(hash);
    }

    self.purge_pending_blocks();

    self.stats.finalization_count += 1;
    self.stats.last_finalization = Some(host.now);
    host.oracle.finalized(&record);

    info!(
      index = record.index,
      block = %new_lfb.to_b58(),
      height = new_height,
      pruned = to_remove.len(),
      "finalization advanced"
    );

    self.check_protocol_update(host);
    Ok(())
  }
}

/// Splits the finalization reward pool equally among the signers of
/// a carried record, inside the state transition of the block that
/// carries it.
pub(crate) fn apply_finalization_rewards(
  workspace: &mut ThawedState,
  finalizers: &[BakerId],
) {
  if finalizers.is_empty() {
    return;
  }
  let mut rewards = workspace.rewards();
  let share = rewards.finalization_reward / finalizers.len() as u64;
  if share == 0 {
    return;
  }

  let mut paid = 0;
  for id in finalizers {
    let Some(account) =
      workspace.bakers().baker(*id).map(|b| b.account.clone())
    else {
      continue;
    };
    if let Some(holder) = workspace.account(&account) {
      let mut holder = (*holder).clone();
      holder.balance += share;
      workspace.set_account(holder);
      paid += share;
    }
  }
  rewards.finalization_reward -= paid;
  workspace.set_rewards(rewards);
}
