//! Reception and execution of blocks and transactions.
//!
//! Reception is two-phase: `receive_block` validates everything that
//! can be validated without the parent state and either parks the
//! block as pending or hands back an [`ExecuteCont`]. The caller must
//! pass that handle to `execute_block` or drop it; dropping it
//! without executing marks the block dead at the next operation, so a
//! block can never linger half-received.

use {
  super::{
    block::BakedBlock,
    callbacks::Callbacks,
    oracle::{FinalizationOracle, OracleVerdict},
    pending::PendingBlock,
    tree::{BlockStatus, Skov},
  },
  crate::{
    primitives::{Timestamp, ToBase58String},
    results::UpdateResult,
    scheduler::{self, BlockContext, ExecutionEngine},
    state::BlockState,
    transactions::{verify_item, BlockItem, VerificationCache},
  },
  multihash::Multihash,
  std::sync::{Arc, Mutex},
  tracing::{debug, warn},
};

/// Everything the host lends the core for one operation.
pub struct HostContext<'a> {
  pub oracle: &'a mut dyn FinalizationOracle,
  pub engine: &'a dyn ExecutionEngine,
  pub callbacks: &'a Callbacks,
  pub verification: &'a VerificationCache,
  pub now: Timestamp,
}

/// Execution handle for a received block whose parent is live.
///
/// Must be passed to [`Skov::execute_block`]; dropping it unused
/// reports the block into the tree's dead-drop so it is marked dead.
pub struct ExecuteCont {
  pending: Option<PendingBlock>,
  deadbox: Arc<Mutex<Vec<Multihash>>>,
}

impl ExecuteCont {
  fn new(pending: PendingBlock, deadbox: Arc<Mutex<Vec<Multihash>>>) -> Self {
    Self {
      pending: Some(pending),
      deadbox,
    }
  }

  pub fn block_hash(&self) -> Multihash {
    self.pending.as_ref().unwrap().hash
  }

  fn take(mut self) -> PendingBlock {
    self.pending.take().unwrap()
  }
}

impl Drop for ExecuteCont {
  fn drop(&mut self) {
    if let Some(pending) = self.pending.take() {
      self.deadbox.lock().unwrap().push(pending.hash);
    }
  }
}

impl Skov {
  /// Marks blocks whose execution handle was dropped unused.
  pub(crate) fn sweep_deadbox(&mut self) {
    let dropped: Vec<Multihash> =
      std::mem::take(&mut *self.deadbox.lock().unwrap());
    for hash in dropped {
      warn!(
        "execution handle for {} dropped without executing",
        hash.to_b58()
      );
      self.mark_dead(hash);
    }
  }

  /// Validates an inbound block up to the point where its parent
  /// state is needed. Handles the wire `block` message type.
  pub fn receive_block(
    &mut self,
    genesis_index: u32,
    bytes: &[u8],
    host: &mut HostContext,
  ) -> (UpdateResult, Option<ExecuteCont>) {
    self.sweep_deadbox();

    if self.shutdown {
      return (UpdateResult::ConsensusShutDown, None);
    }
    if bytes.len() as u32 > self.params.max_block_size {
      return (UpdateResult::SerializationFail, None);
    }
    let block: BakedBlock = match bincode::deserialize(bytes) {
      Ok(block) => block,
      Err(_) => return (UpdateResult::SerializationFail, None),
    };
    if genesis_index != self.genesis_index {
      return (UpdateResult::InvalidGenesisIndex, None);
    }

    let block = Arc::new(block);
    let hash = block.hash();
    self.stats.blocks_received += 1;

    let lfb_state = self.last_finalized_state();
    let threshold = self.params.early_block_threshold;
    if lfb_state.slot_time(block.slot) > host.now + threshold {
      debug!("{block} is early, not marking dead");
      return (UpdateResult::EarlyBlock, None);
    }

    if self.statuses.contains_key(&hash) {
      return (UpdateResult::Duplicate, None);
    }

    if block.slot <= self.last_finalized_slot() {
      self.statuses.insert(hash, BlockStatus::Dead);
      return (UpdateResult::Stale, None);
    }

    match self.status(&block.parent) {
      None | Some(BlockStatus::Pending) => {
        if !self.preflight_checks(&block, &lfb_state, host) {
          self.statuses.insert(hash, BlockStatus::Dead);
          return (UpdateResult::Invalid, None);
        }
        self.statuses.insert(hash, BlockStatus::Pending);
        self
          .pending_blocks
          .add_pending(PendingBlock::new(block, host.now));
        (UpdateResult::PendingBlock, None)
      }
      Some(BlockStatus::Dead) => (UpdateResult::Stale, None),
      Some(BlockStatus::Alive) | Some(BlockStatus::Finalized { .. }) => {
        if self.live_parent_checks(&block).is_err()
          || !block.verify_signature()
        {
          self.statuses.insert(hash, BlockStatus::Dead);
          return (UpdateResult::Invalid, None);
        }
        let cont = ExecuteCont::new(
          PendingBlock::new(block, host.now),
          Arc::clone(&self.deadbox),
        );
        (UpdateResult::Success, Some(cont))
      }
    }
  }

  /// Checks a block whose parent state is not available, against the
  /// last finalized state. Best effort: a pass here does not make the
  /// block valid, only worth keeping.
  fn preflight_checks(
    &mut self,
    block: &Arc<BakedBlock>,
    lfb_state: &Arc<BlockState>,
    host: &mut HostContext,
  ) -> bool {
    if !block.verify_signature() {
      return false;
    }

    // best-effort admission of the carried transactions so they are
    // already verified if the block goes live later
    let lfb_slot = self.last_finalized_slot();
    for item in &block.items {
      self.admit_item(
        Arc::new(item.clone()),
        lfb_state,
        lfb_slot,
        false,
        host,
      );
    }

    if let Some(committee) = lfb_state.definite_slot_bakers(block.slot) {
      let Some(member) = committee.get(block.baker) else {
        return false;
      };
      if member.sign_key != block.baker_key {
        return false;
      }

      // the election nonce is only predictable while the block's
      // slot stays inside the last finalized epoch
      if let Some(nonce) = lfb_state.seed.predictable_nonce_for(block.slot) {
        if !block.nonce.verify(&member.election_key, &nonce, block.slot) {
          return false;
        }
        if !block.proof.verify(&member.election_key, &nonce, block.slot) {
          return false;
        }
        let difficulty = lfb_state
          .election_difficulty_at(lfb_state.slot_time(block.slot));
        if !block.proof.wins(difficulty, member.stake, committee.total_stake)
        {
          return false;
        }
      }
    }

    true
  }

  /// Full validity checks against a live parent.
  fn live_parent_checks(&self, block: &BakedBlock) -> Result<(), ()> {
    let parent = self.entry(&block.parent).ok_or(())?;
    if parent.slot() >= block.slot {
      return Err(());
    }
    if block.height != parent.height + 1 {
      return Err(());
    }
    match self.status(&block.last_finalized) {
      Some(BlockStatus::Finalized { .. }) => {}
      // a block may point at the very block its carried record is
      // about to finalize
      Some(BlockStatus::Alive)
        if block
          .finalization
          .as_ref()
          .map(|r| r.block == block.last_finalized)
          .unwrap_or(false) => {}
      _ => return Err(()),
    }

    let parent_state = self
      .block_state(&block.parent)
      .map_err(|_| ())?
      .ok_or(())?;
    let committee = parent_state.slot_bakers(block.slot);
    let member = committee.get(block.baker).ok_or(())?;
    if member.sign_key != block.baker_key {
      return Err(());
    }

    let nonce = parent_state.seed.nonce_for(block.slot);
    if !block.nonce.verify(&member.election_key, &nonce, block.slot) {
      return Err(());
    }
    if !block.proof.verify(&member.election_key, &nonce, block.slot) {
      return Err(());
    }
    let difficulty = parent_state
      .election_difficulty_at(parent_state.slot_time(block.slot));
    if !block.proof.wins(difficulty, member.stake, committee.total_stake) {
      return Err(());
    }

    Ok(())
  }

  /// Executes a block whose reception succeeded, then promotes any
  /// pending children that were waiting for it.
  pub fn execute_block(
    &mut self,
    cont: ExecuteCont,
    host: &mut HostContext,
  ) -> UpdateResult {
    let first = cont.take();
    let result = self.execute_live(&first, host);

    if result != UpdateResult::Success {
      return result;
    }

    // recursively promote pending children; they were pre-verified,
    // full execution happens through the same path now
    let mut queue = self.pending_blocks.take_children_of(&first.hash);
    while let Some(child) = queue.pop() {
      if self.live_parent_checks(&child.block).is_err() {
        self.mark_dead(child.hash);
        continue;
      }
      if self.execute_live(&child, host) == UpdateResult::Success {
        let mut grandchildren =
          self.pending_blocks.take_children_of(&child.hash);
        queue.append(&mut grandchildren);
      }
    }

    result
  }

  /// The execution step proper: one block against its parent state.
  fn execute_live(
    &mut self,
    pending: &PendingBlock,
    host: &mut HostContext,
  ) -> UpdateResult {
    let block = &pending.block;
    let hash = pending.hash;

    // the parent may have died since reception
    if !matches!(
      self.status(&block.parent),
      Some(BlockStatus::Alive) | Some(BlockStatus::Finalized { .. })
    ) {
      self.mark_dead(hash);
      return UpdateResult::Invalid;
    }

    // a carried finalization record advances finalization before the
    // block's own transactions run
    if let Some(record) = &block.finalization {
      let next = self.next_finalization_index();
      if record.index < next {
        // must agree with what that index already finalized
        if self.finalization_list[record.index as usize].1 != record.block {
          self.mark_dead(hash);
          return UpdateResult::Invalid;
        }
      } else if record.index > next
        || record.block != block.last_finalized
      {
        // a single finalized ancestor: the record must finalize the
        // block the chain expects next
        self.mark_dead(hash);
        return UpdateResult::Invalid;
      } else {
        match host.oracle.receive_record(record) {
          OracleVerdict::Consumed { finalizers } => {
            if self
              .do_trusted_finalize(record.clone(), &finalizers, host)
              .is_err()
            {
              self.mark_dead(hash);
              return UpdateResult::Invalid;
            }
          }
          OracleVerdict::Duplicate => {}
          OracleVerdict::Rejected => {
            self.mark_dead(hash);
            return UpdateResult::Invalid;
          }
        }
        // the advance may have pruned the branch this block extends
        if !matches!(
          self.status(&block.parent),
          Some(BlockStatus::Alive) | Some(BlockStatus::Finalized { .. })
        ) {
          self.mark_dead(hash);
          return UpdateResult::Invalid;
        }
      }
    }

    let parent_state = match self.block_state(&block.parent) {
      Ok(Some(state)) => state,
      _ => {
        self.mark_dead(hash);
        return UpdateResult::Invalid;
      }
    };

    let mut workspace = parent_state.thaw();
    workspace.set_seed(parent_state.seed.update(block.slot, &block.nonce));

    // signers of a carried record take their cut of the finalization
    // reward pool inside this block's state transition, so the reward
    // is identical however the record reached us
    if let Some(record) = &block.finalization {
      let mut rewardees: Vec<crate::primitives::BakerId> =
        record.proof.iter().map(|(id, _)| *id).collect();
      rewardees.sort_unstable();
      rewardees.dedup();
      super::finalize::apply_finalization_rewards(&mut workspace, &rewardees);
    }

    let items: Vec<Arc<BlockItem>> =
      block.items.iter().cloned().map(Arc::new).collect();
    let ctx = BlockContext {
      slot: block.slot,
      slot_time: parent_state.slot_time(block.slot),
      baker: Some(block.baker),
      max_energy: parent_state.params.max_block_energy,
    };

    let summary = match scheduler::execute_items(
      &mut workspace,
      &items,
      &ctx,
      host.engine,
      host.verification,
    ) {
      Ok(summary) => summary,
      Err(error) => {
        warn!("{block} failed execution: {error}");
        self.mark_dead(hash);
        return UpdateResult::Invalid;
      }
    };

    let new_state = workspace.freeze();
    if new_state.hash() != block.state_hash {
      warn!("{block} claimed a state hash its execution does not produce");
      self.mark_dead(hash);
      return UpdateResult::Invalid;
    }
    if summary.outcomes_hash != block.outcomes_hash {
      warn!("{block} claimed an outcome hash its execution does not produce");
      self.mark_dead(hash);
      return UpdateResult::Invalid;
    }

    // commit mappings for everything the block carries
    let lfb_state = self.last_finalized_state();
    let lfb_slot = self.last_finalized_slot();
    for (index, item) in items.iter().enumerate() {
      self.admit_item(Arc::clone(item), &lfb_state, lfb_slot, false, host);
      self
        .transactions
        .commit_in_block(hash, block.slot, &item.hash(), index);
    }

    let parent_was_focus = self.focus == block.parent;
    self.insert_alive(
      Arc::clone(block),
      new_state,
      Arc::new(summary.outcomes),
      host.now,
    );
    if parent_was_focus {
      self.set_focus(hash);
    }

    host.oracle.block_arrived(&hash, block.height);
    (host.callbacks.block_arrived)(hash, block.height);
    debug!("{block} is alive");

    // a record that was waiting for exactly this block can go now
    self.drain_pending_finalizations(host);

    self.maybe_purge_transactions(host.now);
    UpdateResult::Success
  }

  /// Admits one item into the transaction table, verifying it if it
  /// is unseen and caching the verdict.
  fn admit_item(
    &mut self,
    item: Arc<BlockItem>,
    state: &Arc<BlockState>,
    slot: u64,
    individual: bool,
    host: &mut HostContext,
  ) -> crate::transactions::AddResult {
    let hash = item.hash();

    // skip verification unless the cached verdict is absent or was
    // declared future-state-dependent
    let verres = match host.verification.get(&hash) {
      Some(cached) if !cached.needs_recheck() => cached,
      _ => {
        let fresh = verify_item(
          &item,
          state,
          host.now,
          self.params.transactions_keep_alive_time,
        );
        host.verification.insert(hash, fresh);
        fresh
      }
    };

    let stream_start = match item.as_ref() {
      BlockItem::Normal(tx) => state
        .account(&tx.header.sender)
        .map(|a| a.next_nonce)
        .unwrap_or(1),
      BlockItem::Update(update) => {
        state.next_update_sequence(update.update_type())
      }
      BlockItem::Credential(_) => 1,
    };

    let result = self.transactions.add_commit(
      Arc::clone(&item),
      verres,
      host.now,
      slot,
      stream_start,
      individual,
    );
    if matches!(result, crate::transactions::AddResult::Added(_)) {
      self.pending_transactions.add(&item);
    }
    result
  }

  /// Reception of an individually gossiped transaction.
  pub fn receive_transaction(
    &mut self,
    bytes: &[u8],
    host: &mut HostContext,
  ) -> UpdateResult {
    self.sweep_deadbox();
    if self.shutdown {
      return UpdateResult::ConsensusShutDown;
    }
    let item: BlockItem = match bincode::deserialize(bytes) {
      Ok(item) => item,
      Err(_) => return UpdateResult::SerializationFail,
    };
    self.receive_transaction_item(Arc::new(item), host)
  }

  pub fn receive_transaction_item(
    &mut self,
    item: Arc<BlockItem>,
    host: &mut HostContext,
  ) -> UpdateResult {
    use crate::transactions::AddResult;

    if self.shutdown {
      return UpdateResult::ConsensusShutDown;
    }
    self.stats.transactions_received += 1;

    let lfb_state = self.last_finalized_state();
    let lfb_slot = self.last_finalized_slot();
    let result = self.admit_item(item, &lfb_state, lfb_slot, true, host);

    let code = match result {
      AddResult::Added(_) => UpdateResult::Success,
      AddResult::Duplicate(_) => UpdateResult::Duplicate,
      AddResult::ObsoleteNonce => UpdateResult::Stale,
      AddResult::NotAdded(code) => code,
    };

    self.maybe_purge_transactions(host.now);
    code
  }

  /// Reception of a standalone finalization record.
  pub fn receive_finalization_record(
    &mut self,
    record: super::block::FinalizationRecord,
    host: &mut HostContext,
  ) -> UpdateResult {
    self.sweep_deadbox();

    let next = self.next_finalization_index();
    if record.index < next {
      return if self.finalization_list[record.index as usize].1
        == record.block
      {
        UpdateResult::Duplicate
      } else {
        UpdateResult::Invalid
      };
    }
    if record.index > next {
      self.pending_finalizations.insert(record.index, record);
      return UpdateResult::PendingFinalization;
    }

    match self.status(&record.block) {
      Some(BlockStatus::Alive) => {}
      Some(BlockStatus::Dead) => return UpdateResult::Invalid,
      _ => {
        // the target is not here yet; park the record for catch-up
        self.pending_finalizations.insert(record.index, record);
        return UpdateResult::Unverifiable;
      }
    }

    match host.oracle.receive_record(&record) {
      OracleVerdict::Consumed { finalizers } => {
        if self
          .do_trusted_finalize(record.clone(), &finalizers, host)
          .is_err()
        {
          return UpdateResult::Invalid;
        }
        let bytes = bincode::serialize(&record).unwrap();
        (host.callbacks.broadcast_finalization_record)(&bytes);

        self.drain_pending_finalizations(host);
        UpdateResult::Success
      }
      OracleVerdict::Duplicate => UpdateResult::Duplicate,
      OracleVerdict::Rejected => UpdateResult::Invalid,
    }
  }

  /// Replays queued ahead-of-time records that became processable.
  fn drain_pending_finalizations(&mut self, host: &mut HostContext) {
    loop {
      let next = self.next_finalization_index();
      let Some(record) = self.pending_finalizations.remove(&next) else {
        return;
      };
      if !matches!(self.status(&record.block), Some(BlockStatus::Alive)) {
        self.pending_finalizations.insert(next, record);
        return;
      }
      match host.oracle.receive_record(&record) {
        OracleVerdict::Consumed { finalizers } => {
          if self
            .do_trusted_finalize(record, &finalizers, host)
            .is_err()
          {
            return;
          }
        }
        _ => return,
      }
    }
  }

  /// Cadence- and clock-driven purge of the transaction table.
  pub(crate) fn maybe_purge_transactions(&mut self, now: Timestamp) {
    let cadence = self.params.insertions_before_transaction_purge;
    if self.transactions.purge_due(cadence) {
      self.purge_transactions(now);
    }
  }

  pub fn purge_transactions(&mut self, now: Timestamp) {
    let keep_alive = self.params.transactions_keep_alive_time;
    let lfb_slot = self.last_finalized_slot();
    self.transactions.purge(now, keep_alive, lfb_slot);
  }

  /// Drops pending blocks that can never go live anymore.
  pub(crate) fn purge_pending_blocks(&mut self) {
    let cap = self.last_finalized_slot();
    let mut table = std::mem::take(&mut self.pending_blocks);
    while let Some(stale) = table.take_next_until(cap) {
      self.mark_dead(stale.hash);
    }
    self.pending_blocks = table;
  }
}
