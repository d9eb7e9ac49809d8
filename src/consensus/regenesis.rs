//! Protocol updates and the era handoff ("regenesis").
//!
//! Once a protocol update's effective time passes, this consensus
//! stops accepting new input (receives answer `ConsensusShutDown`)
//! while finalization keeps running. The first block finalized past
//! the effective time is the era's terminal block; its state is
//! migrated into the next era's initial state and the new genesis is
//! staged for the host to pick up.

use {
  super::{
    block::{CoreGenesisParameters, GenesisData, GenesisKind},
    receive::HostContext,
    tree::{Skov, StagedRegenesis},
  },
  crate::{
    primitives::ToBase58String,
    state::{QueuedUpdate, UpdatePayload},
  },
  std::sync::Arc,
  tracing::info,
};

impl Skov {
  /// Runs after every finalization advance: enters shut-down when a
  /// protocol update became effective and performs the regenesis as
  /// soon as the terminal block is finalized.
  pub(crate) fn check_protocol_update(&mut self, host: &mut HostContext) {
    if self.staged_regenesis.is_some() {
      return;
    }

    let lfb_state = self.last_finalized_state();
    let Some(update) = lfb_state.updates.pending_protocol_update().cloned()
    else {
      return;
    };

    // shut down as soon as the wall clock crosses the effective time
    if host.now >= update.effective_time && !self.shutdown {
      info!(
        effective = %update.effective_time,
        "protocol update effective, consensus shutting down"
      );
      self.shutdown = true;
    }

    // the terminal block is the first finalized block whose slot
    // time reaches the effective time; this hook runs on every
    // finalization, so the first hit is the terminal block
    let lfb_slot_time = lfb_state.slot_time(self.last_finalized_slot());
    if lfb_slot_time < update.effective_time {
      return;
    }

    self.shutdown = true;
    self.perform_regenesis(&update, host);
  }

  fn perform_regenesis(
    &mut self,
    update: &QueuedUpdate,
    host: &mut HostContext,
  ) {
    let UpdatePayload::Protocol(protocol) = &update.payload else {
      return;
    };

    let terminal_hash = self.last_finalized().1;
    let terminal_entry = self.last_finalized_entry();
    let terminal_height = terminal_entry.height;
    let terminal_slot = terminal_entry.slot();
    let terminal_state = self.last_finalized_state();

    // core parameters carry forward; the new era starts its slot
    // clock at the terminal block's slot time
    let genesis_time = terminal_state.slot_time(terminal_slot);
    let core = CoreGenesisParameters {
      genesis_time,
      slot_duration_millis: self.genesis.core.slot_duration_millis,
      epoch_length: self.genesis.core.epoch_length,
      max_block_energy: self.genesis.core.max_block_energy,
      finalization_parameters: self
        .genesis
        .core
        .finalization_parameters
        .clone(),
    };

    let next_state = terminal_state
      .migrate_for_regenesis(protocol.next_version, genesis_time);

    let genesis = Arc::new(GenesisData {
      kind: GenesisKind::Regenesis {
        first_genesis: self.genesis.first_genesis(),
        previous_genesis: self.genesis_hash,
        terminal_block: terminal_hash,
      },
      core,
      protocol_version: protocol.next_version,
      state_hash: next_state.hash(),
      absolute_height: terminal_height + 1,
    });
    let genesis_hash = genesis.hash();

    info!(
      era = self.genesis_index + 1,
      genesis = %genesis_hash.to_b58(),
      terminal = %terminal_hash.to_b58(),
      version = ?protocol.next_version,
      "regenesis staged"
    );

    self.staged_regenesis = Some(StagedRegenesis {
      genesis,
      state: next_state,
    });
    (host.callbacks.regenesis)(genesis_hash);
  }

  /// Hands the staged next era out to the host, which opens the next
  /// era's tree with it.
  pub fn take_staged_regenesis(&mut self) -> Option<StagedRegenesis> {
    self.staged_regenesis.take()
  }
}
