//! The core's outbound contract to its host.
//!
//! The host hands one of these in at construction; the core calls the
//! capabilities from inside the same critical section as the state
//! change they announce, so observers never see a state without its
//! announcement.

use {crate::primitives::Height, multihash::Multihash};

type Broadcast = Box<dyn Fn(&[u8]) + Send + Sync>;

pub struct Callbacks {
  /// Relay a serialized block to peers.
  pub broadcast_block: Broadcast,
  /// Relay a serialized finalization record to peers.
  pub broadcast_finalization_record: Broadcast,
  /// A block became live at the given height.
  pub block_arrived: Box<dyn Fn(Multihash, Height) + Send + Sync>,
  /// A protocol update completed; the next era's genesis hash.
  pub regenesis: Box<dyn Fn(Multihash) + Send + Sync>,
}

impl Default for Callbacks {
  fn default() -> Self {
    Self {
      broadcast_block: Box::new(|_| {}),
      broadcast_finalization_record: Box::new(|_| {}),
      block_arrived: Box::new(|_, _| {}),
      regenesis: Box::new(|_| {}),
    }
  }
}

impl std::fmt::Debug for Callbacks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("Callbacks { .. }")
  }
}
