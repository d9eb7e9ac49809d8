use {
  super::{chain_params::RewardParameters, ProtocolVersion},
  crate::primitives::{Pubkey, Timestamp, UpdateSequence},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
};

/// Kinds of chain updates carried by `ChainUpdate` transactions. Each
/// type has its own independent sequence-number stream.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
)]
pub enum UpdateType {
  ElectionDifficulty,
  MaxBlockEnergy,
  RewardParameters,
  Protocol,
}

/// Announcement of a protocol-version change. Once the effective time
/// of such an update passes, consensus shuts down and the next era is
/// started from the terminal block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolUpdate {
  pub next_version: ProtocolVersion,
  pub message: String,
  pub specification_hash: Multihash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePayload {
  ElectionDifficulty(u32),
  MaxBlockEnergy(u64),
  RewardParameters(RewardParameters),
  Protocol(ProtocolUpdate),
}

impl UpdatePayload {
  pub fn update_type(&self) -> UpdateType {
    match self {
      UpdatePayload::ElectionDifficulty(_) => UpdateType::ElectionDifficulty,
      UpdatePayload::MaxBlockEnergy(_) => UpdateType::MaxBlockEnergy,
      UpdatePayload::RewardParameters(_) => UpdateType::RewardParameters,
      UpdatePayload::Protocol(_) => UpdateType::Protocol,
    }
  }
}

/// An update that was admitted to the chain and is waiting for its
/// effective time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedUpdate {
  pub sequence: UpdateSequence,
  pub effective_time: Timestamp,
  pub payload: UpdatePayload,
}

/// Keys authorized to sign chain updates, with the number of
/// signatures required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateKeys {
  pub keys: Vec<Pubkey>,
  pub threshold: u16,
}

/// Pending chain-parameter changes awaiting their effective time,
/// together with the per-type sequence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQueues {
  pub keys: UpdateKeys,
  next_sequence: BTreeMap<UpdateType, UpdateSequence>,
  queue: Vec<QueuedUpdate>,
}

impl UpdateQueues {
  pub fn new(keys: UpdateKeys) -> Self {
    Self {
      keys,
      next_sequence: BTreeMap::new(),
      queue: vec![],
    }
  }

  /// The next admissible sequence number for an update type. Streams
  /// start at 1 like account nonces.
  pub fn next_sequence(&self, ty: UpdateType) -> UpdateSequence {
    self.next_sequence.get(&ty).copied().unwrap_or(1)
  }

  /// Enqueues an enacted update and advances its sequence stream.
  /// The queue stays sorted by effective time.
  pub fn enqueue(&mut self, update: QueuedUpdate) {
    self
      .next_sequence
      .insert(update.payload.update_type(), update.sequence + 1);
    let at = self
      .queue
      .partition_point(|u| u.effective_time <= update.effective_time);
    self.queue.insert(at, update);
  }

  /// Removes and returns all updates whose effective time has been
  /// reached, in effective-time order. Protocol updates are left in
  /// the queue: they are resolved by regenesis, not by parameter
  /// application.
  pub fn enact_up_to(&mut self, now: Timestamp) -> Vec<QueuedUpdate> {
    let mut enacted = vec![];
    let mut keep = vec![];
    for update in self.queue.drain(..) {
      if update.effective_time <= now
        && update.payload.update_type() != UpdateType::Protocol
      {
        enacted.push(update);
      } else {
        keep.push(update);
      }
    }
    self.queue = keep;
    enacted
  }

  /// The earliest queued protocol update, if any.
  pub fn pending_protocol_update(&self) -> Option<&QueuedUpdate> {
    self
      .queue
      .iter()
      .find(|u| u.payload.update_type() == UpdateType::Protocol)
  }

  /// Whether any queued update could still affect the answer to a
  /// question about time `at`.
  pub fn affects(&self, at: Timestamp) -> bool {
    self.queue.iter().any(|u| u.effective_time <= at)
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &QueuedUpdate> {
    self.queue.iter()
  }

  /// Empties the queue; part of regenesis state migration.
  pub fn clear_queue(&mut self) {
    self.queue.clear();
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{QueuedUpdate, UpdatePayload, UpdateQueues, UpdateType},
    crate::primitives::Timestamp,
  };

  fn update(seq: u64, at: u64, payload: UpdatePayload) -> QueuedUpdate {
    QueuedUpdate {
      sequence: seq,
      effective_time: Timestamp(at),
      payload,
    }
  }

  #[test]
  fn sequences_are_per_type() {
    let mut q = UpdateQueues::default();
    assert_eq!(q.next_sequence(UpdateType::ElectionDifficulty), 1);

    q.enqueue(update(1, 100, UpdatePayload::ElectionDifficulty(5)));
    assert_eq!(q.next_sequence(UpdateType::ElectionDifficulty), 2);
    assert_eq!(q.next_sequence(UpdateType::MaxBlockEnergy), 1);
  }

  #[test]
  fn enactment_order_and_cutoff() {
    let mut q = UpdateQueues::default();
    q.enqueue(update(1, 300, UpdatePayload::MaxBlockEnergy(9)));
    q.enqueue(update(1, 100, UpdatePayload::ElectionDifficulty(5)));

    let enacted = q.enact_up_to(Timestamp(200));
    assert_eq!(enacted.len(), 1);
    assert_eq!(
      enacted[0].payload,
      UpdatePayload::ElectionDifficulty(5)
    );
    assert!(!q.is_empty());
  }
}
