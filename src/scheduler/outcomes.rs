use {
  crate::{
    primitives::{
      content_hash,
      merkle_root,
      Amount,
      BakerId,
      Energy,
      Pubkey,
      Timestamp,
    },
    state::{ContractAddress, ProtocolVersion, UpdateType},
  },
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

/// Either side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
  Account(Pubkey),
  Contract(ContractAddress),
}

/// Observable effects of a successfully executed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
  ModuleDeployed {
    reference: Multihash,
  },
  ContractInitialized {
    address: ContractAddress,
    module: Multihash,
    amount: Amount,
  },
  /// A contract's state and balance changed through an entrypoint
  /// call carrying `amount`.
  Updated {
    address: ContractAddress,
    amount: Amount,
  },
  Transferred {
    from: Address,
    to: Address,
    amount: Amount,
  },
  AccountCreated {
    address: Pubkey,
  },
  CredentialDeployed {
    reg_id: Multihash,
    account: Pubkey,
  },
  BakerAdded {
    id: BakerId,
    account: Pubkey,
    stake: Amount,
  },
  BakerRemoved {
    id: BakerId,
  },
  DelegationConfigured {
    account: Pubkey,
    target: Option<BakerId>,
    stake: Amount,
  },
  UpdateEnqueued {
    update_type: UpdateType,
    effective_time: Timestamp,
  },
}

/// Why an item was charged but had no effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
  ModuleNotFound,
  ModuleAlreadyDeployed,
  InstanceNotFound,
  EntrypointNotFound,
  ReceiverNotFound,
  AmountTooLarge,
  OutOfEnergy,
  AlreadyBaker,
  NotABaker,
  StakeUnderMinimum,
  EngineTrap { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeResult {
  Success { events: Vec<Event> },
  Rejected { reason: RejectReason },
}

/// Per-item execution record; the list of these is what the block's
/// outcomes hash commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
  pub hash: Multihash,
  pub index: u64,
  pub sender: Option<Pubkey>,
  pub energy_used: Energy,
  pub result: OutcomeResult,
}

impl TransactionOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self.result, OutcomeResult::Success { .. })
  }

  pub fn events(&self) -> &[Event] {
    match &self.result {
      OutcomeResult::Success { events } => events,
      OutcomeResult::Rejected { .. } => &[],
    }
  }
}

/// The commitment to a block's outcome list. Early protocol versions
/// hash the serialized list as a whole; from P4 on each outcome is a
/// merkle leaf so individual outcomes carry short membership proofs.
pub fn outcomes_hash(
  version: ProtocolVersion,
  outcomes: &[TransactionOutcome],
) -> Multihash {
  if version.merkle_outcomes() {
    let leaves: Vec<Multihash> =
      outcomes.iter().map(content_hash).collect();
    merkle_root(&leaves)
  } else {
    content_hash(&outcomes)
  }
}
