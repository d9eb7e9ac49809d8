//! The consensus tree-state core: block reception and execution,
//! finalization, pending tables, protocol updates and the wire
//! surface, all operating on the [`tree::Skov`] arena.

mod block;
mod callbacks;
mod coordinator;
mod export;
mod finalize;
mod oracle;
mod pending;
mod receive;
mod regenesis;
mod tree;
mod wire;

pub(crate) use finalize::apply_finalization_rewards;

pub use {
  block::{
    AnyBlock,
    BakedBlock,
    BlockFields,
    CoreGenesisParameters,
    FinalizationParameters,
    FinalizationRecord,
    GenesisData,
    GenesisKind,
  },
  callbacks::Callbacks,
  coordinator::{spawn, Consensus, CoordinatorHandle, Operation},
  export::{BundleIndex, ChunkInfo, EXPORT_VERSION},
  oracle::{FinalizationOracle, OracleVerdict, StakeOracle},
  pending::{PendingBlock, PendingBlockTable},
  receive::{ExecuteCont, HostContext},
  tree::{
    BlockEntry,
    BlockStatus,
    ConsensusStatistics,
    Skov,
    StagedRegenesis,
    StateRef,
  },
  wire::{
    encode_message,
    parse_message,
    CatchUpStatus,
    MessageType,
    WIRE_VERSION,
  },
};

#[cfg(test)]
mod scenarios;
