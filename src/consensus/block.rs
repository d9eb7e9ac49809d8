use {
  crate::{
    primitives::{
      content_hash,
      BakerId,
      BlockNonce,
      ElectionProof,
      Energy,
      Height,
      Keypair,
      Pubkey,
      Slot,
      Timestamp,
      ToBase58String,
    },
    state::ProtocolVersion,
    transactions::BlockItem,
  },
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{ops::Deref, sync::Arc},
};

/// Consensus timing and sizing parameters fixed at a genesis and
/// carried forward across regeneses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreGenesisParameters {
  pub genesis_time: Timestamp,
  pub slot_duration_millis: u64,
  pub epoch_length: u64,
  pub max_block_energy: Energy,
  pub finalization_parameters: FinalizationParameters,
}

/// Knobs of the finalization committee, opaque to the tree state and
/// interpreted by the finalization protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationParameters {
  pub committee_max_size: u32,
  pub minimum_skip: u64,
}

/// How an era came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenesisKind {
  /// Era 0: the chain's very first block.
  Initial,
  /// An era started by a protocol update from a previous era.
  Regenesis {
    /// The first genesis of the whole chain.
    first_genesis: Multihash,
    /// The genesis of the era this one was derived from.
    previous_genesis: Multihash,
    /// The last finalized block of the previous era.
    terminal_block: Multihash,
  },
}

/// The record anchoring an era: its parameters, provenance and the
/// hash of its initial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisData {
  pub kind: GenesisKind,
  pub core: CoreGenesisParameters,
  pub protocol_version: ProtocolVersion,
  pub state_hash: Multihash,
  /// Height of this genesis block on the absolute chain; 0 for the
  /// initial era, terminal height + 1 after a regenesis.
  pub absolute_height: Height,
}

impl GenesisData {
  pub fn hash(&self) -> Multihash {
    content_hash(self)
  }

  /// The chain-wide first genesis: this block for an initial era,
  /// the inherited pointer otherwise.
  pub fn first_genesis(&self) -> Multihash {
    match &self.kind {
      GenesisKind::Initial => self.hash(),
      GenesisKind::Regenesis { first_genesis, .. } => *first_genesis,
    }
  }
}

/// A witness that the block at `block` is irreversible, produced by
/// the finalization protocol. The proof is an aggregate of committee
/// signatures and is validated by the finalization oracle, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationRecord {
  pub index: u64,
  pub block: Multihash,
  pub delay: u64,
  pub proof: Vec<(BakerId, Signature)>,
}

impl FinalizationRecord {
  /// The implicit record finalizing an era's genesis block.
  pub fn genesis(block: Multihash) -> Self {
    Self {
      index: 0,
      block,
      delay: 0,
      proof: vec![],
    }
  }

  pub fn hash(&self) -> Multihash {
    content_hash(self)
  }
}

/// Everything a baker signs when it bakes a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFields {
  pub slot: Slot,
  pub height: Height,
  pub parent: Multihash,
  /// The last finalized block as of baking; fixed by the protocol to
  /// match the tree's LFB at arrival.
  pub last_finalized: Multihash,
  pub baker: BakerId,
  pub baker_key: Pubkey,
  pub proof: ElectionProof,
  pub nonce: BlockNonce,
  pub finalization: Option<FinalizationRecord>,
  pub items: Vec<BlockItem>,
  pub state_hash: Multihash,
  pub outcomes_hash: Multihash,
}

/// A block baked by some participant. Its hash covers the signature,
/// so the wire form round-trips bit for bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakedBlock {
  pub fields: BlockFields,
  pub signature: Signature,
}

impl BakedBlock {
  fn signing_bytes(fields: &BlockFields) -> Vec<u8> {
    bincode::serialize(fields).unwrap()
  }

  pub fn new(keypair: &Keypair, fields: BlockFields) -> Self {
    let signature = keypair.sign(&Self::signing_bytes(&fields));
    Self { fields, signature }
  }

  pub fn hash(&self) -> Multihash {
    content_hash(self)
  }

  pub fn verify_signature(&self) -> bool {
    self
      .fields
      .baker_key
      .verify(&Self::signing_bytes(&self.fields), &self.signature)
  }
}

impl Deref for BakedBlock {
  type Target = BlockFields;

  fn deref(&self) -> &Self::Target {
    &self.fields
  }
}

impl std::fmt::Display for BakedBlock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "block {} [slot {} height {} baker {}]",
      self.hash().to_b58(),
      self.fields.slot,
      self.fields.height,
      self.fields.baker,
    )
  }
}

/// A block in the tree: either an era's genesis or a baked block.
#[derive(Debug, Clone)]
pub enum AnyBlock {
  Genesis(Arc<GenesisData>),
  Baked(Arc<BakedBlock>),
}

impl AnyBlock {
  pub fn hash(&self) -> Multihash {
    match self {
      AnyBlock::Genesis(g) => g.hash(),
      AnyBlock::Baked(b) => b.hash(),
    }
  }

  /// Genesis blocks sit at slot 0 of their era.
  pub fn slot(&self) -> Slot {
    match self {
      AnyBlock::Genesis(_) => 0,
      AnyBlock::Baked(b) => b.slot,
    }
  }

  pub fn parent(&self) -> Option<Multihash> {
    match self {
      AnyBlock::Genesis(_) => None,
      AnyBlock::Baked(b) => Some(b.parent),
    }
  }

  pub fn items(&self) -> &[BlockItem] {
    match self {
      AnyBlock::Genesis(_) => &[],
      AnyBlock::Baked(b) => &b.items,
    }
  }

  pub fn as_baked(&self) -> Option<&Arc<BakedBlock>> {
    match self {
      AnyBlock::Genesis(_) => None,
      AnyBlock::Baked(b) => Some(b),
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::test;

  #[test]
  fn signature_covers_all_fields() {
    let chain = test::TestChain::new();
    let block = chain.bake(&chain.genesis_hash(), 1, vec![]);
    assert!(block.verify_signature());

    let mut forged = (*block).clone();
    forged.fields.slot += 1;
    assert!(!forged.verify_signature());
  }

  #[test]
  fn wire_roundtrip_is_bit_identical() {
    let chain = test::TestChain::new();
    let block = chain.bake(&chain.genesis_hash(), 1, vec![]);

    let bytes = bincode::serialize(&*block).unwrap();
    let parsed: super::BakedBlock = bincode::deserialize(&bytes).unwrap();
    let rebytes = bincode::serialize(&parsed).unwrap();
    assert_eq!(bytes, rebytes);
    assert_eq!(parsed.hash(), block.hash());
  }
}
