//! Shared helpers for unit and scenario tests: deterministic keys, a
//! ready-made genesis, and a chain builder that bakes blocks the same
//! way the execution path validates them.

use {
  crate::{
    consensus::{
      BakedBlock,
      BlockFields,
      Callbacks,
      CoreGenesisParameters,
      FinalizationParameters,
      FinalizationRecord,
      GenesisData,
      GenesisKind,
      HostContext,
      Skov,
      StakeOracle,
    },
    params::RuntimeParameters,
    primitives::{
      Amount,
      BlockNonce,
      ElectionProof,
      Height,
      Keypair,
      Nonce,
      Pubkey,
      Slot,
      Timestamp,
    },
    scheduler::{
      self,
      BlockContext,
      EngineError,
      EngineOutcome,
      ExecutionEngine,
    },
    state::{
      BakerInfo,
      BlockState,
      GenesisAccount,
      GenesisConfiguration,
      Instance,
      Module,
      ProtocolVersion,
      UpdateKeys,
    },
    transactions::{
      BlockItem,
      NormalTransaction,
      Payload,
      TransactionHeader,
      VerificationCache,
    },
  },
  ed25519_dalek::Signer,
  multihash::Multihash,
  std::{
    cell::RefCell,
    collections::HashMap,
    sync::Arc,
  },
};

/// Installs a subscriber once so failing tests show their traces
/// under `RUST_LOG`.
pub fn init_logging() {
  use tracing_subscriber::EnvFilter;
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .try_init();
}

/// Deterministic keypair from a one-byte seed.
pub fn keypair(seed: u8) -> Keypair {
  let bytes = [seed.max(1); 32];
  Keypair::try_from(&bytes[..]).unwrap()
}

pub fn pubkey(seed: u8) -> Pubkey {
  keypair(seed).public()
}

/// A signed transfer from the account with key seed `sender`.
pub fn transfer(sender: u8, nonce: Nonce, amount: Amount) -> BlockItem {
  let keys = keypair(sender);
  BlockItem::Normal(NormalTransaction::new(
    &keys,
    TransactionHeader {
      sender: keys.public(),
      nonce,
      energy: 1_000,
      expiry: Timestamp(100_000),
    },
    Payload::Transfer {
      to: pubkey(2),
      amount,
    },
  ))
}

/// Three funded accounts (seeds 1..=3), one baker on account 1, one
/// update key (seed 9), full election difficulty so the sole baker
/// always wins its slots.
pub fn genesis_config() -> GenesisConfiguration {
  let baker_key = pubkey(1);
  GenesisConfiguration {
    version: ProtocolVersion::P3,
    genesis_time: Timestamp(0),
    epoch_length: 10,
    leadership_election_seed: crate::primitives::sha256(b"test-seed"),
    accounts: (1..=3)
      .map(|seed| GenesisAccount {
        address: pubkey(seed),
        verify_key: pubkey(seed),
        balance: 1_000_000,
      })
      .collect(),
    bakers: vec![BakerInfo {
      id: 0,
      account: baker_key.clone(),
      sign_key: baker_key.clone(),
      election_key: baker_key.clone(),
      aggregation_key: baker_key,
      stake: 500_000,
      commission_ppm: 100_000,
      cooldown_until: None,
    }],
    params: Default::default(),
    update_keys: UpdateKeys {
      keys: vec![pubkey(9)],
      threshold: 1,
    },
    identity_providers: vec![crate::state::IdentityProvider {
      id: 0,
      name: "test-ip".into(),
      verify_key: pubkey(8),
    }],
    anonymity_revokers: vec![crate::state::AnonymityRevoker {
      id: 0,
      name: "test-ar".into(),
      verify_key: pubkey(7),
    }],
    cryptographic_parameters: vec![],
  }
}

pub fn genesis_state() -> Arc<BlockState> {
  BlockState::from_genesis(&genesis_config())
}

/// Engine that leaves state untouched and, on `receive`, refunds the
/// carried amount to the account named by the 32-byte parameter.
pub struct EchoEngine;

impl ExecutionEngine for EchoEngine {
  fn init(
    &self,
    _module: &Module,
    _init_name: &str,
    _parameter: &[u8],
    _amount: Amount,
  ) -> Result<EngineOutcome, EngineError> {
    Ok(EngineOutcome {
      new_state: vec![],
      energy_used: 10,
      transfers: vec![],
    })
  }

  fn receive(
    &self,
    _module: &Module,
    instance: &Instance,
    _entrypoint: &str,
    parameter: &[u8],
    amount: Amount,
  ) -> Result<EngineOutcome, EngineError> {
    let transfers = if parameter.len() == 32 {
      let mut to = [0u8; 32];
      to.copy_from_slice(parameter);
      vec![(Pubkey::new(to), amount)]
    } else {
      vec![]
    };
    Ok(EngineOutcome {
      new_state: instance.state.clone(),
      energy_used: 10,
      transfers,
    })
  }
}

/// Host collaborators bundled for tests.
pub struct TestHost {
  pub oracle: StakeOracle,
  pub engine: EchoEngine,
  pub callbacks: Callbacks,
  pub verification: VerificationCache,
}

impl TestHost {
  pub fn new() -> Self {
    Self {
      oracle: StakeOracle::new(genesis_state().epoch_bakers.clone()),
      engine: EchoEngine,
      callbacks: Callbacks::default(),
      verification: VerificationCache::default(),
    }
  }

  pub fn ctx(&mut self, now: Timestamp) -> HostContext<'_> {
    HostContext {
      oracle: &mut self.oracle,
      engine: &self.engine,
      callbacks: &self.callbacks,
      verification: &self.verification,
      now,
    }
  }
}

impl Default for TestHost {
  fn default() -> Self {
    Self::new()
  }
}

/// Bakes valid blocks off any known parent, tracking the state each
/// block produces so children can be baked off it. Baking runs the
/// same scheduler the tree runs at execution, so the claimed state
/// and outcome hashes always match re-execution.
pub struct TestChain {
  pub baker: Keypair,
  genesis: Arc<GenesisData>,
  genesis_state: Arc<BlockState>,
  states: RefCell<HashMap<Multihash, (Arc<BlockState>, Height)>>,
  dirs: RefCell<Vec<tempfile::TempDir>>,
}

impl TestChain {
  pub fn new() -> Self {
    let genesis_state = genesis_state();
    let genesis = Arc::new(GenesisData {
      kind: GenesisKind::Initial,
      core: CoreGenesisParameters {
        genesis_time: Timestamp(0),
        slot_duration_millis: 1_000,
        epoch_length: 10,
        max_block_energy: 3_000_000,
        finalization_parameters: FinalizationParameters {
          committee_max_size: 1_000,
          minimum_skip: 0,
        },
      },
      protocol_version: ProtocolVersion::P3,
      state_hash: genesis_state.hash(),
      absolute_height: 0,
    });

    let mut states = HashMap::new();
    states.insert(genesis.hash(), (Arc::clone(&genesis_state), 0));
    Self {
      baker: keypair(1),
      genesis,
      genesis_state,
      states: RefCell::new(states),
      dirs: RefCell::new(vec![]),
    }
  }

  pub fn genesis(&self) -> Arc<GenesisData> {
    Arc::clone(&self.genesis)
  }

  pub fn genesis_hash(&self) -> Multihash {
    self.genesis.hash()
  }

  pub fn genesis_state(&self) -> Arc<BlockState> {
    Arc::clone(&self.genesis_state)
  }

  /// Opens a fresh tree over a temporary directory.
  pub fn skov(&self) -> Skov {
    let dir = tempfile::tempdir().unwrap();
    let skov = Skov::open(
      dir.path(),
      0,
      self.genesis(),
      self.genesis_state(),
      RuntimeParameters::default(),
    )
    .unwrap();
    self.dirs.borrow_mut().push(dir);
    skov
  }

  /// Bakes a block off `parent` carrying `items`, mirroring the
  /// validation path: seed update, finalizer rewards, scheduler run.
  pub fn bake(
    &self,
    parent: &Multihash,
    slot: Slot,
    items: Vec<BlockItem>,
  ) -> Arc<BakedBlock> {
    self.bake_full(parent, slot, items, None)
  }

  pub fn bake_child(
    &self,
    parent: &Arc<BakedBlock>,
    slot: Slot,
    items: Vec<BlockItem>,
  ) -> Arc<BakedBlock> {
    self.bake(&parent.hash(), slot, items)
  }

  pub fn bake_full(
    &self,
    parent: &Multihash,
    slot: Slot,
    items: Vec<BlockItem>,
    finalization: Option<FinalizationRecord>,
  ) -> Arc<BakedBlock> {
    let (parent_state, parent_height) = self
      .states
      .borrow()
      .get(parent)
      .cloned()
      .expect("parent must have been baked by this chain");

    let beacon = parent_state.seed.nonce_for(slot);
    let nonce = BlockNonce::new(&self.baker, &beacon, slot);
    let proof = ElectionProof::new(&self.baker, &beacon, slot);

    let mut workspace = parent_state.thaw();
    workspace.set_seed(parent_state.seed.update(slot, &nonce));
    if let Some(record) = &finalization {
      let mut rewardees: Vec<u64> =
        record.proof.iter().map(|(id, _)| *id).collect();
      rewardees.sort_unstable();
      rewardees.dedup();
      crate::consensus::apply_finalization_rewards(
        &mut workspace,
        &rewardees,
      );
    }

    let arcs: Vec<Arc<BlockItem>> =
      items.iter().cloned().map(Arc::new).collect();
    let ctx = BlockContext {
      slot,
      slot_time: parent_state.slot_time(slot),
      baker: Some(0),
      max_energy: parent_state.params.max_block_energy,
    };
    let summary = scheduler::execute_items(
      &mut workspace,
      &arcs,
      &ctx,
      &EchoEngine,
      &VerificationCache::default(),
    )
    .expect("baked items must execute");

    let state = workspace.freeze();
    let fields = BlockFields {
      slot,
      height: parent_height + 1,
      parent: *parent,
      last_finalized: finalization
        .as_ref()
        .map(|r| r.block)
        .unwrap_or_else(|| self.genesis_hash()),
      baker: 0,
      baker_key: self.baker.public(),
      proof,
      nonce,
      finalization,
      items,
      state_hash: state.hash(),
      outcomes_hash: summary.outcomes_hash,
    };
    let block = Arc::new(BakedBlock::new(&self.baker, fields));
    self
      .states
      .borrow_mut()
      .insert(block.hash(), (state, parent_height + 1));
    block
  }

  /// A finalization record signed by the genesis baker, which holds
  /// the whole committee stake.
  pub fn finalization_record(
    &self,
    index: u64,
    block: Multihash,
    delay: u64,
  ) -> FinalizationRecord {
    let message = bincode::serialize(&(index, &block, delay)).unwrap();
    FinalizationRecord {
      index,
      block,
      delay,
      proof: vec![(0, self.baker.sign(&message))],
    }
  }

  pub fn serialized(&self, block: &BakedBlock) -> Vec<u8> {
    bincode::serialize(block).unwrap()
  }
}

impl Default for TestChain {
  fn default() -> Self {
    Self::new()
  }
}
