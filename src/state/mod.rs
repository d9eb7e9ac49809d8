//! Versioned per-block state snapshots.
//!
//! A [`BlockState`] is an immutable snapshot shared by every block
//! that references it. Executing a block opens a mutable workspace
//! with [`BlockState::thaw`], which records changes in an overlay
//! diff without touching the base; [`ThawedState::freeze`] commits
//! the overlay into a fresh snapshot whose untouched entries are
//! shared with the parent through `Arc`. Lineage is strictly
//! ancestor-directed, so snapshots never form cycles.

mod accounts;
mod bakers;
mod cache;
mod chain_params;
mod instances;
mod modules;
mod rewards;
mod seed;
mod updates;

pub use {
  accounts::{Account, AccountIndex, Accounts, ScheduledRelease},
  bakers::{BakerInfo, BakerPool, Delegator, EpochBaker, EpochBakers},
  cache::StateCaches,
  chain_params::{ChainParameters, ExchangeRate, RewardParameters},
  instances::{ContractAddress, Instance, Instances},
  modules::{Module, Modules},
  rewards::RewardAccounts,
  seed::SeedState,
  updates::{
    ProtocolUpdate,
    QueuedUpdate,
    UpdateKeys,
    UpdatePayload,
    UpdateQueues,
    UpdateType,
  },
};

use {
  crate::primitives::{
    content_hash,
    merkle_root,
    Amount,
    Pubkey,
    Slot,
    Timestamp,
  },
  multihash::Multihash,
  once_cell::sync::OnceCell,
  serde::{Deserialize, Serialize},
  std::{collections::BTreeMap, sync::Arc, time::Duration},
  thiserror::Error,
};

/// Chain protocol versions. Dispatch on the version happens at era
/// boundaries only; within an era every operation runs under a single
/// version.
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
pub enum ProtocolVersion {
  P1,
  P2,
  P3,
  P4,
}

impl ProtocolVersion {
  /// From P4 on, transaction outcomes are committed to as a merkle
  /// tree so membership proofs stay short.
  pub fn merkle_outcomes(self) -> bool {
    self >= ProtocolVersion::P4
  }
}

#[derive(Debug, Error)]
pub enum StateError {
  #[error("lookup target does not exist in this state")]
  NotFound,

  #[error("state is for protocol version {actual:?}, expected {expected:?}")]
  VersionMismatch {
    expected: ProtocolVersion,
    actual: ProtocolVersion,
  },

  #[error("storage error: {0}")]
  Storage(#[from] crate::storage::Error),
}

/// An identity provider trusted to attest account credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProvider {
  pub id: u32,
  pub name: String,
  pub verify_key: Pubkey,
}

/// An anonymity revoker that credential deployments may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymityRevoker {
  pub id: u32,
  pub name: String,
  pub verify_key: Pubkey,
}

/// Immutable snapshot of the chain state at one block.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockState {
  pub version: ProtocolVersion,
  pub genesis_time: Timestamp,
  pub accounts: Accounts,
  pub instances: Instances,
  pub modules: Modules,
  pub bakers: BakerPool,
  /// Committee with stakes frozen for the epoch of `seed.epoch`.
  pub epoch_bakers: Arc<EpochBakers>,
  pub rewards: RewardAccounts,
  pub seed: SeedState,
  pub params: ChainParameters,
  pub updates: UpdateQueues,
  pub identity_providers: BTreeMap<u32, IdentityProvider>,
  pub anonymity_revokers: BTreeMap<u32, AnonymityRevoker>,
  pub cryptographic_parameters: Vec<u8>,
  #[serde(skip)]
  hash: OnceCell<Multihash>,
}

/// Everything needed to materialize the state of an era's first block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfiguration {
  pub version: ProtocolVersion,
  pub genesis_time: Timestamp,
  pub epoch_length: u64,
  pub leadership_election_seed: Multihash,
  pub accounts: Vec<GenesisAccount>,
  pub bakers: Vec<BakerInfo>,
  pub params: ChainParameters,
  pub update_keys: UpdateKeys,
  pub identity_providers: Vec<IdentityProvider>,
  pub anonymity_revokers: Vec<AnonymityRevoker>,
  pub cryptographic_parameters: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
  pub address: Pubkey,
  pub verify_key: Pubkey,
  pub balance: Amount,
}

impl BlockState {
  /// Builds the initial state of an era from its genesis
  /// configuration.
  pub fn from_genesis(cfg: &GenesisConfiguration) -> Arc<Self> {
    let mut accounts = Accounts::default();
    for (i, acc) in cfg.accounts.iter().enumerate() {
      accounts.insert(Arc::new(Account::new(
        acc.address.clone(),
        acc.verify_key.clone(),
        i as u64,
        acc.balance,
      )));
    }

    let mut bakers = BakerPool::default();
    for baker in &cfg.bakers {
      bakers.add_baker(Arc::new(baker.clone()));
    }

    let rewards = RewardAccounts {
      total_supply: accounts.total_amount(),
      ..RewardAccounts::default()
    };

    let epoch_bakers = Arc::new(bakers.committee());
    Arc::new(Self {
      version: cfg.version,
      genesis_time: cfg.genesis_time,
      accounts,
      instances: Instances::default(),
      modules: Modules::default(),
      bakers,
      epoch_bakers,
      rewards,
      seed: SeedState::genesis(
        cfg.epoch_length,
        cfg.leadership_election_seed,
      ),
      params: cfg.params.clone(),
      updates: UpdateQueues::new(cfg.update_keys.clone()),
      identity_providers: cfg
        .identity_providers
        .iter()
        .map(|ip| (ip.id, ip.clone()))
        .collect(),
      anonymity_revokers: cfg
        .anonymity_revokers
        .iter()
        .map(|ar| (ar.id, ar.clone()))
        .collect(),
      cryptographic_parameters: cfg.cryptographic_parameters.clone(),
      hash: OnceCell::new(),
    })
  }

  pub fn account(&self, address: &Pubkey) -> Option<&Arc<Account>> {
    self.accounts.get(address)
  }

  pub fn account_by_index(&self, index: AccountIndex) -> Option<&Arc<Account>> {
    self.accounts.get_by_index(index)
  }

  pub fn account_by_credential(
    &self,
    reg_id: &Multihash,
  ) -> Option<&Arc<Account>> {
    self.accounts.get_by_credential(reg_id)
  }

  pub fn instance(&self, address: &ContractAddress) -> Option<&Arc<Instance>> {
    self.instances.get(address)
  }

  pub fn module(&self, reference: &Multihash) -> Option<&Arc<Module>> {
    self.modules.get(reference)
  }

  pub fn seed_state(&self) -> &SeedState {
    &self.seed
  }

  pub fn slot_duration(&self) -> Duration {
    Duration::from_millis(self.params.slot_duration_millis)
  }

  /// Nominal wall-clock time of a slot in this era.
  pub fn slot_time(&self, slot: Slot) -> Timestamp {
    Timestamp(
      self.genesis_time.0 + slot * self.params.slot_duration_millis,
    )
  }

  /// Election difficulty effective at a point in time, taking queued
  /// difficulty updates into account.
  pub fn election_difficulty_at(&self, at: Timestamp) -> u32 {
    let mut difficulty = self.params.election_difficulty_ppm;
    for update in self.updates.iter() {
      if update.effective_time <= at {
        if let UpdatePayload::ElectionDifficulty(d) = update.payload {
          difficulty = d;
        }
      }
    }
    difficulty
  }

  /// The committee eligible to bake at `slot`. For slots in the
  /// current epoch this is the frozen committee; for later epochs it
  /// is projected from current stakes.
  pub fn slot_bakers(&self, slot: Slot) -> Arc<EpochBakers> {
    if self.seed.epoch_of(slot) == self.seed.epoch {
      Arc::clone(&self.epoch_bakers)
    } else {
      Arc::new(self.bakers.committee())
    }
  }

  /// The committee for `slot`, but only when the answer cannot be
  /// changed by any still-unresolved update in the queue or by an
  /// epoch turnover this state has not seen.
  pub fn definite_slot_bakers(&self, slot: Slot) -> Option<Arc<EpochBakers>> {
    if self.seed.epoch_of(slot) != self.seed.epoch {
      return None;
    }
    if self.updates.affects(self.slot_time(slot)) {
      return None;
    }
    Some(Arc::clone(&self.epoch_bakers))
  }

  pub fn next_update_sequence(
    &self,
    ty: UpdateType,
  ) -> crate::primitives::UpdateSequence {
    self.updates.next_sequence(ty)
  }

  /// Derives the initial state of the next era from this terminal
  /// state: the seed is re-keyed, the update queue emptied with its
  /// sequence streams reset, and per-version stake fixups applied.
  /// Everything else carries over, including the terminal epoch's
  /// baking committee and the pending reward pools.
  pub fn migrate_for_regenesis(
    &self,
    version: ProtocolVersion,
    genesis_time: Timestamp,
  ) -> Arc<BlockState> {
    let mut bakers = self.bakers.clone();
    if version >= ProtocolVersion::P4 {
      bakers.sanitize();
    }

    Arc::new(BlockState {
      version,
      genesis_time,
      accounts: self.accounts.clone(),
      instances: self.instances.clone(),
      modules: self.modules.clone(),
      bakers,
      epoch_bakers: Arc::clone(&self.epoch_bakers),
      rewards: self.rewards.clone(),
      seed: SeedState::regenesis(&self.seed),
      params: self.params.clone(),
      updates: UpdateQueues::new(self.updates.keys.clone()),
      identity_providers: self.identity_providers.clone(),
      anonymity_revokers: self.anonymity_revokers.clone(),
      cryptographic_parameters: self.cryptographic_parameters.clone(),
      hash: OnceCell::new(),
    })
  }

  /// Opens a mutable workspace over this snapshot.
  pub fn thaw(self: &Arc<Self>) -> ThawedState {
    ThawedState {
      base: Arc::clone(self),
      diff: StateDiff::default(),
    }
  }

  /// Root of the merkle composition over the entity tables.
  pub fn hash(&self) -> Multihash {
    *self.hash.get_or_init(|| {
      merkle_root(&[
        self.accounts.table_hash(),
        self.instances.table_hash(),
        self.modules.table_hash(),
        self.bakers.table_hash(),
        content_hash(&self.rewards),
        content_hash(&self.seed),
        content_hash(&self.params),
        content_hash(&self.updates),
        content_hash(&self.identity_providers),
        content_hash(&self.anonymity_revokers),
        content_hash(&self.cryptographic_parameters),
      ])
    })
  }

  /// Total-supply conservation, spelled out for tests and for the
  /// startup integrity check.
  pub fn conserves_supply(&self) -> bool {
    self.rewards.conserves(
      self.accounts.total_amount(),
      self.instances.total_amount(),
    )
  }
}

/// Changes accumulated by a thawed workspace, applied over its base.
#[derive(Debug, Default)]
struct StateDiff {
  accounts: BTreeMap<Pubkey, Arc<Account>>,
  credentials: BTreeMap<Multihash, Pubkey>,
  next_account_index: Option<AccountIndex>,
  instances: BTreeMap<ContractAddress, Arc<Instance>>,
  next_instance_index: Option<u64>,
  modules: BTreeMap<Multihash, Arc<Module>>,
  bakers: Option<BakerPool>,
  rewards: Option<RewardAccounts>,
  seed: Option<SeedState>,
  params: Option<ChainParameters>,
  updates: Option<UpdateQueues>,
}

/// A mutable workspace over a frozen snapshot.
///
/// Reads consult the overlay first and fall through to the base, the
/// same way the teacher state combines two layers; writes only ever
/// touch the overlay.
pub struct ThawedState {
  base: Arc<BlockState>,
  diff: StateDiff,
}

impl ThawedState {
  pub fn version(&self) -> ProtocolVersion {
    self.base.version
  }

  pub fn slot_time(&self, slot: Slot) -> Timestamp {
    self.base.slot_time(slot)
  }

  pub fn account(&self, address: &Pubkey) -> Option<Arc<Account>> {
    match self.diff.accounts.get(address) {
      Some(account) => Some(Arc::clone(account)),
      None => self.base.accounts.get(address).cloned(),
    }
  }

  pub fn set_account(&mut self, account: Account) {
    self
      .diff
      .accounts
      .insert(account.address.clone(), Arc::new(account));
  }

  pub fn credential_taken(&self, reg_id: &Multihash) -> bool {
    self.diff.credentials.contains_key(reg_id)
      || self.base.accounts.contains_credential(reg_id)
  }

  /// Creates a fresh account with the next free index and registers
  /// its credentials.
  pub fn create_account(
    &mut self,
    address: Pubkey,
    verify_key: Pubkey,
    balance: Amount,
    credentials: Vec<Multihash>,
  ) -> Arc<Account> {
    let index = self
      .diff
      .next_account_index
      .unwrap_or_else(|| self.base.accounts.next_index());
    self.diff.next_account_index = Some(index + 1);

    let mut account = Account::new(address.clone(), verify_key, index, balance);
    account.credentials = credentials.clone();
    let account = Arc::new(account);

    for cred in credentials {
      self.diff.credentials.insert(cred, address.clone());
    }
    self.diff.accounts.insert(address, Arc::clone(&account));
    account
  }

  pub fn instance(&self, address: &ContractAddress) -> Option<Arc<Instance>> {
    match self.diff.instances.get(address) {
      Some(instance) => Some(Arc::clone(instance)),
      None => self.base.instances.get(address).cloned(),
    }
  }

  pub fn set_instance(&mut self, instance: Instance) {
    self
      .diff
      .instances
      .insert(instance.address, Arc::new(instance));
  }

  /// Allocates the next instance address and stores the instance
  /// under it.
  pub fn create_instance(
    &mut self,
    mut instance: Instance,
  ) -> ContractAddress {
    let index = self
      .diff
      .next_instance_index
      .unwrap_or_else(|| self.base.instances.next_address().index);
    self.diff.next_instance_index = Some(index + 1);

    let address = ContractAddress::new(index);
    instance.address = address;
    self.diff.instances.insert(address, Arc::new(instance));
    address
  }

  pub fn module(&self, reference: &Multihash) -> Option<Arc<Module>> {
    match self.diff.modules.get(reference) {
      Some(module) => Some(Arc::clone(module)),
      None => self.base.modules.get(reference).cloned(),
    }
  }

  pub fn add_module(&mut self, module: Module) -> Multihash {
    let reference = module.reference;
    self.diff.modules.insert(reference, Arc::new(module));
    reference
  }

  pub fn rewards(&self) -> RewardAccounts {
    self
      .diff
      .rewards
      .clone()
      .unwrap_or_else(|| self.base.rewards.clone())
  }

  pub fn set_rewards(&mut self, rewards: RewardAccounts) {
    self.diff.rewards = Some(rewards);
  }

  pub fn seed(&self) -> SeedState {
    self
      .diff
      .seed
      .clone()
      .unwrap_or_else(|| self.base.seed.clone())
  }

  pub fn set_seed(&mut self, seed: SeedState) {
    self.diff.seed = Some(seed);
  }

  pub fn params(&self) -> ChainParameters {
    self
      .diff
      .params
      .clone()
      .unwrap_or_else(|| self.base.params.clone())
  }

  pub fn set_params(&mut self, params: ChainParameters) {
    self.diff.params = Some(params);
  }

  pub fn updates_mut(&mut self) -> &mut UpdateQueues {
    if self.diff.updates.is_none() {
      self.diff.updates = Some(self.base.updates.clone());
    }
    self.diff.updates.as_mut().unwrap()
  }

  pub fn updates(&self) -> &UpdateQueues {
    self.diff.updates.as_ref().unwrap_or(&self.base.updates)
  }

  pub fn bakers_mut(&mut self) -> &mut BakerPool {
    if self.diff.bakers.is_none() {
      self.diff.bakers = Some(self.base.bakers.clone());
    }
    self.diff.bakers.as_mut().unwrap()
  }

  pub fn bakers(&self) -> &BakerPool {
    self.diff.bakers.as_ref().unwrap_or(&self.base.bakers)
  }

  /// Commits the overlay into a new immutable snapshot. Entries the
  /// workspace never touched are shared with the base.
  pub fn freeze(self) -> Arc<BlockState> {
    let base = self.base;
    let diff = self.diff;

    let mut accounts = base.accounts.clone();
    for account in diff.accounts.into_values() {
      accounts.insert(account);
    }

    let mut instances = base.instances.clone();
    for instance in diff.instances.into_values() {
      instances.insert(instance);
    }

    let mut modules = base.modules.clone();
    for module in diff.modules.into_values() {
      modules.insert(module);
    }

    let bakers = diff.bakers.unwrap_or_else(|| base.bakers.clone());
    let seed = diff.seed.unwrap_or_else(|| base.seed.clone());

    // an epoch turnover refreshes the committee snapshot
    let epoch_bakers = if seed.epoch != base.seed.epoch {
      Arc::new(bakers.committee())
    } else {
      Arc::clone(&base.epoch_bakers)
    };

    Arc::new(BlockState {
      version: base.version,
      genesis_time: base.genesis_time,
      accounts,
      instances,
      modules,
      bakers,
      epoch_bakers,
      rewards: diff.rewards.unwrap_or_else(|| base.rewards.clone()),
      seed,
      params: diff.params.unwrap_or_else(|| base.params.clone()),
      updates: diff.updates.unwrap_or_else(|| base.updates.clone()),
      identity_providers: base.identity_providers.clone(),
      anonymity_revokers: base.anonymity_revokers.clone(),
      cryptographic_parameters: base.cryptographic_parameters.clone(),
      hash: OnceCell::new(),
    })
  }
}

#[cfg(test)]
mod tests {
  use {super::*, crate::test};

  #[test]
  fn freeze_of_untouched_thaw_preserves_hash() {
    let state = test::genesis_state();
    let hash = state.hash();
    let refrozen = state.thaw().freeze();
    assert_eq!(refrozen.hash(), hash);
  }

  #[test]
  fn overlay_reads_through_to_base() {
    let state = test::genesis_state();
    let addr = test::pubkey(1);
    let thawed = state.thaw();
    assert_eq!(
      thawed.account(&addr).map(|a| a.balance),
      state.account(&addr).map(|a| a.balance),
    );
  }

  #[test]
  fn writes_stay_in_overlay_until_freeze() {
    let state = test::genesis_state();
    let addr = test::pubkey(1);
    let mut thawed = state.thaw();

    let mut account = (*thawed.account(&addr).unwrap()).clone();
    account.balance += 100;
    thawed.set_account(account);

    // base is untouched
    let original = state.account(&addr).unwrap().balance;
    assert_eq!(
      thawed.account(&addr).unwrap().balance,
      original + 100
    );

    let frozen = thawed.freeze();
    assert_eq!(frozen.account(&addr).unwrap().balance, original + 100);
    assert_eq!(state.account(&addr).unwrap().balance, original);
    assert_ne!(frozen.hash(), state.hash());
  }

  #[test]
  fn created_accounts_get_fresh_indices() {
    let state = test::genesis_state();
    let mut thawed = state.thaw();
    let start = state.accounts.next_index();

    let a = thawed.create_account(
      test::pubkey(40),
      test::pubkey(40),
      5,
      vec![crate::primitives::sha256(b"cred-a")],
    );
    let b = thawed.create_account(
      test::pubkey(41),
      test::pubkey(41),
      5,
      vec![],
    );
    assert_eq!(a.index, start);
    assert_eq!(b.index, start + 1);

    let frozen = thawed.freeze();
    assert!(frozen
      .account_by_credential(&crate::primitives::sha256(b"cred-a"))
      .is_some());
    assert_eq!(frozen.accounts.next_index(), start + 2);
  }

  #[test]
  fn definite_bakers_refuse_pending_updates() {
    let state = test::genesis_state();
    assert!(state.definite_slot_bakers(1).is_some());

    let mut thawed = state.thaw();
    let seq = thawed.updates().next_sequence(UpdateType::ElectionDifficulty);
    thawed.updates_mut().enqueue(QueuedUpdate {
      sequence: seq,
      effective_time: state.slot_time(0),
      payload: UpdatePayload::ElectionDifficulty(1),
    });
    let updated = thawed.freeze();

    assert!(updated.definite_slot_bakers(1).is_none());
    // a slot in a later epoch is never definite
    let far = state.seed.epoch_length * 3;
    assert!(state.definite_slot_bakers(far).is_none());
  }
}
