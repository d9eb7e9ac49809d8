//! The block tree (the "skov"): statuses, branches, finalization
//! list and the focus block.
//!
//! Blocks live in an arena keyed by hash; parent and last-finalized
//! references are plain hashes, never owning pointers, so the
//! apparent cycles of the chain graph reduce to lookups on a monotone
//! height. The tree is the single owner of block statuses and branch
//! membership; block states are shared snapshots referenced by every
//! block that kept them alive.

use {
  super::{
    block::{AnyBlock, BakedBlock, FinalizationRecord, GenesisData},
    pending::PendingBlockTable,
  },
  crate::{
    params::RuntimeParameters,
    primitives::{Height, Slot, Timestamp, ToBase58String},
    state::{BlockState, StateCaches, StateError},
    storage::{self, BlockStateFile, FinalizationCommit, StateKey, TreeStore},
    transactions::{PendingTransactionTable, TransactionTable},
  },
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
  },
  tracing::{info, warn},
};

/// Status of a block hash known to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
  /// Known, but its parent is not live yet.
  Pending,
  /// In the tree, subject to finalization or pruning.
  Alive,
  /// Committed at the given finalization height, irreversibly.
  Finalized { height: Height },
  /// Definitively rejected or orphaned by a finalized competitor.
  Dead,
}

/// A block's state snapshot: live in memory, or archived to the
/// era's segment with only hash and read access retained.
#[derive(Debug, Clone)]
pub enum StateRef {
  Cached(Arc<BlockState>),
  Archived { hash: Multihash, key: StateKey },
}

impl StateRef {
  pub fn state_hash(&self) -> Multihash {
    match self {
      StateRef::Cached(state) => state.hash(),
      StateRef::Archived { hash, .. } => *hash,
    }
  }
}

/// Arena entry of a live or finalized block.
#[derive(Debug, Clone)]
pub struct BlockEntry {
  pub block: AnyBlock,
  pub height: Height,
  pub state: StateRef,
  /// Where the state snapshot sits in the era segment, once written.
  pub state_key: Option<StateKey>,
  /// Execution outcomes of the block's items, kept until the block
  /// is finalized and they move to the outcome store.
  pub outcomes: Arc<Vec<crate::scheduler::TransactionOutcome>>,
  pub arrive: Timestamp,
}

impl BlockEntry {
  pub fn hash(&self) -> Multihash {
    self.block.hash()
  }

  pub fn parent(&self) -> Option<Multihash> {
    self.block.parent()
  }

  pub fn slot(&self) -> Slot {
    self.block.slot()
  }
}

/// Wire form of an arena entry as persisted per finalization step.
#[derive(Debug, Serialize, Deserialize)]
pub enum StoredBlock {
  Genesis(GenesisData),
  Baked(BakedBlock),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredBlockRecord {
  pub block: StoredBlock,
  pub height: Height,
  pub state_key: u64,
}

/// Rolling consensus counters, read-only for observers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsensusStatistics {
  pub blocks_received: u64,
  pub blocks_verified: u64,
  pub transactions_received: u64,
  pub finalization_count: u64,
  pub last_block_arrive: Option<Timestamp>,
  pub last_finalization: Option<Timestamp>,
}

/// The next era's genesis, parked here between the protocol update
/// taking effect and the host tearing this consensus down.
pub struct StagedRegenesis {
  pub genesis: Arc<GenesisData>,
  pub state: Arc<BlockState>,
}

/// The consensus tree state of one era.
pub struct Skov {
  pub(crate) genesis_index: u32,
  pub(crate) genesis: Arc<GenesisData>,
  pub(crate) genesis_hash: Multihash,
  pub(crate) statuses: HashMap<Multihash, BlockStatus>,
  pub(crate) entries: HashMap<Multihash, BlockEntry>,
  /// `branches[h]` lists the alive blocks at height
  /// `lfb.height + 1 + h`, in arrival order.
  pub(crate) branches: Vec<Vec<Multihash>>,
  pub(crate) finalization_list: Vec<(FinalizationRecord, Multihash)>,
  pub(crate) finalized_height_index: BTreeMap<Height, Multihash>,
  pub(crate) focus: Multihash,
  pub(crate) pending_blocks: PendingBlockTable,
  pub(crate) pending_transactions: PendingTransactionTable,
  pub(crate) transactions: TransactionTable,
  pub(crate) params: RuntimeParameters,
  pub(crate) stats: ConsensusStatistics,
  pub(crate) shutdown: bool,
  pub(crate) staged_regenesis: Option<StagedRegenesis>,
  /// Finalization records that arrived ahead of their index.
  pub(crate) pending_finalizations: BTreeMap<u64, FinalizationRecord>,
  /// Hashes of blocks whose execution handle was dropped unused;
  /// swept into `Dead` at the next operation.
  pub(crate) deadbox: Arc<std::sync::Mutex<Vec<Multihash>>>,
  pub(crate) store: TreeStore,
  pub(crate) state_file: BlockStateFile,
  pub(crate) caches: Arc<StateCaches>,
}

impl Skov {
  /// Opens the tree for an era, creating or recovering the persistent
  /// stores under `root`.
  pub fn open(
    root: &Path,
    genesis_index: u32,
    genesis: Arc<GenesisData>,
    genesis_state: Arc<BlockState>,
    params: RuntimeParameters,
  ) -> Result<Self, storage::Error> {
    if genesis_index == 0 {
      storage::migrate_legacy_layout(root)?;
    }
    let store = TreeStore::open(root, genesis_index)?;
    let state_file = BlockStateFile::open(root, genesis_index)?;
    let genesis_hash = genesis.hash();

    let caches = Arc::new(StateCaches::new(
      params.accounts_cache_size,
      params.modules_cache_size,
    ));

    let mut skov = Self {
      genesis_index,
      genesis_hash,
      genesis: Arc::clone(&genesis),
      statuses: HashMap::new(),
      entries: HashMap::new(),
      branches: vec![],
      finalization_list: vec![],
      finalized_height_index: BTreeMap::new(),
      focus: genesis_hash,
      pending_blocks: PendingBlockTable::default(),
      pending_transactions: PendingTransactionTable::default(),
      transactions: TransactionTable::default(),
      params,
      stats: ConsensusStatistics::default(),
      shutdown: false,
      staged_regenesis: None,
      pending_finalizations: BTreeMap::new(),
      deadbox: Arc::new(std::sync::Mutex::new(vec![])),
      store,
      state_file,
      caches,
    };

    let genesis_height = genesis.absolute_height;
    skov.statuses.insert(genesis_hash, BlockStatus::Finalized {
      height: genesis_height,
    });
    skov.finalized_height_index.insert(genesis_height, genesis_hash);

    if skov.store.finalization_count()? == 0 {
      // fresh database: persist the genesis as finalization step 0
      let state_key = skov.state_file.append(genesis_state.as_ref())?;
      let record = FinalizationRecord::genesis(genesis_hash);
      let stored = StoredBlockRecord {
        block: StoredBlock::Genesis((*genesis).clone()),
        height: genesis_height,
        state_key: state_key.0,
      };
      skov.store.commit_finalization(&FinalizationCommit {
        index: 0,
        record: bincode::serialize(&(&record, &genesis_hash))?,
        blocks: vec![(
          genesis_hash,
          genesis_height,
          bincode::serialize(&stored)?,
        )],
        outcomes: vec![],
      })?;
      skov.finalization_list.push((record, genesis_hash));
      skov.entries.insert(genesis_hash, BlockEntry {
        block: AnyBlock::Genesis(genesis),
        height: genesis_height,
        state: StateRef::Cached(genesis_state),
        state_key: Some(state_key),
        outcomes: Arc::new(vec![]),
        arrive: Timestamp::now(),
      });
    } else {
      skov.recover(genesis, genesis_state)?;
    }

    Ok(skov)
  }

  /// Re-derives the tree structure from the persisted finalization
  /// list and the block-state segment. Only the finalized trunk can
  /// be recovered; live branches are gone with the process that held
  /// them.
  fn recover(
    &mut self,
    genesis: Arc<GenesisData>,
    _genesis_state: Arc<BlockState>,
  ) -> Result<(), storage::Error> {
    for bytes in self.store.finalization_records()? {
      let (record, hash): (FinalizationRecord, Multihash) =
        bincode::deserialize(&bytes)?;
      self.finalization_list.push((record, hash));
    }
    let lfb_hash = self.last_finalized().1;

    // the finalization list names only the records' direct targets;
    // the height index fills in the transitively finalized trunk
    let mut height = genesis.absolute_height;
    loop {
      let Some(hash) = self.store.block_by_height(height)? else {
        break;
      };
      let stored = self.store.get_block(&hash)?.ok_or_else(|| {
        storage::Error::Corrupted(format!(
          "finalized block {} missing from the block table",
          hash.to_b58()
        ))
      })?;
      let stored: StoredBlockRecord = bincode::deserialize(&stored)?;

      let key = StateKey(stored.state_key);
      let state: BlockState = self.state_file.load(key)?;
      let state_ref = if hash == lfb_hash {
        StateRef::Cached(Arc::new(state))
      } else {
        StateRef::Archived {
          hash: state.hash(),
          key,
        }
      };

      let block = match stored.block {
        StoredBlock::Genesis(_) => AnyBlock::Genesis(Arc::clone(&genesis)),
        StoredBlock::Baked(b) => AnyBlock::Baked(Arc::new(b)),
      };
      self
        .statuses
        .insert(hash, BlockStatus::Finalized {
          height: stored.height,
        });
      self.finalized_height_index.insert(stored.height, hash);
      self.entries.insert(hash, BlockEntry {
        block,
        height: stored.height,
        state: state_ref,
        state_key: Some(key),
        outcomes: Arc::new(vec![]),
        arrive: Timestamp::now(),
      });
      height += 1;
    }

    if !self.entries.contains_key(&lfb_hash) {
      return Err(storage::Error::Corrupted(format!(
        "last finalized block {} not reachable through the height index",
        lfb_hash.to_b58()
      )));
    }

    self.focus = lfb_hash;
    self.stats.finalization_count = self.finalization_list.len() as u64 - 1;
    info!(
      era = self.genesis_index,
      finalized = self.finalization_list.len(),
      "recovered tree state from the journal"
    );
    Ok(())
  }

  pub fn genesis(&self) -> &Arc<GenesisData> {
    &self.genesis
  }

  pub fn genesis_hash(&self) -> Multihash {
    self.genesis_hash
  }

  pub fn genesis_index(&self) -> u32 {
    self.genesis_index
  }

  pub fn statistics(&self) -> &ConsensusStatistics {
    &self.stats
  }

  pub fn runtime_parameters(&self) -> &RuntimeParameters {
    &self.params
  }

  pub fn transactions(&self) -> &TransactionTable {
    &self.transactions
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown
  }

  /// The staged next-era genesis, if a protocol update completed.
  pub fn staged_regenesis(&self) -> Option<&StagedRegenesis> {
    self.staged_regenesis.as_ref()
  }

  pub fn status(&self, hash: &Multihash) -> Option<BlockStatus> {
    self.statuses.get(hash).copied()
  }

  pub fn entry(&self, hash: &Multihash) -> Option<&BlockEntry> {
    self.entries.get(hash)
  }

  /// The newest entry of the finalization list.
  pub fn last_finalized(&self) -> &(FinalizationRecord, Multihash) {
    self
      .finalization_list
      .last()
      .expect("the finalization list always holds at least the genesis")
  }

  pub fn last_finalized_entry(&self) -> &BlockEntry {
    let (_, hash) = self.last_finalized();
    self
      .entries
      .get(hash)
      .expect("the last finalized block always has an entry")
  }

  /// State of the last finalized block; always cached.
  pub fn last_finalized_state(&self) -> Arc<BlockState> {
    match &self.last_finalized_entry().state {
      StateRef::Cached(state) => Arc::clone(state),
      StateRef::Archived { .. } => {
        unreachable!("the LFB state is never archived")
      }
    }
  }

  pub fn last_finalized_slot(&self) -> Slot {
    self.last_finalized_entry().slot()
  }

  pub fn last_finalized_height(&self) -> Height {
    self.last_finalized_entry().height
  }

  pub fn next_finalization_index(&self) -> u64 {
    self.finalization_list.len() as u64
  }

  pub fn focus(&self) -> Multihash {
    self.focus
  }

  /// Loads the state snapshot of any known block, reading archived
  /// snapshots back from the era segment.
  pub fn block_state(
    &self,
    hash: &Multihash,
  ) -> Result<Option<Arc<BlockState>>, StateError> {
    match self.entries.get(hash).map(|e| &e.state) {
      None => Ok(None),
      Some(StateRef::Cached(state)) => Ok(Some(Arc::clone(state))),
      Some(StateRef::Archived { key, .. }) => {
        let state: BlockState = self.state_file.load(*key)?;
        if state.version != self.genesis.protocol_version {
          return Err(StateError::VersionMismatch {
            expected: self.genesis.protocol_version,
            actual: state.version,
          });
        }
        Ok(Some(Arc::new(state)))
      }
    }
  }

  /// Account lookup in a block's state, read through the shared LRU
  /// cache. Queries against dead or unknown blocks answer `None`.
  pub fn account_in_block(
    &self,
    block: &Multihash,
    address: &crate::primitives::Pubkey,
  ) -> Result<Option<Arc<crate::state::Account>>, StateError> {
    let Some(entry) = self.entries.get(block) else {
      return Ok(None);
    };
    let state_hash = entry.state.state_hash();
    if let Some(hit) = self.caches.account(&state_hash, address) {
      return Ok(Some(hit));
    }

    let Some(state) = self.block_state(block)? else {
      return Ok(None);
    };
    let account = state.account(address).cloned();
    if let Some(account) = &account {
      self.caches.remember_account(state_hash, Arc::clone(account));
    }
    Ok(account)
  }

  /// Module lookup; modules are content-addressed, so the cache is
  /// shared across every state and the artifact is loaded on demand
  /// for archived states.
  pub fn module_in_block(
    &self,
    block: &Multihash,
    reference: &Multihash,
  ) -> Result<Option<Arc<crate::state::Module>>, StateError> {
    if let Some(hit) = self.caches.module(reference) {
      return Ok(Some(hit));
    }
    let Some(state) = self.block_state(block)? else {
      return Ok(None);
    };
    let module = state.module(reference).cloned();
    if let Some(module) = &module {
      self.caches.remember_module(Arc::clone(module));
    }
    Ok(module)
  }

  /// Makes a freshly executed block live and slots it into its branch
  /// layer.
  pub(crate) fn insert_alive(
    &mut self,
    block: Arc<BakedBlock>,
    state: Arc<BlockState>,
    outcomes: Arc<Vec<crate::scheduler::TransactionOutcome>>,
    arrive: Timestamp,
  ) {
    let hash = block.hash();
    let height = block.height;
    let layer = (height - self.last_finalized_height() - 1) as usize;

    self.statuses.insert(hash, BlockStatus::Alive);
    self.entries.insert(hash, BlockEntry {
      block: AnyBlock::Baked(block),
      height,
      state: StateRef::Cached(state),
      state_key: None,
      outcomes,
      arrive,
    });

    if layer == self.branches.len() {
      self.branches.push(vec![hash]);
    } else {
      self.branches[layer].push(hash);
    }
    self.stats.blocks_verified += 1;
    self.stats.last_block_arrive = Some(arrive);
  }

  /// Marks a block dead and drops its arena entry.
  pub(crate) fn mark_dead(&mut self, hash: Multihash) {
    self.statuses.insert(hash, BlockStatus::Dead);
    if let Some(entry) = self.entries.remove(&hash) {
      let layer = entry.height as i64 - self.last_finalized_height() as i64 - 1;
      if layer >= 0 {
        if let Some(level) = self.branches.get_mut(layer as usize) {
          level.retain(|h| h != &hash);
        }
      }
      warn!("block {} marked dead", hash.to_b58());
    }
  }

  /// Walks parent references from `descendant` down to `height`.
  /// Returns `None` when the walk leaves the known tree.
  pub fn ancestor_at_height(
    &self,
    descendant: Multihash,
    height: Height,
  ) -> Option<Multihash> {
    let mut at = descendant;
    loop {
      let entry = self.entries.get(&at)?;
      if entry.height == height {
        return Some(at);
      }
      if entry.height < height {
        return None;
      }
      at = entry.parent()?;
    }
  }

  pub fn is_ancestor(&self, ancestor: &Multihash, descendant: &Multihash) -> bool {
    let Some(anc) = self.entries.get(ancestor) else {
      return false;
    };
    self.ancestor_at_height(*descendant, anc.height) == Some(*ancestor)
  }

  /// Moves the focus block, replaying the pending-transaction table
  /// backward along the abandoned path and forward along the new one.
  pub(crate) fn set_focus(&mut self, new_focus: Multihash) {
    if new_focus == self.focus {
      return;
    }

    let mut back = vec![];
    let mut forward = vec![];
    let mut a = self.focus;
    let mut b = new_focus;

    let height = |skov: &Self, h: &Multihash| {
      skov.entries.get(h).map(|e| e.height).unwrap_or(0)
    };

    while height(self, &a) > height(self, &b) {
      back.push(a);
      let Some(parent) = self.entries.get(&a).and_then(|e| e.parent()) else {
        break;
      };
      a = parent;
    }
    while height(self, &b) > height(self, &a) {
      forward.push(b);
      let Some(parent) = self.entries.get(&b).and_then(|e| e.parent()) else {
        break;
      };
      b = parent;
    }
    while a != b {
      back.push(a);
      forward.push(b);
      match (
        self.entries.get(&a).and_then(|e| e.parent()),
        self.entries.get(&b).and_then(|e| e.parent()),
      ) {
        (Some(pa), Some(pb)) => {
          a = pa;
          b = pb;
        }
        _ => break,
      }
    }

    for hash in back {
      if let Some(entry) = self.entries.get(&hash) {
        let items: Vec<_> = entry.block.items().to_vec();
        self.pending_transactions.rollback_block(items.iter());
      }
    }
    for hash in forward.iter().rev() {
      if let Some(entry) = self.entries.get(hash) {
        let items: Vec<_> = entry.block.items().to_vec();
        self.pending_transactions.forward_block(items.iter());
      }
    }

    self.focus = new_focus;
  }

  /// Branch-coherence invariant; test hook.
  #[cfg(test)]
  pub fn branches_coherent(&self) -> bool {
    let lfb_height = self.last_finalized_height();
    let lfb_hash = self.last_finalized().1;
    self.branches.iter().enumerate().all(|(layer, level)| {
      level.iter().all(|hash| {
        let Some(entry) = self.entries.get(hash) else {
          return false;
        };
        if entry.height != lfb_height + 1 + layer as u64 {
          return false;
        }
        let Some(parent) = entry.parent() else {
          return false;
        };
        if layer == 0 {
          parent == lfb_hash
        } else {
          self.branches[layer - 1].contains(&parent)
        }
      })
    })
  }
}
