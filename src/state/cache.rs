use {
  super::{accounts::Account, modules::Module},
  crate::primitives::Pubkey,
  lru::LruCache,
  multihash::Multihash,
  std::{num::NonZeroUsize, sync::Arc, sync::Mutex},
};

/// Bounded read-through caches shared by all block states.
///
/// Accounts are keyed by (state hash, address) because the same
/// address resolves differently in different snapshots; modules are
/// content-addressed so a bare reference suffices.
pub struct StateCaches {
  accounts: Mutex<LruCache<(Multihash, Pubkey), Arc<Account>>>,
  modules: Mutex<LruCache<Multihash, Arc<Module>>>,
}

impl StateCaches {
  pub fn new(accounts_bound: usize, modules_bound: usize) -> Self {
    Self {
      accounts: Mutex::new(LruCache::new(
        NonZeroUsize::new(accounts_bound.max(1)).unwrap(),
      )),
      modules: Mutex::new(LruCache::new(
        NonZeroUsize::new(modules_bound.max(1)).unwrap(),
      )),
    }
  }

  pub fn account(
    &self,
    state: &Multihash,
    address: &Pubkey,
  ) -> Option<Arc<Account>> {
    self
      .accounts
      .lock()
      .unwrap()
      .get(&(*state, address.clone()))
      .cloned()
  }

  pub fn remember_account(
    &self,
    state: Multihash,
    account: Arc<Account>,
  ) {
    self
      .accounts
      .lock()
      .unwrap()
      .put((state, account.address.clone()), account);
  }

  pub fn module(&self, reference: &Multihash) -> Option<Arc<Module>> {
    self.modules.lock().unwrap().get(reference).cloned()
  }

  pub fn remember_module(&self, module: Arc<Module>) {
    self.modules.lock().unwrap().put(module.reference, module);
  }
}

impl Default for StateCaches {
  fn default() -> Self {
    let defaults = crate::params::RuntimeParameters::default();
    Self::new(defaults.accounts_cache_size, defaults.modules_cache_size)
  }
}
