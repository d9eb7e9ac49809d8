use {
  crate::primitives::{
    content_hash,
    sha256_concat,
    Amount,
    Nonce,
    Pubkey,
    Timestamp,
  },
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{collections::BTreeMap, sync::Arc},
};

pub type AccountIndex = u64;

/// A locked amount that becomes spendable at a fixed time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRelease {
  pub timestamp: Timestamp,
  pub amount: Amount,
}

/// A single account record inside a block state.
///
/// `balance` is the full amount owned by the account, including the
/// staked and the still-locked portions. The shielded amount is kept
/// separately and counts into the reward accounts' encrypted total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
  pub address: Pubkey,
  pub index: AccountIndex,
  pub balance: Amount,
  pub staked: Amount,
  pub releases: Vec<ScheduledRelease>,
  pub next_nonce: Nonce,
  pub verify_key: Pubkey,
  pub credentials: Vec<Multihash>,
}

impl Account {
  pub fn new(
    address: Pubkey,
    verify_key: Pubkey,
    index: AccountIndex,
    balance: Amount,
  ) -> Self {
    Self {
      address,
      index,
      balance,
      staked: 0,
      releases: vec![],
      next_nonce: 1,
      verify_key,
      credentials: vec![],
    }
  }

  /// Sum of releases that have not unlocked yet at `now`.
  pub fn locked(&self, now: Timestamp) -> Amount {
    self
      .releases
      .iter()
      .filter(|r| r.timestamp > now)
      .map(|r| r.amount)
      .sum()
  }

  /// The amount the account may spend at `now`. Staked and locked
  /// portions overlap, so only the larger of the two is held back.
  pub fn spendable(&self, now: Timestamp) -> Amount {
    self
      .balance
      .saturating_sub(self.staked.max(self.locked(now)))
  }
}

/// The account table of a frozen block state.
///
/// Entries are shared between snapshots through `Arc`; a thaw never
/// copies an account that the block does not touch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Accounts {
  by_address: BTreeMap<Pubkey, Arc<Account>>,
  by_index: BTreeMap<AccountIndex, Pubkey>,
  by_credential: BTreeMap<Multihash, Pubkey>,
  next_index: AccountIndex,
}

impl Accounts {
  pub fn get(&self, address: &Pubkey) -> Option<&Arc<Account>> {
    self.by_address.get(address)
  }

  pub fn get_by_index(&self, index: AccountIndex) -> Option<&Arc<Account>> {
    self.by_index.get(&index).and_then(|a| self.by_address.get(a))
  }

  pub fn get_by_credential(
    &self,
    reg_id: &Multihash,
  ) -> Option<&Arc<Account>> {
    self
      .by_credential
      .get(reg_id)
      .and_then(|a| self.by_address.get(a))
  }

  pub fn contains_credential(&self, reg_id: &Multihash) -> bool {
    self.by_credential.contains_key(reg_id)
  }

  pub fn next_index(&self) -> AccountIndex {
    self.next_index
  }

  /// Inserts or overwrites an account, keeping the index and
  /// credential lookups in sync.
  pub fn insert(&mut self, account: Arc<Account>) {
    self.by_index.insert(account.index, account.address.clone());
    for cred in &account.credentials {
      self.by_credential.insert(*cred, account.address.clone());
    }
    if account.index >= self.next_index {
      self.next_index = account.index + 1;
    }
    self.by_address.insert(account.address.clone(), account);
  }

  pub fn len(&self) -> usize {
    self.by_address.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_address.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Account>> {
    self.by_address.values()
  }

  /// Sum of all public balances, used by the total-supply invariant.
  pub fn total_amount(&self) -> Amount {
    self.by_address.values().map(|a| a.balance).sum()
  }

  /// Fold of all entries into a single table root.
  pub fn table_hash(&self) -> Multihash {
    let mut acc = Vec::new();
    for (address, account) in &self.by_address {
      acc.extend_from_slice(address);
      acc.extend_from_slice(content_hash(account.as_ref()).digest());
    }
    sha256_concat(&[b"accounts", &acc])
  }
}
