use {
  crate::primitives::{content_hash, sha256_concat, Amount, Pubkey},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{collections::BTreeMap, fmt, sync::Arc},
};

/// Address of a smart-contract instance.
///
/// Instances are numbered in creation order; the subindex is reserved
/// for reuse of freed slots and stays 0 for now.
#[derive(
  Debug,
  Default,
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
pub struct ContractAddress {
  pub index: u64,
  pub subindex: u64,
}

impl ContractAddress {
  pub fn new(index: u64) -> Self {
    Self { index, subindex: 0 }
  }
}

impl fmt::Display for ContractAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "<{},{}>", self.index, self.subindex)
  }
}

/// A smart-contract instance: an initialized module with its own
/// balance and mutable state blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
  pub address: ContractAddress,
  pub module: Multihash,
  pub init_name: String,
  /// Immutable parameter the instance was initialized with.
  pub parameter: Vec<u8>,
  /// Mutable state, owned by the execution engine.
  pub state: Vec<u8>,
  pub balance: Amount,
  pub owner: Pubkey,
}

/// The instance table of a frozen block state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instances {
  table: BTreeMap<ContractAddress, Arc<Instance>>,
  next_index: u64,
}

impl Instances {
  pub fn get(&self, address: &ContractAddress) -> Option<&Arc<Instance>> {
    self.table.get(address)
  }

  pub fn insert(&mut self, instance: Arc<Instance>) {
    if instance.address.index >= self.next_index {
      self.next_index = instance.address.index + 1;
    }
    self.table.insert(instance.address, instance);
  }

  pub fn next_address(&self) -> ContractAddress {
    ContractAddress::new(self.next_index)
  }

  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Instance>> {
    self.table.values()
  }

  /// Sum of instance balances, used by the total-supply invariant.
  pub fn total_amount(&self) -> Amount {
    self.table.values().map(|i| i.balance).sum()
  }

  pub fn table_hash(&self) -> Multihash {
    let mut acc = Vec::new();
    for (address, instance) in &self.table {
      acc.extend_from_slice(&address.index.to_be_bytes());
      acc.extend_from_slice(&address.subindex.to_be_bytes());
      acc.extend_from_slice(content_hash(instance.as_ref()).digest());
    }
    sha256_concat(&[b"instances", &acc])
  }
}
