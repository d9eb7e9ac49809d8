use {
  crate::primitives::{content_hash, sha256, sha256_concat},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{collections::BTreeMap, sync::Arc},
};

/// A deployed smart-contract module.
///
/// The artifact is the execution engine's input and is opaque here;
/// the reference is the content hash of the artifact bytes, so the
/// same module deployed twice resolves to a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
  pub reference: Multihash,
  pub artifact: Vec<u8>,
  pub entrypoints: Vec<String>,
  pub size: u64,
}

impl Module {
  pub fn new(artifact: Vec<u8>, entrypoints: Vec<String>) -> Self {
    Self {
      reference: sha256(&artifact),
      size: artifact.len() as u64,
      artifact,
      entrypoints,
    }
  }

  pub fn exposes(&self, entrypoint: &str) -> bool {
    self.entrypoints.iter().any(|e| e == entrypoint)
  }
}

/// The module table of a frozen block state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Modules {
  table: BTreeMap<Multihash, Arc<Module>>,
}

impl Modules {
  pub fn get(&self, reference: &Multihash) -> Option<&Arc<Module>> {
    self.table.get(reference)
  }

  pub fn contains(&self, reference: &Multihash) -> bool {
    self.table.contains_key(reference)
  }

  pub fn insert(&mut self, module: Arc<Module>) {
    self.table.insert(module.reference, module);
  }

  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn table_hash(&self) -> Multihash {
    let mut acc = Vec::new();
    for (reference, module) in &self.table {
      acc.extend_from_slice(reference.digest());
      acc.extend_from_slice(content_hash(module.as_ref()).digest());
    }
    sha256_concat(&[b"modules", &acc])
  }
}
