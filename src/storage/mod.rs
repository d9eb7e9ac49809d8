//! Durable storage for the tree state and the block states.
//!
//! The on-disk layout is append-structured per era: era `n` owns an
//! LMDB environment under `treestate-<n>/` and a block-state segment
//! file `blockstate-<n>.dat`. A legacy unversioned layout (a bare
//! `treestate/` directory next to `blockstate.dat`) is migrated in
//! place on startup by renaming both to the era-0 names; the version
//! tag is stamped when the store is first opened.

mod blockstate;
mod treestate;

pub use {
  blockstate::{BlockStateFile, StateKey},
  treestate::{FinalizationCommit, TreeStore},
};

use {
  std::path::{Path, PathBuf},
  thiserror::Error,
};

pub const TREESTATE_VERSION: u32 = 1;
pub const BLOCKSTATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
  #[error("Serialization Error: {0}")]
  Serialization(#[from] bincode::Error),

  #[error("Storage Engine Error: {0}")]
  StorageEngine(#[from] lmdb::Error),

  #[error("System IO Error: {0}")]
  SystemIO(#[from] std::io::Error),

  #[error("storage corrupted: {0}")]
  Corrupted(String),
}

pub fn treestate_dir(root: &Path, era: u32) -> PathBuf {
  root.join(format!("treestate-{era}"))
}

pub fn blockstate_file(root: &Path, era: u32) -> PathBuf {
  root.join(format!("blockstate-{era}.dat"))
}

/// Renames a legacy unversioned layout into the era-0 slots. Returns
/// whether anything was moved. Safe to call on every startup.
pub fn migrate_legacy_layout(root: &Path) -> Result<bool, Error> {
  let mut migrated = false;

  let legacy_tree = root.join("treestate");
  if legacy_tree.is_dir() && !treestate_dir(root, 0).exists() {
    std::fs::rename(&legacy_tree, treestate_dir(root, 0))?;
    migrated = true;
  }

  let legacy_state = root.join("blockstate.dat");
  if legacy_state.is_file() && !blockstate_file(root, 0).exists() {
    std::fs::rename(&legacy_state, blockstate_file(root, 0))?;
    migrated = true;
  }

  Ok(migrated)
}

#[cfg(test)]
mod tests {
  use super::{blockstate_file, migrate_legacy_layout, treestate_dir};

  #[test]
  fn legacy_layout_renamed_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("treestate")).unwrap();
    std::fs::write(dir.path().join("blockstate.dat"), b"x").unwrap();

    assert!(migrate_legacy_layout(dir.path()).unwrap());
    assert!(treestate_dir(dir.path(), 0).is_dir());
    assert!(blockstate_file(dir.path(), 0).is_file());

    // second run is a no-op
    assert!(!migrate_legacy_layout(dir.path()).unwrap());
  }
}
