//! Versioned block bundles for out-of-band catch-up.
//!
//! A bundle is a sequence of chunks; each chunk is a header (magic,
//! version, chunk index) followed by finalized blocks and their
//! records in causal order. A side index lists the height range per
//! chunk so an importer can skip chunks whose blocks it already has
//! without re-validating them.

use {
  super::{
    block::{BakedBlock, FinalizationRecord},
    receive::HostContext,
    tree::Skov,
  },
  crate::{primitives::Height, results::UpdateResult},
  serde::{Deserialize, Serialize},
  std::io::{Read, Write},
  tracing::{debug, warn},
};

pub const EXPORT_VERSION: u32 = 3;
const CHUNK_MAGIC: [u8; 8] = *b"SILVAEXP";

#[derive(Debug, Serialize, Deserialize)]
struct ChunkHeader {
  magic: [u8; 8],
  version: u32,
  chunk_index: u32,
}

#[derive(Debug, Serialize, Deserialize)]
enum ExportItem {
  Block(BakedBlock),
  Record(FinalizationRecord),
}

/// Per-chunk summary written next to the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
  pub chunk_index: u32,
  pub first_height: Height,
  pub last_height: Height,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIndex {
  pub chunks: Vec<ChunkInfo>,
}

impl Skov {
  /// Exports the finalized chain (without the genesis) as a chunked
  /// bundle, returning the chunk index.
  pub fn export_bundle(
    &self,
    out: &mut dyn Write,
    blocks_per_chunk: usize,
  ) -> Result<BundleIndex, crate::storage::Error> {
    let finalized: Vec<(&FinalizationRecord, &multihash::Multihash)> = self
      .finalization_list
      .iter()
      .skip(1)
      .map(|(record, hash)| (record, hash))
      .collect();

    let mut index = BundleIndex::default();
    for (chunk_index, window) in
      finalized.chunks(blocks_per_chunk.max(1)).enumerate()
    {
      let mut items = vec![];
      let mut first_height = Height::MAX;
      let mut last_height = 0;
      for (record, hash) in window {
        let Some(entry) = self.entry(hash) else {
          continue;
        };
        first_height = first_height.min(entry.height);
        last_height = last_height.max(entry.height);
        if let Some(baked) = entry.block.as_baked() {
          items.push(ExportItem::Block((**baked).clone()));
        }
        items.push(ExportItem::Record((*record).clone()));
      }

      bincode::serialize_into(&mut *out, &ChunkHeader {
        magic: CHUNK_MAGIC,
        version: EXPORT_VERSION,
        chunk_index: chunk_index as u32,
      })?;
      bincode::serialize_into(&mut *out, &items)?;
      index.chunks.push(ChunkInfo {
        chunk_index: chunk_index as u32,
        first_height,
        last_height,
      });
    }

    Ok(index)
  }

  /// Imports a bundle, feeding each block and record through the
  /// regular reception paths. Chunks whose whole height range is
  /// already finalized here are skipped using the index.
  pub fn import_bundle(
    &mut self,
    input: &mut dyn Read,
    index: Option<&BundleIndex>,
    host: &mut HostContext,
  ) -> UpdateResult {
    loop {
      let header: ChunkHeader = match bincode::deserialize_from(&mut *input) {
        Ok(header) => header,
        // clean end of stream
        Err(_) => return UpdateResult::Success,
      };
      if header.magic != CHUNK_MAGIC || header.version != EXPORT_VERSION {
        return UpdateResult::SerializationFail;
      }
      let items: Vec<ExportItem> =
        match bincode::deserialize_from(&mut *input) {
          Ok(items) => items,
          Err(_) => return UpdateResult::SerializationFail,
        };

      let already_known = index
        .and_then(|i| {
          i.chunks
            .iter()
            .find(|c| c.chunk_index == header.chunk_index)
        })
        .map(|c| c.last_height <= self.last_finalized_height())
        .unwrap_or(false);
      if already_known {
        debug!(chunk = header.chunk_index, "skipping imported chunk");
        continue;
      }

      for item in items {
        match item {
          ExportItem::Block(block) => {
            let bytes = bincode::serialize(&block).unwrap();
            let (result, cont) =
              self.receive_block(self.genesis_index, &bytes, host);
            let result = match cont {
              Some(cont) => self.execute_block(cont, host),
              None => result,
            };
            match result {
              UpdateResult::Success
              | UpdateResult::Duplicate
              | UpdateResult::Stale
              | UpdateResult::PendingBlock => {}
              other => {
                warn!(chunk = header.chunk_index, ?other, "import aborted");
                return other;
              }
            }
          }
          ExportItem::Record(record) => {
            match self.receive_finalization_record(record, host) {
              UpdateResult::Success
              | UpdateResult::Duplicate
              | UpdateResult::PendingFinalization => {}
              other => {
                warn!(chunk = header.chunk_index, ?other, "import aborted");
                return other;
              }
            }
          }
        }
      }
    }
  }

  /// Imports a bundle from disk; a missing file is reported with the
  /// dedicated code so the caller can fall back to peer catch-up.
  pub fn import_bundle_file(
    &mut self,
    path: &std::path::Path,
    index: Option<&BundleIndex>,
    host: &mut HostContext,
  ) -> UpdateResult {
    let Ok(mut file) = std::fs::File::open(path) else {
      return UpdateResult::MissingImportFile;
    };
    self.import_bundle(&mut file, index, host)
  }
}
