//! Append-structured block-state segments.
//!
//! One segment file per era holds the serialized frozen states of
//! finalized blocks, written in finalization order. Records are
//! length-prefixed; a crash can only ever leave a partial record at
//! the tail, which [`BlockStateFile::open`] truncates away so the
//! file is always consistent up to its last complete record.

use {
  super::{blockstate_file, Error, BLOCKSTATE_VERSION},
  serde::{de::DeserializeOwned, Serialize},
  std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
  },
  tracing::warn,
};

const MAGIC: &[u8; 8] = b"SILVABS\0";
const HEADER_LEN: u64 = 8 + 4 + 4;

/// Offset of a stored state inside its era's segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKey(pub u64);

pub struct BlockStateFile {
  path: PathBuf,
  file: Mutex<File>,
  end: Mutex<u64>,
}

impl BlockStateFile {
  /// Opens or creates the segment for `era`, validating the header
  /// and truncating any partial tail record.
  pub fn open(root: &Path, era: u32) -> Result<Self, Error> {
    let path = blockstate_file(root, era);
    let mut file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(&path)?;

    let len = file.metadata()?.len();
    if len == 0 {
      file.write_all(MAGIC)?;
      file.write_all(&BLOCKSTATE_VERSION.to_le_bytes())?;
      file.write_all(&era.to_le_bytes())?;
      file.flush()?;
    } else {
      if len < HEADER_LEN {
        return Err(Error::Corrupted(format!(
          "block state segment {} shorter than its header",
          path.display()
        )));
      }
      let mut magic = [0u8; 8];
      let mut version = [0u8; 4];
      file.seek(SeekFrom::Start(0))?;
      file.read_exact(&mut magic)?;
      file.read_exact(&mut version)?;
      if &magic != MAGIC {
        return Err(Error::Corrupted(format!(
          "block state segment {} carries a foreign magic",
          path.display()
        )));
      }
      if u32::from_le_bytes(version) != BLOCKSTATE_VERSION {
        return Err(Error::Corrupted(format!(
          "block state segment {} has unsupported version",
          path.display()
        )));
      }
    }

    let end = Self::scan_consistent_end(&mut file)?;
    if end < file.metadata()?.len() {
      warn!(
        path = %path.display(),
        "truncating partial record at the tail of the segment"
      );
      file.set_len(end)?;
    }

    Ok(Self {
      path,
      file: Mutex::new(file),
      end: Mutex::new(end),
    })
  }

  /// Walks the records from the header on and returns the offset just
  /// past the last complete one.
  fn scan_consistent_end(file: &mut File) -> Result<u64, Error> {
    let len = file.metadata()?.len();
    let mut at = HEADER_LEN.min(len);
    loop {
      if at + 4 > len {
        return Ok(at);
      }
      file.seek(SeekFrom::Start(at))?;
      let mut reclen = [0u8; 4];
      file.read_exact(&mut reclen)?;
      let reclen = u32::from_le_bytes(reclen) as u64;
      if at + 4 + reclen > len {
        return Ok(at);
      }
      at += 4 + reclen;
    }
  }

  /// Appends a serialized state and returns its key.
  pub fn append<T: Serialize>(&self, value: &T) -> Result<StateKey, Error> {
    let bytes = bincode::serialize(value)?;
    let mut file = self.file.lock().unwrap();
    let mut end = self.end.lock().unwrap();

    file.seek(SeekFrom::Start(*end))?;
    file.write_all(&(bytes.len() as u32).to_le_bytes())?;
    file.write_all(&bytes)?;
    file.flush()?;

    let key = StateKey(*end);
    *end += 4 + bytes.len() as u64;
    Ok(key)
  }

  /// Loads the record stored at `key`.
  pub fn load<T: DeserializeOwned>(&self, key: StateKey) -> Result<T, Error> {
    let mut file = self.file.lock().unwrap();
    let end = *self.end.lock().unwrap();
    if key.0 + 4 > end {
      return Err(Error::Corrupted(format!(
        "state key {} outside segment {}",
        key.0,
        self.path.display()
      )));
    }

    file.seek(SeekFrom::Start(key.0))?;
    let mut reclen = [0u8; 4];
    file.read_exact(&mut reclen)?;
    let reclen = u32::from_le_bytes(reclen) as usize;
    let mut bytes = vec![0u8; reclen];
    file.read_exact(&mut bytes)?;
    Ok(bincode::deserialize(&bytes)?)
  }
}

#[cfg(test)]
mod tests {
  use super::{BlockStateFile, HEADER_LEN};

  #[test]
  fn append_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let segment = BlockStateFile::open(dir.path(), 0).unwrap();

    let a = segment.append(&vec![1u8, 2, 3]).unwrap();
    let b = segment.append(&"hello".to_string()).unwrap();

    let back_a: Vec<u8> = segment.load(a).unwrap();
    let back_b: String = segment.load(b).unwrap();
    assert_eq!(back_a, vec![1, 2, 3]);
    assert_eq!(back_b, "hello");
  }

  #[test]
  fn partial_tail_is_truncated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let key;
    {
      let segment = BlockStateFile::open(dir.path(), 0).unwrap();
      key = segment.append(&42u64).unwrap();
    }

    // simulate a crash mid-append: garbage length prefix and half a
    // record at the tail
    let path = super::blockstate_file(dir.path(), 0);
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
      .append(true)
      .open(&path)
      .unwrap();
    file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(file);

    let segment = BlockStateFile::open(dir.path(), 0).unwrap();
    let back: u64 = segment.load(key).unwrap();
    assert_eq!(back, 42);
    // the torn record is gone
    let len = std::fs::metadata(&path).unwrap().len();
    assert!(len > HEADER_LEN);
    let fresh = segment.append(&7u64).unwrap();
    assert_eq!(fresh.0, len);
  }

  #[test]
  fn reopen_resumes_after_last_record() {
    let dir = tempfile::tempdir().unwrap();
    let first;
    {
      let segment = BlockStateFile::open(dir.path(), 3).unwrap();
      first = segment.append(&1u32).unwrap();
    }
    let segment = BlockStateFile::open(dir.path(), 3).unwrap();
    let second = segment.append(&2u32).unwrap();
    assert!(second.0 > first.0);
    let one: u32 = segment.load(first).unwrap();
    assert_eq!(one, 1);
  }
}
