//! Content-addressed identifiers.
//!
//! Every identifier on the chain (blocks, transactions, modules,
//! credential registrations, state roots) is the SHA-256 digest of the
//! object's canonical [`bincode`] serialization, wrapped in a multihash.
//! Two implementations that agree on the logical object agree on the
//! identifier.

use {
  multihash::{Code, Multihash, MultihashDigest, Sha2_256, StatefulHasher},
  serde::Serialize,
};

/// SHA-256 of a raw byte string.
pub fn sha256(bytes: &[u8]) -> Multihash {
  Code::Sha2_256.digest(bytes)
}

/// SHA-256 over the concatenation of several byte strings without
/// materializing the concatenated buffer.
pub fn sha256_concat(parts: &[&[u8]]) -> Multihash {
  let mut hasher = Sha2_256::default();
  for part in parts {
    hasher.update(part);
  }
  Multihash::wrap(Code::Sha2_256.into(), hasher.finalize().as_ref()).unwrap()
}

/// Content hash of any canonically serializable value.
///
/// Serialization of an in-memory value never fails with bincode,
/// so this is infallible from the caller's point of view.
pub fn content_hash<T: Serialize>(value: &T) -> Multihash {
  sha256(&bincode::serialize(value).unwrap())
}

/// Root of a binary merkle tree over a list of leaf hashes.
///
/// Odd layers duplicate their last element. The root over an empty
/// list is the hash of the empty string, so that the scheme stays
/// total.
pub fn merkle_root(leaves: &[Multihash]) -> Multihash {
  if leaves.is_empty() {
    return sha256(b"");
  }

  let mut layer: Vec<Multihash> = leaves.to_vec();
  while layer.len() > 1 {
    let mut next = Vec::with_capacity((layer.len() + 1) / 2);
    for pair in layer.chunks(2) {
      let left = pair[0];
      let right = pair.get(1).copied().unwrap_or(left);
      next.push(sha256_concat(&[left.digest(), right.digest()]));
    }
    layer = next;
  }
  layer[0]
}

#[cfg(test)]
mod tests {
  use super::{content_hash, merkle_root, sha256, sha256_concat};

  #[test]
  fn sha256_test_vector() {
    // SHA-256("abc"), a fixed vector that must never change
    let h = sha256(b"abc");
    assert_eq!(
      hex(h.digest()),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }

  #[test]
  fn concat_equals_plain() {
    assert_eq!(sha256_concat(&[b"ab", b"c"]), sha256(b"abc"));
    assert_eq!(sha256_concat(&[]), sha256(b""));
  }

  #[test]
  fn content_hash_is_deterministic() {
    #[derive(serde::Serialize)]
    struct Probe {
      a: u64,
      b: Vec<u8>,
    }
    let one = Probe {
      a: 7,
      b: vec![1, 2, 3],
    };
    let two = Probe {
      a: 7,
      b: vec![1, 2, 3],
    };
    assert_eq!(content_hash(&one), content_hash(&two));
  }

  #[test]
  fn merkle_shapes() {
    let a = sha256(b"a");
    let b = sha256(b"b");
    let c = sha256(b"c");

    assert_eq!(merkle_root(&[]), sha256(b""));
    assert_eq!(merkle_root(&[a]), a);

    let ab = sha256_concat(&[a.digest(), b.digest()]);
    assert_eq!(merkle_root(&[a, b]), ab);

    // odd layer duplicates the trailing leaf
    let cc = sha256_concat(&[c.digest(), c.digest()]);
    let root = sha256_concat(&[ab.digest(), cc.digest()]);
    assert_eq!(merkle_root(&[a, b, c]), root);
  }

  fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
  }
}
