//! Leadership election proofs and block nonces.
//!
//! The protocol treats these as opaque VRF outputs: a baker proves with
//! its election key that it evaluated the beacon at a given slot, and
//! anyone holding the verify key can check the evaluation. ed25519
//! signatures are deterministic, so signing a domain-separated message
//! of (election nonce, slot) behaves as a verifiable random function
//! for our purposes: the output is unpredictable without the secret
//! key, yet fixed once the key and inputs are fixed.

use {
  super::{sha256, sha256_concat, Keypair, Pubkey, Slot},
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

const NONCE_DOMAIN: &[u8] = b"NONCE";
const ELECTION_DOMAIN: &[u8] = b"ELECTION";

fn vrf_message(domain: &[u8], beacon: &Multihash, slot: Slot) -> Vec<u8> {
  let mut msg = Vec::with_capacity(domain.len() + 40);
  msg.extend_from_slice(domain);
  msg.extend_from_slice(&beacon.to_bytes());
  msg.extend_from_slice(&slot.to_be_bytes());
  msg
}

/// The baker's verifiable contribution to the seed beacon, carried in
/// every block and folded into the updated nonce of the seed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNonce(Signature);

impl BlockNonce {
  pub fn new(key: &Keypair, beacon: &Multihash, slot: Slot) -> Self {
    Self(key.sign(&vrf_message(NONCE_DOMAIN, beacon, slot)))
  }

  pub fn verify(&self, key: &Pubkey, beacon: &Multihash, slot: Slot) -> bool {
    key.verify(&vrf_message(NONCE_DOMAIN, beacon, slot), &self.0)
  }

  /// The pseudorandom output folded into the seed state.
  pub fn output(&self) -> Multihash {
    sha256(&self.0.to_bytes())
  }
}

/// Proof that a baker won the block lottery for a slot.
///
/// Validity is checked in two steps: the proof must verify under the
/// baker's registered election key, and its pseudorandom output must
/// fall under the threshold determined by the election difficulty and
/// the baker's share of the total stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionProof(Signature);

impl ElectionProof {
  pub fn new(key: &Keypair, beacon: &Multihash, slot: Slot) -> Self {
    Self(key.sign(&vrf_message(ELECTION_DOMAIN, beacon, slot)))
  }

  pub fn verify(&self, key: &Pubkey, beacon: &Multihash, slot: Slot) -> bool {
    key.verify(&vrf_message(ELECTION_DOMAIN, beacon, slot), &self.0)
  }

  /// Checks the lottery: the proof's output interpreted as a fraction
  /// of the u64 range must be below `difficulty × stake / total`.
  ///
  /// `difficulty_ppm` is the election difficulty in parts per million.
  /// Integer arithmetic only, so every node reaches the same verdict.
  pub fn wins(
    &self,
    difficulty_ppm: u32,
    stake: u64,
    total_stake: u64,
  ) -> bool {
    if total_stake == 0 || stake == 0 {
      return false;
    }
    let out = sha256_concat(&[b"LOTTERY", &self.0.to_bytes()]);
    let mut head = [0u8; 8];
    head.copy_from_slice(&out.digest()[..8]);
    let draw = u64::from_be_bytes(head) as u128;

    let threshold = ((u64::MAX as u128) * (difficulty_ppm as u128)
      / 1_000_000u128)
      .saturating_mul(stake as u128)
      / total_stake as u128;

    draw < threshold
  }
}
