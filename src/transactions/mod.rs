//! Transactions, credential deployments and chain updates.
//!
//! These are the three kinds of items a block carries. Each has a
//! canonical serialization whose SHA-256 is its identity everywhere
//! else: in the transaction table, in block bodies and in outcome
//! records.

mod pending;
mod table;
mod verify;

pub use {
  pending::PendingTransactionTable,
  table::{AddResult, TransactionStatus, TransactionTable},
  verify::{verify_item, VerificationCache, VerificationOutcome},
};

use {
  crate::{
    primitives::{
      content_hash,
      sha256,
      Amount,
      Energy,
      Keypair,
      Nonce,
      Pubkey,
      Timestamp,
      UpdateSequence,
    },
    state::{ContractAddress, ScheduledRelease, UpdatePayload, UpdateType},
  },
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

/// Fixed part of every account transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
  pub sender: Pubkey,
  pub nonce: Nonce,
  /// Energy the sender is willing to pay for.
  pub energy: Energy,
  /// The transaction is not valid in blocks with a later slot time.
  pub expiry: Timestamp,
}

/// Operations an account can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
  Transfer {
    to: Pubkey,
    amount: Amount,
  },
  TransferWithSchedule {
    to: Pubkey,
    releases: Vec<ScheduledRelease>,
  },
  DeployModule {
    artifact: Vec<u8>,
    entrypoints: Vec<String>,
  },
  InitContract {
    module: Multihash,
    init_name: String,
    parameter: Vec<u8>,
    amount: Amount,
  },
  UpdateContract {
    address: ContractAddress,
    entrypoint: String,
    parameter: Vec<u8>,
    amount: Amount,
  },
  AddBaker {
    sign_key: Pubkey,
    election_key: Pubkey,
    aggregation_key: Pubkey,
    stake: Amount,
  },
  RemoveBaker,
  Delegate {
    target: Option<crate::primitives::BakerId>,
    stake: Amount,
  },
}

/// An account-signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalTransaction {
  pub header: TransactionHeader,
  pub payload: Payload,
  pub signature: Signature,
}

impl NormalTransaction {
  fn signing_bytes(header: &TransactionHeader, payload: &Payload) -> Vec<u8> {
    bincode::serialize(&(header, payload)).unwrap()
  }

  pub fn new(
    keypair: &Keypair,
    header: TransactionHeader,
    payload: Payload,
  ) -> Self {
    let signature = keypair.sign(&Self::signing_bytes(&header, &payload));
    Self {
      header,
      payload,
      signature,
    }
  }

  /// Checks the signature under the account's registered verify key,
  /// which is not necessarily the sender address.
  pub fn verify_signature(&self, verify_key: &Pubkey) -> bool {
    verify_key.verify(
      &Self::signing_bytes(&self.header, &self.payload),
      &self.signature,
    )
  }
}

/// An account-creation witness issued by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDeployment {
  /// Registration id; globally unique across the whole history.
  pub reg_id: Multihash,
  pub verify_key: Pubkey,
  pub ip_identity: u32,
  pub ar_identities: Vec<u32>,
  /// Opaque identity proofs checked by the cryptographic layer.
  pub proofs: Vec<u8>,
  pub ip_signature: Signature,
  pub message_expiry: Timestamp,
}

impl CredentialDeployment {
  pub fn signing_bytes(&self) -> Vec<u8> {
    bincode::serialize(&(
      &self.reg_id,
      &self.verify_key,
      self.ip_identity,
      &self.ar_identities,
      &self.proofs,
      self.message_expiry,
    ))
    .unwrap()
  }

  /// Address of the account this credential creates, derived from
  /// the registration id.
  pub fn account_address(&self) -> Pubkey {
    sha256(&self.reg_id.to_bytes()).into()
  }
}

/// A chain-parameter change signed by the update key holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUpdate {
  pub sequence: UpdateSequence,
  pub effective_time: Timestamp,
  /// Latest slot time at which the update may still enter a block.
  pub timeout: Timestamp,
  pub payload: UpdatePayload,
  /// (key index, signature) pairs; at least `threshold` distinct
  /// authorized keys must have signed.
  pub signatures: Vec<(u16, Signature)>,
}

impl ChainUpdate {
  pub fn signing_bytes(&self) -> Vec<u8> {
    bincode::serialize(&(
      self.sequence,
      self.effective_time,
      self.timeout,
      &self.payload,
    ))
    .unwrap()
  }

  pub fn update_type(&self) -> UpdateType {
    self.payload.update_type()
  }
}

/// Any item a block can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockItem {
  Normal(NormalTransaction),
  Credential(CredentialDeployment),
  Update(ChainUpdate),
}

impl BlockItem {
  pub fn hash(&self) -> Multihash {
    content_hash(self)
  }

  /// The (sender, nonce) stream this item belongs to, if it is
  /// nonce-tracked.
  pub fn sender_nonce(&self) -> Option<(&Pubkey, Nonce)> {
    match self {
      BlockItem::Normal(tx) => Some((&tx.header.sender, tx.header.nonce)),
      _ => None,
    }
  }

  /// The (update type, sequence) stream, for chain updates.
  pub fn update_sequence(&self) -> Option<(UpdateType, UpdateSequence)> {
    match self {
      BlockItem::Update(u) => Some((u.update_type(), u.sequence)),
      _ => None,
    }
  }

  pub fn expiry(&self) -> Timestamp {
    match self {
      BlockItem::Normal(tx) => tx.header.expiry,
      BlockItem::Credential(cred) => cred.message_expiry,
      BlockItem::Update(update) => update.timeout,
    }
  }

  pub fn serialized_size(&self) -> u64 {
    bincode::serialized_size(self).unwrap()
  }
}

/// Energy charged for checking and dispatching an item before its
/// payload runs: a flat header cost plus a size-proportional part.
pub fn base_energy_cost(serialized_size: u64) -> Energy {
  50 + serialized_size / 100
}

impl std::fmt::Display for BlockItem {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    use crate::primitives::ToBase58String;
    let kind = match self {
      BlockItem::Normal(_) => "tx",
      BlockItem::Credential(_) => "cred",
      BlockItem::Update(_) => "update",
    };
    write!(f, "{kind}:{}", self.hash().to_b58())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{BlockItem, NormalTransaction, Payload, TransactionHeader},
    crate::primitives::Timestamp,
  };

  #[test]
  fn signature_covers_header_and_payload() {
    let keypair = crate::test::keypair(1);
    let header = TransactionHeader {
      sender: keypair.public(),
      nonce: 1,
      energy: 1_000,
      expiry: Timestamp(10_000),
    };
    let tx = NormalTransaction::new(
      &keypair,
      header.clone(),
      Payload::Transfer {
        to: crate::test::pubkey(2),
        amount: 5,
      },
    );
    assert!(tx.verify_signature(&keypair.public()));

    let mut altered = tx.clone();
    altered.header.nonce = 2;
    assert!(!altered.verify_signature(&keypair.public()));
  }

  #[test]
  fn serialization_roundtrip_preserves_hash() {
    let keypair = crate::test::keypair(3);
    let tx = NormalTransaction::new(
      &keypair,
      TransactionHeader {
        sender: keypair.public(),
        nonce: 4,
        energy: 700,
        expiry: Timestamp(99),
      },
      Payload::RemoveBaker,
    );
    let item = BlockItem::Normal(tx);
    let bytes = bincode::serialize(&item).unwrap();
    let parsed: BlockItem = bincode::deserialize(&bytes).unwrap();
    assert_eq!(parsed.hash(), item.hash());
    assert_eq!(bincode::serialize(&parsed).unwrap(), bytes);
  }
}
