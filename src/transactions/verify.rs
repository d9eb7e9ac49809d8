//! Pre-execution verification of block items.
//!
//! Verification runs against the last finalized state when an item
//! first shows up, and the verdict is cached so the scheduler does not
//! re-check signatures whose inputs cannot have changed. A verdict of
//! [`VerificationOutcome::MaybeValid`] marks results that depend on
//! state that may still change (a missing sender account, a nonce gap,
//! a balance); those are the only ones re-examined at execution time.

use {
  super::{base_energy_cost, BlockItem, ChainUpdate, CredentialDeployment},
  crate::{
    primitives::Timestamp,
    results::UpdateResult,
    state::BlockState,
  },
  dashmap::DashMap,
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
  /// Valid against the state it was checked at.
  Valid,
  /// Not valid right now, but a future state could accept it; the
  /// code names the missing precondition.
  MaybeValid(UpdateResult),
  /// Never valid in any descendant state.
  Invalid(UpdateResult),
}

impl VerificationOutcome {
  pub fn is_valid(self) -> bool {
    matches!(self, VerificationOutcome::Valid)
  }

  /// Whether the item could be accepted by some future state, which
  /// is what decides if it may sit in the table at all.
  pub fn future_valid(self) -> bool {
    !matches!(self, VerificationOutcome::Invalid(_))
  }

  /// Whether a cached copy of this verdict must be re-checked before
  /// execution.
  pub fn needs_recheck(self) -> bool {
    matches!(self, VerificationOutcome::MaybeValid(_))
  }

  pub fn reject_code(self) -> UpdateResult {
    match self {
      VerificationOutcome::Valid => UpdateResult::Success,
      VerificationOutcome::MaybeValid(code) => code,
      VerificationOutcome::Invalid(code) => code,
    }
  }
}

/// Shared verdict cache, readable without the coordinator lock.
#[derive(Default)]
pub struct VerificationCache {
  results: DashMap<Multihash, VerificationOutcome>,
}

impl VerificationCache {
  pub fn get(&self, hash: &Multihash) -> Option<VerificationOutcome> {
    self.results.get(hash).map(|r| *r)
  }

  pub fn insert(&self, hash: Multihash, outcome: VerificationOutcome) {
    self.results.insert(hash, outcome);
  }

  pub fn forget(&self, hash: &Multihash) {
    self.results.remove(hash);
  }
}

/// Verifies one item against a state. `now` is the admission clock,
/// `keep_alive` bounds how far in the future an expiry may lie.
pub fn verify_item(
  item: &BlockItem,
  state: &BlockState,
  now: Timestamp,
  keep_alive: Duration,
) -> VerificationOutcome {
  match item {
    BlockItem::Normal(tx) => verify_normal(tx, state, now, keep_alive),
    BlockItem::Credential(cred) => verify_credential(cred, state, now),
    BlockItem::Update(update) => verify_update(update, state, now),
  }
}

fn verify_normal(
  tx: &super::NormalTransaction,
  state: &BlockState,
  now: Timestamp,
  keep_alive: Duration,
) -> VerificationOutcome {
  use VerificationOutcome::*;

  if tx.header.expiry < now {
    return Invalid(UpdateResult::VerificationFailed);
  }
  if tx.header.expiry > now + keep_alive {
    return Invalid(UpdateResult::ExpiryTooLate);
  }

  let size = BlockItem::Normal(tx.clone()).serialized_size();
  if tx.header.energy < base_energy_cost(size) {
    return Invalid(UpdateResult::TooLowEnergy);
  }
  if tx.header.energy > state.params.max_block_energy {
    return Invalid(UpdateResult::EnergyExceeded);
  }

  let account = match state.account(&tx.header.sender) {
    Some(account) => account,
    // the sender may be created by a credential that is still in
    // flight, so this is not a terminal verdict
    None => return MaybeValid(UpdateResult::NonexistingSenderAccount),
  };

  if !tx.verify_signature(&account.verify_key) {
    return Invalid(UpdateResult::VerificationFailed);
  }
  if tx.header.nonce < account.next_nonce {
    return Invalid(UpdateResult::DuplicateNonce);
  }
  if tx.header.nonce > account.next_nonce {
    return MaybeValid(UpdateResult::NonceTooLarge);
  }
  if account.spendable(now) < tx.header.energy {
    return MaybeValid(UpdateResult::InsufficientFunds);
  }

  Valid
}

fn verify_credential(
  cred: &CredentialDeployment,
  state: &BlockState,
  now: Timestamp,
) -> VerificationOutcome {
  use VerificationOutcome::*;

  if cred.message_expiry < now {
    return Invalid(UpdateResult::CredentialDeploymentExpired);
  }
  if state.accounts.contains_credential(&cred.reg_id)
    || state.account(&cred.account_address()).is_some()
  {
    return Invalid(UpdateResult::DuplicateAccountRegistrationID);
  }

  let provider = match state.identity_providers.get(&cred.ip_identity) {
    Some(provider) => provider,
    None => return Invalid(UpdateResult::CredentialDeploymentInvalidIP),
  };
  if cred
    .ar_identities
    .iter()
    .any(|ar| !state.anonymity_revokers.contains_key(ar))
  {
    return Invalid(UpdateResult::CredentialDeploymentInvalidAR);
  }
  if !provider
    .verify_key
    .verify(&cred.signing_bytes(), &cred.ip_signature)
  {
    return Invalid(UpdateResult::CredentialDeploymentInvalidSignatures);
  }

  Valid
}

fn verify_update(
  update: &ChainUpdate,
  state: &BlockState,
  now: Timestamp,
) -> VerificationOutcome {
  use VerificationOutcome::*;

  if update.timeout < now || update.timeout > update.effective_time {
    return Invalid(UpdateResult::ChainUpdateInvalidEffectiveTime);
  }

  let expected = state.next_update_sequence(update.update_type());
  if update.sequence < expected {
    return Invalid(UpdateResult::ChainUpdateSequenceNumberTooOld);
  }

  let keys = &state.updates.keys;
  let message = update.signing_bytes();
  let mut signers = std::collections::BTreeSet::new();
  for (index, signature) in &update.signatures {
    if let Some(key) = keys.keys.get(*index as usize) {
      if key.verify(&message, signature) {
        signers.insert(*index);
      }
    }
  }
  if signers.len() < keys.threshold as usize {
    return Invalid(UpdateResult::ChainUpdateInvalidSignatures);
  }

  if update.sequence > expected {
    return MaybeValid(UpdateResult::NonceTooLarge);
  }
  Valid
}
