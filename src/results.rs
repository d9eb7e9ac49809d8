//! Fixed result codes for every reception operation.
//!
//! The numeric values are part of the node's external contract: the
//! RPC surface reports them verbatim and the networking layer decides
//! from them whether a message is relayed to other peers. They must
//! never be renumbered.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UpdateResult {
  Success = 0,
  SerializationFail = 1,
  Invalid = 2,
  PendingBlock = 3,
  PendingFinalization = 4,
  Async = 5,
  Duplicate = 6,
  Stale = 7,
  IncorrectFinalizationSession = 8,
  Unverifiable = 9,
  ContinueCatchUp = 10,
  EarlyBlock = 11,
  MissingImportFile = 12,
  ConsensusShutDown = 13,
  ExpiryTooLate = 14,
  VerificationFailed = 15,
  NonexistingSenderAccount = 16,
  DuplicateNonce = 17,
  NonceTooLarge = 18,
  TooLowEnergy = 19,
  InvalidGenesisIndex = 20,
  DuplicateAccountRegistrationID = 21,
  CredentialDeploymentInvalidSignatures = 22,
  CredentialDeploymentInvalidIP = 23,
  CredentialDeploymentInvalidAR = 24,
  CredentialDeploymentExpired = 25,
  ChainUpdateInvalidEffectiveTime = 26,
  ChainUpdateSequenceNumberTooOld = 27,
  ChainUpdateInvalidSignatures = 28,
  EnergyExceeded = 29,
  InsufficientFunds = 30,
}

impl UpdateResult {
  pub fn code(self) -> u8 {
    self as u8
  }

  /// Whether the message that produced this result should still be
  /// relayed to peers. Everything else is either rejected locally or
  /// was already known.
  pub fn should_relay(self) -> bool {
    matches!(
      self,
      UpdateResult::Success
        | UpdateResult::PendingBlock
        | UpdateResult::PendingFinalization
    )
  }

  pub fn from_code(code: u8) -> Option<Self> {
    use UpdateResult::*;
    Some(match code {
      0 => Success,
      1 => SerializationFail,
      2 => Invalid,
      3 => PendingBlock,
      4 => PendingFinalization,
      5 => Async,
      6 => Duplicate,
      7 => Stale,
      8 => IncorrectFinalizationSession,
      9 => Unverifiable,
      10 => ContinueCatchUp,
      11 => EarlyBlock,
      12 => MissingImportFile,
      13 => ConsensusShutDown,
      14 => ExpiryTooLate,
      15 => VerificationFailed,
      16 => NonexistingSenderAccount,
      17 => DuplicateNonce,
      18 => NonceTooLarge,
      19 => TooLowEnergy,
      20 => InvalidGenesisIndex,
      21 => DuplicateAccountRegistrationID,
      22 => CredentialDeploymentInvalidSignatures,
      23 => CredentialDeploymentInvalidIP,
      24 => CredentialDeploymentInvalidAR,
      25 => CredentialDeploymentExpired,
      26 => ChainUpdateInvalidEffectiveTime,
      27 => ChainUpdateSequenceNumberTooOld,
      28 => ChainUpdateInvalidSignatures,
      29 => EnergyExceeded,
      30 => InsufficientFunds,
      _ => return None,
    })
  }
}
