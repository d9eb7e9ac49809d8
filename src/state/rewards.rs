use {
  crate::primitives::Amount,
  serde::{Deserialize, Serialize},
};

/// The special reward accounts of a block state.
///
/// `total_supply` is the recorded amount of currency in existence;
/// the conservation invariant ties it to the sum of every other
/// holder of value in the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAccounts {
  pub baking_reward: Amount,
  pub finalization_reward: Amount,
  pub gas_account: Amount,
  /// Total of all shielded amounts across accounts.
  pub total_encrypted: Amount,
  pub total_supply: Amount,
}

impl RewardAccounts {
  /// Conservation check: public account balances plus instance
  /// balances plus the reward pools plus the encrypted total must
  /// equal the recorded supply.
  pub fn conserves(
    &self,
    accounts_total: Amount,
    instances_total: Amount,
  ) -> bool {
    accounts_total
      + instances_total
      + self.baking_reward
      + self.finalization_reward
      + self.gas_account
      + self.total_encrypted
      == self.total_supply
  }
}
