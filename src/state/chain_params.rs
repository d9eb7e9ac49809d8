use {
  crate::primitives::{Amount, Energy},
  serde::{Deserialize, Serialize},
};

/// A rational exchange rate between two units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
  pub numerator: u64,
  pub denominator: u64,
}

impl ExchangeRate {
  pub fn one() -> Self {
    Self {
      numerator: 1,
      denominator: 1,
    }
  }
}

/// How block rewards are split between participants. Fractions are
/// parts per million of the distributed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardParameters {
  pub baker_fraction_ppm: u32,
  pub finalizer_fraction_ppm: u32,
  pub gas_fraction_ppm: u32,
}

/// Chain-level parameters of a block state. All of these can change
/// through the update queue at their effective time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParameters {
  /// Election difficulty in parts per million; scales the block
  /// lottery threshold for every baker.
  pub election_difficulty_ppm: u32,
  pub euro_per_energy: ExchangeRate,
  pub micro_unit_per_euro: ExchangeRate,
  pub baker_cooldown_epochs: u64,
  pub delegator_cooldown_epochs: u64,
  pub minimum_baker_stake: Amount,
  /// Pool capital bound, parts per million of total stake.
  pub capital_bound_ppm: u32,
  pub leverage_bound: ExchangeRate,
  pub reward_parameters: RewardParameters,
  pub max_block_energy: Energy,
  pub slot_duration_millis: u64,
}

impl Default for ChainParameters {
  fn default() -> Self {
    Self {
      election_difficulty_ppm: 1_000_000,
      euro_per_energy: ExchangeRate::one(),
      micro_unit_per_euro: ExchangeRate::one(),
      baker_cooldown_epochs: 2,
      delegator_cooldown_epochs: 2,
      minimum_baker_stake: 1,
      capital_bound_ppm: 100_000,
      leverage_bound: ExchangeRate {
        numerator: 3,
        denominator: 1,
      },
      reward_parameters: RewardParameters {
        baker_fraction_ppm: 600_000,
        finalizer_fraction_ppm: 300_000,
        gas_fraction_ppm: 100_000,
      },
      max_block_energy: 3_000_000,
      slot_duration_millis: 1_000,
    }
  }
}
