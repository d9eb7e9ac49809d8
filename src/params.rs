//! Node-local runtime options for the consensus core.
//!
//! These knobs tune resource usage and admission policy of a single
//! node; they are not consensus-critical and never enter any hash.

use {
  serde::{Deserialize, Serialize},
  std::time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeParameters {
  /// Upper bound on the serialized length of an acceptable block.
  pub max_block_size: u32,

  /// Budget for assembling a block when it is our turn to bake.
  #[serde(with = "humantime_serde")]
  pub block_construction_timeout: Duration,

  /// Blocks whose slot time exceeds `now + threshold` are rejected
  /// with `EarlyBlock` rather than marked dead, since they may become
  /// acceptable once our clock catches up.
  #[serde(with = "humantime_serde")]
  pub early_block_threshold: Duration,

  /// Clamp on the tolerated skew between wall clock and slot time
  /// when baking.
  #[serde(with = "humantime_serde")]
  pub max_baking_delay: Duration,

  /// A table purge is triggered after this many insertions into the
  /// transaction table.
  pub insertions_before_transaction_purge: u32,

  /// How long an untouched transaction survives in the table before a
  /// purge may take it.
  #[serde(with = "humantime_serde")]
  pub transactions_keep_alive_time: Duration,

  /// Period of the background purge task.
  #[serde(with = "humantime_serde")]
  pub transactions_purging_delay: Duration,

  /// Bound on the account LRU cache of a block state.
  pub accounts_cache_size: usize,

  /// Bound on the module metadata LRU cache.
  pub modules_cache_size: usize,

  /// Per-chunk timeout for out-of-band catch-up downloads.
  #[serde(with = "humantime_serde")]
  pub download_blocks_timeout: Duration,
}

impl Default for RuntimeParameters {
  fn default() -> Self {
    Self {
      max_block_size: 4_194_304,
      block_construction_timeout: Duration::from_millis(3_000),
      early_block_threshold: Duration::from_secs(30),
      max_baking_delay: Duration::from_secs(10),
      insertions_before_transaction_purge: 1_000,
      transactions_keep_alive_time: Duration::from_secs(5 * 60),
      transactions_purging_delay: Duration::from_secs(60),
      accounts_cache_size: 10_000,
      modules_cache_size: 1_000,
      download_blocks_timeout: Duration::from_secs(5 * 60),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::RuntimeParameters;

  #[test]
  fn defaults_fill_missing_fields() {
    let params: RuntimeParameters =
      serde_json::from_str(r#"{ "accountsCacheSize": 50 }"#).unwrap();
    assert_eq!(params.accounts_cache_size, 50);
    assert_eq!(params.modules_cache_size, 1_000);
    assert_eq!(params.insertions_before_transaction_purge, 1_000);
  }

  #[test]
  fn humantime_durations_parse() {
    let params: RuntimeParameters = serde_json::from_str(
      r#"{ "transactionsKeepAliveTime": "10m", "earlyBlockThreshold": "2s" }"#,
    )
    .unwrap();
    assert_eq!(params.transactions_keep_alive_time.as_secs(), 600);
    assert_eq!(params.early_block_threshold.as_secs(), 2);
  }
}
