use {
  crate::primitives::{
    content_hash,
    sha256_concat,
    Amount,
    BakerId,
    Pubkey,
    Timestamp,
  },
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
  },
};

/// Registration record of a staking participant eligible to bake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakerInfo {
  pub id: BakerId,
  pub account: Pubkey,
  pub sign_key: Pubkey,
  pub election_key: Pubkey,
  pub aggregation_key: Pubkey,
  pub stake: Amount,
  pub commission_ppm: u32,
  /// Set while the baker is unwinding its stake; it stays in the
  /// table but leaves the committee snapshots.
  pub cooldown_until: Option<Timestamp>,
}

/// A staker delegating to a baker pool, or passively (no target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegator {
  pub account: Pubkey,
  pub target: Option<BakerId>,
  pub stake: Amount,
}

/// The baker and delegator tables of a frozen block state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BakerPool {
  bakers: BTreeMap<BakerId, Arc<BakerInfo>>,
  delegators: BTreeMap<Pubkey, Delegator>,
  aggregation_keys: BTreeSet<Pubkey>,
  next_baker_id: BakerId,
}

impl BakerPool {
  pub fn baker(&self, id: BakerId) -> Option<&Arc<BakerInfo>> {
    self.bakers.get(&id)
  }

  pub fn baker_by_account(&self, account: &Pubkey) -> Option<&Arc<BakerInfo>> {
    self.bakers.values().find(|b| &b.account == account)
  }

  pub fn contains_aggregation_key(&self, key: &Pubkey) -> bool {
    self.aggregation_keys.contains(key)
  }

  pub fn next_baker_id(&self) -> BakerId {
    self.next_baker_id
  }

  pub fn add_baker(&mut self, info: Arc<BakerInfo>) {
    if info.id >= self.next_baker_id {
      self.next_baker_id = info.id + 1;
    }
    self.aggregation_keys.insert(info.aggregation_key.clone());
    self.bakers.insert(info.id, info);
  }

  pub fn remove_baker(&mut self, id: BakerId) {
    if let Some(info) = self.bakers.remove(&id) {
      self.aggregation_keys.remove(&info.aggregation_key);
    }
  }

  pub fn set_delegator(&mut self, delegator: Delegator) {
    self.delegators.insert(delegator.account.clone(), delegator);
  }

  pub fn delegator(&self, account: &Pubkey) -> Option<&Delegator> {
    self.delegators.get(account)
  }

  pub fn bakers(&self) -> impl Iterator<Item = &Arc<BakerInfo>> {
    self.bakers.values()
  }

  /// Re-points delegators whose target baker no longer exists to
  /// passive delegation, and clamps commissions into range. Runs as
  /// part of era migrations.
  pub fn sanitize(&mut self) {
    let known: std::collections::BTreeSet<crate::primitives::BakerId> =
      self.bakers.keys().copied().collect();
    for delegator in self.delegators.values_mut() {
      if let Some(target) = delegator.target {
        if !known.contains(&target) {
          delegator.target = None;
        }
      }
    }
    let clamped: Vec<Arc<BakerInfo>> = self
      .bakers
      .values()
      .filter(|b| b.commission_ppm > 1_000_000)
      .map(|b| {
        let mut fixed = (**b).clone();
        fixed.commission_ppm = 1_000_000;
        Arc::new(fixed)
      })
      .collect();
    for baker in clamped {
      self.bakers.insert(baker.id, baker);
    }
  }

  /// A baker's stake for committee purposes: its own plus everything
  /// delegated to its pool.
  pub fn effective_stake(&self, id: BakerId) -> Amount {
    let own = self.bakers.get(&id).map(|b| b.stake).unwrap_or(0);
    let delegated: Amount = self
      .delegators
      .values()
      .filter(|d| d.target == Some(id))
      .map(|d| d.stake)
      .sum();
    own + delegated
  }

  /// Snapshots the committee of bakers that are in good standing,
  /// with their effective stakes. This is what slot-leadership checks
  /// run against for a whole epoch.
  pub fn committee(&self) -> EpochBakers {
    let bakers: Vec<EpochBaker> = self
      .bakers
      .values()
      .filter(|b| b.cooldown_until.is_none())
      .map(|b| EpochBaker {
        id: b.id,
        account: b.account.clone(),
        sign_key: b.sign_key.clone(),
        election_key: b.election_key.clone(),
        stake: self.effective_stake(b.id),
      })
      .collect();
    let total_stake = bakers.iter().map(|b| b.stake).sum();
    EpochBakers {
      bakers,
      total_stake,
    }
  }

  pub fn table_hash(&self) -> Multihash {
    let mut acc = Vec::new();
    for (id, info) in &self.bakers {
      acc.extend_from_slice(&id.to_be_bytes());
      acc.extend_from_slice(content_hash(info.as_ref()).digest());
    }
    for delegator in self.delegators.values() {
      acc.extend_from_slice(content_hash(delegator).digest());
    }
    sha256_concat(&[b"bakers", &acc])
  }
}

/// A member of an epoch's baking committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochBaker {
  pub id: BakerId,
  pub account: Pubkey,
  pub sign_key: Pubkey,
  pub election_key: Pubkey,
  pub stake: Amount,
}

/// The committee of a single epoch, with stakes frozen at the epoch
/// boundary so membership checks are stable for all slots within it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochBakers {
  pub bakers: Vec<EpochBaker>,
  pub total_stake: Amount,
}

impl EpochBakers {
  pub fn get(&self, id: BakerId) -> Option<&EpochBaker> {
    self.bakers.iter().find(|b| b.id == id)
  }

  pub fn is_empty(&self) -> bool {
    self.bakers.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{BakerInfo, BakerPool, Delegator},
    std::sync::Arc,
  };

  fn baker(id: u64, stake: u64) -> Arc<BakerInfo> {
    let key = crate::test::pubkey(id as u8 + 1);
    Arc::new(BakerInfo {
      id,
      account: key.clone(),
      sign_key: key.clone(),
      election_key: key.clone(),
      aggregation_key: key,
      stake,
      commission_ppm: 100_000,
      cooldown_until: None,
    })
  }

  #[test]
  fn committee_includes_delegated_stake() {
    let mut pool = BakerPool::default();
    pool.add_baker(baker(0, 1_000));
    pool.add_baker(baker(1, 500));
    pool.set_delegator(Delegator {
      account: crate::test::pubkey(9),
      target: Some(1),
      stake: 700,
    });

    let committee = pool.committee();
    assert_eq!(committee.total_stake, 2_200);
    assert_eq!(committee.get(0).unwrap().stake, 1_000);
    assert_eq!(committee.get(1).unwrap().stake, 1_200);
  }

  #[test]
  fn cooldown_leaves_committee_but_keeps_record() {
    let mut pool = BakerPool::default();
    pool.add_baker(baker(0, 1_000));
    let mut cooling = (*baker(1, 500)).clone();
    cooling.cooldown_until = Some(crate::primitives::Timestamp(1));
    pool.add_baker(Arc::new(cooling));

    let committee = pool.committee();
    assert!(committee.get(1).is_none());
    assert!(pool.baker(1).is_some());
  }

  #[test]
  fn aggregation_key_closure() {
    let mut pool = BakerPool::default();
    let info = baker(0, 10);
    let agg = info.aggregation_key.clone();
    pool.add_baker(info);
    assert!(pool.contains_aggregation_key(&agg));
    pool.remove_baker(0);
    assert!(!pool.contains_aggregation_key(&agg));
  }
}
