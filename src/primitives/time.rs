use {
  chrono::Utc,
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Display, Formatter},
    ops::{Add, Sub},
    time::Duration,
  },
};

/// Milliseconds since the unix epoch.
///
/// All protocol timestamps (genesis time, slot times, transaction
/// expiries, update effective times) are carried in this form so the
/// canonical serialization is a plain integer.
#[derive(
  Debug,
  Default,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
  pub fn now() -> Self {
    Self(Utc::now().timestamp_millis() as u64)
  }

  pub fn millis(self) -> u64 {
    self.0
  }

  pub fn saturating_sub(self, d: Duration) -> Self {
    Self(self.0.saturating_sub(d.as_millis() as u64))
  }
}

impl Add<Duration> for Timestamp {
  type Output = Timestamp;

  fn add(self, d: Duration) -> Timestamp {
    Timestamp(self.0 + d.as_millis() as u64)
  }
}

impl Sub<Timestamp> for Timestamp {
  type Output = Duration;

  fn sub(self, other: Timestamp) -> Duration {
    Duration::from_millis(self.0.saturating_sub(other.0))
  }
}

impl Display for Timestamp {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}ms", self.0)
  }
}
