/// Base58 rendering for log lines and display output. Hashes are the
/// only values printed often enough to warrant the trait.
pub trait ToBase58String {
  fn to_b58(&self) -> String;
}

impl ToBase58String for multihash::Multihash {
  fn to_b58(&self) -> String {
    bs58::encode(self.to_bytes()).into_string()
  }
}
