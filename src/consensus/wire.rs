//! The versioned wire envelope and catch-up status handling.
//!
//! A message is a 1-byte type, a 4-byte big-endian genesis index and
//! a version-prefixed body. Unknown types fail deserialization;
//! unknown genesis indices are answered with `InvalidGenesisIndex` by
//! the reception paths.

use {
  super::{
    block::FinalizationRecord,
    receive::HostContext,
    tree::Skov,
  },
  crate::{primitives::Height, results::UpdateResult},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

pub const WIRE_VERSION: u8 = 1;

/// Bound on the direct-send burst a catch-up status may trigger.
const CATCH_UP_BURST: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
  Block = 0,
  FinalizationMessage = 1,
  FinalizationRecord = 2,
  CatchUpStatus = 3,
}

impl MessageType {
  fn from_byte(byte: u8) -> Option<Self> {
    Some(match byte {
      0 => MessageType::Block,
      1 => MessageType::FinalizationMessage,
      2 => MessageType::FinalizationRecord,
      3 => MessageType::CatchUpStatus,
      _ => return None,
    })
  }
}

/// Frames a body into the wire envelope.
pub fn encode_message(
  ty: MessageType,
  genesis_index: u32,
  body: &[u8],
) -> Vec<u8> {
  let mut out = Vec::with_capacity(6 + body.len());
  out.push(ty as u8);
  out.extend_from_slice(&genesis_index.to_be_bytes());
  out.push(WIRE_VERSION);
  out.extend_from_slice(body);
  out
}

/// Splits the envelope; `None` means the bytes are not a message.
pub fn parse_message(bytes: &[u8]) -> Option<(MessageType, u32, &[u8])> {
  if bytes.len() < 6 {
    return None;
  }
  let ty = MessageType::from_byte(bytes[0])?;
  let mut index = [0u8; 4];
  index.copy_from_slice(&bytes[1..5]);
  if bytes[5] != WIRE_VERSION {
    return None;
  }
  Some((ty, u32::from_be_bytes(index), &bytes[6..]))
}

/// A peer's summary of where its tree stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpStatus {
  pub last_finalized: Multihash,
  pub last_finalized_height: Height,
  pub finalization_index: u64,
  pub best_block: Multihash,
}

impl Skov {
  /// Our own status summary, for gossip to peers.
  pub fn catch_up_status(&self) -> CatchUpStatus {
    let best_block = self
      .branches
      .last()
      .and_then(|layer| layer.first().copied())
      .unwrap_or_else(|| self.last_finalized().1);
    CatchUpStatus {
      last_finalized: self.last_finalized().1,
      last_finalized_height: self.last_finalized_height(),
      finalization_index: self.next_finalization_index() - 1,
      best_block,
    }
  }

  /// Full dispatch of a framed wire message. Blocks are received and
  /// executed in one go; finalization messages belong to the oracle.
  pub fn receive_message(
    &mut self,
    bytes: &[u8],
    host: &mut HostContext,
    send: &mut dyn FnMut(&[u8]),
  ) -> UpdateResult {
    let Some((ty, genesis_index, body)) = parse_message(bytes) else {
      return UpdateResult::SerializationFail;
    };

    match ty {
      MessageType::Block => {
        let (result, cont) = self.receive_block(genesis_index, body, host);
        match cont {
          Some(cont) => self.execute_block(cont, host),
          None => result,
        }
      }
      MessageType::FinalizationMessage => {
        if genesis_index != self.genesis_index {
          return UpdateResult::InvalidGenesisIndex;
        }
        // the BFT message algebra is the oracle's business
        UpdateResult::Async
      }
      MessageType::FinalizationRecord => {
        if genesis_index != self.genesis_index {
          return UpdateResult::InvalidGenesisIndex;
        }
        match bincode::deserialize::<FinalizationRecord>(body) {
          Ok(record) => self.receive_finalization_record(record, host),
          Err(_) => UpdateResult::SerializationFail,
        }
      }
      MessageType::CatchUpStatus => {
        if genesis_index != self.genesis_index {
          return UpdateResult::InvalidGenesisIndex;
        }
        match bincode::deserialize::<CatchUpStatus>(body) {
          Ok(status) => self.receive_catch_up_status(&status, send),
          Err(_) => UpdateResult::SerializationFail,
        }
      }
    }
  }

  /// Answers a peer's catch-up status. A peer that is ahead makes us
  /// ask for more (`ContinueCatchUp`); a peer that is behind gets a
  /// bounded burst of finalized blocks and records through `send`.
  pub fn receive_catch_up_status(
    &mut self,
    status: &CatchUpStatus,
    send: &mut dyn FnMut(&[u8]),
  ) -> UpdateResult {
    let ours = self.next_finalization_index() - 1;

    if status.finalization_index > ours {
      return UpdateResult::ContinueCatchUp;
    }
    if status.finalization_index == ours {
      return UpdateResult::Success;
    }

    let from = status.finalization_index + 1;
    let to = ours.min(status.finalization_index + CATCH_UP_BURST as u64);
    for index in from..=to {
      let (record, block_hash) = &self.finalization_list[index as usize];
      if let Some(entry) = self.entry(block_hash) {
        if let Some(baked) = entry.block.as_baked() {
          let body = bincode::serialize(baked.as_ref()).unwrap();
          send(&encode_message(
            MessageType::Block,
            self.genesis_index,
            &body,
          ));
        }
      }
      let body = bincode::serialize(record).unwrap();
      send(&encode_message(
        MessageType::FinalizationRecord,
        self.genesis_index,
        &body,
      ));
    }

    UpdateResult::Success
  }
}

#[cfg(test)]
mod tests {
  use super::{encode_message, parse_message, MessageType, WIRE_VERSION};

  #[test]
  fn envelope_roundtrip() {
    let framed = encode_message(MessageType::Block, 7, b"body");
    let (ty, index, body) = parse_message(&framed).unwrap();
    assert_eq!(ty, MessageType::Block);
    assert_eq!(index, 7);
    assert_eq!(body, b"body");
  }

  #[test]
  fn unknown_type_and_version_rejected() {
    let mut framed = encode_message(MessageType::CatchUpStatus, 0, b"");
    framed[0] = 9;
    assert!(parse_message(&framed).is_none());

    let mut framed = encode_message(MessageType::Block, 0, b"");
    framed[5] = WIRE_VERSION + 1;
    assert!(parse_message(&framed).is_none());

    assert!(parse_message(b"ab").is_none());
  }
}
