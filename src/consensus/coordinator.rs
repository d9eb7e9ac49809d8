//! The single serial writer in front of the tree.
//!
//! All mutations of the tree state flow through one [`Consensus`]
//! value; the host either calls it directly from its own loop or
//! spawns it behind a queue with [`spawn`], in which case network
//! ingress and RPC enqueue operations and await their result codes.
//! A periodic tick drives the transaction purge.

use {
  super::{
    block::FinalizationRecord,
    callbacks::Callbacks,
    oracle::FinalizationOracle,
    receive::HostContext,
    tree::{ConsensusStatistics, Skov},
    wire::CatchUpStatus,
  },
  crate::{
    primitives::Timestamp,
    results::UpdateResult,
    scheduler::ExecutionEngine,
    transactions::VerificationCache,
  },
  std::sync::Arc,
  tokio::sync::{mpsc, oneshot},
  tracing::{debug, info},
};

/// The consensus core with its host collaborators bound in.
pub struct Consensus {
  skov: Skov,
  oracle: Box<dyn FinalizationOracle>,
  engine: Arc<dyn ExecutionEngine>,
  callbacks: Callbacks,
  verification: Arc<VerificationCache>,
}

impl Consensus {
  pub fn new(
    skov: Skov,
    oracle: Box<dyn FinalizationOracle>,
    engine: Arc<dyn ExecutionEngine>,
    callbacks: Callbacks,
  ) -> Self {
    Self {
      skov,
      oracle,
      engine,
      callbacks,
      verification: Arc::new(VerificationCache::default()),
    }
  }

  pub fn skov(&self) -> &Skov {
    &self.skov
  }

  pub fn statistics(&self) -> &ConsensusStatistics {
    self.skov.statistics()
  }

  /// The shared verification cache, readable without entering the
  /// coordinator.
  pub fn verification_cache(&self) -> Arc<VerificationCache> {
    Arc::clone(&self.verification)
  }

  /// Receives and, when the parent is live, immediately executes a
  /// block.
  pub fn receive_block(
    &mut self,
    genesis_index: u32,
    bytes: &[u8],
    now: Timestamp,
  ) -> UpdateResult {
    let mut host = HostContext {
      oracle: self.oracle.as_mut(),
      engine: self.engine.as_ref(),
      callbacks: &self.callbacks,
      verification: &self.verification,
      now,
    };
    let (result, cont) = self.skov.receive_block(genesis_index, bytes, &mut host);
    match cont {
      Some(cont) => self.skov.execute_block(cont, &mut host),
      None => result,
    }
  }

  pub fn receive_transaction(
    &mut self,
    bytes: &[u8],
    now: Timestamp,
  ) -> UpdateResult {
    let mut host = HostContext {
      oracle: self.oracle.as_mut(),
      engine: self.engine.as_ref(),
      callbacks: &self.callbacks,
      verification: &self.verification,
      now,
    };
    self.skov.receive_transaction(bytes, &mut host)
  }

  pub fn receive_finalization_record(
    &mut self,
    record: FinalizationRecord,
    now: Timestamp,
  ) -> UpdateResult {
    let mut host = HostContext {
      oracle: self.oracle.as_mut(),
      engine: self.engine.as_ref(),
      callbacks: &self.callbacks,
      verification: &self.verification,
      now,
    };
    self.skov.receive_finalization_record(record, &mut host)
  }

  /// Full wire dispatch; direct replies are collected for the caller
  /// to send back to the peer.
  pub fn receive_message(
    &mut self,
    bytes: &[u8],
    now: Timestamp,
  ) -> (UpdateResult, Vec<Vec<u8>>) {
    let mut replies = vec![];
    let mut host = HostContext {
      oracle: self.oracle.as_mut(),
      engine: self.engine.as_ref(),
      callbacks: &self.callbacks,
      verification: &self.verification,
      now,
    };
    let result = self.skov.receive_message(bytes, &mut host, &mut |reply| {
      replies.push(reply.to_vec())
    });
    (result, replies)
  }

  pub fn catch_up_status(&self) -> CatchUpStatus {
    self.skov.catch_up_status()
  }

  pub fn purge_transactions(&mut self, now: Timestamp) {
    self.skov.purge_transactions(now);
  }
}

/// An operation enqueued to the coordinator task.
pub enum Operation {
  Block {
    genesis_index: u32,
    bytes: Vec<u8>,
    reply: oneshot::Sender<UpdateResult>,
  },
  Transaction {
    bytes: Vec<u8>,
    reply: oneshot::Sender<UpdateResult>,
  },
  FinalizationRecord {
    record: FinalizationRecord,
    reply: oneshot::Sender<UpdateResult>,
  },
  Message {
    bytes: Vec<u8>,
    reply: oneshot::Sender<(UpdateResult, Vec<Vec<u8>>)>,
  },
  Stop,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
  sender: mpsc::UnboundedSender<Operation>,
}

impl CoordinatorHandle {
  pub fn enqueue(&self, op: Operation) -> bool {
    self.sender.send(op).is_ok()
  }

  pub async fn receive_block(
    &self,
    genesis_index: u32,
    bytes: Vec<u8>,
  ) -> UpdateResult {
    let (reply, answer) = oneshot::channel();
    if !self.enqueue(Operation::Block {
      genesis_index,
      bytes,
      reply,
    }) {
      return UpdateResult::ConsensusShutDown;
    }
    answer.await.unwrap_or(UpdateResult::ConsensusShutDown)
  }

  pub async fn receive_transaction(&self, bytes: Vec<u8>) -> UpdateResult {
    let (reply, answer) = oneshot::channel();
    if !self.enqueue(Operation::Transaction { bytes, reply }) {
      return UpdateResult::ConsensusShutDown;
    }
    answer.await.unwrap_or(UpdateResult::ConsensusShutDown)
  }

  pub fn stop(&self) {
    let _ = self.sender.send(Operation::Stop);
  }
}

/// Spawns the coordinator task draining the operation queue, with a
/// periodic transaction purge at the configured cadence.
pub fn spawn(mut consensus: Consensus) -> CoordinatorHandle {
  let (sender, mut receiver) = mpsc::unbounded_channel::<Operation>();
  let purge_period = consensus.skov.runtime_parameters().transactions_purging_delay;

  tokio::spawn(async move {
    let mut purge = tokio::time::interval(purge_period);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        op = receiver.recv() => {
          let Some(op) = op else { break };
          match op {
            Operation::Block { genesis_index, bytes, reply } => {
              let result = consensus.receive_block(
                genesis_index,
                &bytes,
                Timestamp::now(),
              );
              let _ = reply.send(result);
            }
            Operation::Transaction { bytes, reply } => {
              let result =
                consensus.receive_transaction(&bytes, Timestamp::now());
              let _ = reply.send(result);
            }
            Operation::FinalizationRecord { record, reply } => {
              let result = consensus
                .receive_finalization_record(record, Timestamp::now());
              let _ = reply.send(result);
            }
            Operation::Message { bytes, reply } => {
              let result =
                consensus.receive_message(&bytes, Timestamp::now());
              let _ = reply.send(result);
            }
            Operation::Stop => break,
          }
        }
        _ = purge.tick() => {
          debug!("periodic transaction purge");
          consensus.purge_transactions(Timestamp::now());
        }
      }
    }
    info!("consensus coordinator stopped");
  });

  CoordinatorHandle { sender }
}
