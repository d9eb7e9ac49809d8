//! Executes a block's items against a thawed state.
//!
//! The scheduler owns everything that is deterministic bookkeeping:
//! nonces, fees, balances, baker registration, update enactment. The
//! smart-contract engine behind [`ExecutionEngine`] is an external
//! collaborator that is handed a module artifact and returns a state
//! delta, consumed energy and raised events.
//!
//! Failures split into two classes. An [`OutcomeResult::Rejected`]
//! charges the sender and has no further effect but leaves the block
//! valid; a [`SchedulerError`] means the baker included something no
//! honest baker would, and invalidates the whole block.

mod outcomes;

pub use outcomes::{
  outcomes_hash,
  Address,
  Event,
  OutcomeResult,
  RejectReason,
  TransactionOutcome,
};

use {
  crate::{
    primitives::{Amount, BakerId, Energy, Nonce, Pubkey, Slot, Timestamp},
    state::{
      BakerInfo,
      Instance,
      Module,
      ScheduledRelease,
      ThawedState,
      UpdatePayload,
    },
    transactions::{
      base_energy_cost,
      BlockItem,
      ChainUpdate,
      CredentialDeployment,
      NormalTransaction,
      Payload,
      VerificationCache,
    },
  },
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::sync::Arc,
  thiserror::Error,
  tracing::debug,
};

/// What the execution engine reports back from a contract call.
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
  pub new_state: Vec<u8>,
  pub energy_used: Energy,
  /// Outbound transfers from the instance to accounts, applied by
  /// the scheduler after the call returns.
  pub transfers: Vec<(Pubkey, Amount)>,
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("contract trapped: {0}")]
  Trap(String),
}

/// Deterministic smart-contract execution, provided by the host.
pub trait ExecutionEngine: Send + Sync {
  fn init(
    &self,
    module: &Module,
    init_name: &str,
    parameter: &[u8],
    amount: Amount,
  ) -> Result<EngineOutcome, EngineError>;

  fn receive(
    &self,
    module: &Module,
    instance: &Instance,
    entrypoint: &str,
    parameter: &[u8],
    amount: Amount,
  ) -> Result<EngineOutcome, EngineError>;
}

/// Engine for hosts that run no contracts: every call succeeds and
/// leaves the instance state untouched.
pub struct NullEngine;

impl ExecutionEngine for NullEngine {
  fn init(
    &self,
    _module: &Module,
    _init_name: &str,
    _parameter: &[u8],
    _amount: Amount,
  ) -> Result<EngineOutcome, EngineError> {
    Ok(EngineOutcome::default())
  }

  fn receive(
    &self,
    _module: &Module,
    instance: &Instance,
    _entrypoint: &str,
    _parameter: &[u8],
    _amount: Amount,
  ) -> Result<EngineOutcome, EngineError> {
    Ok(EngineOutcome {
      new_state: instance.state.clone(),
      ..EngineOutcome::default()
    })
  }
}

/// Faults that invalidate the whole block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
  #[error("sender account does not exist")]
  SenderMissing,

  #[error("wrong nonce: expected {expected}, got {actual}")]
  InvalidNonce { expected: Nonce, actual: Nonce },

  #[error("signature verification failed at execution")]
  InvalidSignature,

  #[error("item expired before the block's slot time")]
  ExpiredItem,

  #[error("sender cannot cover the declared energy")]
  InsufficientCoverage,

  #[error("cumulative energy exceeds the block limit")]
  BlockEnergyExceeded,

  #[error("wrong update sequence: expected {expected}, got {actual}")]
  InvalidUpdate { expected: u64, actual: u64 },

  #[error("credential registration id already taken")]
  DuplicateCredential,
}

/// Execution context of one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockContext {
  pub slot: Slot,
  pub slot_time: Timestamp,
  pub baker: Option<BakerId>,
  pub max_energy: Energy,
}

/// Result of executing a full block body.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
  pub outcomes: Vec<TransactionOutcome>,
  pub energy_used: Energy,
  pub outcomes_hash: Multihash,
}

/// Runs every item of a block, in order, against `state`.
pub fn execute_items(
  state: &mut ThawedState,
  items: &[Arc<BlockItem>],
  ctx: &BlockContext,
  engine: &dyn ExecutionEngine,
  verdicts: &VerificationCache,
) -> Result<ExecutionSummary, SchedulerError> {
  enact_due_updates(state, ctx.slot_time);

  let mut outcomes = Vec::with_capacity(items.len());
  let mut total_energy: Energy = 0;

  for (index, item) in items.iter().enumerate() {
    let outcome = match item.as_ref() {
      BlockItem::Normal(tx) => {
        execute_normal(state, item, tx, index as u64, ctx, engine, verdicts)?
      }
      BlockItem::Credential(cred) => {
        execute_credential(state, item, cred, index as u64, ctx)?
      }
      BlockItem::Update(update) => {
        execute_update(state, item, update, index as u64, ctx)?
      }
    };

    total_energy += outcome.energy_used;
    if total_energy > ctx.max_energy {
      return Err(SchedulerError::BlockEnergyExceeded);
    }
    outcomes.push(outcome);
  }

  let outcomes_hash = outcomes_hash(state.version(), &outcomes);
  Ok(ExecutionSummary {
    outcomes,
    energy_used: total_energy,
    outcomes_hash,
  })
}

/// Applies queued parameter changes whose effective time has passed.
fn enact_due_updates(state: &mut ThawedState, now: Timestamp) {
  let due = state.updates_mut().enact_up_to(now);
  if due.is_empty() {
    return;
  }
  let mut params = state.params();
  for update in due {
    debug!(payload = ?update.payload, "enacting chain update");
    match update.payload {
      UpdatePayload::ElectionDifficulty(d) => {
        params.election_difficulty_ppm = d;
      }
      UpdatePayload::MaxBlockEnergy(e) => params.max_block_energy = e,
      UpdatePayload::RewardParameters(rp) => params.reward_parameters = rp,
      // resolved at era boundaries, never here
      UpdatePayload::Protocol(_) => {}
    }
  }
  state.set_params(params);
}

fn execute_normal(
  state: &mut ThawedState,
  item: &Arc<BlockItem>,
  tx: &NormalTransaction,
  index: u64,
  ctx: &BlockContext,
  engine: &dyn ExecutionEngine,
  verdicts: &VerificationCache,
) -> Result<TransactionOutcome, SchedulerError> {
  let sender = state
    .account(&tx.header.sender)
    .ok_or(SchedulerError::SenderMissing)?;

  if tx.header.expiry < ctx.slot_time {
    return Err(SchedulerError::ExpiredItem);
  }
  if tx.header.nonce != sender.next_nonce {
    return Err(SchedulerError::InvalidNonce {
      expected: sender.next_nonce,
      actual: tx.header.nonce,
    });
  }

  // cached clean verdicts skip the signature here; anything that was
  // state-dependent at admission is checked again under the lock
  let skip_signature = verdicts
    .get(&item.hash())
    .map(|v| v.is_valid())
    .unwrap_or(false);
  if !skip_signature && !tx.verify_signature(&sender.verify_key) {
    return Err(SchedulerError::InvalidSignature);
  }

  if sender.spendable(ctx.slot_time) < tx.header.energy {
    return Err(SchedulerError::InsufficientCoverage);
  }

  // nonce advances and the fee is owed no matter how the payload goes
  let mut sender_account = (*sender).clone();
  sender_account.next_nonce += 1;
  state.set_account(sender_account);

  let base = base_energy_cost(item.serialized_size());
  let (energy_used, result) =
    apply_payload(state, tx, base, ctx, engine);
  charge_fee(state, &tx.header.sender, energy_used, ctx);

  Ok(TransactionOutcome {
    hash: item.hash(),
    index,
    sender: Some(tx.header.sender.clone()),
    energy_used,
    result,
  })
}

/// Runs the payload under the sender's energy budget. Returns the
/// energy actually consumed and the outcome.
fn apply_payload(
  state: &mut ThawedState,
  tx: &NormalTransaction,
  base: Energy,
  ctx: &BlockContext,
  engine: &dyn ExecutionEngine,
) -> (Energy, OutcomeResult) {
  let budget = tx.header.energy;
  let sender = tx.header.sender.clone();
  let reject = |energy, reason| {
    (energy, OutcomeResult::Rejected { reason })
  };

  match &tx.payload {
    Payload::Transfer { to, amount } => {
      let cost = base + 300;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      match transfer(state, &sender, to, *amount, ctx.slot_time, budget) {
        Ok(event) => (cost, OutcomeResult::Success {
          events: vec![event],
        }),
        Err(reason) => reject(cost, reason),
      }
    }

    Payload::TransferWithSchedule { to, releases } => {
      let cost = base + 300 + 100 * releases.len() as Energy;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let total: Amount = releases.iter().map(|r| r.amount).sum();
      match scheduled_transfer(
        state,
        &sender,
        to,
        releases,
        total,
        ctx.slot_time,
        budget,
      ) {
        Ok(event) => (cost, OutcomeResult::Success {
          events: vec![event],
        }),
        Err(reason) => reject(cost, reason),
      }
    }

    Payload::DeployModule {
      artifact,
      entrypoints,
    } => {
      let cost = base + 500 + artifact.len() as Energy / 10;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let module = Module::new(artifact.clone(), entrypoints.clone());
      if state.module(&module.reference).is_some() {
        return reject(cost, RejectReason::ModuleAlreadyDeployed);
      }
      let reference = state.add_module(module);
      (cost, OutcomeResult::Success {
        events: vec![Event::ModuleDeployed { reference }],
      })
    }

    Payload::InitContract {
      module,
      init_name,
      parameter,
      amount,
    } => {
      let cost = base + 1_000;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let Some(module) = state.module(module) else {
        return reject(cost, RejectReason::ModuleNotFound);
      };
      if !module.exposes(init_name) {
        return reject(cost, RejectReason::EntrypointNotFound);
      }
      if !debit(state, &sender, *amount, ctx.slot_time, budget) {
        return reject(cost, RejectReason::AmountTooLarge);
      }
      match engine.init(&module, init_name, parameter, *amount) {
        Ok(run) => {
          let cost = cost + run.energy_used;
          if cost > budget {
            credit_account(state, &sender, *amount);
            return reject(budget, RejectReason::OutOfEnergy);
          }
          let address = state.create_instance(Instance {
            address: Default::default(),
            module: module.reference,
            init_name: init_name.clone(),
            parameter: parameter.clone(),
            state: run.new_state,
            balance: *amount,
            owner: sender.clone(),
          });
          (cost, OutcomeResult::Success {
            events: vec![Event::ContractInitialized {
              address,
              module: module.reference,
              amount: *amount,
            }],
          })
        }
        Err(EngineError::Trap(reason)) => {
          credit_account(state, &sender, *amount);
          reject(cost, RejectReason::EngineTrap { reason })
        }
      }
    }

    Payload::UpdateContract {
      address,
      entrypoint,
      parameter,
      amount,
    } => {
      let cost = base + 700;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let Some(instance) = state.instance(address) else {
        return reject(cost, RejectReason::InstanceNotFound);
      };
      let Some(module) = state.module(&instance.module) else {
        return reject(cost, RejectReason::ModuleNotFound);
      };
      if !module.exposes(entrypoint) {
        return reject(cost, RejectReason::EntrypointNotFound);
      }
      if !debit(state, &sender, *amount, ctx.slot_time, budget) {
        return reject(cost, RejectReason::AmountTooLarge);
      }

      match engine.receive(&module, &instance, entrypoint, parameter, *amount)
      {
        Ok(run) => {
          let cost = cost + run.energy_used;
          if cost > budget {
            credit_account(state, &sender, *amount);
            return reject(budget, RejectReason::OutOfEnergy);
          }
          let outgoing: Amount =
            run.transfers.iter().map(|(_, a)| a).sum();
          if instance.balance + amount < outgoing {
            credit_account(state, &sender, *amount);
            return reject(cost, RejectReason::AmountTooLarge);
          }

          let mut updated = (*instance).clone();
          updated.state = run.new_state;
          updated.balance = updated.balance + amount - outgoing;
          state.set_instance(updated);

          let mut events = vec![Event::Updated {
            address: *address,
            amount: *amount,
          }];
          for (to, transferred) in run.transfers {
            credit_account(state, &to, transferred);
            events.push(Event::Transferred {
              from: Address::Contract(*address),
              to: Address::Account(to),
              amount: transferred,
            });
          }
          (cost, OutcomeResult::Success { events })
        }
        Err(EngineError::Trap(reason)) => {
          credit_account(state, &sender, *amount);
          reject(cost, RejectReason::EngineTrap { reason })
        }
      }
    }

    Payload::AddBaker {
      sign_key,
      election_key,
      aggregation_key,
      stake,
    } => {
      let cost = base + 300;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      if state.bakers().baker_by_account(&sender).is_some() {
        return reject(cost, RejectReason::AlreadyBaker);
      }
      let params = state.params();
      let account = state.account(&sender).unwrap();
      if *stake < params.minimum_baker_stake {
        return reject(cost, RejectReason::StakeUnderMinimum);
      }
      if account.balance.saturating_sub(budget) < *stake {
        return reject(cost, RejectReason::AmountTooLarge);
      }

      let id = state.bakers().next_baker_id();
      state.bakers_mut().add_baker(Arc::new(BakerInfo {
        id,
        account: sender.clone(),
        sign_key: sign_key.clone(),
        election_key: election_key.clone(),
        aggregation_key: aggregation_key.clone(),
        stake: *stake,
        commission_ppm: 100_000,
        cooldown_until: None,
      }));
      let mut account = (*account).clone();
      account.staked = *stake;
      state.set_account(account);

      (cost, OutcomeResult::Success {
        events: vec![Event::BakerAdded {
          id,
          account: sender,
          stake: *stake,
        }],
      })
    }

    Payload::RemoveBaker => {
      let cost = base + 300;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let Some(info) = state.bakers().baker_by_account(&sender).cloned()
      else {
        return reject(cost, RejectReason::NotABaker);
      };

      // the baker stays registered through its cooldown but leaves
      // the committee snapshots immediately
      let params = state.params();
      let seed = state.seed();
      let cooldown = params.baker_cooldown_epochs
        * seed.epoch_length
        * params.slot_duration_millis;
      let mut cooling = (*info).clone();
      cooling.cooldown_until =
        Some(Timestamp(ctx.slot_time.0 + cooldown));
      let id = cooling.id;
      state.bakers_mut().add_baker(Arc::new(cooling));

      (cost, OutcomeResult::Success {
        events: vec![Event::BakerRemoved { id }],
      })
    }

    Payload::Delegate { target, stake } => {
      let cost = base + 300;
      if cost > budget {
        return reject(budget, RejectReason::OutOfEnergy);
      }
      let account = state.account(&sender).unwrap();
      if account.balance.saturating_sub(budget) < *stake {
        return reject(cost, RejectReason::AmountTooLarge);
      }
      state.bakers_mut().set_delegator(crate::state::Delegator {
        account: sender.clone(),
        target: *target,
        stake: *stake,
      });
      let mut account = (*account).clone();
      account.staked = *stake;
      state.set_account(account);

      (cost, OutcomeResult::Success {
        events: vec![Event::DelegationConfigured {
          account: sender,
          target: *target,
          stake: *stake,
        }],
      })
    }
  }
}

fn execute_credential(
  state: &mut ThawedState,
  item: &Arc<BlockItem>,
  cred: &CredentialDeployment,
  index: u64,
  ctx: &BlockContext,
) -> Result<TransactionOutcome, SchedulerError> {
  if cred.message_expiry < ctx.slot_time {
    return Err(SchedulerError::ExpiredItem);
  }
  if state.credential_taken(&cred.reg_id) {
    return Err(SchedulerError::DuplicateCredential);
  }

  let address = cred.account_address();
  state.create_account(
    address.clone(),
    cred.verify_key.clone(),
    0,
    vec![cred.reg_id],
  );

  Ok(TransactionOutcome {
    hash: item.hash(),
    index,
    sender: None,
    energy_used: 0,
    result: OutcomeResult::Success {
      events: vec![
        Event::AccountCreated {
          address: address.clone(),
        },
        Event::CredentialDeployed {
          reg_id: cred.reg_id,
          account: address,
        },
      ],
    },
  })
}

fn execute_update(
  state: &mut ThawedState,
  item: &Arc<BlockItem>,
  update: &ChainUpdate,
  index: u64,
  ctx: &BlockContext,
) -> Result<TransactionOutcome, SchedulerError> {
  if update.timeout < ctx.slot_time {
    return Err(SchedulerError::ExpiredItem);
  }
  let expected = state.updates().next_sequence(update.update_type());
  if update.sequence != expected {
    return Err(SchedulerError::InvalidUpdate {
      expected,
      actual: update.sequence,
    });
  }

  state.updates_mut().enqueue(crate::state::QueuedUpdate {
    sequence: update.sequence,
    effective_time: update.effective_time,
    payload: update.payload.clone(),
  });

  Ok(TransactionOutcome {
    hash: item.hash(),
    index,
    sender: None,
    energy_used: 0,
    result: OutcomeResult::Success {
      events: vec![Event::UpdateEnqueued {
        update_type: update.update_type(),
        effective_time: update.effective_time,
      }],
    },
  })
}

/// Debits `amount` from an account if it is spendable on top of the
/// reserved energy budget.
fn debit(
  state: &mut ThawedState,
  from: &Pubkey,
  amount: Amount,
  now: Timestamp,
  reserved: Energy,
) -> bool {
  if amount == 0 {
    return true;
  }
  let Some(account) = state.account(from) else {
    return false;
  };
  if account.spendable(now).saturating_sub(reserved) < amount {
    return false;
  }
  let mut account = (*account).clone();
  account.balance -= amount;
  state.set_account(account);
  true
}

fn credit_account(state: &mut ThawedState, to: &Pubkey, amount: Amount) {
  if amount == 0 {
    return;
  }
  if let Some(account) = state.account(to) {
    let mut account = (*account).clone();
    account.balance += amount;
    state.set_account(account);
  } else {
    // value must not vanish: unknown receivers feed the gas account
    let mut rewards = state.rewards();
    rewards.gas_account += amount;
    state.set_rewards(rewards);
  }
}

fn transfer(
  state: &mut ThawedState,
  from: &Pubkey,
  to: &Pubkey,
  amount: Amount,
  now: Timestamp,
  reserved: Energy,
) -> Result<Event, RejectReason> {
  if state.account(to).is_none() {
    return Err(RejectReason::ReceiverNotFound);
  }
  if !debit(state, from, amount, now, reserved) {
    return Err(RejectReason::AmountTooLarge);
  }
  credit_account(state, to, amount);
  Ok(Event::Transferred {
    from: Address::Account(from.clone()),
    to: Address::Account(to.clone()),
    amount,
  })
}

fn scheduled_transfer(
  state: &mut ThawedState,
  from: &Pubkey,
  to: &Pubkey,
  releases: &[ScheduledRelease],
  total: Amount,
  now: Timestamp,
  reserved: Energy,
) -> Result<Event, RejectReason> {
  if state.account(to).is_none() {
    return Err(RejectReason::ReceiverNotFound);
  }
  if !debit(state, from, total, now, reserved) {
    return Err(RejectReason::AmountTooLarge);
  }

  let mut receiver = (*state.account(to).unwrap()).clone();
  receiver.balance += total;
  receiver.releases.extend_from_slice(releases);
  state.set_account(receiver);

  Ok(Event::Transferred {
    from: Address::Account(from.clone()),
    to: Address::Account(to.clone()),
    amount: total,
  })
}

/// Moves the fee out of the sender and splits it between the baker
/// and the gas account per the reward parameters.
fn charge_fee(
  state: &mut ThawedState,
  sender: &Pubkey,
  fee: Amount,
  ctx: &BlockContext,
) {
  if fee == 0 {
    return;
  }
  if let Some(account) = state.account(sender) {
    let mut account = (*account).clone();
    account.balance = account.balance.saturating_sub(fee);
    state.set_account(account);
  }

  let params = state.params();
  let baker_cut = fee
    * params.reward_parameters.baker_fraction_ppm as u64
    / 1_000_000;
  let baker_account = ctx
    .baker
    .and_then(|id| state.bakers().baker(id).map(|b| b.account.clone()));

  let mut to_gas = fee;
  if let Some(baker_account) = baker_account {
    credit_account(state, &baker_account, baker_cut);
    to_gas = fee - baker_cut;
  }

  let mut rewards = state.rewards();
  rewards.gas_account += to_gas;
  state.set_rewards(rewards);
}
