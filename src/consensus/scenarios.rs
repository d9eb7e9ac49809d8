//! End-to-end scenarios over a full tree: contract execution,
//! nonce races, fork pruning, pending promotion, regenesis and
//! duplicate finalization handling.

use {
  super::{BakedBlock, BlockStatus, Callbacks, Skov},
  crate::{
    primitives::{sha256, Timestamp},
    results::UpdateResult,
    scheduler::{Address, Event},
    state::{ContractAddress, ProtocolUpdate, ProtocolVersion, UpdatePayload},
    test::{self, TestChain, TestHost},
    transactions::{
      BlockItem,
      ChainUpdate,
      NormalTransaction,
      Payload,
      TransactionHeader,
      TransactionStatus,
    },
  },
  ed25519_dalek::Signer,
  multihash::Multihash,
  std::sync::{Arc, Mutex},
};

fn receive_and_execute(
  skov: &mut Skov,
  host: &mut TestHost,
  block: &BakedBlock,
  now: Timestamp,
) -> UpdateResult {
  let bytes = bincode::serialize(block).unwrap();
  let mut ctx = host.ctx(now);
  let (result, cont) = skov.receive_block(0, &bytes, &mut ctx);
  match cont {
    Some(cont) => skov.execute_block(cont, &mut ctx),
    None => result,
  }
}

fn finalize(
  skov: &mut Skov,
  host: &mut TestHost,
  chain: &TestChain,
  index: u64,
  block: Multihash,
  now: Timestamp,
) -> UpdateResult {
  let record = chain.finalization_record(index, block, 0);
  let mut ctx = host.ctx(now);
  skov.receive_finalization_record(record, &mut ctx)
}

fn signed_tx(
  sender: u8,
  nonce: u64,
  payload: Payload,
) -> BlockItem {
  let keys = test::keypair(sender);
  BlockItem::Normal(NormalTransaction::new(
    &keys,
    TransactionHeader {
      sender: keys.public(),
      nonce,
      energy: 5_000,
      expiry: Timestamp(100_000),
    },
    payload,
  ))
}

#[test]
fn simple_transfer_through_contract() {
  test::init_logging();
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let artifact = vec![0, 6, 1, 7];
  let module_ref = sha256(&artifact);
  let items = vec![
    signed_tx(1, 1, Payload::DeployModule {
      artifact,
      entrypoints: vec!["init".into(), "receive".into()],
    }),
    signed_tx(1, 2, Payload::InitContract {
      module: module_ref,
      init_name: "init".into(),
      parameter: vec![],
      amount: 0,
    }),
    // the echo engine sends the carried amount back to the account
    // named in the parameter
    signed_tx(1, 3, Payload::UpdateContract {
      address: ContractAddress::new(0),
      entrypoint: "receive".into(),
      parameter: test::pubkey(1).to_vec(),
      amount: 11,
    }),
  ];

  let block = chain.bake(&chain.genesis_hash(), 1, items);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &block, Timestamp(1_000)),
    UpdateResult::Success
  );

  let entry = skov.entry(&block.hash()).unwrap();
  let call_outcome = &entry.outcomes[2];
  assert!(call_outcome.is_success());
  let contract = ContractAddress::new(0);
  assert!(call_outcome.events().contains(&Event::Updated {
    address: contract,
    amount: 11,
  }));
  assert!(call_outcome.events().contains(&Event::Transferred {
    from: Address::Contract(contract),
    to: Address::Account(test::pubkey(1)),
    amount: 11,
  }));

  // value is conserved through deploy, init, call and fees
  let state = skov.block_state(&block.hash()).unwrap().unwrap();
  assert!(state.conserves_supply());
  assert_eq!(state.instance(&contract).unwrap().balance, 0);
}

#[test]
fn nonce_race_resolves_at_finalization() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let first = Arc::new(signed_tx(3, 1, Payload::Transfer {
    to: test::pubkey(2),
    amount: 5,
  }));
  let second = Arc::new(signed_tx(3, 1, Payload::Transfer {
    to: test::pubkey(2),
    amount: 6,
  }));

  {
    let mut ctx = host.ctx(Timestamp(500));
    assert_eq!(
      skov.receive_transaction_item(Arc::clone(&first), &mut ctx),
      UpdateResult::Success
    );
    assert_eq!(
      skov.receive_transaction_item(Arc::clone(&second), &mut ctx),
      UpdateResult::Success
    );
  }

  let block =
    chain.bake(&chain.genesis_hash(), 1, vec![(*first).clone()]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &block, Timestamp(1_000)),
    UpdateResult::Success
  );
  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, block.hash(), Timestamp(1_100)),
    UpdateResult::Success
  );

  assert!(matches!(
    skov.transactions().lookup(&first.hash()).unwrap().status,
    TransactionStatus::Finalized { .. }
  ));
  assert!(matches!(
    skov.transactions().lookup(&second.hash()).unwrap().status,
    TransactionStatus::Dropped
  ));
  assert_eq!(
    skov.transactions().next_account_nonce(&test::pubkey(3), 1),
    2
  );
}

#[test]
fn fork_is_pruned_by_finalization() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let x = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let y = chain.bake(&chain.genesis_hash(), 2, vec![]);
  let x2 = chain.bake_child(&x, 3, vec![]);
  let y2 = chain.bake_child(&y, 4, vec![]);

  for block in [&x, &y, &x2, &y2] {
    assert_eq!(
      receive_and_execute(&mut skov, &mut host, block, Timestamp(5_000)),
      UpdateResult::Success
    );
  }
  assert!(skov.branches_coherent());

  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, x2.hash(), Timestamp(5_500)),
    UpdateResult::Success
  );

  assert!(matches!(
    skov.status(&x.hash()),
    Some(BlockStatus::Finalized { .. })
  ));
  assert!(matches!(
    skov.status(&x2.hash()),
    Some(BlockStatus::Finalized { .. })
  ));
  assert_eq!(skov.status(&y.hash()), Some(BlockStatus::Dead));
  assert_eq!(skov.status(&y2.hash()), Some(BlockStatus::Dead));

  assert_eq!(skov.last_finalized().1, x2.hash());
  assert!(skov.branches_coherent());

  // a late block extending the dead branch is stale, not pending
  let y3 = chain.bake_child(&y2, 5, vec![]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &y3, Timestamp(6_000)),
    UpdateResult::Stale
  );
}

#[test]
fn pending_block_promotes_when_parent_arrives() {
  let chain = TestChain::new();
  let mut skov = chain.skov();

  let arrivals: Arc<Mutex<Vec<Multihash>>> = Arc::new(Mutex::new(vec![]));
  let sink = Arc::clone(&arrivals);
  let mut host = TestHost::new();
  host.callbacks = Callbacks {
    block_arrived: Box::new(move |hash, _| sink.lock().unwrap().push(hash)),
    ..Callbacks::default()
  };

  let parent = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let child = chain.bake_child(&parent, 2, vec![]);

  // child first: parks as pending under the unknown parent
  let bytes = bincode::serialize(&*child).unwrap();
  let mut ctx = host.ctx(Timestamp(2_000));
  let (result, cont) = skov.receive_block(0, &bytes, &mut ctx);
  assert_eq!(result, UpdateResult::PendingBlock);
  assert!(cont.is_none());
  drop(ctx);
  assert_eq!(skov.status(&child.hash()), Some(BlockStatus::Pending));

  // parent arrives: both go live through the same execution path
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &parent, Timestamp(2_000)),
    UpdateResult::Success
  );
  assert_eq!(skov.status(&parent.hash()), Some(BlockStatus::Alive));
  assert_eq!(skov.status(&child.hash()), Some(BlockStatus::Alive));
  assert!(skov.branches_coherent());

  // the arrival hook fired exactly once per block
  let seen = arrivals.lock().unwrap();
  assert_eq!(seen.as_slice(), &[parent.hash(), child.hash()]);
}

#[test]
fn execution_handle_dropped_marks_dead() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let block = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let bytes = bincode::serialize(&*block).unwrap();
  {
    let mut ctx = host.ctx(Timestamp(1_000));
    let (result, cont) = skov.receive_block(0, &bytes, &mut ctx);
    assert_eq!(result, UpdateResult::Success);
    drop(cont);
  }

  // the next operation sweeps the dropped handle
  let mut ctx = host.ctx(Timestamp(1_001));
  let (result, _) = skov.receive_block(0, &bytes, &mut ctx);
  assert_eq!(result, UpdateResult::Duplicate);
  assert_eq!(skov.status(&block.hash()), Some(BlockStatus::Dead));
}

#[test]
fn early_duplicate_and_stale_codes() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  // slot time far past the clock: early, and not marked dead
  let early = chain.bake(&chain.genesis_hash(), 500, vec![]);
  let bytes = bincode::serialize(&*early).unwrap();
  let mut ctx = host.ctx(Timestamp(1_000));
  let (result, _) = skov.receive_block(0, &bytes, &mut ctx);
  assert_eq!(result, UpdateResult::EarlyBlock);
  drop(ctx);
  assert_eq!(skov.status(&early.hash()), None);

  // wrong era
  let block = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let bytes = bincode::serialize(&*block).unwrap();
  let mut ctx = host.ctx(Timestamp(1_000));
  let (result, _) = skov.receive_block(9, &bytes, &mut ctx);
  assert_eq!(result, UpdateResult::InvalidGenesisIndex);
  drop(ctx);

  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &block, Timestamp(1_000)),
    UpdateResult::Success
  );
  let mut ctx = host.ctx(Timestamp(1_000));
  let (result, _) = skov.receive_block(0, &bytes, &mut ctx);
  assert_eq!(result, UpdateResult::Duplicate);
  drop(ctx);

  // finalize height 1, then a slot-1 sibling is stale
  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, block.hash(), Timestamp(1_200)),
    UpdateResult::Success
  );
  let sibling = chain.bake(&chain.genesis_hash(), 1, vec![test::transfer(2, 1, 1)]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &sibling, Timestamp(1_500)),
    UpdateResult::Stale
  );
}

#[test]
fn duplicate_finalization_record_is_reported() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let block = chain.bake(&chain.genesis_hash(), 1, vec![]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &block, Timestamp(1_000)),
    UpdateResult::Success
  );

  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, block.hash(), Timestamp(1_100)),
    UpdateResult::Success
  );
  let before = skov.next_finalization_index();

  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, block.hash(), Timestamp(1_200)),
    UpdateResult::Duplicate
  );
  assert_eq!(skov.next_finalization_index(), before);
  assert_eq!(skov.last_finalized().1, block.hash());
}

#[test]
fn record_ahead_of_its_block_is_parked_then_applied() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let block = chain.bake(&chain.genesis_hash(), 1, vec![]);

  // a record for a future index waits for its turn
  let future = chain.finalization_record(3, sha256(b"far-away"), 0);
  let mut ctx = host.ctx(Timestamp(900));
  assert_eq!(
    skov.receive_finalization_record(future, &mut ctx),
    UpdateResult::PendingFinalization
  );

  // the right index, but the target block has not arrived yet
  let record = chain.finalization_record(1, block.hash(), 0);
  assert_eq!(
    skov.receive_finalization_record(record, &mut ctx),
    UpdateResult::Unverifiable
  );
  drop(ctx);

  // block arrival applies the parked record
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &block, Timestamp(1_000)),
    UpdateResult::Success
  );
  assert!(matches!(
    skov.status(&block.hash()),
    Some(BlockStatus::Finalized { .. })
  ));
  assert_eq!(skov.last_finalized().1, block.hash());
}

fn protocol_update_item(effective: u64, timeout: u64) -> BlockItem {
  let mut update = ChainUpdate {
    sequence: 1,
    effective_time: Timestamp(effective),
    timeout: Timestamp(timeout),
    payload: UpdatePayload::Protocol(ProtocolUpdate {
      next_version: ProtocolVersion::P4,
      message: "upgrade".into(),
      specification_hash: sha256(b"spec-doc"),
    }),
    signatures: vec![],
  };
  let signature = test::keypair(9).sign(&update.signing_bytes());
  update.signatures = vec![(0, signature)];
  BlockItem::Update(update)
}

#[test]
fn protocol_update_stages_regenesis() {
  let chain = TestChain::new();
  let mut skov = chain.skov();
  let mut host = TestHost::new();

  let b1 = chain.bake(&chain.genesis_hash(), 1, vec![protocol_update_item(
    2_000, 1_500,
  )]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &b1, Timestamp(1_000)),
    UpdateResult::Success
  );
  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 1, b1.hash(), Timestamp(1_100)),
    UpdateResult::Success
  );
  assert!(!skov.is_shut_down());
  assert!(skov.staged_regenesis().is_none());

  // terminal block: first finalized block at or past the effective
  // slot time
  let b2 = chain.bake_child(&b1, 2, vec![]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &b2, Timestamp(1_900)),
    UpdateResult::Success
  );
  assert_eq!(
    finalize(&mut skov, &mut host, &chain, 2, b2.hash(), Timestamp(2_500)),
    UpdateResult::Success
  );

  assert!(skov.is_shut_down());
  let staged = skov.staged_regenesis().unwrap();

  match &staged.genesis.kind {
    super::GenesisKind::Regenesis {
      first_genesis,
      previous_genesis,
      terminal_block,
    } => {
      assert_eq!(*first_genesis, chain.genesis_hash());
      assert_eq!(*previous_genesis, chain.genesis_hash());
      assert_eq!(*terminal_block, b2.hash());
    }
    other => panic!("expected a regenesis, got {other:?}"),
  }
  assert_eq!(staged.genesis.protocol_version, ProtocolVersion::P4);
  assert_eq!(staged.genesis.absolute_height, 3);
  assert_eq!(staged.genesis.core.genesis_time, Timestamp(2_000));

  // seed re-keyed from the terminal state's updated nonce
  let terminal = skov.block_state(&b2.hash()).unwrap().unwrap();
  assert_eq!(
    staged.state.seed,
    crate::state::SeedState::regenesis(&terminal.seed)
  );
  // the update queue starts the new era empty
  assert!(staged.state.updates.is_empty());
  // the terminal epoch's committee carries into the new era
  assert_eq!(staged.state.epoch_bakers, terminal.epoch_bakers);

  // shut-down: new input is refused, with the dedicated code
  let b3 = chain.bake_child(&b2, 3, vec![]);
  assert_eq!(
    receive_and_execute(&mut skov, &mut host, &b3, Timestamp(3_000)),
    UpdateResult::ConsensusShutDown
  );
}

#[test]
fn regenesis_is_deterministic_across_nodes() {
  let chain = TestChain::new();
  let b1 = chain.bake(&chain.genesis_hash(), 1, vec![protocol_update_item(
    2_000, 1_500,
  )]);
  let b2 = chain.bake_child(&b1, 2, vec![]);

  let mut staged_hashes = vec![];
  for _ in 0..2 {
    let mut skov = chain.skov();
    let mut host = TestHost::new();
    receive_and_execute(&mut skov, &mut host, &b1, Timestamp(1_000));
    finalize(&mut skov, &mut host, &chain, 1, b1.hash(), Timestamp(1_100));
    receive_and_execute(&mut skov, &mut host, &b2, Timestamp(1_900));
    finalize(&mut skov, &mut host, &chain, 2, b2.hash(), Timestamp(2_500));
    staged_hashes.push(skov.staged_regenesis().unwrap().genesis.hash());
  }
  assert_eq!(staged_hashes[0], staged_hashes[1]);
}

#[test]
fn tree_recovers_from_the_journal() {
  let chain = TestChain::new();
  let dir = tempfile::tempdir().unwrap();
  let params = crate::params::RuntimeParameters::default();

  let b1 = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let b2 = chain.bake_child(&b1, 2, vec![]);
  {
    let mut skov = Skov::open(
      dir.path(),
      0,
      chain.genesis(),
      chain.genesis_state(),
      params.clone(),
    )
    .unwrap();
    let mut host = TestHost::new();
    receive_and_execute(&mut skov, &mut host, &b1, Timestamp(1_000));
    receive_and_execute(&mut skov, &mut host, &b2, Timestamp(2_000));
    assert_eq!(
      finalize(&mut skov, &mut host, &chain, 1, b2.hash(), Timestamp(2_100)),
      UpdateResult::Success
    );
  }

  let skov = Skov::open(
    dir.path(),
    0,
    chain.genesis(),
    chain.genesis_state(),
    params,
  )
  .unwrap();
  assert_eq!(skov.last_finalized().1, b2.hash());
  assert_eq!(skov.next_finalization_index(), 2);
  assert!(matches!(
    skov.status(&b1.hash()),
    Some(BlockStatus::Finalized { .. })
  ));
  // the recovered LFB state answers queries
  let state = skov.block_state(&b2.hash()).unwrap().unwrap();
  assert!(state.conserves_supply());
}

#[test]
fn export_import_bundle_roundtrip() {
  let chain = TestChain::new();
  let mut source = chain.skov();
  let mut host = TestHost::new();

  let b1 = chain.bake(&chain.genesis_hash(), 1, vec![]);
  let b2 = chain.bake_child(&b1, 2, vec![]);
  receive_and_execute(&mut source, &mut host, &b1, Timestamp(1_000));
  receive_and_execute(&mut source, &mut host, &b2, Timestamp(2_000));
  finalize(&mut source, &mut host, &chain, 1, b1.hash(), Timestamp(2_100));
  finalize(&mut source, &mut host, &chain, 2, b2.hash(), Timestamp(2_200));

  let mut bundle = vec![];
  let index = source.export_bundle(&mut bundle, 1).unwrap();
  assert_eq!(index.chunks.len(), 2);

  let mut target = chain.skov();
  let mut import_host = TestHost::new();
  let mut ctx = import_host.ctx(Timestamp(2_500));
  let result =
    target.import_bundle(&mut bundle.as_slice(), Some(&index), &mut ctx);
  assert_eq!(result, UpdateResult::Success);
  drop(ctx);

  assert_eq!(target.last_finalized().1, b2.hash());
  assert_eq!(target.next_finalization_index(), 3);
}
