// tests/ledger_core.rs
// End-to-end behaviour of the ledger core: production, staking, slashing,
// settlement and difficulty retargeting through one writer.

use ouro_consensus::crypto::{sign_bytes, Keyring};
use ouro_consensus::staking::{PayoutKind, StakeAction};
use ouro_consensus::{
    Behavior, Block, BlockVerdict, Clock, ConsensusError, CoreConfig, CoreOptions, LedgerCore,
    LedgerRecord, LedgerStore, ManualClock, MemoryStore, PeerStatus, SlashReason, Transaction,
};
use std::sync::Arc;
use std::thread;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn build(kind: &str) -> (Arc<LedgerCore>, Arc<ManualClock>, Arc<MemoryStore>) {
    init_logger();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store = Arc::new(MemoryStore::new());
    let mut config = CoreConfig::default();
    config.consensus.kind = kind.to_string();
    config.consensus.pow_difficulty = 1;
    let core = LedgerCore::new(config, clock.clone(), store.clone()).unwrap();
    (Arc::new(core), clock, store)
}

#[test]
fn pos_production_and_reward_settlement() {
    let (core, clock, _) = build("pos");
    assert!(core.stake("v1", "v1", 700).unwrap());
    assert!(core.stake("v1", "d1", 300).unwrap());

    clock.advance_secs(60);
    let block = core.produce_block(vec![]).unwrap();
    assert_eq!(block.validator, "v1");
    assert_eq!(core.height(), 1);

    // Pool holds the staking block reward of 50
    assert_eq!(core.status().reward_pool, 50);
    let report = core.settle(core.height()).unwrap();
    let total: u64 = report.payouts.iter().map(|p| p.amount).sum();
    assert_eq!(total, 50);
    assert!(report
        .payouts
        .iter()
        .any(|p| p.kind == PayoutKind::DelegatorReward && p.recipient == "d1" && p.amount == 15));
    assert_eq!(core.status().reward_pool, 0);
}

#[test]
fn unstake_waits_for_lockup() {
    let (core, clock, store) = build("pos");
    core.stake("v1", "v1", 500).unwrap();

    assert!(core.unstake("v1", "v1", 200).unwrap());
    // Promised balance cannot be requested twice
    assert!(!core.unstake("v1", "v1", 301).unwrap());

    core.settle(0).unwrap();
    assert_eq!(core.status().total_stake, 500);

    clock.advance_secs(604_800);
    let report = core.settle(0).unwrap();
    assert_eq!(report.released.len(), 1);
    assert_eq!(core.status().total_stake, 300);

    let actions: Vec<StakeAction> = store
        .by_address("v1")
        .unwrap()
        .into_iter()
        .filter_map(|r| match r {
            LedgerRecord::Stake(s) => Some(s.action),
            _ => None,
        })
        .collect();
    assert_eq!(
        actions,
        vec![StakeAction::Stake, StakeAction::Unstake, StakeAction::Release]
    );
}

#[test]
fn slash_cuts_stake_once_per_cooldown() {
    let (core, clock, store) = build("pos");
    core.stake("v1", "v1", 1000).unwrap();

    let event = core.slash("v1", SlashReason::DoubleSigning, None).unwrap();
    assert_eq!(event.amount, 0.5);
    assert_eq!(core.staking().validator_stake("v1"), 500);

    let second = core.slash("v1", SlashReason::DoubleSigning, None);
    assert!(matches!(second, Err(ConsensusError::SlashCooldown { .. })));
    assert_eq!(core.slashing().slashing_events(Some("v1"), None, None).len(), 1);

    // The only validator is cooling down, so PoS has nobody to pick
    clock.advance_secs(10);
    assert!(matches!(
        core.produce_block(vec![]),
        Err(ConsensusError::NoEligibleProducer(_))
    ));

    let slashes = store
        .by_address("v1")
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r, LedgerRecord::Slash(_)))
        .count();
    assert_eq!(slashes, 1);
}

#[test]
fn repeated_offline_reports_auto_slash() {
    let (core, _, _) = build("pos");
    core.stake("v1", "v1", 1000).unwrap();

    assert!(core.report_behavior("v1", Behavior::Offline).unwrap().is_empty());
    assert!(core.report_behavior("v1", Behavior::Offline).unwrap().is_empty());
    let events = core.report_behavior("v1", Behavior::Offline).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, SlashReason::ValidatorOffline);
    assert_eq!(core.staking().validator_stake("v1"), 950);

    // Counters were reset and the cooldown gates further evaluation
    assert!(core.report_behavior("v1", Behavior::Offline).unwrap().is_empty());
}

fn build_signed(kind: &str) -> (Arc<LedgerCore>, Arc<ManualClock>) {
    init_logger();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let mut config = CoreConfig::default();
    config.consensus.kind = kind.to_string();
    let options = CoreOptions {
        keyring: Some(Arc::new(Keyring::new())),
        ..CoreOptions::default()
    };
    let core =
        LedgerCore::with_options(config, clock.clone(), Arc::new(MemoryStore::new()), options).unwrap();
    (Arc::new(core), clock)
}

#[test]
fn signed_invalid_block_is_rejected_and_penalised() {
    let (core, clock) = build_signed("pos");
    core.stake("v1", "v1", 1000).unwrap();
    core.stake("mallory", "mallory", 1000).unwrap();
    core.register_validator_key("mallory", [3u8; 32]).unwrap();
    core.slash("mallory", SlashReason::ProtocolViolation, Some(0.0)).unwrap();

    // mallory is cooling down and so not eligible to produce
    clock.advance_secs(60);
    let tip = core.chain().last().cloned().unwrap();
    let mut block = Block::next(&tip, clock.now(), tip.difficulty, "mallory", vec![]);
    block.signature = sign_bytes(&[3u8; 32], block.hash.as_bytes()).unwrap();
    let verdict = core.submit_block(block).unwrap();
    assert!(matches!(verdict, BlockVerdict::Rejected { .. }));
    assert_eq!(core.height(), 0);

    let record = core.slashing().behavior_record("mallory").unwrap();
    assert_eq!(record.invalid_blocks, 1);
}

#[test]
fn forged_blocks_never_cost_the_named_validator() {
    let (core, clock, _) = build("pos");
    core.stake("victim", "victim", 1000).unwrap();
    clock.advance_secs(60);
    let tip = core.chain().last().cloned().unwrap();

    // Garbage parent, resealed so the hash itself checks out
    let mut stale = Block::next(&tip, clock.now(), tip.difficulty, "victim", vec![]);
    stale.previous_hash = "garbage".into();
    stale.reseal();
    // Links correctly but breaks a rule, with nothing proving who built it
    let inflated = Block::next(&tip, clock.now(), tip.difficulty + 5, "victim", vec![]);

    for _ in 0..5 {
        for block in [stale.clone(), inflated.clone()] {
            assert!(!core.submit_block(block).unwrap().is_accepted());
        }
    }
    assert_eq!(core.height(), 0);
    assert_eq!(core.staking().validator_stake("victim"), 1000);
    assert_eq!(core.slashing().statistics().total_events, 0);
    assert!(core
        .slashing()
        .behavior_record("victim")
        .map_or(true, |r| r.invalid_blocks == 0));
}

#[test]
fn pow_retargets_on_interval_boundary() {
    init_logger();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let mut config = CoreConfig::default();
    config.consensus.pow_difficulty = 1;
    config.difficulty.change_limit = 1.0;
    let core = LedgerCore::new(config, clock.clone(), Arc::new(MemoryStore::new())).unwrap();

    // Ten-block window spanning 270s against 600s expected
    for _ in 0..9 {
        clock.advance_secs(30);
        core.produce_block(vec![Transaction::new("a", "b", 1, 0)]).unwrap();
    }
    assert_eq!(core.height(), 9);
    assert_eq!(core.status().difficulty, Some(2));

    clock.advance_secs(30);
    let next = core.produce_block(vec![]).unwrap();
    assert_eq!(next.difficulty, 2);
    assert!(next.hash.starts_with("00"));
}

#[test]
fn switching_to_pow_mines_at_the_chain_difficulty() {
    let (core, clock, _) = build("pos");
    core.stake("v1", "v1", 100).unwrap();
    core.switch_consensus("pow").unwrap();
    core.coordinator().retarget(7);

    core.switch_consensus("pos").unwrap();
    clock.advance_secs(60);
    core.produce_block(vec![]).unwrap();
    core.switch_consensus("pow").unwrap();
    assert_eq!(core.status().difficulty, Some(1));

    clock.advance_secs(60);
    assert_eq!(core.produce_block(vec![]).unwrap().difficulty, 1);
}

#[test]
fn switching_consensus_keeps_chain() {
    let (core, clock, _) = build("pow");
    core.stake("v1", "v1", 100).unwrap();
    clock.advance_secs(60);
    core.produce_block(vec![]).unwrap();

    core.switch_consensus("dpos").unwrap();
    clock.advance_secs(60);
    let block = core.produce_block(vec![]).unwrap();
    assert_eq!(block.validator, "v1");
    assert_eq!(core.status().consensus, "dpos");
    assert_eq!(core.height(), 2);

    // Empty peer set trivially agrees; a majority on another head does not
    assert!(core.is_consensus_achieved(&[]));
    let peers = vec![PeerStatus::new("p1", 2, "other"), PeerStatus::new("p2", 2, "other")];
    assert!(!core.is_consensus_achieved(&peers));
}

#[test]
fn pbft_finality_follows_recorded_votes() {
    let (core, _, _) = build("pbft");
    let tip = core.status().tip_hash;
    assert!(!core.is_consensus_achieved(&[]));
    core.record_vote(&tip, "n1");
    core.record_vote(&tip, "n2");
    assert!(!core.is_consensus_achieved(&[]));
    core.record_vote(&tip, "n3");
    assert!(core.is_consensus_achieved(&[]));
}

#[test]
fn signed_production_with_keyring() {
    let (core, clock) = build_signed("pos");
    core.stake("v1", "v1", 500).unwrap();
    core.register_validator_key("v1", [9u8; 32]).unwrap();

    clock.advance_secs(60);
    let block = core.produce_block(vec![]).unwrap();
    assert!(!block.signature.is_empty());

    // Same producer, no signature
    clock.advance_secs(60);
    let unsigned = Block::next(&block, clock.now(), block.difficulty, "v1", vec![]);
    assert!(!core.submit_block(unsigned).unwrap().is_accepted());
    // Anyone could have built it, so it does not count against v1
    assert_eq!(core.slashing().behavior_record("v1").unwrap().invalid_blocks, 0);
}

#[test]
fn concurrent_unstakes_never_overdraw() {
    let (core, _, _) = build("pos");
    core.stake("v1", "v1", 100).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let core = core.clone();
            thread::spawn(move || core.unstake("v1", "v1", 60).unwrap())
        })
        .collect();
    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(core.staking().pending_unstakes().len(), 1);
}

#[test]
fn concurrent_slashes_record_one_event() {
    let (core, _, _) = build("pos");
    core.stake("v1", "v1", 1000).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let core = core.clone();
            thread::spawn(move || core.slash("v1", SlashReason::InvalidBlock, None).is_ok())
        })
        .collect();
    let ok = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    assert_eq!(ok, 1);
    assert_eq!(core.slashing().statistics().total_events, 1);
    assert_eq!(core.staking().validator_stake("v1"), 750);
}

#[tokio::test(start_paused = true)]
async fn periodic_settlement_pays_out_pool() {
    let (core, clock, _) = build("pow");
    core.stake("v1", "v1", 100).unwrap();
    clock.advance_secs(60);
    core.produce_block(vec![]).unwrap();
    assert_eq!(core.status().reward_pool, 50);

    let task = core.spawn_settlement(std::time::Duration::from_secs(10));
    tokio::time::sleep(std::time::Duration::from_secs(15)).await;

    assert_eq!(core.status().reward_pool, 0);
    assert_eq!(core.staking().reward_stats().total_rewards, 50);
    task.abort();
}
