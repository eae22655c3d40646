//! Detection and dispatch through full scans.

mod common;

use common::{
    addr, single_source, temp_log, test_store, transfer, wash_pattern, ChainFixture, RecordingSink,
};
use washguard_analysis::classify::TrackingMode;
use washguard_analysis::detector::DetectorConfig;
use washguard_analysis::dispatch::{
    onchain_reason, ActionOutcome, DetectionLog, Dispatcher, MAX_ONCHAIN_REASON_BYTES,
};
use washguard_analysis::scan::{ScanConfig, Scanner};
use washguard_data::state::GuardState;

const PAIR: u8 = 99;

fn chain_with(
    head: u64,
    events: impl IntoIterator<Item = washguard_data::TransferEvent>,
) -> ChainFixture {
    let mut chain = ChainFixture::new(head);
    for event in events {
        chain.push(event);
    }
    chain
}

#[tokio::test]
async fn wash_trader_is_detected_and_logged_once() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, pair, 10, 4)));
    let (_dir, log) = temp_log();
    let dispatcher = Dispatcher::monitor(log);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    assert_eq!(report.detections.len(), 1);
    let detection = &report.detections[0];
    assert_eq!(detection.address, bot);
    assert_eq!(detection.outcome, ActionOutcome::Logged);
    // Classified at the eighth trade.
    assert_eq!(detection.block_number, 24);
    assert!(detection.reasons.iter().any(|r| r.starts_with("WASH_TRADING (4B/4S")));
    assert!(detection.reasons.iter().any(|r| r.starts_with("RAPID_TRADING")));

    assert!(state.is_detected(&bot));
    assert!(state.is_actioned(&bot));
    assert!(state.trader(&pair).is_none());

    let records = dispatcher.log().read_all().expect("log readable");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.address, bot.to_checksum(None));
    assert_eq!(record.total_trades, 8);
    assert_eq!((record.incoming, record.outgoing), (4, 4));
    assert_eq!(record.first_seen, 10);
    assert_eq!(record.action, "logged");
}

#[tokio::test]
async fn trader_below_min_trades_is_never_flagged() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let events = wash_pattern(bot, pair, 10, 4).into_iter().take(7);
    let (source, _) = single_source(chain_with(100, events));
    let (_dir, log) = temp_log();
    let dispatcher = Dispatcher::monitor(log);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    assert!(report.detections.is_empty());
    assert_eq!(state.trader(&bot).map(|h| h.trade_count()), Some(7));
    assert!(dispatcher.log().read_all().expect("log readable").is_empty());
}

#[tokio::test]
async fn single_signal_is_not_enough() {
    let seller = addr(3);
    let pair = addr(PAIR);
    let events = (1..=30).map(|block| transfer(seller, pair, block, 0));
    let (source, _) = single_source(chain_with(30, events));
    let (_dir, log) = temp_log();
    let dispatcher = Dispatcher::monitor(log);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 30).await;

    // Only high frequency fires for a one-way seller.
    assert!(report.detections.is_empty());
    assert!(!state.is_detected(&seller));
}

#[tokio::test]
async fn same_block_round_trips_are_flagged() {
    let bot = addr(8);
    let pair = addr(PAIR);
    let mut events = Vec::new();
    for block in [100, 300, 500, 700] {
        events.push(transfer(pair, bot, block, 0));
        events.push(transfer(bot, pair, block, 1));
    }
    let (source, _) = single_source(chain_with(800, events));
    let (_dir, log) = temp_log();
    let dispatcher = Dispatcher::monitor(log);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 800).await;

    assert_eq!(report.detections.len(), 1);
    let reasons = &report.detections[0].reasons;
    assert_eq!(reasons.len(), 2);
    assert!(reasons[0].starts_with("WASH_TRADING"));
    assert_eq!(reasons[1], "SAME_BLOCK_REVERSAL (block 100)");
}

#[tokio::test]
async fn symmetric_mode_flags_both_sides_of_a_mirror_trade() {
    let bot = addr(7);
    let peer = addr(8);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, peer, 10, 4)));
    let (_dir, log) = temp_log();
    let dispatcher = Dispatcher::monitor(log);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::Symmetric,
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    let flagged: Vec<_> = report.detections.iter().map(|d| d.address).collect();
    assert_eq!(flagged, vec![bot, peer]);
    assert_eq!(dispatcher.log().read_all().expect("log readable").len(), 2);
}

#[tokio::test]
async fn blacklist_is_submitted_once_per_bot() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let mut events = wash_pattern(bot, pair, 10, 4);
    events.extend(wash_pattern(bot, pair, 40, 4));
    let (source, _) = single_source(chain_with(100, events));
    let (_dir, log) = temp_log();
    let sink = RecordingSink::default();
    let submitted = sink.submitted.clone();
    let submissions = sink.submissions.clone();
    let dispatcher = Dispatcher::with_sink(log, sink);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    assert_eq!(report.detections.len(), 1);
    assert_eq!(report.detections[0].outcome, ActionOutcome::Blacklisted);
    assert_eq!(submissions.get(), 1);
    let reason = submitted.borrow().get(&bot).cloned().expect("bot submitted");
    assert!(reason.starts_with("WASH_TRADING"));
    assert!(reason.len() <= MAX_ONCHAIN_REASON_BYTES);
    assert!(state.is_actioned(&bot));
}

#[tokio::test]
async fn already_blacklisted_bot_is_not_resubmitted() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, pair, 10, 4)));
    let (_dir, log) = temp_log();
    let sink = RecordingSink::with_preexisting(&[bot]);
    let submissions = sink.submissions.clone();
    let dispatcher = Dispatcher::with_sink(log, sink);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    assert_eq!(report.detections[0].outcome, ActionOutcome::AlreadyBlacklisted);
    assert_eq!(submissions.get(), 0);
    assert!(state.is_actioned(&bot));
}

#[tokio::test]
async fn failed_action_keeps_detection_and_can_be_retried() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, pair, 10, 4)));
    let (_dir, log) = temp_log();
    let sink = RecordingSink::rejecting(&[bot]);
    let healed = sink.healed();
    let dispatcher = Dispatcher::with_sink(log.clone(), sink);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    assert!(matches!(report.detections[0].outcome, ActionOutcome::Failed(_)));
    assert!(state.is_detected(&bot));
    assert!(!state.is_actioned(&bot));
    assert_eq!(state.pending_actions(), vec![bot]);

    let retry = Dispatcher::with_sink(log, healed.clone());
    assert_eq!(retry.retry_pending(&mut state).await, 1);
    assert!(state.is_actioned(&bot));
    assert!(state.pending_actions().is_empty());
    assert!(healed.submitted.borrow().contains_key(&bot));
    // Retrying does not produce a second detection record.
    assert_eq!(retry.log().read_all().expect("log readable").len(), 1);
}

#[tokio::test]
async fn unwritable_log_keeps_monitor_detection_pending_across_snapshots() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, pair, 10, 4)));
    let dir = tempfile::tempdir().expect("temp dir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").expect("blocker file");
    let broken = Dispatcher::monitor(DetectionLog::new(blocker.join("detections.jsonl")));
    let scanner = Scanner::new(
        &source,
        &broken,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;
    assert!(matches!(report.detections[0].outcome, ActionOutcome::Failed(_)));
    assert_eq!(state.pending_actions(), vec![bot]);

    let store = test_store();
    store.save(&state).expect("save");
    let mut restored = store.load().expect("load").expect("snapshot present");
    assert_eq!(restored.pending_actions(), vec![bot]);

    let (_log_dir, log) = temp_log();
    let healthy = Dispatcher::monitor(log);
    assert_eq!(healthy.retry_pending(&mut restored).await, 1);
    assert!(restored.pending_actions().is_empty());

    let records = healthy.log().read_all().expect("log readable");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reasons, report.detections[0].reasons);
    assert_eq!(records[0].action, "logged");
}

#[tokio::test]
async fn blacklist_retry_after_restart_submits_original_reasons() {
    let bot = addr(7);
    let pair = addr(PAIR);
    let (source, _) = single_source(chain_with(100, wash_pattern(bot, pair, 10, 4)));
    let (_dir, log) = temp_log();
    let sink = RecordingSink::rejecting(&[bot]);
    let healed = sink.healed();
    let dispatcher = Dispatcher::with_sink(log.clone(), sink);
    let scanner = Scanner::new(
        &source,
        &dispatcher,
        TrackingMode::PairRelative { pair },
        DetectorConfig::default(),
        ScanConfig::default(),
    );

    let mut state = GuardState::with_watermark(0);
    let report = scanner.run(&mut state, 100).await;

    let store = test_store();
    store.save(&state).expect("save");
    let mut restored = store.load().expect("load").expect("snapshot present");

    let retry = Dispatcher::with_sink(log, healed.clone());
    assert_eq!(retry.retry_pending(&mut restored).await, 1);
    let submitted = healed.submitted.borrow().get(&bot).cloned().expect("bot submitted");
    assert_eq!(submitted, onchain_reason(&report.detections[0].reasons));
}
