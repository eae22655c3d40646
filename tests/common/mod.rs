//! Shared test helpers and utilities.
//!
//! Provides factories for transfer events and scripted doubles for the
//! event source and blacklist sink, so scans can run without a chain.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result};
use washguard_analysis::dispatch::{ActionSink, DetectionLog};
use washguard_data::source::{EventSource, FallbackSource};
use washguard_data::store::SnapshotStore;
use washguard_data::types::TransferEvent;

/// Deterministic address whose last byte is `n`.
pub fn addr(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = n;
    Address::from(bytes)
}

/// A transfer of 1000 units at `block_number`.
pub fn transfer(from: Address, to: Address, block_number: u64, log_index: u64) -> TransferEvent {
    TransferEvent {
        from,
        to,
        amount: U256::from(1_000u64),
        block_number,
        log_index,
    }
}

/// Creates an in-memory snapshot store with migrations applied.
///
/// # Panics
/// Panics if the in-memory database cannot be created.
pub fn test_store() -> SnapshotStore {
    SnapshotStore::new(":memory:").expect("in-memory store should always open")
}

/// Detection log in a fresh temporary directory.
///
/// The directory handle must be kept alive for the log to stay writable.
pub fn temp_log() -> (tempfile::TempDir, DetectionLog) {
    let dir = tempfile::tempdir().expect("temp dir");
    let log = DetectionLog::new(dir.path().join("detections.jsonl"));
    (dir, log)
}

/// In-memory chain: events keyed by block, plus a head.
#[derive(Clone, Debug, Default)]
pub struct ChainFixture {
    pub head: u64,
    pub events: Vec<TransferEvent>,
}

impl ChainFixture {
    pub fn new(head: u64) -> Self {
        Self {
            head,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    pub fn in_range(&self, from_block: u64, to_block: u64) -> Vec<TransferEvent> {
        self.events
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect()
    }
}

/// Event source serving a [`ChainFixture`], with scripted failures.
///
/// `fail_on_calls` lists 1-based `transfers` call numbers that fail.
/// Requested ranges are recorded through a shared handle so they can be
/// inspected after the source has moved into a [`FallbackSource`].
pub struct ScriptedSource {
    label: String,
    chain: ChainFixture,
    fail_on_calls: BTreeSet<usize>,
    always_fail: bool,
    calls: Rc<Cell<usize>>,
    ranges: Rc<RefCell<Vec<(u64, u64)>>>,
}

impl ScriptedSource {
    pub fn new(label: &str, chain: ChainFixture) -> Self {
        Self {
            label: label.to_string(),
            chain,
            fail_on_calls: BTreeSet::new(),
            always_fail: false,
            calls: Rc::new(Cell::new(0)),
            ranges: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on_calls.extend(calls.iter().copied());
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Number of `transfers` calls made so far.
    pub fn call_counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.calls)
    }

    /// Ranges passed to `transfers`, in call order.
    pub fn range_log(&self) -> Rc<RefCell<Vec<(u64, u64)>>> {
        Rc::clone(&self.ranges)
    }
}

impl EventSource for ScriptedSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn head_block(&self) -> Result<u64> {
        if self.always_fail {
            return Err(eyre!("{} unreachable", self.label));
        }
        Ok(self.chain.head)
    }

    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        self.ranges.borrow_mut().push((from_block, to_block));
        if self.always_fail || self.fail_on_calls.contains(&call) {
            return Err(eyre!("{} timed out on call {call}", self.label));
        }
        Ok(self.chain.in_range(from_block, to_block))
    }
}

/// Single-endpoint fallback source over `chain`, returning its call counter.
pub fn single_source(chain: ChainFixture) -> (FallbackSource<ScriptedSource>, Rc<Cell<usize>>) {
    let source = ScriptedSource::new("primary", chain);
    let calls = source.call_counter();
    (FallbackSource::new(vec![source]), calls)
}

/// Blacklist sink that records submissions.
///
/// Submissions are kept behind shared handles so they stay visible after the
/// sink has moved into a dispatcher.
#[derive(Clone, Default)]
pub struct RecordingSink {
    /// Addresses the sink reports as already blacklisted.
    pub preexisting: BTreeSet<Address>,
    /// Addresses whose `blacklist` call fails.
    pub rejecting: BTreeSet<Address>,
    pub submitted: Rc<RefCell<BTreeMap<Address, String>>>,
    pub submissions: Rc<Cell<usize>>,
}

impl RecordingSink {
    pub fn rejecting(addresses: &[Address]) -> Self {
        Self {
            rejecting: addresses.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn with_preexisting(addresses: &[Address]) -> Self {
        Self {
            preexisting: addresses.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Same recorded history, but accepts every address.
    pub fn healed(&self) -> Self {
        Self {
            preexisting: self.preexisting.clone(),
            rejecting: BTreeSet::new(),
            submitted: Rc::clone(&self.submitted),
            submissions: Rc::clone(&self.submissions),
        }
    }
}

impl ActionSink for RecordingSink {
    async fn is_blacklisted(&self, address: Address) -> Result<bool> {
        Ok(self.preexisting.contains(&address) || self.submitted.borrow().contains_key(&address))
    }

    async fn blacklist(&self, address: Address, reason: &str) -> Result<()> {
        self.submissions.set(self.submissions.get() + 1);
        if self.rejecting.contains(&address) {
            return Err(eyre!("transaction reverted"));
        }
        self.submitted
            .borrow_mut()
            .insert(address, reason.to_string());
        Ok(())
    }
}

/// Events making `bot` a wash trader against `peer`: alternating buys and
/// sells two blocks apart starting at `start_block`, `rounds` of each.
///
/// Every event is logged at index 0 of its own block.
pub fn wash_pattern(
    bot: Address,
    peer: Address,
    start_block: u64,
    rounds: u64,
) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    for round in 0..rounds {
        let block = start_block + round * 4;
        events.push(transfer(peer, bot, block, 0));
        events.push(transfer(bot, peer, block + 2, 0));
    }
    events
}
