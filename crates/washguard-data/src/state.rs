//! In-memory trader state owned by a single run.
//!
//! Built from the persisted snapshot at run start, passed explicitly through
//! every pipeline stage, and written back wholesale at run end.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::Address;
use chrono::{DateTime, Utc};

use crate::types::{TradeRecord, TraderHistory, MINT_BURN_SENTINEL};

/// Counters reported at the end of a run and stored with the snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateSummary {
    /// Number of distinct addresses with at least one trade.
    pub addresses_tracked: usize,
    /// Number of addresses classified as bots.
    pub bots_detected: usize,
    /// Detected addresses whose side effect has not been confirmed.
    pub actions_pending: usize,
    /// Last fully scanned block.
    pub watermark: u64,
}

/// Address-keyed trade history plus the detection bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardState {
    watermark: u64,
    traders: BTreeMap<Address, TraderHistory>,
    detected: BTreeSet<Address>,
    /// Reasons each detected address was classified with.
    detection_reasons: BTreeMap<Address, Vec<String>>,
    actioned: BTreeSet<Address>,
    last_update: Option<DateTime<Utc>>,
}

impl GuardState {
    /// Empty state whose watermark sits `lookback` blocks behind `head`.
    pub fn fresh(head: u64, lookback: u64) -> Self {
        Self::with_watermark(head.saturating_sub(lookback))
    }

    /// Empty state at an explicit watermark.
    pub fn with_watermark(watermark: u64) -> Self {
        Self {
            watermark,
            traders: BTreeMap::new(),
            detected: BTreeSet::new(),
            detection_reasons: BTreeMap::new(),
            actioned: BTreeSet::new(),
            last_update: None,
        }
    }

    /// Reassembles a state from its persisted parts.
    ///
    /// `detected` maps each classified address to its detection reasons.
    pub fn from_parts(
        watermark: u64,
        traders: BTreeMap<Address, TraderHistory>,
        detected: BTreeMap<Address, Vec<String>>,
        actioned: BTreeSet<Address>,
        last_update: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            watermark,
            traders,
            detected: detected.keys().copied().collect(),
            detection_reasons: detected,
            actioned,
            last_update,
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Moves the watermark forward to `block`. Lower values are ignored.
    pub fn advance_watermark(&mut self, block: u64) {
        if block > self.watermark {
            self.watermark = block;
        }
    }

    /// Lookup-or-create for a trader entry.
    ///
    /// Returns the entry and whether it was created by this call. A created
    /// entry takes `first_block` as its `first_seen`.
    pub fn trader_entry(
        &mut self,
        address: Address,
        first_block: u64,
    ) -> (&mut TraderHistory, bool) {
        let created = !self.traders.contains_key(&address);
        let history = self
            .traders
            .entry(address)
            .or_insert_with(|| TraderHistory::new(first_block));
        (history, created)
    }

    /// Appends `trade` to the history of `address`.
    ///
    /// The mint/burn sentinel is never recorded; `None` is returned for it.
    pub fn record_trade(&mut self, address: Address, trade: TradeRecord) -> Option<&TraderHistory> {
        if address == MINT_BURN_SENTINEL {
            return None;
        }
        let (history, created) = self.trader_entry(address, trade.block_number);
        if created {
            tracing::trace!(trader = %address, first_seen = trade.block_number, "new trader");
        }
        history.push(trade);
        Some(history)
    }

    pub fn trader(&self, address: &Address) -> Option<&TraderHistory> {
        self.traders.get(address)
    }

    pub fn traders(&self) -> &BTreeMap<Address, TraderHistory> {
        &self.traders
    }

    /// Adds `address` to the detection set with the reasons it was flagged for.
    ///
    /// Returns `false` if it was already there; the first reasons are kept.
    pub fn mark_detected(&mut self, address: Address, reasons: Vec<String>) -> bool {
        if !self.detected.insert(address) {
            return false;
        }
        self.detection_reasons.insert(address, reasons);
        true
    }

    pub fn is_detected(&self, address: &Address) -> bool {
        self.detected.contains(address)
    }

    pub fn detected(&self) -> &BTreeSet<Address> {
        &self.detected
    }

    /// Reasons recorded when `address` was detected; empty if it never was.
    pub fn detection_reasons(&self, address: &Address) -> &[String] {
        self.detection_reasons
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Records that the detection side effect for `address` completed.
    pub fn mark_actioned(&mut self, address: Address) {
        self.actioned.insert(address);
    }

    pub fn is_actioned(&self, address: &Address) -> bool {
        self.actioned.contains(address)
    }

    pub fn actioned(&self) -> &BTreeSet<Address> {
        &self.actioned
    }

    /// Detected addresses whose side effect never succeeded.
    pub fn pending_actions(&self) -> Vec<Address> {
        self.detected.difference(&self.actioned).copied().collect()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            addresses_tracked: self.traders.len(),
            bots_detected: self.detected.len(),
            actions_pending: self.detected.difference(&self.actioned).count(),
            watermark: self.watermark,
        }
    }
}
