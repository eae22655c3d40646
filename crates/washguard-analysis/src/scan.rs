//! Chunked scan driver.
//!
//! Walks forward from the watermark in fixed-size chunks. A chunk is folded
//! into state and the watermark advanced only when the whole chunk was
//! fetched; the first failed chunk ends the pass so it is retried from the
//! same block next run.

use alloy::primitives::Address;
use washguard_data::source::{EndpointAttempt, EventSource, FallbackSource};
use washguard_data::state::GuardState;
use washguard_data::types::TransferEvent;

use crate::classify::{fold_transfer, TrackingMode};
use crate::detector::{evaluate, should_evaluate, DetectorConfig};
use crate::dispatch::{ActionOutcome, ActionSink, Dispatcher};

/// Chunking limits for one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    /// Blocks per chunk (inclusive range length).
    pub chunk_size: u64,
    /// Chunks fetched per invocation at most.
    pub max_chunks: usize,
    /// Blocks behind head to start from when there is no snapshot.
    pub lookback_blocks: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_chunks: 20,
            lookback_blocks: 50,
        }
    }
}

impl ScanConfig {
    /// State for a first run: the watermark sits `lookback_blocks` behind `head`.
    pub fn initial_state(&self, head: u64) -> GuardState {
        GuardState::fresh(head, self.lookback_blocks)
    }
}

/// Inclusive block ranges to scan, starting at `start` and ending at `head`.
///
/// Empty when `start >= head`.
pub fn plan_chunks(
    start: u64,
    head: u64,
    chunk_size: u64,
    max_chunks: usize,
) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    if start >= head {
        return chunks;
    }
    let mut from = start;
    while from <= head && chunks.len() < max_chunks {
        let to = from.saturating_add(chunk_size - 1).min(head);
        chunks.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    chunks
}

/// A positive classification made during the scan.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub address: Address,
    pub reasons: Vec<String>,
    pub outcome: ActionOutcome,
    pub block_number: u64,
}

/// The chunk that ended the scan.
#[derive(Clone, Debug, PartialEq)]
pub struct FailedChunk {
    pub from_block: u64,
    pub to_block: u64,
    pub attempts: Vec<EndpointAttempt>,
}

/// What one scan pass did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    /// First block of the pass (watermark + 1).
    pub start_block: u64,
    /// Chain head the pass aimed for.
    pub head: u64,
    pub chunks_planned: usize,
    pub chunks_scanned: usize,
    pub events_processed: usize,
    pub detections: Vec<Detection>,
    /// Set when a chunk could not be fetched from any endpoint.
    pub failed_chunk: Option<FailedChunk>,
    pub final_watermark: u64,
}

impl ScanReport {
    /// True when the pass caught up with the head it aimed for.
    pub fn reached_head(&self) -> bool {
        self.final_watermark >= self.head
    }
}

/// Drives the fetch → classify → detect → dispatch pipeline over chunks.
pub struct Scanner<'a, S, K> {
    source: &'a FallbackSource<S>,
    dispatcher: &'a Dispatcher<K>,
    mode: TrackingMode,
    detector: DetectorConfig,
    scan: ScanConfig,
}

impl<'a, S: EventSource, K: ActionSink> Scanner<'a, S, K> {
    pub fn new(
        source: &'a FallbackSource<S>,
        dispatcher: &'a Dispatcher<K>,
        mode: TrackingMode,
        detector: DetectorConfig,
        scan: ScanConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            mode,
            detector,
            scan,
        }
    }

    /// Scans from the state's watermark towards `head`.
    #[tracing::instrument(skip(self, state), fields(watermark = state.watermark()))]
    pub async fn run(&self, state: &mut GuardState, head: u64) -> ScanReport {
        let start_block = state.watermark().saturating_add(1);
        let chunks = plan_chunks(start_block, head, self.scan.chunk_size, self.scan.max_chunks);
        let mut report = ScanReport {
            start_block,
            head,
            chunks_planned: chunks.len(),
            final_watermark: state.watermark(),
            ..ScanReport::default()
        };

        if chunks.is_empty() {
            tracing::info!(start_block, head, "nothing to scan");
            return report;
        }

        for (from_block, to_block) in chunks {
            let fetch = self.source.fetch_chunk(from_block, to_block).await;
            let Some(events) = fetch.events else {
                tracing::warn!(
                    from_block,
                    to_block,
                    attempts = fetch.attempts.len(),
                    "chunk fetch failed on every endpoint; stopping scan"
                );
                report.failed_chunk = Some(FailedChunk {
                    from_block,
                    to_block,
                    attempts: fetch.attempts,
                });
                break;
            };

            for event in &events {
                self.fold_event(state, event, &mut report).await;
            }
            state.advance_watermark(to_block);
            report.chunks_scanned += 1;
            report.events_processed += events.len();
            tracing::debug!(from_block, to_block, events = events.len(), "chunk committed");
        }

        report.final_watermark = state.watermark();
        tracing::info!(
            chunks_scanned = report.chunks_scanned,
            events = report.events_processed,
            detections = report.detections.len(),
            watermark = report.final_watermark,
            "scan finished"
        );
        report
    }

    /// Folds the event into state, then evaluates each trader it touched.
    async fn fold_event(
        &self,
        state: &mut GuardState,
        event: &TransferEvent,
        report: &mut ScanReport,
    ) {
        for trader in fold_transfer(state, self.mode, event) {
            if !should_evaluate(state, &trader, &self.detector) {
                continue;
            }
            let Some(history) = state.trader(&trader) else {
                continue;
            };
            let verdict = evaluate(history, &self.detector);
            if !verdict.is_bot() {
                continue;
            }
            if let Some(outcome) = self.dispatcher.dispatch(state, trader, &verdict).await {
                report.detections.push(Detection {
                    address: trader,
                    reasons: verdict.reasons(),
                    outcome,
                    block_number: event.block_number,
                });
            }
        }
    }
}
