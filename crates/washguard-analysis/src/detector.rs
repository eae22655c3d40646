//! Heuristic wash-trading bot detection.
//!
//! Four independent signals are evaluated against a trader's history. Any two
//! of them are enough to classify the address as a bot.
//!
//! # Accuracy
//! This is a heuristic classifier. It accepts both false positives and false
//! negatives and is meant to surface addresses for review.

use std::fmt;

use alloy::primitives::Address;
use washguard_data::state::GuardState;
use washguard_data::types::TraderHistory;

/// Number of triggered signals required for a positive classification.
pub const MIN_SIGNALS: usize = 2;

const SECONDS_PER_HOUR: u64 = 3_600;

/// Detection thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Trades a trader needs before being evaluated at all.
    pub min_trades: usize,
    /// `min(in, out) / max(in, out)` at or above this is wash trading.
    pub wash_ratio: f64,
    /// Average hold time (blocks) below this is rapid trading.
    pub max_avg_hold_blocks: f64,
    /// Trade rate above this is high frequency.
    pub max_trades_per_hour: f64,
    /// Chain block time used to convert block spans to hours.
    pub seconds_per_block: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_trades: 8,
            wash_ratio: 0.85,
            max_avg_hold_blocks: 100.0,
            max_trades_per_hour: 20.0,
            seconds_per_block: 3,
        }
    }
}

impl DetectorConfig {
    /// Blocks produced per hour at the configured block time.
    pub fn blocks_per_hour(&self) -> f64 {
        SECONDS_PER_HOUR as f64 / self.seconds_per_block.max(1) as f64
    }
}

/// A triggered heuristic together with the numbers that triggered it.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// Incoming and outgoing trade counts are nearly balanced.
    WashTrading {
        incoming: usize,
        outgoing: usize,
        ratio: f64,
    },
    /// Tokens are sold shortly after being bought.
    RapidHold { avg_hold_blocks: f64 },
    /// Too many trades per hour since first seen.
    HighFrequency { trades_per_hour: f64 },
    /// Adjacent trades in one block flip direction.
    SameBlockReversal { block: u64 },
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::WashTrading {
                incoming,
                outgoing,
                ratio,
            } => write!(f, "WASH_TRADING ({incoming}B/{outgoing}S, ratio:{ratio:.2})"),
            Signal::RapidHold { avg_hold_blocks } => {
                write!(f, "RAPID_TRADING (avg_hold:{}blk)", *avg_hold_blocks as u64)
            }
            Signal::HighFrequency { trades_per_hour } => {
                write!(f, "HIGH_FREQUENCY ({trades_per_hour:.1} trades/hr)")
            }
            Signal::SameBlockReversal { block } => write!(f, "SAME_BLOCK_REVERSAL (block {block})"),
        }
    }
}

/// Collected signals for one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Verdict {
    pub signals: Vec<Signal>,
}

impl Verdict {
    pub fn is_bot(&self) -> bool {
        self.signals.len() >= MIN_SIGNALS
    }

    /// Reason strings, one per triggered signal.
    pub fn reasons(&self) -> Vec<String> {
        self.signals.iter().map(ToString::to_string).collect()
    }
}

/// Balanced in/out counts.
pub fn wash_trading(history: &TraderHistory, cfg: &DetectorConfig) -> Option<Signal> {
    let incoming = history.incoming_count();
    let outgoing = history.outgoing_count();
    if incoming == 0 || outgoing == 0 {
        return None;
    }
    let ratio = incoming.min(outgoing) as f64 / incoming.max(outgoing) as f64;
    (ratio >= cfg.wash_ratio).then_some(Signal::WashTrading {
        incoming,
        outgoing,
        ratio,
    })
}

/// Average blocks between each outgoing trade and the latest incoming trade
/// strictly before it. Outgoing trades with no earlier incoming are skipped.
pub fn average_hold_blocks(history: &TraderHistory) -> Option<f64> {
    let mut total: u128 = 0;
    let mut pairs: u64 = 0;
    for sell in history.outgoing() {
        let latest_buy = history
            .incoming()
            .filter(|buy| buy.block_number < sell.block_number)
            .map(|buy| buy.block_number)
            .max();
        if let Some(buy_block) = latest_buy {
            total += u128::from(sell.block_number - buy_block);
            pairs += 1;
        }
    }
    (pairs > 0).then(|| total as f64 / pairs as f64)
}

/// Short average hold time.
pub fn rapid_hold(history: &TraderHistory, cfg: &DetectorConfig) -> Option<Signal> {
    let avg_hold_blocks = average_hold_blocks(history)?;
    (avg_hold_blocks < cfg.max_avg_hold_blocks).then_some(Signal::RapidHold { avg_hold_blocks })
}

/// Trades per hour between first sighting and the latest trade.
///
/// `None` when every trade sits in the first block.
pub fn trades_per_hour(history: &TraderHistory, cfg: &DetectorConfig) -> Option<f64> {
    let last = history.last_block()?;
    let block_range = last.saturating_sub(history.first_seen());
    if block_range == 0 {
        return None;
    }
    Some(history.trade_count() as f64 / block_range as f64 * cfg.blocks_per_hour())
}

/// Trading rate above the threshold.
pub fn high_frequency(history: &TraderHistory, cfg: &DetectorConfig) -> Option<Signal> {
    let trades_per_hour = trades_per_hour(history, cfg)?;
    (trades_per_hour > cfg.max_trades_per_hour).then_some(Signal::HighFrequency { trades_per_hour })
}

/// First adjacent pair of trades sharing a block with opposite directions.
pub fn same_block_reversal(history: &TraderHistory) -> Option<Signal> {
    history
        .trades()
        .windows(2)
        .find(|pair| {
            pair[0].block_number == pair[1].block_number && pair[0].direction != pair[1].direction
        })
        .map(|pair| Signal::SameBlockReversal {
            block: pair[0].block_number,
        })
}

/// Runs all four heuristics.
pub fn evaluate(history: &TraderHistory, cfg: &DetectorConfig) -> Verdict {
    let signals = [
        wash_trading(history, cfg),
        rapid_hold(history, cfg),
        high_frequency(history, cfg),
        same_block_reversal(history),
    ]
    .into_iter()
    .flatten()
    .collect();
    Verdict { signals }
}

/// True when `address` has enough trades and has not been classified yet.
pub fn should_evaluate(state: &GuardState, address: &Address, cfg: &DetectorConfig) -> bool {
    if state.is_detected(address) {
        return false;
    }
    state
        .trader(address)
        .is_some_and(|history| history.trade_count() >= cfg.min_trades)
}
