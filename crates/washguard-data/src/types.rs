//! Type definitions for token transfers and per-trader trade history.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// Mint/burn sentinel. Transfers from or to this address are never trades.
pub const MINT_BURN_SENTINEL: Address = Address::ZERO;

/// One decoded `Transfer` event of the monitored token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    /// Token sender.
    pub from: Address,
    /// Token receiver.
    pub to: Address,
    /// Amount transferred in token base units.
    pub amount: U256,
    /// Block the transfer was included in.
    pub block_number: u64,
    /// Log index within the block (ordering key).
    pub log_index: u64,
}

impl TransferEvent {
    /// True when either side is the mint/burn sentinel.
    pub fn touches_sentinel(&self) -> bool {
        self.from == MINT_BURN_SENTINEL || self.to == MINT_BURN_SENTINEL
    }
}

/// Direction of a trade relative to the trader that owns the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Trader received tokens (a buy in pair-relative mode).
    Incoming,
    /// Trader sent tokens (a sell in pair-relative mode).
    Outgoing,
}

impl Direction {
    /// Stable text form used in the snapshot database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    /// Parses the text form written by [`Direction::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// A single trade as seen from one trader. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeRecord {
    /// Incoming or outgoing relative to the owning trader.
    pub direction: Direction,
    /// Block the underlying transfer was included in.
    pub block_number: u64,
    /// Amount transferred.
    pub amount: U256,
    /// The other side of the transfer.
    pub counterparty: Address,
}

/// Append-only trade history for one address.
///
/// `incoming` and `outgoing` hold indices into `trades`, so both direction
/// subsequences are always ordered subsets of the full sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraderHistory {
    trades: Vec<TradeRecord>,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
    first_seen: u64,
}

impl TraderHistory {
    /// Creates an empty history first seen at `first_seen`.
    pub fn new(first_seen: u64) -> Self {
        Self {
            trades: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            first_seen,
        }
    }

    /// Appends a trade to the full sequence and its direction subsequence.
    pub fn push(&mut self, trade: TradeRecord) {
        let idx = self.trades.len();
        match trade.direction {
            Direction::Incoming => self.incoming.push(idx),
            Direction::Outgoing => self.outgoing.push(idx),
        }
        self.trades.push(trade);
    }

    /// Full trade sequence in arrival order.
    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Incoming trades in arrival order.
    pub fn incoming(&self) -> impl Iterator<Item = &TradeRecord> + '_ {
        self.incoming.iter().map(move |&idx| &self.trades[idx])
    }

    /// Outgoing trades in arrival order.
    pub fn outgoing(&self) -> impl Iterator<Item = &TradeRecord> + '_ {
        self.outgoing.iter().map(move |&idx| &self.trades[idx])
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// Block of the first recorded trade. Never changes after creation.
    pub fn first_seen(&self) -> u64 {
        self.first_seen
    }

    /// Block of the most recently appended trade.
    pub fn last_block(&self) -> Option<u64> {
        self.trades.last().map(|trade| trade.block_number)
    }
}
