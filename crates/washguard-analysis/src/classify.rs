//! Turns token transfers into per-trader trade records.
//!
//! Two tracking modes are supported:
//! - **Symmetric**: every transfer is a trade for both parties.
//! - **Pair-relative**: only transfers touching a liquidity pair count, and only
//!   the non-pair party gets a record (pair → trader is a buy, trader → pair a sell).

use alloy::primitives::Address;
use washguard_data::state::GuardState;
use washguard_data::types::{Direction, TradeRecord, TransferEvent};

/// How transfers map to trader activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingMode {
    /// Track sender and receiver of every transfer.
    Symmetric,
    /// Track only swaps against a fixed liquidity pair.
    PairRelative {
        /// The pair contract address.
        pair: Address,
    },
}

impl TrackingMode {
    /// Pair-relative when a pair address is configured, symmetric otherwise.
    pub fn from_pair(pair: Option<Address>) -> Self {
        match pair {
            Some(pair) => TrackingMode::PairRelative { pair },
            None => TrackingMode::Symmetric,
        }
    }
}

/// Produces zero, one, or two `(trader, record)` pairs for a transfer.
///
/// Transfers involving the mint/burn sentinel yield nothing.
pub fn classify_transfer(mode: TrackingMode, event: &TransferEvent) -> Vec<(Address, TradeRecord)> {
    if event.touches_sentinel() {
        return Vec::new();
    }

    let record = |direction: Direction, counterparty: Address| TradeRecord {
        direction,
        block_number: event.block_number,
        amount: event.amount,
        counterparty,
    };

    match mode {
        TrackingMode::Symmetric => vec![
            (event.from, record(Direction::Outgoing, event.to)),
            (event.to, record(Direction::Incoming, event.from)),
        ],
        TrackingMode::PairRelative { pair } => {
            if event.from == pair && event.to != pair {
                vec![(event.to, record(Direction::Incoming, pair))]
            } else if event.to == pair && event.from != pair {
                vec![(event.from, record(Direction::Outgoing, pair))]
            } else {
                Vec::new()
            }
        }
    }
}

/// Appends the transfer's trade records to `state`.
///
/// Returns the traders whose histories grew, in classification order.
pub fn fold_transfer(
    state: &mut GuardState,
    mode: TrackingMode,
    event: &TransferEvent,
) -> Vec<Address> {
    classify_transfer(mode, event)
        .into_iter()
        .filter_map(|(trader, record)| state.record_trade(trader, record).map(|_| trader))
        .collect()
}
