//! washguard-data crate
//!
//! Transfer feed access, per-trader history state, and snapshot persistence.

pub mod source;
pub mod state;
pub mod store;
pub mod types;

pub use types::{Direction, TradeRecord, TraderHistory, TransferEvent, MINT_BURN_SENTINEL};
