//! washguard-analysis crate
//!
//! Transfer classification, bot-pattern heuristics, detection dispatch, and
//! the chunked scan driver that ties them to an event feed.

pub mod classify;
pub mod detector;
pub mod dispatch;
pub mod scan;
