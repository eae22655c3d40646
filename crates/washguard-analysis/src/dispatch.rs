//! One-time actions taken when an address is classified as a bot.
//!
//! Every detection is appended to a JSON Lines log. When an [`ActionSink`] is
//! configured the address is also submitted for blacklisting, after checking
//! that it is not blacklisted already.
//!
//! The address enters the detection set before the side effect is attempted.
//! A crash or sink failure after that point leaves it detected but not
//! actioned: the record is written at most once, the side effect is attempted
//! at least once, and [`Dispatcher::retry_pending`] can replay it later.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::sol;
use chrono::Utc;
use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use washguard_data::state::GuardState;

use crate::detector::Verdict;

/// Longest reason string submitted on chain, in bytes.
pub const MAX_ONCHAIN_REASON_BYTES: usize = 128;

sol! {
    #[sol(rpc)]
    interface ITokenBlacklist {
        function isBlacklisted(address account) external view returns (bool blacklisted);
        function addToBlacklist(address account, string reason) external;
    }
}

/// External system that can blacklist an address.
#[allow(async_fn_in_trait)]
pub trait ActionSink {
    /// Whether the address is already blacklisted externally.
    async fn is_blacklisted(&self, address: Address) -> Result<bool>;

    /// Blacklists the address. Returns once the action is confirmed.
    async fn blacklist(&self, address: Address, reason: &str) -> Result<()>;
}

/// Sink type for monitor mode, where no external action exists.
pub enum MonitorOnly {}

impl ActionSink for MonitorOnly {
    async fn is_blacklisted(&self, _address: Address) -> Result<bool> {
        match *self {}
    }

    async fn blacklist(&self, _address: Address, _reason: &str) -> Result<()> {
        match *self {}
    }
}

/// Blacklists through the token contract using an operator wallet provider.
pub struct ContractSink<P> {
    token: Address,
    provider: P,
    receipt_timeout: Duration,
}

impl<P: Provider + Clone> ContractSink<P> {
    /// `provider` must carry a wallet allowed to call `addToBlacklist`.
    pub fn new(token: Address, provider: P, receipt_timeout: Duration) -> Self {
        Self {
            token,
            provider,
            receipt_timeout,
        }
    }
}

impl<P: Provider + Clone> ActionSink for ContractSink<P> {
    async fn is_blacklisted(&self, address: Address) -> Result<bool> {
        let contract = ITokenBlacklist::new(self.token, self.provider.clone());
        let result = contract
            .isBlacklisted(address)
            .call()
            .await
            .wrap_err("isBlacklisted call failed")?;
        Ok(result.blacklisted)
    }

    #[tracing::instrument(skip(self, reason), fields(token = %self.token))]
    async fn blacklist(&self, address: Address, reason: &str) -> Result<()> {
        let contract = ITokenBlacklist::new(self.token, self.provider.clone());
        let pending = contract
            .addToBlacklist(address, reason.to_string())
            .send()
            .await
            .wrap_err("failed to submit addToBlacklist transaction")?;
        let tx_hash = *pending.tx_hash();
        tracing::info!(tx_hash = %tx_hash, "blacklist transaction submitted");

        let receipt = tokio::time::timeout(self.receipt_timeout, pending.get_receipt())
            .await
            .map_err(|_| {
                eyre!(
                    "no receipt for {tx_hash} within {}s",
                    self.receipt_timeout.as_secs()
                )
            })?
            .wrap_err("failed waiting for blacklist receipt")?;

        if !receipt.status() {
            return Err(eyre!("blacklist transaction {tx_hash} reverted"));
        }
        Ok(())
    }
}

/// What happened to the side effect of a detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Monitor mode: recorded in the detection log only.
    Logged,
    /// Blacklist transaction confirmed.
    Blacklisted,
    /// The sink already had the address; nothing was submitted.
    AlreadyBlacklisted,
    /// The sink rejected the request or timed out.
    Failed(String),
}

impl ActionOutcome {
    /// Whether the address can be considered handled.
    pub fn is_actioned(&self) -> bool {
        !matches!(self, ActionOutcome::Failed(_))
    }

    pub fn label(&self) -> String {
        match self {
            ActionOutcome::Logged => "logged".to_string(),
            ActionOutcome::Blacklisted => "blacklisted".to_string(),
            ActionOutcome::AlreadyBlacklisted => "already_blacklisted".to_string(),
            ActionOutcome::Failed(reason) => format!("failed: {reason}"),
        }
    }
}

/// One line of the detection log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// Checksummed address.
    pub address: String,
    pub reasons: Vec<String>,
    pub total_trades: usize,
    pub incoming: usize,
    pub outgoing: usize,
    pub first_seen: u64,
    /// Outcome label, see [`ActionOutcome::label`].
    pub action: String,
}

/// Append-only JSON Lines detection log.
#[derive(Clone, Debug)]
pub struct DetectionLog {
    path: PathBuf,
}

impl DetectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a single line, creating the file if needed.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or written.
    pub fn append(&self, record: &DetectionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).wrap_err("failed to encode detection")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .wrap_err_with(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Reads every record back.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or a line is malformed.
    pub fn read_all(&self) -> Result<Vec<DetectionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("failed to read {}", self.path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).wrap_err("malformed detection record"))
            .collect()
    }
}

/// Joins reasons and truncates them to [`MAX_ONCHAIN_REASON_BYTES`] on a char boundary.
pub fn onchain_reason(reasons: &[String]) -> String {
    let joined = reasons.join(" | ");
    if joined.len() <= MAX_ONCHAIN_REASON_BYTES {
        return joined;
    }
    let mut end = MAX_ONCHAIN_REASON_BYTES;
    while !joined.is_char_boundary(end) {
        end -= 1;
    }
    joined[..end].to_string()
}

/// Performs the detection side effects.
pub struct Dispatcher<K = MonitorOnly> {
    log: DetectionLog,
    sink: Option<K>,
}

impl Dispatcher<MonitorOnly> {
    /// Log-only dispatcher.
    pub fn monitor(log: DetectionLog) -> Self {
        Self { log, sink: None }
    }
}

impl<K: ActionSink> Dispatcher<K> {
    /// Dispatcher that also blacklists through `sink`.
    pub fn with_sink(log: DetectionLog, sink: K) -> Self {
        Self {
            log,
            sink: Some(sink),
        }
    }

    pub fn log(&self) -> &DetectionLog {
        &self.log
    }

    /// Records a positive classification of `address` and runs its side effect.
    ///
    /// In monitor mode the side effect is the detection log line itself, so a
    /// failed append leaves the address pending. With a sink, the log line
    /// only documents the blacklist outcome.
    ///
    /// Returns `None` if the address was already in the detection set.
    #[tracing::instrument(skip_all, fields(address = %address))]
    pub async fn dispatch(
        &self,
        state: &mut GuardState,
        address: Address,
        verdict: &Verdict,
    ) -> Option<ActionOutcome> {
        let reasons = verdict.reasons();
        if !state.mark_detected(address, reasons.clone()) {
            return None;
        }

        let outcome = match &self.sink {
            None => self.append_logged(state, address, &reasons),
            Some(sink) => {
                let outcome = perform(sink, address, &onchain_reason(&reasons)).await;
                let record = detection_record(state, address, &reasons, &outcome);
                if let Err(error) = self.log.append(&record) {
                    tracing::warn!(
                        error = %error,
                        path = %self.log.path().display(),
                        "failed to write detection log"
                    );
                }
                outcome
            }
        };

        tracing::warn!(
            reasons = %reasons.join(" | "),
            total_trades = state.trader(&address).map_or(0, |h| h.trade_count()),
            action = %outcome.label(),
            "bot detected"
        );
        if outcome.is_actioned() {
            state.mark_actioned(address);
        } else {
            tracing::warn!(
                outcome = %outcome.label(),
                "detection action failed; address left pending"
            );
        }

        Some(outcome)
    }

    /// Replays the side effect for detected addresses that were never actioned.
    ///
    /// Detections are not re-evaluated. In monitor mode the missing log line is
    /// written; with a sink the blacklist is resubmitted with the reasons stored
    /// at detection time. Returns how many addresses became actioned.
    pub async fn retry_pending(&self, state: &mut GuardState) -> usize {
        let mut actioned = 0;
        for address in state.pending_actions() {
            let reasons = state.detection_reasons(&address).to_vec();
            let outcome = match &self.sink {
                None => self.append_logged(state, address, &reasons),
                Some(sink) => perform(sink, address, &onchain_reason(&reasons)).await,
            };
            if outcome.is_actioned() {
                state.mark_actioned(address);
                actioned += 1;
                tracing::info!(
                    address = %address,
                    action = %outcome.label(),
                    "pending action completed"
                );
            } else {
                tracing::warn!(
                    address = %address,
                    action = %outcome.label(),
                    "pending action still failing"
                );
            }
        }
        actioned
    }

    /// Monitor-mode side effect: the outcome is whatever the append produced.
    fn append_logged(
        &self,
        state: &GuardState,
        address: Address,
        reasons: &[String],
    ) -> ActionOutcome {
        let record = detection_record(state, address, reasons, &ActionOutcome::Logged);
        match self.log.append(&record) {
            Ok(()) => ActionOutcome::Logged,
            Err(error) => ActionOutcome::Failed(format!("{error:#}")),
        }
    }
}

fn detection_record(
    state: &GuardState,
    address: Address,
    reasons: &[String],
    outcome: &ActionOutcome,
) -> DetectionRecord {
    let (total_trades, incoming, outgoing, first_seen) = state
        .trader(&address)
        .map(|h| (h.trade_count(), h.incoming_count(), h.outgoing_count(), h.first_seen()))
        .unwrap_or_default();
    DetectionRecord {
        timestamp: Utc::now().to_rfc3339(),
        address: address.to_checksum(None),
        reasons: reasons.to_vec(),
        total_trades,
        incoming,
        outgoing,
        first_seen,
        action: outcome.label(),
    }
}

async fn perform<K: ActionSink>(sink: &K, address: Address, reason: &str) -> ActionOutcome {
    match sink.is_blacklisted(address).await {
        Ok(true) => ActionOutcome::AlreadyBlacklisted,
        Ok(false) => match sink.blacklist(address, reason).await {
            Ok(()) => ActionOutcome::Blacklisted,
            Err(error) => ActionOutcome::Failed(format!("{error:#}")),
        },
        Err(error) => ActionOutcome::Failed(format!("idempotency check failed: {error:#}")),
    }
}
