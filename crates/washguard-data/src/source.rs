//! Alloy RPC integration for fetching token `Transfer` events.
//!
//! [`RpcEventSource`] talks to one endpoint. [`FallbackSource`] wraps an
//! ordered list of sources and tries them one after another for each chunk,
//! recording every attempt.

use std::future::Future;

use alloy::network::Ethereum;
use alloy::primitives::Address;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;
use eyre::{eyre, Context, Result};

use crate::types::TransferEvent;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// A feed of ordered token transfers for a block range.
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Human-readable endpoint label for logs and attempt reports.
    fn label(&self) -> &str;

    /// Current chain head.
    async fn head_block(&self) -> Result<u64>;

    /// All transfers in `[from_block, to_block]`, ordered by block and log index.
    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>>;
}

/// Fetches `Transfer` logs of one token contract through a single RPC endpoint.
pub struct RpcEventSource {
    provider: ProviderType,
    token: Address,
    label: String,
}

impl RpcEventSource {
    /// Creates a source and tests RPC connectivity via `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the endpoint does not answer.
    #[tracing::instrument(skip_all, fields(rpc_url = %rpc_url))]
    pub async fn new(rpc_url: &str, token: Address) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);

        let block_number = provider
            .get_block_number()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;

        tracing::info!(
            rpc_url = %rpc_url,
            latest_block = block_number,
            "RPC connection successful"
        );

        Ok(Self {
            provider,
            token,
            label: rpc_url.to_string(),
        })
    }
}

impl EventSource for RpcEventSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn head_block(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .wrap_err("eth_blockNumber failed")
    }

    #[tracing::instrument(skip(self), fields(endpoint = %self.label))]
    async fn transfers(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferEvent>> {
        let filter = Filter::new()
            .address(self.token)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err_with(|| format!("eth_getLogs failed for blocks {from_block}..={to_block}"))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let block_number = log
                .block_number
                .ok_or_else(|| eyre!("transfer log without block number"))?;
            let log_index = log.log_index.unwrap_or_default();
            let decoded = log
                .log_decode::<Transfer>()
                .wrap_err_with(|| format!("malformed Transfer log in block {block_number}"))?;
            let transfer = decoded.inner.data;
            events.push(TransferEvent {
                from: transfer.from,
                to: transfer.to,
                amount: transfer.value,
                block_number,
                log_index,
            });
        }

        sort_events(&mut events);
        tracing::debug!(from_block, to_block, events = events.len(), "fetched transfers");
        Ok(events)
    }
}

/// Orders events by `(block_number, log_index)`.
pub fn sort_events(events: &mut [TransferEvent]) {
    events.sort_by_key(|event| (event.block_number, event.log_index));
}

/// Result of one endpoint attempt within a chunk fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAttempt {
    /// Label of the endpoint that was tried.
    pub endpoint: String,
    /// Error text when the attempt failed, `None` on success.
    pub error: Option<String>,
}

impl EndpointAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of fetching one chunk across all endpoints.
#[derive(Clone, Debug, Default)]
pub struct ChunkFetch {
    /// Every attempt made, in priority order.
    pub attempts: Vec<EndpointAttempt>,
    /// Events from the first successful endpoint, `None` if all failed.
    pub events: Option<Vec<TransferEvent>>,
}

/// Ordered list of interchangeable event sources.
///
/// Endpoints are tried sequentially in priority order. The first success wins;
/// data from failed attempts is dropped and never merged.
pub struct FallbackSource<S> {
    sources: Vec<S>,
}

impl<S: EventSource> FallbackSource<S> {
    pub fn new(sources: Vec<S>) -> Self {
        Self { sources }
    }

    /// Highest-priority endpoint; the one every chunk is tried on first.
    pub fn primary(&self) -> Option<&S> {
        self.sources.first()
    }

    /// Endpoint labels in priority order.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> + '_ {
        self.sources.iter().map(|source| source.label())
    }

    /// Chain head from the first endpoint that answers.
    ///
    /// # Errors
    /// Returns error if no endpoint reports a head block.
    pub async fn head_block(&self) -> Result<u64> {
        for source in &self.sources {
            match source.head_block().await {
                Ok(head) => return Ok(head),
                Err(error) => {
                    tracing::warn!(endpoint = source.label(), error = %error, "head lookup failed");
                }
            }
        }
        Err(eyre!(
            "no endpoint reported a head block ({} configured)",
            self.sources.len()
        ))
    }

    /// Fetches `[from_block, to_block]` from the first endpoint that succeeds.
    pub async fn fetch_chunk(&self, from_block: u64, to_block: u64) -> ChunkFetch {
        let mut outcome = ChunkFetch::default();
        for source in &self.sources {
            match source.transfers(from_block, to_block).await {
                Ok(mut events) => {
                    sort_events(&mut events);
                    outcome.attempts.push(EndpointAttempt {
                        endpoint: source.label().to_string(),
                        error: None,
                    });
                    outcome.events = Some(events);
                    return outcome;
                }
                Err(error) => {
                    tracing::warn!(
                        endpoint = source.label(),
                        from_block,
                        to_block,
                        error = %error,
                        "endpoint failed, trying next"
                    );
                    outcome.attempts.push(EndpointAttempt {
                        endpoint: source.label().to_string(),
                        error: Some(format!("{error:#}")),
                    });
                }
            }
        }
        outcome
    }
}

/// Connects to every URL in priority order, keeping those that answer.
///
/// The first reachable URL becomes the [`FallbackSource::primary`] endpoint.
///
/// # Errors
/// Returns error when none of the endpoints is reachable.
pub async fn connect_all(
    rpc_urls: &[String],
    token: Address,
) -> Result<FallbackSource<RpcEventSource>> {
    connect_with(rpc_urls, |url| async move { RpcEventSource::new(&url, token).await }).await
}

async fn connect_with<S, F, Fut>(rpc_urls: &[String], connect: F) -> Result<FallbackSource<S>>
where
    S: EventSource,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<S>>,
{
    let mut sources = Vec::new();
    for url in rpc_urls {
        match connect(url.clone()).await {
            Ok(source) => sources.push(source),
            Err(error) => tracing::warn!(rpc_url = %url, error = %error, "endpoint unreachable"),
        }
    }
    if sources.is_empty() {
        return Err(eyre!(
            "none of the {} configured RPC endpoints is reachable",
            rpc_urls.len()
        ));
    }
    Ok(FallbackSource::new(sources))
}
