//! ============================================================================
//! Transaction Confirmation Monitor - Push/Poll Race & Retry Policy
//! ============================================================================
//! Resolves a submitted ledger transaction to confirmed/reverted/timed-out:
//! - Push path: websocket signature subscription, resolves on first receipt
//! - Poll path: signature-status polling on a short fixed interval, with one
//!   history-backed escalation before timing out
//! Whichever path resolves first wins; the loser is dropped, not aborted.
//! Also provides error classification and exponential backoff for sends.
//! ============================================================================

use futures_util::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSignatureSubscribeConfig;
use solana_client::rpc_response::RpcSignatureResult;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::Signature;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Outcome of waiting on a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Transaction landed successfully
    Confirmed,
    /// Transaction landed but the program rejected it
    Reverted(String),
    /// Still unconfirmed after the attempt ceiling; may yet confirm
    TimedOut,
}

/// Configuration for confirmation polling and send retries
#[derive(Clone)]
pub struct ConfirmConfig {
    /// Confirmation polling interval
    pub poll_interval_ms: u64,
    /// Maximum confirmation polling attempts before escalation
    pub max_poll_attempts: u32,
    /// Maximum transaction send attempts
    pub max_send_retries: u32,
    /// Base delay between send retries (doubled per attempt)
    pub base_delay_ms: u64,
    /// Cap on the backoff delay
    pub max_delay_ms: u64,
    /// Whether to add jitter to backoff delays
    pub jitter: bool,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_attempts: 30,
            max_send_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Likely transient, should retry
    Retryable,
    /// Permanent, don't retry
    Permanent,
    /// Blockhash expired, need a fresh blockhash
    BlockhashExpired,
    /// Rate limited, back off more aggressively
    RateLimited,
}

/// Classify a send error to determine whether retry is appropriate
pub fn classify_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    if lower.contains("blockhash")
        || lower.contains("block height exceeded")
        || lower.contains("transaction has already been processed")
    {
        return ErrorKind::BlockhashExpired;
    }

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return ErrorKind::RateLimited;
    }

    if lower.contains("insufficient funds")
        || lower.contains("insufficient lamports")
        || lower.contains("invalid signature")
        || lower.contains("invalid account")
        || lower.contains("account not found")
        || lower.contains("program failed")
        || lower.contains("custom program error")
        || lower.contains("simulation failed")
        || lower.contains("rejected")
    {
        return ErrorKind::Permanent;
    }

    if lower.contains("connection")
        || lower.contains("timeout")
        || lower.contains("network")
        || lower.contains("temporary")
        || lower.contains("try again")
    {
        return ErrorKind::Retryable;
    }

    // Default to retryable for unknown errors
    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn backoff_delay(attempt: u32, config: &ConfirmConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% jitter on top of the capped delay
        use rand::Rng;
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Race two confirmation strategies; the first to resolve wins and the other
/// future is simply dropped.
pub async fn first_resolved<A, B>(push: A, poll: B) -> ConfirmOutcome
where
    A: Future<Output = ConfirmOutcome>,
    B: Future<Output = ConfirmOutcome>,
{
    tokio::select! {
        outcome = push => outcome,
        outcome = poll => outcome,
    }
}

/// Confirmation monitor racing a websocket subscription against RPC polling
pub struct ConfirmationMonitor {
    rpc: Arc<RpcClient>,
    ws_url: Option<String>,
    config: ConfirmConfig,
}

impl ConfirmationMonitor {
    pub fn new(rpc: Arc<RpcClient>, ws_url: Option<String>) -> Self {
        Self {
            rpc,
            ws_url,
            config: ConfirmConfig::default(),
        }
    }

    pub fn with_config(rpc: Arc<RpcClient>, ws_url: Option<String>, config: ConfirmConfig) -> Self {
        Self {
            rpc,
            ws_url,
            config,
        }
    }

    /// Wait for the transaction to resolve. A `TimedOut` outcome means the
    /// outcome is unknown — callers keep the task pending rather than
    /// discarding it.
    pub async fn confirm(&self, signature: &Signature) -> ConfirmOutcome {
        match &self.ws_url {
            Some(ws_url) => {
                first_resolved(
                    self.push_path(ws_url, signature),
                    self.poll_path(signature),
                )
                .await
            }
            None => self.poll_path(signature).await,
        }
    }

    /// Push path: subscribe to the signature and resolve on the first
    /// processed notification. On subscription failure this path never
    /// resolves, leaving the poll path to win the race.
    async fn push_path(&self, ws_url: &str, signature: &Signature) -> ConfirmOutcome {
        let client = match PubsubClient::new(ws_url).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Signature subscription unavailable: {}", e);
                return std::future::pending().await;
            }
        };

        let config = RpcSignatureSubscribeConfig {
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        };

        let (mut stream, _unsubscribe) = match client.signature_subscribe(signature, Some(config)).await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Signature subscribe failed: {}", e);
                return std::future::pending().await;
            }
        };

        while let Some(response) = stream.next().await {
            if let RpcSignatureResult::ProcessedSignature(processed) = response.value {
                return match processed.err {
                    None => {
                        info!("Transaction confirmed via subscription: {}", signature);
                        ConfirmOutcome::Confirmed
                    }
                    Some(err) => {
                        warn!("Transaction reverted via subscription: {:?}", err);
                        ConfirmOutcome::Reverted(err.to_string())
                    }
                };
            }
        }

        // Stream ended without a notification; let the poll path decide
        std::future::pending().await
    }

    /// Poll path: bounded signature-status polling, then one history-backed
    /// status fetch before giving up.
    async fn poll_path(&self, signature: &Signature) -> ConfirmOutcome {
        debug!("Polling confirmation for {}", signature);

        for attempt in 0..self.config.max_poll_attempts {
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;

            match self.rpc.get_signature_status(signature).await {
                Ok(Some(status)) => match status {
                    Ok(()) => {
                        info!(
                            "Transaction confirmed: {} (poll attempt {})",
                            signature,
                            attempt + 1
                        );
                        return ConfirmOutcome::Confirmed;
                    }
                    Err(e) => {
                        warn!("Transaction failed on-chain: {}", e);
                        return ConfirmOutcome::Reverted(e.to_string());
                    }
                },
                Ok(None) => {
                    debug!("Transaction not yet confirmed (attempt {})", attempt + 1);
                }
                Err(e) => {
                    warn!("Error checking status (attempt {}): {}", attempt + 1, e);
                    // Continue polling on RPC errors
                }
            }
        }

        // Escalation: one history-backed fetch catches signatures that have
        // already aged out of the recent-status cache
        match self
            .rpc
            .get_signature_status_with_commitment_and_history(
                signature,
                CommitmentConfig::confirmed(),
                true,
            )
            .await
        {
            Ok(Some(Ok(()))) => {
                info!("Transaction confirmed via history lookup: {}", signature);
                return ConfirmOutcome::Confirmed;
            }
            Ok(Some(Err(e))) => {
                warn!("Transaction failed on-chain (history): {}", e);
                return ConfirmOutcome::Reverted(e.to_string());
            }
            Ok(None) => {}
            Err(e) => warn!("History lookup failed for {}: {}", signature, e),
        }

        warn!(
            "Confirmation timed out for {} after {} attempts",
            signature, self.config.max_poll_attempts
        );
        ConfirmOutcome::TimedOut
    }
}
