//! ============================================================================
//! Ledger Gateway - Request & Completion Writes, Membership Reads
//! ============================================================================
//! Handles all chain interactions for the generation ledger:
//! - request_generation: pays the mode-dependent fee, embeds the service
//!   task id so ledger and service agree on the correlation key
//! - record_completion: writes final metadata; at most once per request
//! - Read queries: requested/completed task-id lists, daily quota
//! - Local signing (keys never leave the device)
//! ============================================================================

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    message::Message,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::confirm::{
    backoff_delay, classify_error, ConfirmConfig, ConfirmOutcome, ConfirmationMonitor, ErrorKind,
};
use crate::ledger_program::{
    build_record_completion_ix, build_request_generation_ix, fetch_ledger_config,
    fetch_requests_by_owner, LedgerConfig, ERR_ALREADY_COMPLETED,
};
use crate::types::{CompletionRecord, GenerationParams, Result, TunemintError};

/// Flat allowance for transaction fees on top of the generation fee
const TX_OVERHEAD_LAMPORTS: u64 = 50_000;

/// Abstraction over the ledger, so the orchestrator and reconciler can be
/// exercised against in-memory fakes.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Bound wallet address; `WalletNotConnected` if none.
    fn wallet_address(&self) -> Result<String>;

    /// Submit the paid request-generation call. Returns the transaction
    /// signature. Must not be called without a valid task id.
    async fn request_generation(&self, params: &GenerationParams, task_id: &str) -> Result<String>;

    /// Write the completion record. The program rejects a second completion
    /// for an already-completed request.
    async fn record_completion(&self, record: &CompletionRecord) -> Result<String>;

    /// Task ids the ledger has recorded requests for.
    async fn user_task_ids(&self) -> Result<Vec<String>>;

    /// Task ids the ledger has recorded completions for.
    async fn user_completed_task_ids(&self) -> Result<Vec<String>>;

    /// Generations remaining under today's quota.
    async fn daily_generations_left(&self) -> Result<u32>;

    /// Resolve a submitted transaction to confirmed/reverted/timed-out.
    async fn await_confirmation(&self, tx_hash: &str) -> Result<ConfirmOutcome>;
}

/// Map a send/simulation error string into the caller-facing taxonomy
pub fn map_ledger_error(task_id: &str, error: &str) -> TunemintError {
    let lower = error.to_lowercase();
    if error.contains(ERR_ALREADY_COMPLETED) {
        TunemintError::AlreadyCompleted(task_id.to_string())
    } else if lower.contains("rejected") || lower.contains("declined") {
        TunemintError::UserRejected
    } else if lower.contains("insufficient funds") || lower.contains("insufficient lamports") {
        TunemintError::InsufficientBalance {
            needed: 0,
            available: 0,
        }
    } else {
        TunemintError::LedgerReverted(error.to_string())
    }
}

/// Ledger gateway backed by a Solana RPC endpoint
pub struct SolanaLedger {
    rpc: Arc<RpcClient>,
    monitor: ConfirmationMonitor,
    /// Local keypair for signing (never leaves the device)
    keypair: Arc<RwLock<Option<Keypair>>>,
    config: ConfirmConfig,
}

impl SolanaLedger {
    pub fn new(rpc_url: &str, ws_url: Option<String>) -> Self {
        let rpc = Arc::new(RpcClient::new_with_commitment(
            rpc_url.to_string(),
            CommitmentConfig::confirmed(),
        ));
        let config = ConfirmConfig::default();
        let monitor = ConfirmationMonitor::with_config(rpc.clone(), ws_url, config.clone());
        Self {
            rpc,
            monitor,
            keypair: Arc::new(RwLock::new(None)),
            config,
        }
    }

    /// Load a keypair from a JSON byte-array file (the standard CLI wallet
    /// format). Returns the wallet address.
    pub async fn load_keypair(&self, keypair_path: &str) -> Result<String> {
        info!("Loading keypair from: {}", keypair_path);

        let keypair_data = std::fs::read_to_string(keypair_path)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("Failed to read keypair: {}", e)))?;

        let bytes: Vec<u8> = serde_json::from_str(&keypair_data)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("Failed to parse keypair: {}", e)))?;

        let keypair = Keypair::try_from(bytes.as_slice())
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("Invalid keypair bytes: {}", e)))?;

        let address = keypair.pubkey().to_string();
        *self.keypair.write().await = Some(keypair);

        info!("Loaded wallet: {}", address);
        Ok(address)
    }

    /// Wallet balance in lamports
    pub async fn balance_lamports(&self) -> Result<u64> {
        let pubkey = {
            let guard = self.keypair.read().await;
            guard
                .as_ref()
                .map(|kp| kp.pubkey())
                .ok_or(TunemintError::WalletNotConnected)?
        };
        self.rpc
            .get_balance(&pubkey)
            .await
            .map_err(|e| TunemintError::Network(format!("balance query failed: {}", e)))
    }

    pub async fn fetch_config(&self) -> Result<LedgerConfig> {
        Ok(fetch_ledger_config(&self.rpc).await?)
    }

    /// Send a transaction with bounded retry: permanent errors surface
    /// immediately, expired blockhashes are refreshed on the next attempt,
    /// rate limits back off at the cap.
    async fn send_with_retry(
        &self,
        keypair: &Keypair,
        instructions: &[Instruction],
        task_id: &str,
    ) -> Result<Signature> {
        let mut last_error = String::new();

        for attempt in 0..self.config.max_send_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, &self.config);
                debug!("Retry attempt {} after {:?} delay", attempt, delay);
                sleep(delay).await;
            }

            let blockhash = self
                .rpc
                .get_latest_blockhash()
                .await
                .map_err(|e| TunemintError::Network(format!("Failed to get blockhash: {}", e)))?;

            let message = Message::new(instructions, Some(&keypair.pubkey()));
            let tx = Transaction::new(&[keypair], message, blockhash);

            match self.rpc.send_transaction(&tx).await {
                Ok(signature) => {
                    info!("Transaction sent: {} (attempt {})", signature, attempt + 1);
                    return Ok(signature);
                }
                Err(e) => {
                    let error_str = e.to_string();
                    let error_kind = classify_error(&error_str);

                    warn!(
                        "Send attempt {} failed ({:?}): {}",
                        attempt + 1,
                        error_kind,
                        error_str
                    );

                    match error_kind {
                        ErrorKind::Permanent => return Err(map_ledger_error(task_id, &error_str)),
                        ErrorKind::BlockhashExpired => {
                            // Loop refetches a fresh blockhash
                        }
                        ErrorKind::RateLimited => {
                            sleep(Duration::from_millis(self.config.max_delay_ms)).await;
                        }
                        ErrorKind::Retryable => {}
                    }

                    last_error = error_str;
                }
            }
        }

        Err(TunemintError::Network(format!(
            "Max retries ({}) exceeded. Last error: {}",
            self.config.max_send_retries, last_error
        )))
    }
}

#[async_trait]
impl Ledger for SolanaLedger {
    fn wallet_address(&self) -> Result<String> {
        // try_read to stay sync — returns not-connected if locked or unset
        self.keypair
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|kp| kp.pubkey().to_string()))
            .ok_or(TunemintError::WalletNotConnected)
    }

    async fn request_generation(&self, params: &GenerationParams, task_id: &str) -> Result<String> {
        let keypair_guard = self.keypair.read().await;
        let keypair = keypair_guard
            .as_ref()
            .ok_or(TunemintError::WalletNotConnected)?;

        // Fee comes from the two on-chain constants unless overridden
        let fee_lamports = match params.fee_override_lamports {
            Some(fee) => fee,
            None => fetch_ledger_config(&self.rpc)
                .await?
                .fee_for(params.custom_mode),
        };

        let balance = self
            .rpc
            .get_balance(&keypair.pubkey())
            .await
            .map_err(|e| TunemintError::Network(format!("balance query failed: {}", e)))?;
        let needed = fee_lamports + TX_OVERHEAD_LAMPORTS;
        if balance < needed {
            return Err(TunemintError::InsufficientBalance {
                needed,
                available: balance,
            });
        }

        info!(
            "Recording generation request for task {} (fee {} lamports)",
            task_id, fee_lamports
        );

        let ix = build_request_generation_ix(&keypair.pubkey(), task_id, params, fee_lamports);
        let signature = self.send_with_retry(keypair, &[ix], task_id).await?;

        info!("Generation request recorded: {}", signature);
        Ok(signature.to_string())
    }

    async fn record_completion(&self, record: &CompletionRecord) -> Result<String> {
        let keypair_guard = self.keypair.read().await;
        let keypair = keypair_guard
            .as_ref()
            .ok_or(TunemintError::WalletNotConnected)?;

        info!("Recording completion for task {}", record.task_id);

        let ix = build_record_completion_ix(&keypair.pubkey(), record);
        let signature = self.send_with_retry(keypair, &[ix], &record.task_id).await?;

        info!("Completion recorded: {}", signature);
        Ok(signature.to_string())
    }

    async fn user_task_ids(&self) -> Result<Vec<String>> {
        let pubkey = solana_sdk::pubkey::Pubkey::from_str(&self.wallet_address()?)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("bad wallet address: {}", e)))?;
        let requests = fetch_requests_by_owner(&self.rpc, &pubkey, None).await?;
        Ok(requests.into_iter().map(|r| r.task_id).collect())
    }

    async fn user_completed_task_ids(&self) -> Result<Vec<String>> {
        let pubkey = solana_sdk::pubkey::Pubkey::from_str(&self.wallet_address()?)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("bad wallet address: {}", e)))?;
        let requests = fetch_requests_by_owner(&self.rpc, &pubkey, Some(true)).await?;
        Ok(requests.into_iter().map(|r| r.task_id).collect())
    }

    async fn daily_generations_left(&self) -> Result<u32> {
        let pubkey = solana_sdk::pubkey::Pubkey::from_str(&self.wallet_address()?)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("bad wallet address: {}", e)))?;

        let config = fetch_ledger_config(&self.rpc).await?;
        let requests = fetch_requests_by_owner(&self.rpc, &pubkey, None).await?;

        let midnight = chrono::Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let today = requests
            .iter()
            .filter(|r| r.created_at >= midnight)
            .count() as u32;

        Ok(config.daily_limit.saturating_sub(today))
    }

    async fn await_confirmation(&self, tx_hash: &str) -> Result<ConfirmOutcome> {
        let signature = Signature::from_str(tx_hash)
            .map_err(|e| TunemintError::Internal(anyhow::anyhow!("bad signature: {}", e)))?;
        Ok(self.monitor.confirm(&signature).await)
    }
}
