//! ============================================================================
//! Tunemint Ledger — On-Chain Program Integration
//! ============================================================================
//! Constants, PDA derivation, account deserialization, and instruction
//! builders for the Tunemint generation-ledger Solana program.
//!
//! Program ID: 2szgHq5b84mCsrEjCsL3vuAp8xw3A8mnFZ39BN3PY82t
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};
use std::str::FromStr;

use crate::types::{CompletionRecord, GenerationParams};

// System program ID — avoid deprecated solana_sdk::system_program
const SYSTEM_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("11111111111111111111111111111111");

// ============================================================================
// Constants
// ============================================================================

/// Generation-ledger program ID (same on devnet and mainnet)
pub const PROGRAM_ID: &str = "2szgHq5b84mCsrEjCsL3vuAp8xw3A8mnFZ39BN3PY82t";

/// Fixed byte offset of the requester pubkey within a request account
pub const REQUEST_OWNER_OFFSET: usize = 8;

/// Fixed byte offset of the completed flag within a request account
pub const REQUEST_COMPLETED_OFFSET: usize = 40;

/// Anchor custom error code for "completion already recorded" (6001)
pub const ERR_ALREADY_COMPLETED: &str = "custom program error: 0x1771";

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

pub fn program_id() -> Pubkey {
    Pubkey::from_str(PROGRAM_ID).expect("Invalid ledger program ID")
}

// ============================================================================
// Discriminators
// ============================================================================

/// Compute the 8-byte Anchor instruction discriminator.
/// Format: SHA256("global:<instruction_name>")[0..8]
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let input = format!("global:{}", name);
    let hash = Sha256::digest(input.as_bytes());
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Compute the 8-byte Anchor account discriminator.
/// Format: SHA256("account:<AccountName>")[0..8]
pub fn account_discriminator(name: &str) -> [u8; 8] {
    let input = format!("account:{}", name);
    let hash = Sha256::digest(input.as_bytes());
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

fn request_discriminator() -> [u8; 8] {
    account_discriminator("GenerationRequest")
}

fn config_discriminator() -> [u8; 8] {
    account_discriminator("LedgerConfig")
}

// ============================================================================
// PDA Derivation
// ============================================================================

/// Request accounts are keyed by the service-minted task id. Task ids can
/// exceed the 32-byte seed limit, so the seed is the SHA256 of the id.
pub fn derive_request_pda(task_id: &str) -> (Pubkey, u8) {
    let seed: [u8; 32] = Sha256::digest(task_id.as_bytes()).into();
    Pubkey::find_program_address(&[b"request", &seed], &program_id())
}

pub fn derive_config_pda() -> (Pubkey, u8) {
    Pubkey::find_program_address(&[b"config"], &program_id())
}

pub fn derive_treasury_pda() -> (Pubkey, u8) {
    Pubkey::find_program_address(&[b"treasury"], &program_id())
}

// ============================================================================
// On-Chain Accounts
// ============================================================================

/// Global fee/limit configuration held in the config PDA.
///
/// Account layout:
///   [0..8]   discriminator
///   [8..40]  authority (Pubkey)
///   [40..48] simple_fee_lamports (u64 LE)
///   [48..56] advanced_fee_lamports (u64 LE)
///   [56..60] daily_limit (u32 LE)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub simple_fee_lamports: u64,
    pub advanced_fee_lamports: u64,
    pub daily_limit: u32,
}

impl LedgerConfig {
    pub fn from_account_data(data: &[u8]) -> Result<Self> {
        if data.len() < 60 {
            return Err(anyhow!("Config account too short: {} bytes", data.len()));
        }
        if data[0..8] != config_discriminator() {
            return Err(anyhow!("Config discriminator mismatch"));
        }
        Ok(Self {
            simple_fee_lamports: u64::from_le_bytes(data[40..48].try_into()?),
            advanced_fee_lamports: u64::from_le_bytes(data[48..56].try_into()?),
            daily_limit: u32::from_le_bytes(data[56..60].try_into()?),
        })
    }

    /// Fee owed for one request under the given mode
    pub fn fee_for(&self, custom_mode: bool) -> u64 {
        if custom_mode {
            self.advanced_fee_lamports
        } else {
            self.simple_fee_lamports
        }
    }
}

/// Deserialized generation request from on-chain account data.
///
/// Account layout (fixed prefix, variable-length task id last):
///   [0..8]   discriminator
///   [8..40]  requester (Pubkey)
///   [40]     completed flag (0/1)
///   [41]     custom_mode flag (0/1)
///   [42..50] created_at (i64 LE)
///   [50..58] fee_lamports (u64 LE)
///   [58..62] task id length (u32 LE)
///   [62..]   task id bytes (utf-8)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequestAccount {
    pub pda: String,
    pub requester: String,
    pub completed: bool,
    pub custom_mode: bool,
    pub created_at: i64,
    pub fee_lamports: u64,
    pub task_id: String,
}

impl GenerationRequestAccount {
    pub fn from_account_data(data: &[u8], pda: &Pubkey) -> Result<Self> {
        if data.len() < 62 {
            return Err(anyhow!("Request account too short: {} bytes", data.len()));
        }
        if data[0..8] != request_discriminator() {
            return Err(anyhow!("Request discriminator mismatch"));
        }

        let requester = Pubkey::try_from(&data[8..40])
            .map_err(|e| anyhow!("Invalid requester pubkey: {}", e))?;
        let completed = data[REQUEST_COMPLETED_OFFSET] == 1;
        let custom_mode = data[41] == 1;
        let created_at = i64::from_le_bytes(data[42..50].try_into()?);
        let fee_lamports = u64::from_le_bytes(data[50..58].try_into()?);

        let id_len = u32::from_le_bytes(data[58..62].try_into()?) as usize;
        if data.len() < 62 + id_len {
            return Err(anyhow!("Request account truncated task id"));
        }
        let task_id = String::from_utf8(data[62..62 + id_len].to_vec())
            .map_err(|e| anyhow!("Invalid task id bytes: {}", e))?;

        Ok(Self {
            pda: pda.to_string(),
            requester: requester.to_string(),
            completed,
            custom_mode,
            created_at,
            fee_lamports,
            task_id,
        })
    }
}

// ============================================================================
// Instruction Builders
// ============================================================================

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            put_str(buf, s);
        }
        None => buf.push(0),
    }
}

/// Build a `request_generation` instruction. The paid fee is moved from the
/// requester to the treasury PDA by the program.
///
/// Accounts:
///   0. [writable] Request PDA (derived from task id)
///   1. []         Config PDA
///   2. [writable] Treasury PDA
///   3. [signer]   Requester (pays the fee)
///   4. []         System program
pub fn build_request_generation_ix(
    requester: &Pubkey,
    task_id: &str,
    params: &GenerationParams,
    fee_lamports: u64,
) -> Instruction {
    let (request_pda, _) = derive_request_pda(task_id);
    let (config_pda, _) = derive_config_pda();
    let (treasury_pda, _) = derive_treasury_pda();

    let disc = instruction_discriminator("request_generation");

    let mut data = Vec::with_capacity(256);
    data.extend_from_slice(&disc);
    put_str(&mut data, task_id);
    put_str(&mut data, &params.prompt);
    put_opt_str(&mut data, params.style.as_deref());
    data.push(params.instrumental as u8);
    data.push(params.custom_mode as u8);
    put_opt_str(&mut data, params.title.as_deref());
    put_opt_str(&mut data, params.vocal_gender.map(|g| g.as_str()));
    put_opt_str(&mut data, params.lyrics_mode.as_deref());
    data.extend_from_slice(&fee_lamports.to_le_bytes());

    Instruction {
        program_id: program_id(),
        accounts: vec![
            AccountMeta::new(request_pda, false),
            AccountMeta::new_readonly(config_pda, false),
            AccountMeta::new(treasury_pda, false),
            AccountMeta::new(*requester, true), // signer
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
        data,
    }
}

/// Build a `record_completion` instruction. The program rejects a second
/// completion for an already-completed request.
///
/// Accounts:
///   0. [writable] Request PDA
///   1. [signer]   Requester
pub fn build_record_completion_ix(requester: &Pubkey, record: &CompletionRecord) -> Instruction {
    let (request_pda, _) = derive_request_pda(&record.task_id);

    let disc = instruction_discriminator("record_completion");

    let mut data = Vec::with_capacity(256);
    data.extend_from_slice(&disc);
    put_str(&mut data, &record.metadata_uri);
    data.extend_from_slice(&record.duration_secs.to_le_bytes());
    put_str(&mut data, &record.genre_tags.join(","));
    put_str(&mut data, &record.model_name);
    put_str(&mut data, &record.create_time);

    Instruction {
        program_id: program_id(),
        accounts: vec![
            AccountMeta::new(request_pda, false),
            AccountMeta::new(*requester, true), // signer
        ],
        data,
    }
}

// ============================================================================
// RPC Query Helpers
// ============================================================================

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::commitment_config::CommitmentConfig;

/// Fetch the global fee/limit configuration.
pub async fn fetch_ledger_config(rpc: &RpcClient) -> Result<LedgerConfig> {
    let (config_pda, _) = derive_config_pda();
    let account = rpc
        .get_account(&config_pda)
        .await
        .map_err(|e| anyhow!("Failed to fetch ledger config: {}", e))?;
    LedgerConfig::from_account_data(&account.data)
}

/// Fetch all generation requests owned by `requester`, optionally filtered by
/// the completed flag.
pub async fn fetch_requests_by_owner(
    rpc: &RpcClient,
    requester: &Pubkey,
    completed: Option<bool>,
) -> Result<Vec<GenerationRequestAccount>> {
    let mut filters = vec![
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(0, request_discriminator().to_vec())),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            REQUEST_OWNER_OFFSET,
            requester.to_bytes().to_vec(),
        )),
    ];
    if let Some(flag) = completed {
        filters.push(RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            REQUEST_COMPLETED_OFFSET,
            vec![flag as u8],
        )));
    }

    let config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    let accounts = rpc
        .get_program_accounts_with_config(&program_id(), config)
        .await
        .map_err(|e| anyhow!("Failed to fetch program accounts: {}", e))?;

    let mut requests = Vec::new();
    for (pubkey, account) in accounts.iter() {
        match GenerationRequestAccount::from_account_data(&account.data, pubkey) {
            Ok(req) => requests.push(req),
            Err(e) => tracing::warn!("Failed to deserialize request {}: {}", pubkey, e),
        }
    }

    // Newest first
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(requests)
}

/// Fetch a single request account by task id.
pub async fn fetch_request_by_task_id(
    rpc: &RpcClient,
    task_id: &str,
) -> Result<Option<GenerationRequestAccount>> {
    let (pda, _) = derive_request_pda(task_id);

    match rpc.get_account(&pda).await {
        Ok(account) => {
            let req = GenerationRequestAccount::from_account_data(&account.data, &pda)?;
            Ok(Some(req))
        }
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Tests
// ============================================================================
