//! ============================================================================
//! TUNEMINT-CORE: Generation Orchestration Engine
//! ============================================================================
//! Drives a user-initiated "create song" action through three independently
//! failing systems — the asynchronous generation service, the on-chain
//! generation ledger, and content-addressed storage — and presents one
//! consistent, de-duplicated view of in-flight and completed work:
//! - Suno-style generation API client (start / status / bounded poll)
//! - Solana ledger gateway (paid request + completion writes, reads)
//! - Confirmation monitor racing a subscription against RPC polling
//! - IPFS pinning client for artifacts and provenance metadata
//! - Reconciler + orchestrator with a single owned state container
//! ============================================================================

pub mod callback;
pub mod config;
pub mod confirm;
pub mod db;
pub mod ledger;
pub mod ledger_program;
pub mod library;
pub mod orchestrator;
pub mod reconcile;
pub mod storage;
pub mod suno;
pub mod types;

#[cfg(test)]
mod testutil;

// Re-export main types for convenience
pub use confirm::{ConfirmOutcome, ConfirmationMonitor};
pub use db::TaskDb;
pub use ledger::{Ledger, SolanaLedger};
pub use library::MusicLibrary;
pub use orchestrator::{GenerationOrchestrator, OrchestratorConfig};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use storage::{ArtifactStore, PinataClient};
pub use suno::{GenerationService, SunoClient};
pub use types::*;
