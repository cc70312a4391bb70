//! ============================================================================
//! Generation Orchestrator - Top-Level Entry Point
//! ============================================================================
//! Sequences one "create song" action across the three external systems:
//!   start generation -> record request on ledger -> register pending ->
//!   schedule reconciliation triggers (push channel + two delayed polls)
//! and exposes the de-duplicated sorted collection, the pending-task set, and
//! the per-task status map to all consumers.
//! ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::confirm::ConfirmOutcome;
use crate::db::TaskDb;
use crate::ledger::Ledger;
use crate::library::MusicLibrary;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::storage::ArtifactStore;
use crate::suno::GenerationService;
use crate::types::{
    CompletionEvent, GenerationParams, GenerationTask, MusicArtifact, Result, ServiceStatus,
    TaskLifecycle, TaskStatusEntry, TunemintError,
};

/// Scheduling knobs for the per-task safety-net polls
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Delayed reconciliation attempts per task: a short and a long horizon
    pub recheck_delays: [Duration; 2],
    /// Attempt ceiling for each bounded poll
    pub poll_attempts: u32,
    /// Callback URL advertised to the generation service, if a listener runs
    pub callback_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            recheck_delays: [Duration::from_secs(45), Duration::from_secs(180)],
            poll_attempts: 20,
            callback_url: None,
        }
    }
}

pub struct GenerationOrchestrator {
    service: Arc<dyn GenerationService>,
    ledger: Arc<dyn Ledger>,
    reconciler: Reconciler,
    library: Arc<RwLock<MusicLibrary>>,
    db: Option<Arc<TaskDb>>,
    config: OrchestratorConfig,
}

impl GenerationOrchestrator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ArtifactStore>,
        db: Option<Arc<TaskDb>>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let library = Arc::new(RwLock::new(MusicLibrary::new()));
        let reconciler = Reconciler::new(ledger.clone(), store, library.clone());
        Arc::new(Self {
            service,
            ledger,
            reconciler,
            library,
            db,
            config,
        })
    }

    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Drive one generation request. Returns the service-minted task id; the
    /// artifacts arrive later through reconciliation. Errors before the task
    /// is registered are fatal to this call and nothing is left behind.
    pub async fn generate(self: &Arc<Self>, params: GenerationParams) -> Result<String> {
        // Preflight: a bound wallet and remaining quota, checked before any
        // external state is touched
        self.ledger.wallet_address()?;
        match self.ledger.daily_generations_left().await {
            Ok(0) => return Err(TunemintError::QuotaExhausted),
            Ok(left) => debug!("{} generations left today", left),
            Err(e) => warn!("Quota check failed, proceeding: {}", e),
        }

        // The task id must exist before the ledger call that embeds it
        let task_id = self
            .service
            .start_generation(&params, self.config.callback_url.as_deref())
            .await?;

        let request_tx = self.ledger.request_generation(&params, &task_id).await?;

        // Register as pending immediately, before confirmation, so consumers
        // see progress without waiting
        let mut task = GenerationTask::new(task_id.as_str());
        task.request_tx = Some(request_tx.clone());
        self.library.write().await.register_pending(task.clone());
        if let Some(db) = &self.db {
            if let Err(e) = db.store_pending(&task) {
                warn!("Failed to journal pending task {}: {}", task_id, e);
            }
        }

        info!("Task {} registered pending (request tx {})", task_id, request_tx);

        // Confirmation monitor runs alongside; a timeout never removes the task
        let this = Arc::clone(self);
        let confirm_task = task_id.clone();
        tokio::spawn(async move {
            this.monitor_confirmation(confirm_task, request_tx).await;
        });

        // Two delayed reconciliation attempts as a safety net alongside any
        // pushed callback — a fixed schedule, not an open-ended retry loop
        for delay in self.config.recheck_delays {
            let this = Arc::clone(self);
            let recheck_task = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = this.recheck(&recheck_task).await {
                    warn!("Scheduled recheck for {} failed: {}", recheck_task, e);
                }
            });
        }

        Ok(task_id)
    }

    /// Entry point for the push channel: a completion payload delivered by
    /// the generation service's callback.
    pub async fn handle_callback(&self, event: CompletionEvent) -> Result<ReconcileOutcome> {
        debug!("Callback received for task {}", event.task_id);
        let task_id = event.task_id.clone();
        let outcome = self.reconciler.process(event).await?;
        self.finalize(&task_id).await;
        Ok(outcome)
    }

    /// Manual re-check for a task whose results never arrived. Skipped when
    /// the collection already holds the full batch.
    pub async fn check_missing_task(&self, task_id: &str) -> Result<()> {
        if self.is_satisfied(task_id).await {
            debug!("Task {} already satisfied, skipping re-check", task_id);
            return Ok(());
        }

        let event = self.service.get_task_status(task_id).await?;
        self.reconciler.process(event).await?;
        self.finalize(task_id).await;
        Ok(())
    }

    /// Idempotent de-duplication pass over the visible collection.
    pub async fn deduplicate(&self) {
        self.library.write().await.deduplicate();
    }

    /// Generations remaining under today's quota (ledger read).
    pub async fn daily_generations_left(&self) -> Result<u32> {
        self.ledger.daily_generations_left().await
    }

    /// Pull the ledger's requested/completed task-id lists — the
    /// authoritative membership source for the visible collection.
    pub async fn refresh_membership(&self) -> Result<()> {
        let requested = self.ledger.user_task_ids().await?;
        let completed = self.ledger.user_completed_task_ids().await?;
        debug!(
            "Membership refreshed: {} requested, {} completed",
            requested.len(),
            completed.len()
        );
        self.library
            .write()
            .await
            .set_ledger_membership(requested, completed);
        Ok(())
    }

    /// Re-register journaled pending tasks after a restart and schedule an
    /// immediate re-check for each.
    pub async fn restore_pending(self: &Arc<Self>) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let tasks = db.list_pending()?;
        if tasks.is_empty() {
            return Ok(());
        }

        info!("Restoring {} pending tasks from journal", tasks.len());
        for task in tasks {
            let task_id = task.task_id.clone();
            self.library.write().await.register_pending(task);

            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.recheck(&task_id).await {
                    warn!("Restore re-check for {} failed: {}", task_id, e);
                }
            });
        }
        Ok(())
    }

    // ========================================================================
    // Consumer Projections
    // ========================================================================

    /// The de-duplicated, membership-filtered, sorted collection.
    pub async fn visible_collection(&self) -> Vec<MusicArtifact> {
        self.library.read().await.snapshot()
    }

    pub async fn pending_tasks(&self) -> HashSet<String> {
        self.library.read().await.pending_tasks()
    }

    pub async fn status_map(&self) -> HashMap<String, TaskStatusEntry> {
        self.library.read().await.status_map()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn monitor_confirmation(&self, task_id: String, tx_hash: String) {
        match self.ledger.await_confirmation(&tx_hash).await {
            Ok(ConfirmOutcome::Confirmed) => {
                info!("Request tx confirmed for task {}", task_id);
                self.library
                    .write()
                    .await
                    .set_task_lifecycle(&task_id, TaskLifecycle::Confirmed);
            }
            Ok(ConfirmOutcome::Reverted(reason)) => {
                warn!("Request tx reverted for task {}: {}", task_id, reason);
                self.library
                    .write()
                    .await
                    .abandon(&task_id, ServiceStatus::CreateTaskFailed);
                self.unjournal(&task_id);
            }
            Ok(ConfirmOutcome::TimedOut) => {
                // Outcome unknown: the generation likely succeeded server-side,
                // so the task stays pending rather than being discarded
                warn!(
                    "Confirmation timed out for task {}; keeping it pending",
                    task_id
                );
            }
            Err(e) => warn!("Confirmation monitor error for task {}: {}", task_id, e),
        }
    }

    async fn recheck(&self, task_id: &str) -> Result<()> {
        if self.is_satisfied(task_id).await {
            debug!("Task {} already satisfied, skipping scheduled poll", task_id);
            return Ok(());
        }

        let event = self
            .service
            .poll_until_complete(task_id, self.config.poll_attempts)
            .await?;
        self.reconciler.process(event).await?;
        self.finalize(task_id).await;
        Ok(())
    }

    async fn is_satisfied(&self, task_id: &str) -> bool {
        let lib = self.library.read().await;
        let expected = lib
            .task(task_id)
            .map(|t| t.expected_tracks)
            .unwrap_or(crate::types::TRACKS_PER_TASK);
        lib.recorded_tracks(task_id) >= expected
    }

    /// Drop completed or failed tasks from the journal
    async fn finalize(&self, task_id: &str) {
        let done = {
            let lib = self.library.read().await;
            lib.task(task_id)
                .map(|t| {
                    matches!(
                        t.status,
                        TaskLifecycle::Completed | TaskLifecycle::Failed
                    )
                })
                .unwrap_or(false)
        };
        if done {
            self.unjournal(task_id);
        }
    }

    fn unjournal(&self, task_id: &str) {
        if let Some(db) = &self.db {
            if let Err(e) = db.remove_pending(task_id) {
                warn!("Failed to remove {} from journal: {}", task_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{event_for, track, MockLedger, MockService, MockStore};
    use crate::types::MusicModel;

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "lofi beat".into(),
            style: None,
            title: None,
            custom_mode: false,
            instrumental: false,
            model: MusicModel::V4,
            vocal_gender: None,
            lyrics_mode: None,
            fee_override_lamports: None,
        }
    }

    fn quiet_config() -> OrchestratorConfig {
        // Long horizons so scheduled polls never interfere with assertions
        OrchestratorConfig {
            recheck_delays: [Duration::from_secs(600), Duration::from_secs(1200)],
            poll_attempts: 3,
            callback_url: None,
        }
    }

    fn orchestrator_with(
        service: MockService,
        ledger: MockLedger,
    ) -> (Arc<GenerationOrchestrator>, Arc<MockService>, Arc<MockLedger>) {
        let service = Arc::new(service);
        let ledger = Arc::new(ledger);
        let orch = GenerationOrchestrator::new(
            service.clone(),
            ledger.clone(),
            Arc::new(MockStore::default()),
            None,
            quiet_config(),
        );
        (orch, service, ledger)
    }

    #[tokio::test]
    async fn test_happy_path_callback() {
        let (orch, _service, ledger) =
            orchestrator_with(MockService::new("t1"), MockLedger::default());

        let task_id = orch.generate(params()).await.unwrap();
        assert_eq!(task_id, "t1");

        // Pending immediately, with placeholder rows visible
        let pending = orch.pending_tasks().await;
        assert!(pending.contains("t1"));
        assert_eq!(orch.visible_collection().await.len(), 2);

        // Both artifacts arrive via the push channel
        let outcome = orch
            .handle_callback(event_for("t1", vec![track("a1"), track("a2")]))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Committed { new_tracks: 2 });

        // Convergence: pending set empty, exactly two entries, SUCCESS status
        assert!(orch.pending_tasks().await.is_empty());
        let visible = orch.visible_collection().await;
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|a| !a.placeholder));
        let status = orch.status_map().await;
        assert_eq!(status["t1"].status, ServiceStatus::Success);
        assert_eq!(ledger.completion_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_channels_converge() {
        let (orch, service, ledger) =
            orchestrator_with(MockService::new("t1"), MockLedger::default());
        orch.generate(params()).await.unwrap();

        // Both the callback and a poll report the same completion
        let event = event_for("t1", vec![track("a1"), track("a2")]);
        service.set_event(event.clone());

        orch.handle_callback(event).await.unwrap();
        orch.check_missing_task("t1").await.unwrap();

        // One effective completion: two tracks, one ledger write
        assert_eq!(orch.visible_collection().await.len(), 2);
        assert_eq!(ledger.completion_calls(), 1);
        // The re-check short-circuited before calling the service
        assert_eq!(service.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_wallet_rejection_leaves_nothing_behind() {
        let (orch, _service, ledger) = orchestrator_with(
            MockService::new("t1"),
            MockLedger::default().with_rejected_signing(),
        );

        let err = orch.generate(params()).await.unwrap_err();
        assert!(matches!(err, TunemintError::UserRejected));
        assert_eq!(ledger.request_calls(), 1);

        // No pending entry, no placeholders, no artifacts ever
        assert!(orch.pending_tasks().await.is_empty());
        assert!(orch.visible_collection().await.is_empty());
    }

    #[tokio::test]
    async fn test_quota_exhausted_fails_before_service_call() {
        let (orch, service, _ledger) = orchestrator_with(
            MockService::new("t1"),
            MockLedger::default().with_quota(0),
        );

        let err = orch.generate(params()).await.unwrap_err();
        assert!(matches!(err, TunemintError::QuotaExhausted));
        assert_eq!(service.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_reverted_confirmation_abandons_task() {
        let (orch, _service, _ledger) = orchestrator_with(
            MockService::new("t1"),
            MockLedger::default()
                .with_confirm_outcome(ConfirmOutcome::Reverted("program error".into())),
        );

        orch.generate(params()).await.unwrap();

        // Give the spawned confirmation monitor a moment to land
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orch.pending_tasks().await.is_empty());
        assert!(orch.visible_collection().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_timeout_keeps_task_pending() {
        let (orch, _service, _ledger) = orchestrator_with(
            MockService::new("t1"),
            MockLedger::default().with_confirm_outcome(ConfirmOutcome::TimedOut),
        );

        orch.generate(params()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Ambiguous outcome: the task is kept, not discarded
        assert!(orch.pending_tasks().await.contains("t1"));
    }

    #[tokio::test]
    async fn test_check_missing_task_pulls_results() {
        let (orch, service, _ledger) =
            orchestrator_with(MockService::new("t1"), MockLedger::default());
        orch.generate(params()).await.unwrap();

        service.set_event(event_for("t1", vec![track("a1"), track("a2")]));
        orch.check_missing_task("t1").await.unwrap();

        assert_eq!(orch.visible_collection().await.len(), 2);
        assert!(orch.pending_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_membership_refresh_feeds_the_gate() {
        let (orch, _service, ledger) =
            orchestrator_with(MockService::new("t1"), MockLedger::default());
        orch.generate(params()).await.unwrap();
        orch.handle_callback(event_for("t1", vec![track("a1"), track("a2")]))
            .await
            .unwrap();

        // The mock ledger recorded the request, so membership holds after a
        // refresh and both artifacts remain visible
        orch.refresh_membership().await.unwrap();
        assert_eq!(orch.visible_collection().await.len(), 2);
        assert_eq!(ledger.request_calls(), 1);
    }
}
