//! Shared in-memory fakes for the collaborator seams, used by the reconciler
//! and orchestrator tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::confirm::ConfirmOutcome;
use crate::ledger::Ledger;
use crate::storage::ArtifactStore;
use crate::suno::{GenerationService, SUCCESS_CODE};
use crate::types::{
    CompletionEvent, CompletionRecord, GenerationParams, Result, ServiceStatus, TrackPayload,
    TunemintError,
};

pub fn track(id: &str) -> TrackPayload {
    TrackPayload {
        id: id.into(),
        audio_url: format!("https://cdn.example/{}.mp3", id),
        image_url: format!("https://cdn.example/{}.jpg", id),
        title: format!("Track {}", id),
        tags: "lofi, chill".into(),
        duration_secs: 182.4,
        create_time: "2025-06-01 12:00:00".into(),
        model_name: "V4".into(),
        prompt: "lofi beat".into(),
    }
}

pub fn event_for(task_id: &str, tracks: Vec<TrackPayload>) -> CompletionEvent {
    CompletionEvent {
        task_id: task_id.into(),
        code: SUCCESS_CODE,
        status: ServiceStatus::Success,
        tracks,
    }
}

// ============================================================================
// Mock Ledger
// ============================================================================

pub struct MockLedger {
    pub requested: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<String>>,
    completion_calls: AtomicUsize,
    request_calls: AtomicUsize,
    reject_signing: bool,
    completion_error: bool,
    quota: u32,
    confirm_outcome: ConfirmOutcome,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            requested: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            completion_calls: AtomicUsize::new(0),
            request_calls: AtomicUsize::new(0),
            reject_signing: false,
            completion_error: false,
            quota: 10,
            confirm_outcome: ConfirmOutcome::Confirmed,
        }
    }
}

impl MockLedger {
    pub fn with_rejected_signing(mut self) -> Self {
        self.reject_signing = true;
        self
    }

    pub fn with_completion_error(mut self) -> Self {
        self.completion_error = true;
        self
    }

    pub fn with_quota(mut self, quota: u32) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_confirm_outcome(mut self, outcome: ConfirmOutcome) -> Self {
        self.confirm_outcome = outcome;
        self
    }

    pub fn completion_calls(&self) -> usize {
        self.completion_calls.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    fn wallet_address(&self) -> Result<String> {
        Ok("TestWa11et1111111111111111111111111111111111".into())
    }

    async fn request_generation(&self, _params: &GenerationParams, task_id: &str) -> Result<String> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_signing {
            return Err(TunemintError::UserRejected);
        }
        self.requested.lock().unwrap().push(task_id.to_string());
        Ok(format!("sig-request-{}", task_id))
    }

    async fn record_completion(&self, record: &CompletionRecord) -> Result<String> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        if self.completion_error {
            return Err(TunemintError::LedgerReverted("rpc unavailable".into()));
        }
        self.completed.lock().unwrap().push(record.task_id.clone());
        Ok(format!("sig-complete-{}", record.task_id))
    }

    async fn user_task_ids(&self) -> Result<Vec<String>> {
        Ok(self.requested.lock().unwrap().clone())
    }

    async fn user_completed_task_ids(&self) -> Result<Vec<String>> {
        Ok(self.completed.lock().unwrap().clone())
    }

    async fn daily_generations_left(&self) -> Result<u32> {
        Ok(self.quota)
    }

    async fn await_confirmation(&self, _tx_hash: &str) -> Result<ConfirmOutcome> {
        Ok(self.confirm_outcome.clone())
    }
}

// ============================================================================
// Mock Artifact Store
// ============================================================================

#[derive(Default)]
pub struct MockStore {
    fail_names: Vec<String>,
}

impl MockStore {
    pub fn failing_for(name: &str) -> Self {
        Self {
            fail_names: vec![name.to_string()],
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.fail_names.iter().any(|f| f == name) {
            return Err(TunemintError::UploadFailed(format!("injected for {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MockStore {
    async fn upload_blob(&self, _bytes: Vec<u8>, name: &str) -> Result<String> {
        self.check(name)?;
        Ok(format!("Qm{}", name.replace('.', "-")))
    }

    async fn upload_json(&self, _document: &serde_json::Value, name: &str) -> Result<String> {
        self.check(name)?;
        Ok(format!("Qm{}", name.replace('.', "-")))
    }

    async fn pin_remote(&self, _url: &str, name: &str) -> Result<String> {
        self.check(name)?;
        Ok(format!("Qm{}", name.replace('.', "-")))
    }

    fn gateway_url(&self, cid: &str) -> String {
        format!("https://gw.test/ipfs/{}", cid)
    }
}

// ============================================================================
// Mock Generation Service
// ============================================================================

pub struct MockService {
    pub task_id: String,
    event: Mutex<CompletionEvent>,
    start_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MockService {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            event: Mutex::new(CompletionEvent {
                task_id: task_id.to_string(),
                code: SUCCESS_CODE,
                status: ServiceStatus::Pending,
                tracks: Vec::new(),
            }),
            start_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_event(&self, event: CompletionEvent) {
        *self.event.lock().unwrap() = event;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for MockService {
    async fn start_generation(
        &self,
        _params: &GenerationParams,
        _callback_url: Option<&str>,
    ) -> Result<String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.task_id.clone())
    }

    async fn get_task_status(&self, _task_id: &str) -> Result<CompletionEvent> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.event.lock().unwrap().clone())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}
