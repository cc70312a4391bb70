//! ============================================================================
//! Task Reconciler - Completion Event Processing
//! ============================================================================
//! Turns a generation-service completion signal (pushed callback or polled
//! result, already normalized into one event shape) into pinned artifacts
//! plus a ledger completion record:
//!   entry guard -> validate -> pin artifacts -> record completion -> commit
//! Upload failures are non-fatal per artifact (the original URL is kept); a
//! failed completion write leaves the artifacts visible and flags the task
//! for a retry of the write.
//! ============================================================================

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::library::MusicLibrary;
use crate::storage::ArtifactStore;
use crate::suno::SUCCESS_CODE;
use crate::types::{
    CompletionEvent, CompletionRecord, ContentReference, MusicArtifact, ProvenanceMetadata,
    Result, ServiceStatus, TrackPayload, TunemintError,
};

/// What a reconciliation run did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The task already holds its full batch (or a run is in flight): no-op
    AlreadySatisfied,
    /// Soft rejection — upstream is still working or reported a transition
    /// state; the task stays pending
    Incomplete(ServiceStatus),
    /// Hard upstream failure — the task was dropped from the pending set
    Abandoned(ServiceStatus),
    /// Tracks merged into the collection
    Committed { new_tracks: usize },
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ArtifactStore>,
    library: Arc<RwLock<MusicLibrary>>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ArtifactStore>,
        library: Arc<RwLock<MusicLibrary>>,
    ) -> Self {
        Self {
            ledger,
            store,
            library,
        }
    }

    /// Process one completion event. Safe to call from any number of delivery
    /// channels: the artifact-count guard plus the in-flight marker make
    /// duplicate triggers for the same task converge to a single effective
    /// completion.
    pub async fn process(&self, event: CompletionEvent) -> Result<ReconcileOutcome> {
        let task_id = event.task_id.clone();
        let expected = {
            let mut lib = self.library.write().await;
            let expected = lib
                .task(&task_id)
                .map(|t| t.expected_tracks)
                .unwrap_or(crate::types::TRACKS_PER_TASK);

            if lib.recorded_tracks(&task_id) >= expected {
                debug!("Task {} already satisfied, skipping", task_id);
                return Ok(ReconcileOutcome::AlreadySatisfied);
            }
            if !lib.begin_reconcile(&task_id) {
                debug!("Task {} reconciliation already in flight, skipping", task_id);
                return Ok(ReconcileOutcome::AlreadySatisfied);
            }
            expected
        };

        let outcome = self.run(&task_id, expected, event).await;

        self.library.write().await.end_reconcile(&task_id);
        outcome
    }

    async fn run(
        &self,
        task_id: &str,
        expected: usize,
        event: CompletionEvent,
    ) -> Result<ReconcileOutcome> {
        // Validating: only a success code with a non-empty batch proceeds.
        // Upstream services report incomplete success during transition
        // windows, so anything short of a hard failure is a soft "still
        // processing or failed" — a warning, never a thrown error.
        if event.code != SUCCESS_CODE
            || !event.status.has_complete_audio()
            || event.tracks.is_empty()
        {
            let mut lib = self.library.write().await;
            if event.status.is_failure() {
                lib.abandon(task_id, event.status);
                return Ok(ReconcileOutcome::Abandoned(event.status));
            }
            warn!(
                "Task {} not reconcilable yet (code {}, status {:?}, {} tracks)",
                task_id,
                event.code,
                event.status,
                event.tracks.len()
            );
            lib.note_progress(task_id, event.status, event.tracks.len());
            return Ok(ReconcileOutcome::Incomplete(event.status));
        }

        // UploadingArtifacts: pin audio, image, and the provenance document
        // for each track. Any individual upload failure falls back to the
        // original remote URL and the run continues.
        let (wallet, request_tx) = {
            let lib = self.library.read().await;
            let wallet = self.ledger.wallet_address().unwrap_or_default();
            let request_tx = lib
                .task(task_id)
                .and_then(|t| t.request_tx.clone())
                .unwrap_or_default();
            (wallet, request_tx)
        };

        let mut artifacts = Vec::with_capacity(event.tracks.len());
        for track in &event.tracks {
            artifacts.push(self.build_artifact(task_id, track, &wallet, &request_tx).await);
        }

        // RecordingCompletion: at most once per task. A failure here is not
        // rolled back — the artifacts stay visible and the task keeps a
        // retry flag for the completion write.
        let already_recorded = {
            let lib = self.library.read().await;
            lib.task(task_id)
                .map(|t| t.completion_tx.is_some())
                .unwrap_or(false)
                || lib.recorded_tracks(task_id) >= expected
        };

        let mut completion_failed = false;
        if !already_recorded {
            let record = build_completion_record(task_id, &event.tracks, &artifacts);
            match self.ledger.record_completion(&record).await {
                Ok(tx) => {
                    info!("Completion recorded for task {}: {}", task_id, tx);
                    self.library.write().await.set_completion_tx(task_id, tx);
                }
                Err(TunemintError::AlreadyCompleted(_)) => {
                    debug!("Ledger already holds a completion for task {}", task_id);
                }
                Err(e) => {
                    warn!("Completion write failed for task {}: {}", task_id, e);
                    completion_failed = true;
                }
            }
        }

        // Done: fold the artifacts in, drop placeholders and the pending
        // entry, refresh the status map — atomically under the write guard.
        let new_tracks = artifacts.len();
        {
            let mut lib = self.library.write().await;
            lib.merge_completed(task_id, artifacts);
            if completion_failed {
                lib.flag_completion_retry(task_id);
            }
        }

        Ok(ReconcileOutcome::Committed { new_tracks })
    }

    /// Build one artifact from a raw track, pinning what can be pinned.
    async fn build_artifact(
        &self,
        task_id: &str,
        track: &TrackPayload,
        wallet: &str,
        request_tx: &str,
    ) -> MusicArtifact {
        let mut audio = ContentReference::remote(track.audio_url.clone());
        let mut image = ContentReference::remote(track.image_url.clone());

        if !track.audio_url.is_empty() {
            match self
                .store
                .pin_remote(&track.audio_url, &format!("{}.mp3", track.id))
                .await
            {
                Ok(cid) => {
                    let url = self.store.gateway_url(&cid);
                    audio.pin(cid, url);
                }
                Err(e) => warn!(
                    "Audio pin failed for {} (keeping original URL): {}",
                    track.id, e
                ),
            }
        }

        if !track.image_url.is_empty() {
            match self
                .store
                .pin_remote(&track.image_url, &format!("{}.jpg", track.id))
                .await
            {
                Ok(cid) => {
                    let url = self.store.gateway_url(&cid);
                    image.pin(cid, url);
                }
                Err(e) => warn!(
                    "Image pin failed for {} (keeping original URL): {}",
                    track.id, e
                ),
            }
        }

        let provenance = ProvenanceMetadata {
            title: track.title.clone(),
            prompt: track.prompt.clone(),
            style: None,
            model_name: track.model_name.clone(),
            wallet: wallet.to_string(),
            request_tx_hash: request_tx.to_string(),
            genre_tags: track.genre_tags(),
            create_time: track.create_time.clone(),
        };
        let document = provenance.to_document(audio.best_url(), image.best_url());

        let metadata_uri = match self
            .store
            .upload_json(&document, &format!("{}.json", track.id))
            .await
        {
            Ok(cid) => Some(format!("ipfs://{}", cid)),
            Err(e) => {
                warn!("Metadata pin failed for {}: {}", track.id, e);
                None
            }
        };

        MusicArtifact {
            id: track.id.clone(),
            task_id: task_id.to_string(),
            title: track.title.clone(),
            duration_secs: track.duration_secs,
            genre_tags: track.genre_tags(),
            audio,
            image,
            metadata_uri,
            create_time: track.create_time.clone(),
            placeholder: false,
        }
    }
}

/// Compose the ledger completion arguments from the batch. The first track's
/// pinned metadata stands for the task; durations are summed per the batch.
fn build_completion_record(
    task_id: &str,
    tracks: &[TrackPayload],
    artifacts: &[MusicArtifact],
) -> CompletionRecord {
    let first = artifacts.first();
    let metadata_uri = first
        .and_then(|a| a.metadata_uri.clone())
        .unwrap_or_else(|| {
            // Fall back to the original audio URL if the metadata pin failed
            tracks
                .first()
                .map(|t| t.audio_url.clone())
                .unwrap_or_default()
        });

    CompletionRecord {
        task_id: task_id.to_string(),
        metadata_uri,
        duration_secs: tracks.first().map(|t| t.duration_secs.round() as u32).unwrap_or(0),
        genre_tags: tracks.first().map(|t| t.genre_tags()).unwrap_or_default(),
        model_name: tracks
            .first()
            .map(|t| t.model_name.clone())
            .unwrap_or_default(),
        create_time: tracks
            .first()
            .map(|t| t.create_time.clone())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{event_for, track, MockLedger, MockStore};
    use crate::types::GenerationTask;

    fn setup(
        ledger: MockLedger,
        store: MockStore,
    ) -> (Reconciler, Arc<RwLock<MusicLibrary>>, Arc<MockLedger>) {
        let library = Arc::new(RwLock::new(MusicLibrary::new()));
        let ledger = Arc::new(ledger);
        let reconciler = Reconciler::new(
            ledger.clone(),
            Arc::new(store),
            library.clone(),
        );
        (reconciler, library, ledger)
    }

    async fn register(library: &Arc<RwLock<MusicLibrary>>, task_id: &str, request_tx: &str) {
        let mut task = GenerationTask::new(task_id);
        task.request_tx = Some(request_tx.into());
        library.write().await.register_pending(task);
    }

    #[tokio::test]
    async fn test_happy_path_commits_and_records() {
        let (reconciler, library, ledger) = setup(MockLedger::default(), MockStore::default());
        register(&library, "t1", "0xabc").await;

        let outcome = reconciler
            .process(event_for("t1", vec![track("a1"), track("a2")]))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Committed { new_tracks: 2 });
        assert_eq!(ledger.completion_calls(), 1);

        let lib = library.read().await;
        assert!(!lib.is_pending("t1"));
        assert_eq!(lib.recorded_tracks("t1"), 2);
        // Artifacts were pinned and carry gateway URLs
        let visible = lib.snapshot();
        assert!(visible.iter().all(|a| a.audio.is_pinned()));
    }

    #[tokio::test]
    async fn test_idempotent_reconciliation() {
        let (reconciler, library, ledger) = setup(MockLedger::default(), MockStore::default());
        register(&library, "t1", "0xabc").await;

        let event = event_for("t1", vec![track("a1"), track("a2")]);
        let first = reconciler.process(event.clone()).await.unwrap();
        assert_eq!(first, ReconcileOutcome::Committed { new_tracks: 2 });

        // Replaying the same payload is a no-op: no duplicate artifacts, no
        // second ledger completion call
        let second = reconciler.process(event).await.unwrap();
        assert_eq!(second, ReconcileOutcome::AlreadySatisfied);
        assert_eq!(ledger.completion_calls(), 1);
        assert_eq!(library.read().await.recorded_tracks("t1"), 2);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_original_url_and_records() {
        let store = MockStore::failing_for("a1.mp3");
        let (reconciler, library, ledger) = setup(MockLedger::default(), store);
        register(&library, "t1", "0xabc").await;

        let outcome = reconciler
            .process(event_for("t1", vec![track("a1"), track("a2")]))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Committed { new_tracks: 2 });
        // Completion is still recorded despite the audio pin failure
        assert_eq!(ledger.completion_calls(), 1);

        let lib = library.read().await;
        let visible = lib.snapshot();
        let a1 = visible.iter().find(|a| a.id == "a1").unwrap();
        assert!(!a1.audio.is_pinned());
        assert_eq!(a1.audio.best_url(), "https://cdn.example/a1.mp3");
        let a2 = visible.iter().find(|a| a.id == "a2").unwrap();
        assert!(a2.audio.is_pinned());
    }

    #[tokio::test]
    async fn test_incomplete_payload_is_soft() {
        let (reconciler, library, ledger) = setup(MockLedger::default(), MockStore::default());
        register(&library, "t1", "0xabc").await;

        let mut event = event_for("t1", vec![]);
        event.status = ServiceStatus::FirstSuccess;
        let outcome = reconciler.process(event).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Incomplete(ServiceStatus::FirstSuccess)
        );
        // Task stays pending; nothing was recorded
        assert!(library.read().await.is_pending("t1"));
        assert_eq!(ledger.completion_calls(), 0);
    }

    #[tokio::test]
    async fn test_hard_failure_abandons() {
        let (reconciler, library, _ledger) = setup(MockLedger::default(), MockStore::default());
        register(&library, "t1", "0xabc").await;

        let mut event = event_for("t1", vec![]);
        event.status = ServiceStatus::GenerateAudioFailed;
        let outcome = reconciler.process(event).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Abandoned(ServiceStatus::GenerateAudioFailed)
        );
        assert!(!library.read().await.is_pending("t1"));
    }

    #[tokio::test]
    async fn test_completion_write_failure_keeps_artifacts_visible() {
        let ledger = MockLedger::default().with_completion_error();
        let (reconciler, library, ledger) = setup(ledger, MockStore::default());
        register(&library, "t1", "0xabc").await;

        let outcome = reconciler
            .process(event_for("t1", vec![track("a1"), track("a2")]))
            .await
            .unwrap();

        // Not rolled back: tracks are visible, the task is flagged for retry
        assert_eq!(outcome, ReconcileOutcome::Committed { new_tracks: 2 });
        assert_eq!(ledger.completion_calls(), 1);
        let lib = library.read().await;
        assert_eq!(lib.recorded_tracks("t1"), 2);
        assert!(lib.status_of("t1").unwrap().needs_completion_retry);
    }
}
