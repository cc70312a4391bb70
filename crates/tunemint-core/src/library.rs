//! ============================================================================
//! Music Library - Single Owned Orchestration State
//! ============================================================================
//! The one mutable state container behind the orchestration engine: the
//! visible music collection, the pending-task set, the per-task status map,
//! the ledger membership sets, and the local task registry. All mutation goes
//! through the methods here so the de-duplication and membership invariants
//! are enforced in one place; callers never touch the fields directly.
//! ============================================================================

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::types::{
    GenerationTask, MusicArtifact, ServiceStatus, TaskLifecycle, TaskStatusEntry,
};

#[derive(Default)]
pub struct MusicLibrary {
    /// All known entries, placeholders included. Visibility is decided at
    /// snapshot time by the membership filter.
    items: Vec<MusicArtifact>,
    /// Task ids currently awaiting reconciliation
    pending: HashSet<String>,
    /// Tasks with a reconciliation run currently in flight
    reconciling: HashSet<String>,
    /// Coarse per-task progress projection
    status: HashMap<String, TaskStatusEntry>,
    /// Local registry of tasks started this session (or restored)
    tasks: HashMap<String, GenerationTask>,
    /// Ledger's requested task-id list (authoritative membership source)
    ledger_requested: HashSet<String>,
    /// Ledger's completed task-id list
    ledger_completed: HashSet<String>,
    /// The most recently submitted task, sorted first
    current_task: Option<String>,
}

impl MusicLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Task Registration
    // ========================================================================

    /// Register a freshly submitted task: adds it to the pending set, inserts
    /// one placeholder row per expected track, and seeds the status map.
    /// Called immediately after the ledger request returns, before
    /// confirmation, so consumers see progress without waiting.
    pub fn register_pending(&mut self, task: GenerationTask) {
        let task_id = task.task_id.clone();
        debug!("Registering pending task {}", task_id);

        for slot in 0..task.expected_tracks {
            let placeholder = MusicArtifact::placeholder(&task_id, slot);
            if !self.items.iter().any(|a| a.id == placeholder.id) {
                self.items.push(placeholder);
            }
        }

        self.pending.insert(task_id.clone());
        self.status.insert(
            task_id.clone(),
            TaskStatusEntry {
                status: ServiceStatus::Pending,
                has_data: false,
                track_count: 0,
                needs_completion_retry: false,
            },
        );
        self.current_task = Some(task_id.clone());
        self.tasks.insert(task_id, task);
    }

    pub fn task(&self, task_id: &str) -> Option<&GenerationTask> {
        self.tasks.get(task_id)
    }

    pub fn set_task_lifecycle(&mut self, task_id: &str, status: TaskLifecycle) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = status;
        }
    }

    pub fn set_completion_tx(&mut self, task_id: &str, tx: String) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.completion_tx = Some(tx);
        }
    }

    // ========================================================================
    // Reconciliation Guards
    // ========================================================================

    /// Non-placeholder artifacts currently held for a task. This count is the
    /// cross-channel guard: once it reaches the expected batch size, further
    /// completion events for the task are no-ops.
    pub fn recorded_tracks(&self, task_id: &str) -> usize {
        self.items
            .iter()
            .filter(|a| !a.placeholder && a.task_id == task_id)
            .count()
    }

    /// Test-and-set the in-flight marker for a task. Returns false if a
    /// reconciliation run is already underway.
    pub fn begin_reconcile(&mut self, task_id: &str) -> bool {
        if self.reconciling.contains(task_id) {
            return false;
        }
        self.reconciling.insert(task_id.to_string());
        self.set_task_lifecycle(task_id, TaskLifecycle::Reconciling);
        true
    }

    pub fn end_reconcile(&mut self, task_id: &str) {
        self.reconciling.remove(task_id);
    }

    // ========================================================================
    // Status Map
    // ========================================================================

    /// Record an upstream status observation without committing tracks.
    /// Soft states ("still processing or failed") land here.
    pub fn note_progress(&mut self, task_id: &str, status: ServiceStatus, track_count: usize) {
        let entry = self
            .status
            .entry(task_id.to_string())
            .or_insert(TaskStatusEntry {
                status,
                has_data: false,
                track_count: 0,
                needs_completion_retry: false,
            });
        entry.status = status;
        entry.has_data = track_count > 0;
        entry.track_count = track_count;
    }

    /// Flag that tracks are visible but the ledger completion write failed
    /// and needs a retry.
    pub fn flag_completion_retry(&mut self, task_id: &str) {
        if let Some(entry) = self.status.get_mut(task_id) {
            entry.needs_completion_retry = true;
        }
    }

    // ========================================================================
    // Commit Operations
    // ========================================================================

    /// Fold a completed task's artifacts into the collection: placeholders
    /// for the task are removed, the new artifacts appended, the collection
    /// de-duplicated, the task dropped from the pending set, and the status
    /// map updated — all before the caller releases the write guard, so
    /// readers never observe a half-merged collection.
    pub fn merge_completed(&mut self, task_id: &str, artifacts: Vec<MusicArtifact>) {
        debug!(
            "Merging {} artifacts for task {}",
            artifacts.len(),
            task_id
        );

        self.items
            .retain(|a| !(a.placeholder && a.task_id == task_id));
        self.items.extend(artifacts);
        self.deduplicate();

        self.pending.remove(task_id);

        let track_count = self.recorded_tracks(task_id);
        let entry = self
            .status
            .entry(task_id.to_string())
            .or_insert(TaskStatusEntry {
                status: ServiceStatus::Success,
                has_data: true,
                track_count,
                needs_completion_retry: false,
            });
        entry.status = ServiceStatus::Success;
        entry.has_data = track_count > 0;
        entry.track_count = track_count;

        self.set_task_lifecycle(task_id, TaskLifecycle::Completed);
    }

    /// Abandon a task after an unrecoverable upstream failure: pending entry
    /// and placeholders are removed so the task cannot retry forever, and the
    /// failure is surfaced through the status map.
    pub fn abandon(&mut self, task_id: &str, status: ServiceStatus) {
        warn!("Abandoning task {} ({:?})", task_id, status);

        self.pending.remove(task_id);
        self.items
            .retain(|a| !(a.placeholder && a.task_id == task_id));
        self.note_progress(task_id, status, 0);
        self.set_task_lifecycle(task_id, TaskLifecycle::Failed);
    }

    /// Idempotent de-duplication pass: the first occurrence of each artifact
    /// `id` wins. Artifacts sharing a `task_id` are never dropped for that
    /// reason — one task legitimately yields several tracks.
    pub fn deduplicate(&mut self) {
        let mut seen: HashSet<String> = HashSet::with_capacity(self.items.len());
        self.items.retain(|a| seen.insert(a.id.clone()));
    }

    // ========================================================================
    // Membership & Visibility
    // ========================================================================

    /// Replace the ledger membership sets from a fresh read of the chain.
    pub fn set_ledger_membership(&mut self, requested: Vec<String>, completed: Vec<String>) {
        self.ledger_requested = requested.into_iter().collect();
        self.ledger_completed = completed.into_iter().collect();
    }

    /// The authoritative display gate. An artifact is visible if its task is
    /// known to the ledger, or it is a placeholder for a task we are still
    /// waiting on, or it carries real audio the ledger read simply has not
    /// caught up with yet (the ledger can lag the service by a confirmation
    /// interval).
    pub fn is_member(&self, artifact: &MusicArtifact) -> bool {
        if self.ledger_requested.contains(&artifact.task_id)
            || self.ledger_completed.contains(&artifact.task_id)
        {
            return true;
        }
        if artifact.placeholder && self.pending.contains(&artifact.task_id) {
            return true;
        }
        artifact.has_playable_audio()
    }

    /// The visible collection: membership-filtered and sorted. Order: the
    /// just-submitted task first, then other pending tasks, then tasks the
    /// ledger has completed, then everything else by creation time
    /// descending; entries with unparseable timestamps sort last.
    pub fn snapshot(&self) -> Vec<MusicArtifact> {
        let mut visible: Vec<MusicArtifact> = self
            .items
            .iter()
            .filter(|a| self.is_member(a))
            .cloned()
            .collect();

        visible.sort_by(|a, b| {
            self.sort_rank(a)
                .cmp(&self.sort_rank(b))
                .then_with(|| match (a.created_at(), b.created_at()) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
        });

        visible
    }

    fn sort_rank(&self, artifact: &MusicArtifact) -> u8 {
        if self
            .current_task
            .as_deref()
            .is_some_and(|t| t == artifact.task_id)
        {
            0
        } else if self.pending.contains(&artifact.task_id) {
            1
        } else if self.ledger_completed.contains(&artifact.task_id) {
            2
        } else {
            3
        }
    }

    // ========================================================================
    // Consumer Projections
    // ========================================================================

    pub fn pending_tasks(&self) -> HashSet<String> {
        self.pending.clone()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.pending.contains(task_id)
    }

    pub fn status_map(&self) -> HashMap<String, TaskStatusEntry> {
        self.status.clone()
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatusEntry> {
        self.status.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentReference, TRACKS_PER_TASK};

    fn artifact(id: &str, task_id: &str, create_time: &str) -> MusicArtifact {
        MusicArtifact {
            id: id.into(),
            task_id: task_id.into(),
            title: format!("track {}", id),
            duration_secs: 120.0,
            genre_tags: vec!["lofi".into()],
            audio: ContentReference::remote(format!("https://cdn.example/{}.mp3", id)),
            image: ContentReference::remote(format!("https://cdn.example/{}.jpg", id)),
            metadata_uri: None,
            create_time: create_time.into(),
            placeholder: false,
        }
    }

    fn library_with_membership(task_ids: &[&str]) -> MusicLibrary {
        let mut lib = MusicLibrary::new();
        lib.set_ledger_membership(task_ids.iter().map(|s| s.to_string()).collect(), vec![]);
        lib
    }

    #[test]
    fn test_dedup_keeps_same_task_distinct_ids() {
        let mut lib = library_with_membership(&["t1"]);
        lib.merge_completed(
            "t1",
            vec![
                artifact("a1", "t1", "2025-06-01 12:00:00"),
                artifact("a2", "t1", "2025-06-01 12:00:01"),
            ],
        );

        // Two artifacts, same task, distinct ids: both retained
        assert_eq!(lib.snapshot().len(), 2);
    }

    #[test]
    fn test_dedup_first_occurrence_wins() {
        let mut lib = library_with_membership(&["t1"]);
        let mut first = artifact("a1", "t1", "");
        first.title = "original".into();
        let mut dup = artifact("a1", "t1", "");
        dup.title = "duplicate".into();

        lib.merge_completed("t1", vec![first]);
        lib.merge_completed("t1", vec![dup]);

        let visible = lib.snapshot();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title, "original");
    }

    #[test]
    fn test_membership_gate() {
        let mut lib = library_with_membership(&["t1"]);

        lib.merge_completed("t1", vec![artifact("a1", "t1", "")]);

        // Forged entry: task unknown to the ledger, audio stripped
        let mut forged = artifact("x9", "t-unknown", "");
        forged.audio = ContentReference::remote("");
        lib.items.push(forged);

        let visible = lib.snapshot();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "a1");
    }

    #[test]
    fn test_membership_allows_audio_during_ledger_lag() {
        // The ledger read can lag the service; real audio is still shown
        let lib_empty = MusicLibrary::new();
        let lagging = artifact("a1", "t-not-yet-on-ledger", "");
        assert!(lib_empty.is_member(&lagging));
    }

    #[test]
    fn test_pending_placeholders_and_convergence() {
        let mut lib = MusicLibrary::new();
        lib.register_pending(GenerationTask::new("t1"));

        // Exactly expected-count placeholder rows, visible while pending
        assert!(lib.is_pending("t1"));
        let visible = lib.snapshot();
        assert_eq!(visible.len(), TRACKS_PER_TASK);
        assert!(visible.iter().all(|a| a.placeholder));

        lib.merge_completed(
            "t1",
            vec![artifact("a1", "t1", ""), artifact("a2", "t1", "")],
        );

        // Convergence: pending entry gone, placeholders gone, tracks merged
        assert!(!lib.is_pending("t1"));
        assert!(lib.pending_tasks().is_empty());
        let visible = lib.snapshot();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|a| !a.placeholder));

        let entry = lib.status_of("t1").unwrap();
        assert_eq!(entry.status, ServiceStatus::Success);
        assert!(entry.has_data);
        assert_eq!(entry.track_count, 2);
    }

    #[test]
    fn test_abandon_removes_pending_and_placeholders() {
        let mut lib = MusicLibrary::new();
        lib.register_pending(GenerationTask::new("t1"));
        lib.abandon("t1", ServiceStatus::GenerateAudioFailed);

        assert!(!lib.is_pending("t1"));
        assert!(lib.snapshot().is_empty());
        let entry = lib.status_of("t1").unwrap();
        assert_eq!(entry.status, ServiceStatus::GenerateAudioFailed);
        assert_eq!(lib.task("t1").unwrap().status, TaskLifecycle::Failed);
    }

    #[test]
    fn test_sort_order_tiers() {
        let mut lib = MusicLibrary::new();
        lib.set_ledger_membership(
            vec!["t-old".into(), "t-current".into(), "t-pending".into()],
            vec!["t-done".into()],
        );

        lib.items.push(artifact("old1", "t-old", "2025-01-01 00:00:00"));
        lib.items.push(artifact("old2", "t-old", "2025-03-01 00:00:00"));
        lib.items.push(artifact("done1", "t-done", "2025-02-01 00:00:00"));

        lib.register_pending(GenerationTask::new("t-pending"));
        lib.register_pending(GenerationTask::new("t-current"));
        // t-current was registered last, so it is the current task

        let visible = lib.snapshot();
        let task_order: Vec<&str> = visible.iter().map(|a| a.task_id.as_str()).collect();

        // Current task first, then other pending, then ledger-completed
        assert_eq!(task_order[0], "t-current");
        assert_eq!(task_order[1], "t-current");
        assert_eq!(task_order[2], "t-pending");
        assert_eq!(task_order[3], "t-pending");
        assert_eq!(task_order[4], "t-done");
        // Remaining items newest-first
        assert_eq!(visible[5].id, "old2");
        assert_eq!(visible[6].id, "old1");
    }

    #[test]
    fn test_sort_invalid_timestamps_last() {
        let mut lib = library_with_membership(&["t1"]);
        lib.items.push(artifact("bad", "t1", "not a date"));
        lib.items.push(artifact("good", "t1", "2025-06-01 12:00:00"));

        let visible = lib.snapshot();
        assert_eq!(visible[0].id, "good");
        assert_eq!(visible[1].id, "bad");
    }

    #[test]
    fn test_reconcile_in_flight_marker() {
        let mut lib = MusicLibrary::new();
        lib.register_pending(GenerationTask::new("t1"));

        assert!(lib.begin_reconcile("t1"));
        // Second entry while in flight is refused
        assert!(!lib.begin_reconcile("t1"));

        lib.end_reconcile("t1");
        assert!(lib.begin_reconcile("t1"));
    }

    #[test]
    fn test_recorded_tracks_ignores_placeholders() {
        let mut lib = MusicLibrary::new();
        lib.register_pending(GenerationTask::new("t1"));
        assert_eq!(lib.recorded_tracks("t1"), 0);

        lib.merge_completed("t1", vec![artifact("a1", "t1", "")]);
        assert_eq!(lib.recorded_tracks("t1"), 1);
    }

    #[test]
    fn test_completion_retry_flag() {
        let mut lib = MusicLibrary::new();
        lib.register_pending(GenerationTask::new("t1"));
        lib.flag_completion_retry("t1");
        assert!(lib.status_of("t1").unwrap().needs_completion_retry);
    }
}
