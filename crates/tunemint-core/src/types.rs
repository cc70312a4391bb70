//! ============================================================================
//! Core Types for Tunemint
//! ============================================================================
//! Defines the shared data model for the generation-orchestration engine:
//! tasks, artifacts, content references, status projections, and the error
//! taxonomy surfaced to consumers.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// The generation service returns a fixed batch of tracks per task.
pub const TRACKS_PER_TASK: usize = 2;

/// Parameters for one user-initiated generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Advanced mode: caller supplies style/title/lyrics instead of a bare prompt
    #[serde(default)]
    pub custom_mode: bool,
    #[serde(default)]
    pub instrumental: bool,
    pub model: MusicModel,
    #[serde(default)]
    pub vocal_gender: Option<VocalGender>,
    #[serde(default)]
    pub lyrics_mode: Option<String>,
    /// Overrides the on-chain fee constants when set (in lamports)
    #[serde(default)]
    pub fee_override_lamports: Option<u64>,
}

/// Generation model selector, wire-compatible with the service's enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MusicModel {
    #[serde(rename = "V3_5")]
    V3_5,
    #[serde(rename = "V4")]
    V4,
    #[serde(rename = "V4_5")]
    V4_5,
    #[serde(rename = "V5")]
    V5,
}

impl MusicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V3_5 => "V3_5",
            Self::V4 => "V4",
            Self::V4_5 => "V4_5",
            Self::V5 => "V5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VocalGender {
    Male,
    Female,
}

impl VocalGender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "m",
            Self::Female => "f",
        }
    }
}

/// Lifecycle of one generation task as tracked by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLifecycle {
    /// Registered locally; ledger confirmation still outstanding
    Pending,
    /// Request transaction confirmed on the ledger
    Confirmed,
    /// A completion payload is being processed
    Reconciling,
    /// Tracks merged into the collection, completion recorded
    Completed,
    /// Unrecoverable upstream failure; removed from the pending set
    Failed,
}

/// One user-initiated creation request, correlated across all three systems
/// by the service-minted `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: String,
    /// Ledger transaction recording the request; None until submitted
    pub request_tx: Option<String>,
    /// Ledger transaction recording completion; None until reconciled
    pub completion_tx: Option<String>,
    pub status: TaskLifecycle,
    pub expected_tracks: usize,
    pub created_at: i64,
}

impl GenerationTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            request_tx: None,
            completion_tx: None,
            status: TaskLifecycle::Pending,
            expected_tracks: TRACKS_PER_TASK,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A remote asset plus (once pinned) its content address and derived gateway
/// URL. The original URL is retained as a fallback forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentReference {
    pub original_url: String,
    #[serde(default)]
    pub content_address: Option<String>,
    #[serde(default)]
    pub gateway_url: Option<String>,
}

impl ContentReference {
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            original_url: url.into(),
            content_address: None,
            gateway_url: None,
        }
    }

    /// Record the pinned content address and its derived gateway URL
    pub fn pin(&mut self, cid: String, gateway_url: String) {
        self.content_address = Some(cid);
        self.gateway_url = Some(gateway_url);
    }

    /// Preferred retrieval URL: gateway if pinned, original otherwise
    pub fn best_url(&self) -> &str {
        self.gateway_url.as_deref().unwrap_or(&self.original_url)
    }

    pub fn is_pinned(&self) -> bool {
        self.content_address.is_some()
    }
}

/// Structured provenance embedded in the pinned metadata document.
/// Carries the ledger transaction hash that authorized the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceMetadata {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    pub model_name: String,
    pub wallet: String,
    pub request_tx_hash: String,
    pub genre_tags: Vec<String>,
    pub create_time: String,
}

impl ProvenanceMetadata {
    /// Render the NFT-style metadata document that gets pinned
    pub fn to_document(&self, audio_url: &str, image_url: &str) -> serde_json::Value {
        serde_json::json!({
            "name": self.title,
            "description": self.prompt,
            "image": image_url,
            "animation_url": audio_url,
            "attributes": [
                { "trait_type": "model", "value": self.model_name },
                { "trait_type": "style", "value": self.style.clone().unwrap_or_default() },
                { "trait_type": "genres", "value": self.genre_tags.join(",") },
                { "trait_type": "request_tx", "value": self.request_tx_hash },
                { "trait_type": "created", "value": self.create_time },
            ],
            "properties": {
                "wallet": self.wallet,
                "prompt": self.prompt,
            },
        })
    }
}

/// One rendered track belonging to a task. `id` is the sole de-duplication
/// key; a task intentionally yields multiple artifacts sharing one `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicArtifact {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub duration_secs: f64,
    pub genre_tags: Vec<String>,
    pub audio: ContentReference,
    pub image: ContentReference,
    /// Pinned provenance document, once uploaded
    #[serde(default)]
    pub metadata_uri: Option<String>,
    /// Upstream creation timestamp; kept verbatim, may be unparseable
    pub create_time: String,
    /// Placeholder row for a still-pending task
    #[serde(default)]
    pub placeholder: bool,
}

impl MusicArtifact {
    /// Placeholder row shown while a task is pending. The synthetic id keeps
    /// placeholders out of the way of the real de-duplication key space.
    pub fn placeholder(task_id: &str, slot: usize) -> Self {
        Self {
            id: format!("pending-{}-{}", task_id, slot),
            task_id: task_id.to_string(),
            title: String::new(),
            duration_secs: 0.0,
            genre_tags: Vec::new(),
            audio: ContentReference::remote(""),
            image: ContentReference::remote(""),
            metadata_uri: None,
            create_time: String::new(),
            placeholder: true,
        }
    }

    /// Parse the upstream timestamp. Accepts RFC 3339, the service's
    /// "YYYY-MM-DD HH:MM:SS" form, and epoch milliseconds; None otherwise.
    pub fn created_at(&self) -> Option<i64> {
        let raw = self.create_time.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp());
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Some(naive.and_utc().timestamp());
        }
        if let Ok(millis) = raw.parse::<i64>() {
            // Values this large can only be epoch milliseconds
            return Some(if millis > 1_000_000_000_000 {
                millis / 1000
            } else {
                millis
            });
        }
        None
    }

    /// Non-placeholder entry with actual audio content
    pub fn has_playable_audio(&self) -> bool {
        !self.placeholder && !self.audio.best_url().is_empty()
    }
}

/// Upstream generation-service status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Pending,
    TextSuccess,
    FirstSuccess,
    Success,
    CreateTaskFailed,
    GenerateAudioFailed,
    CallbackException,
    SensitiveWordError,
    #[serde(other)]
    Unknown,
}

impl ServiceStatus {
    /// Terminal states: no further polling will change the outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::CreateTaskFailed
                | Self::GenerateAudioFailed
                | Self::CallbackException
                | Self::SensitiveWordError
        )
    }

    /// Hard upstream failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::CreateTaskFailed
                | Self::GenerateAudioFailed
                | Self::CallbackException
                | Self::SensitiveWordError
        )
    }

    /// Only SUCCESS carries the complete artifact batch
    pub fn has_complete_audio(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One raw track as reported by the generation service, before pinning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPayload {
    pub id: String,
    pub audio_url: String,
    pub image_url: String,
    pub title: String,
    /// Comma-separated genre tags as the service reports them
    pub tags: String,
    pub duration_secs: f64,
    pub create_time: String,
    pub model_name: String,
    pub prompt: String,
}

impl TrackPayload {
    pub fn genre_tags(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// The normalized completion event: both the pushed callback and the polled
/// record-info response reduce to this shape before the reconciler sees them.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub task_id: String,
    pub code: i64,
    pub status: ServiceStatus,
    pub tracks: Vec<TrackPayload>,
}

/// Arguments for the ledger completion write
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub task_id: String,
    pub metadata_uri: String,
    pub duration_secs: u32,
    pub genre_tags: Vec<String>,
    pub model_name: String,
    pub create_time: String,
}

/// Coarse per-task projection for progress rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    pub status: ServiceStatus,
    pub has_data: bool,
    pub track_count: usize,
    /// Tracks are visible but the ledger completion write still needs a retry
    #[serde(default)]
    pub needs_completion_retry: bool,
}

/// Error taxonomy surfaced to consumers of the core
#[derive(Debug, thiserror::Error)]
pub enum TunemintError {
    #[error("wallet not connected")]
    WalletNotConnected,

    #[error("insufficient balance: need {needed} lamports, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("signing rejected by wallet")]
    UserRejected,

    #[error("daily generation quota exhausted")]
    QuotaExhausted,

    #[error("generation service error: {0}")]
    ServiceUnavailable(String),

    #[error("generation service reported success without data: {0}")]
    UpstreamIncomplete(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("ledger call reverted: {0}")]
    LedgerReverted(String),

    #[error("confirmation timed out for {0}")]
    ConfirmationTimeout(String),

    #[error("completion already recorded for task {0}")]
    AlreadyCompleted(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TunemintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_status_wire_names() {
        let s: ServiceStatus = serde_json::from_str("\"FIRST_SUCCESS\"").unwrap();
        assert_eq!(s, ServiceStatus::FirstSuccess);
        let s: ServiceStatus = serde_json::from_str("\"SENSITIVE_WORD_ERROR\"").unwrap();
        assert_eq!(s, ServiceStatus::SensitiveWordError);
        // Unrecognized statuses fold into Unknown instead of failing the parse
        let s: ServiceStatus = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(s, ServiceStatus::Unknown);
    }

    #[test]
    fn test_service_status_classification() {
        assert!(ServiceStatus::Success.is_terminal());
        assert!(ServiceStatus::Success.has_complete_audio());
        assert!(!ServiceStatus::Success.is_failure());
        assert!(ServiceStatus::GenerateAudioFailed.is_failure());
        assert!(!ServiceStatus::Pending.is_terminal());
        assert!(!ServiceStatus::FirstSuccess.is_terminal());
        assert!(!ServiceStatus::FirstSuccess.has_complete_audio());
    }

    #[test]
    fn test_created_at_parsing() {
        let mut a = MusicArtifact::placeholder("t", 0);
        a.create_time = "2025-06-01T12:00:00Z".into();
        assert!(a.created_at().is_some());

        a.create_time = "2025-06-01 12:00:00".into();
        assert!(a.created_at().is_some());

        a.create_time = "1748779200000".into();
        assert_eq!(a.created_at(), Some(1_748_779_200));

        a.create_time = "not a date".into();
        assert_eq!(a.created_at(), None);

        a.create_time = String::new();
        assert_eq!(a.created_at(), None);
    }

    #[test]
    fn test_content_reference_fallback() {
        let mut r = ContentReference::remote("https://cdn.example/audio.mp3");
        assert_eq!(r.best_url(), "https://cdn.example/audio.mp3");
        assert!(!r.is_pinned());

        r.pin("QmHash".into(), "https://gateway.example/ipfs/QmHash".into());
        assert_eq!(r.best_url(), "https://gateway.example/ipfs/QmHash");
        // The original URL is never discarded
        assert_eq!(r.original_url, "https://cdn.example/audio.mp3");
    }

    #[test]
    fn test_track_payload_genre_tags() {
        let t = TrackPayload {
            id: "a1".into(),
            audio_url: String::new(),
            image_url: String::new(),
            title: String::new(),
            tags: "lofi, chill,, ambient ".into(),
            duration_secs: 0.0,
            create_time: String::new(),
            model_name: String::new(),
            prompt: String::new(),
        };
        assert_eq!(t.genre_tags(), vec!["lofi", "chill", "ambient"]);
    }

    #[test]
    fn test_placeholder_ids_distinct_per_slot() {
        let a = MusicArtifact::placeholder("t1", 0);
        let b = MusicArtifact::placeholder("t1", 1);
        assert_ne!(a.id, b.id);
        assert!(a.placeholder);
        assert!(!a.has_playable_audio());
    }
}
