//! ============================================================================
//! Generation Service Client - Suno Music API
//! ============================================================================
//! Handles the asynchronous music generation service:
//! - Start a render job and obtain the service-minted taskId
//! - One-shot status query (record-info)
//! - Bounded polling helper that returns the last observed snapshot on
//!   exhaustion instead of throwing
//! ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{
    CompletionEvent, GenerationParams, Result, ServiceStatus, TrackPayload, TunemintError,
};

/// Default API base
const DEFAULT_BASE_URL: &str = "https://api.sunoapi.org";

/// Start-generation endpoint path
const GENERATE_PATH: &str = "/api/v1/generate";

/// One-shot task status endpoint path
const RECORD_INFO_PATH: &str = "/api/v1/generate/record-info";

/// The service's success sentinel in response envelopes
pub const SUCCESS_CODE: i64 = 200;

/// Interval between polling attempts
const POLL_INTERVAL_SECS: u64 = 10;

/// Abstraction over the generation service, so the orchestrator and
/// reconciler can be exercised against in-memory fakes.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Start an asynchronous render job; returns the service-minted task id.
    async fn start_generation(
        &self,
        params: &GenerationParams,
        callback_url: Option<&str>,
    ) -> Result<String>;

    /// One-shot status query, normalized into a completion event.
    async fn get_task_status(&self, task_id: &str) -> Result<CompletionEvent>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(POLL_INTERVAL_SECS)
    }

    /// Poll up to `max_attempts` times. Returns the last observed snapshot on
    /// exhaustion so callers can decide whether to keep the task pending.
    async fn poll_until_complete(&self, task_id: &str, max_attempts: u32) -> Result<CompletionEvent> {
        let mut last = self.get_task_status(task_id).await?;

        for attempt in 1..max_attempts {
            if last.status.is_terminal() {
                return Ok(last);
            }
            debug!(
                "Task {} still {:?} (poll attempt {}/{})",
                task_id, last.status, attempt, max_attempts
            );
            tokio::time::sleep(self.poll_interval()).await;
            last = self.get_task_status(task_id).await?;
        }

        if !last.status.is_terminal() {
            warn!(
                "Polling exhausted for task {} after {} attempts (last status {:?})",
                task_id, max_attempts, last.status
            );
        }
        Ok(last)
    }
}

/// HTTP client for the Suno generation API
pub struct SunoClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl SunoClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GenerationService for SunoClient {
    async fn start_generation(
        &self,
        params: &GenerationParams,
        callback_url: Option<&str>,
    ) -> Result<String> {
        info!(
            "Starting generation: {}...",
            &params.prompt[..params.prompt.len().min(50)]
        );

        let request = GenerateRequest {
            prompt: &params.prompt,
            style: params.style.as_deref(),
            title: params.title.as_deref(),
            custom_mode: params.custom_mode,
            instrumental: params.instrumental,
            model: params.model.as_str(),
            vocal_gender: params.vocal_gender.map(|g| g.as_str()),
            call_back_url: callback_url,
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, GENERATE_PATH))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| TunemintError::ServiceUnavailable(format!("generate call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TunemintError::ServiceUnavailable(format!(
                "generate returned {}: {}",
                status, body
            )));
        }

        let envelope: ApiEnvelope<GenerateData> = response
            .json()
            .await
            .map_err(|e| TunemintError::ServiceUnavailable(format!("bad generate response: {}", e)))?;

        if envelope.code != SUCCESS_CODE {
            return Err(TunemintError::ServiceUnavailable(format!(
                "generate rejected ({}): {}",
                envelope.code, envelope.msg
            )));
        }

        let task_id = envelope
            .data
            .map(|d| d.task_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                TunemintError::UpstreamIncomplete("generate succeeded without a taskId".into())
            })?;

        info!("Generation started, taskId: {}", task_id);
        Ok(task_id)
    }

    async fn get_task_status(&self, task_id: &str) -> Result<CompletionEvent> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, RECORD_INFO_PATH))
            .query(&[("taskId", task_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| TunemintError::ServiceUnavailable(format!("record-info failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TunemintError::ServiceUnavailable(format!(
                "record-info returned {}: {}",
                status, body
            )));
        }

        let envelope: ApiEnvelope<RecordInfoData> = response.json().await.map_err(|e| {
            TunemintError::ServiceUnavailable(format!("bad record-info response: {}", e))
        })?;

        let code = envelope.code;
        let data = envelope
            .data
            .ok_or_else(|| TunemintError::TaskNotFound(task_id.to_string()))?;

        Ok(normalize_record_info(task_id, code, data))
    }
}

/// Reduce a polled record-info payload to the canonical completion shape
fn normalize_record_info(task_id: &str, code: i64, data: RecordInfoData) -> CompletionEvent {
    let tracks = data
        .response
        .and_then(|r| r.suno_data)
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.into_payload())
        .collect();

    CompletionEvent {
        task_id: task_id.to_string(),
        code,
        status: data.status,
        tracks,
    }
}

// ============================================================================
// Suno API Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    custom_mode: bool,
    instrumental: bool,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    vocal_gender: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_back_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateData {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordInfoData {
    #[allow(dead_code)]
    #[serde(default)]
    task_id: String,
    status: ServiceStatus,
    #[serde(default)]
    response: Option<RecordResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordResponse {
    #[serde(default)]
    suno_data: Option<Vec<SunoTrack>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SunoTrack {
    id: String,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    source_audio_url: Option<String>,
    #[serde(default)]
    stream_audio_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    source_image_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
}

impl SunoTrack {
    fn into_payload(self) -> TrackPayload {
        TrackPayload {
            id: self.id,
            audio_url: self
                .audio_url
                .or(self.source_audio_url)
                .or(self.stream_audio_url)
                .unwrap_or_default(),
            image_url: self.image_url.or(self.source_image_url).unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            duration_secs: self.duration.unwrap_or(0.0),
            create_time: self.create_time.unwrap_or_default(),
            model_name: self.model_name.unwrap_or_default(),
            prompt: self.prompt.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD_INFO_FIXTURE: &str = r#"{
        "code": 200,
        "msg": "success",
        "data": {
            "taskId": "t1",
            "status": "SUCCESS",
            "response": {
                "sunoData": [
                    {
                        "id": "a1",
                        "audioUrl": "https://cdn.example/a1.mp3",
                        "imageUrl": "https://cdn.example/a1.jpg",
                        "title": "Lofi Beat",
                        "tags": "lofi, chill",
                        "duration": 182.4,
                        "createTime": "2025-06-01 12:00:00",
                        "modelName": "V4",
                        "prompt": "lofi beat"
                    },
                    {
                        "id": "a2",
                        "sourceAudioUrl": "https://cdn.example/a2.mp3",
                        "sourceImageUrl": "https://cdn.example/a2.jpg",
                        "title": "Lofi Beat (alt)",
                        "duration": 175.0
                    }
                ]
            }
        }
    }"#;

    #[test]
    fn test_record_info_normalization() {
        let envelope: ApiEnvelope<RecordInfoData> =
            serde_json::from_str(RECORD_INFO_FIXTURE).unwrap();
        let event = normalize_record_info("t1", envelope.code, envelope.data.unwrap());

        assert_eq!(event.task_id, "t1");
        assert_eq!(event.code, SUCCESS_CODE);
        assert_eq!(event.status, ServiceStatus::Success);
        assert_eq!(event.tracks.len(), 2);
        assert_eq!(event.tracks[0].id, "a1");
        assert_eq!(event.tracks[0].audio_url, "https://cdn.example/a1.mp3");
        // Fallback URL fields are honored
        assert_eq!(event.tracks[1].audio_url, "https://cdn.example/a2.mp3");
        assert_eq!(event.tracks[1].image_url, "https://cdn.example/a2.jpg");
    }

    #[test]
    fn test_record_info_without_tracks() {
        let raw = r#"{"code": 200, "data": {"taskId": "t2", "status": "PENDING"}}"#;
        let envelope: ApiEnvelope<RecordInfoData> = serde_json::from_str(raw).unwrap();
        let event = normalize_record_info("t2", envelope.code, envelope.data.unwrap());
        assert_eq!(event.status, ServiceStatus::Pending);
        assert!(event.tracks.is_empty());
    }

    #[test]
    fn test_generate_request_wire_shape() {
        let req = GenerateRequest {
            prompt: "lofi beat",
            style: Some("lofi"),
            title: None,
            custom_mode: true,
            instrumental: false,
            model: "V4",
            vocal_gender: Some("f"),
            call_back_url: Some("http://localhost:8787/callback"),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["customMode"], true);
        assert_eq!(v["callBackUrl"], "http://localhost:8787/callback");
        assert_eq!(v["vocalGender"], "f");
        assert!(v.get("title").is_none());
    }

    #[test]
    fn test_envelope_missing_data() {
        let raw = r#"{"code": 455, "msg": "maintenance"}"#;
        let envelope: ApiEnvelope<GenerateData> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, 455);
        assert!(envelope.data.is_none());
    }
}
