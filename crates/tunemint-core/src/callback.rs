//! ============================================================================
//! Callback Listener - Push Channel for Completion Payloads
//! ============================================================================
//! A minimal HTTP endpoint that receives the generation service's completion
//! callback, normalizes it into the same event shape the poll path produces,
//! and forwards it over a channel. Runs tiny_http on a dedicated thread so
//! the async side only sees a stream of events.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::io::Read;
use tiny_http::{Response, Server};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{CompletionEvent, ServiceStatus, TrackPayload};

/// Callback payload as posted by the generation service. Field names arrive
/// in snake_case; camelCase aliases cover older payload revisions.
#[derive(Debug, Deserialize)]
pub struct CallbackPayload {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: CallbackData,
}

#[derive(Debug, Deserialize)]
pub struct CallbackData {
    #[serde(alias = "callbackType")]
    pub callback_type: String,
    #[serde(alias = "taskId")]
    pub task_id: String,
    #[serde(default)]
    pub data: Vec<CallbackTrack>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackTrack {
    pub id: String,
    #[serde(default, alias = "audioUrl")]
    pub audio_url: Option<String>,
    #[serde(default, alias = "sourceAudioUrl")]
    pub source_audio_url: Option<String>,
    #[serde(default, alias = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(default, alias = "sourceImageUrl")]
    pub source_image_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default, alias = "createTime")]
    pub create_time: Option<String>,
    #[serde(default, alias = "modelName")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl CallbackPayload {
    /// Normalize into the canonical completion shape. The callback type maps
    /// onto the service's progressive statuses; only "complete" carries the
    /// full batch.
    pub fn into_event(self) -> CompletionEvent {
        let status = if self.code != crate::suno::SUCCESS_CODE {
            ServiceStatus::GenerateAudioFailed
        } else {
            match self.data.callback_type.as_str() {
                "complete" => ServiceStatus::Success,
                "first" => ServiceStatus::FirstSuccess,
                "text" => ServiceStatus::TextSuccess,
                _ => ServiceStatus::Unknown,
            }
        };

        let tracks = self
            .data
            .data
            .into_iter()
            .map(|t| TrackPayload {
                id: t.id,
                audio_url: t.audio_url.or(t.source_audio_url).unwrap_or_default(),
                image_url: t.image_url.or(t.source_image_url).unwrap_or_default(),
                title: t.title.unwrap_or_default(),
                tags: t.tags.unwrap_or_default(),
                duration_secs: t.duration.unwrap_or(0.0),
                create_time: t.create_time.unwrap_or_default(),
                model_name: t.model_name.unwrap_or_default(),
                prompt: t.prompt.unwrap_or_default(),
            })
            .collect();

        CompletionEvent {
            task_id: self.data.task_id,
            code: self.code,
            status,
            tracks,
        }
    }
}

/// Spawn the callback endpoint on the given port. Returns the receiving end
/// of the event channel; the server thread lives for the process lifetime.
pub fn spawn_listener(port: u16) -> Result<mpsc::UnboundedReceiver<CompletionEvent>> {
    let addr = format!("0.0.0.0:{}", port);
    let server = Server::http(&addr).map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;

    let (tx, rx) = mpsc::unbounded_channel();

    info!("Callback listener on http://{}", addr);

    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            if let Err(e) = request.as_reader().read_to_string(&mut body) {
                warn!("Failed to read callback body: {}", e);
                let _ = request.respond(Response::from_string("bad request").with_status_code(400));
                continue;
            }

            match serde_json::from_str::<CallbackPayload>(&body) {
                Ok(payload) => {
                    let event = payload.into_event();
                    info!(
                        "Callback for task {} ({:?}, {} tracks)",
                        event.task_id,
                        event.status,
                        event.tracks.len()
                    );
                    if tx.send(event).is_err() {
                        // Receiver dropped: shut the thread down
                        break;
                    }
                    let _ = request.respond(Response::from_string("ok"));
                }
                Err(e) => {
                    warn!("Unparseable callback payload: {}", e);
                    let _ =
                        request.respond(Response::from_string("bad payload").with_status_code(400));
                }
            }
        }
    });

    Ok(rx)
}
