//! Durable trajectory capture.
//!
//! Layout under the base directory, one directory per run:
//!
//! ```text
//! <base>/<YYYYMMDD_HHMMSS>_<session_id>/
//!     messages.jsonl              one canonical message per line
//!     screenshots/<call_id>.png   decoded screenshot payloads
//! ```
//!
//! Messages are written as they happen so a process crash loses at most the
//! in-flight event; the jsonl file is fsynced at run end.

use async_trait::async_trait;
use base64::Engine;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::{Callback, RunContext};
use crate::error::AgentError;
use crate::loops::{strip_data_url, StepOutput};
use crate::run::RunResult;
use crate::schema::{Action, Message, SYNTHETIC_SCREENSHOT_URL};

struct TrajectoryState {
    run_dir: PathBuf,
    file: File,
    /// How many messages of the orchestrator's history have been written.
    written: usize,
}

pub struct TrajectoryWriter {
    base_dir: PathBuf,
    state: Mutex<Option<TrajectoryState>>,
}

impl TrajectoryWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state: Mutex::new(None),
        }
    }

    fn append(state: &mut TrajectoryState, msg: &Message) {
        match serde_json::to_string(msg) {
            Ok(line) => {
                if let Err(e) = writeln!(state.file, "{line}") {
                    tracing::warn!(error = %e, "failed to append trajectory message");
                }
                state.written += 1;
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode trajectory message"),
        }
    }

    fn save_screenshot(state: &TrajectoryState, msg: &Message) {
        let Message::ComputerCallOutput {
            call_id, output, ..
        } = msg
        else {
            return;
        };
        let Some(url) = output.image_url() else {
            return;
        };
        if url == SYNTHETIC_SCREENSHOT_URL || !url.starts_with("data:") {
            return;
        }
        match base64::engine::general_purpose::STANDARD.decode(strip_data_url(url)) {
            Ok(png) => {
                let path = state.run_dir.join("screenshots").join(format!("{call_id}.png"));
                if let Err(e) = fs::write(&path, png) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to save screenshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "screenshot payload is not valid base64"),
        }
    }
}

#[async_trait]
impl Callback for TrajectoryWriter {
    async fn on_run_start(&self, ctx: &RunContext) {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let run_dir = self.base_dir.join(format!("{stamp}_{}", ctx.session_id));
        let result = (|| -> std::io::Result<TrajectoryState> {
            fs::create_dir_all(run_dir.join("screenshots"))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(run_dir.join("messages.jsonl"))?;
            Ok(TrajectoryState {
                run_dir: run_dir.clone(),
                file,
                written: 0,
            })
        })();
        match result {
            Ok(state) => {
                tracing::info!(dir = %run_dir.display(), "trajectory capture started");
                *self.state.lock().await = Some(state);
            }
            Err(e) => {
                tracing::warn!(error = %e, dir = %run_dir.display(), "trajectory capture disabled")
            }
        }
    }

    async fn before_turn(&self, _ctx: &RunContext, messages: Vec<Message>) -> Vec<Message> {
        // The first turn carries the caller's input; later turns only replay
        // history we already captured through after_llm/after_action.
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            if state.written == 0 {
                for msg in &messages {
                    Self::append(state, msg);
                }
            }
        }
        messages
    }

    async fn after_llm(
        &self,
        _ctx: &RunContext,
        resp: StepOutput,
    ) -> Result<StepOutput, AgentError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            for msg in &resp.messages {
                Self::append(state, msg);
            }
        }
        Ok(resp)
    }

    async fn after_action(
        &self,
        _ctx: &RunContext,
        _action: &Action,
        result: Message,
    ) -> Message {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            Self::save_screenshot(state, &result);
            Self::append(state, &result);
        }
        result
    }

    async fn on_run_end(&self, _ctx: &RunContext, result: &RunResult) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            // The run result is the authoritative message list: it includes
            // terminal notes and recovery messages that never passed through
            // the shaping hooks. Replace the incremental log with it.
            let finalize = (|| -> std::io::Result<()> {
                use std::io::Seek;
                state.file.set_len(0)?;
                state.file.seek(std::io::SeekFrom::Start(0))?;
                for msg in &result.output {
                    let line = serde_json::to_string(msg)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    writeln!(state.file, "{line}")?;
                }
                state.file.sync_all()
            })();
            if let Err(e) = finalize {
                tracing::warn!(error = %e, "failed to finalize trajectory");
            }
        }
        *guard = None;
    }
}
