//! The computer port: screenshot and input primitives over a sandboxed
//! desktop.
//!
//! The port is a mechanical executor. It never interprets actions; mapping
//! canonical actions onto these primitives is the orchestrator's job, and
//! deciding which actions to take is the model's.

pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AgentError;
use crate::schema::{MouseButton, Point};

/// Failure of a computer-port operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComputerError {
    /// Network/socket trouble reaching the sandbox. Retryable.
    #[error("computer transport error: {0}")]
    Transport(String),
    /// The sandbox rejected or could not perform the operation. Not retryable.
    #[error("computer target error: {0}")]
    Target(String),
}

impl ComputerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputerError::Transport(_))
    }
}

impl From<ComputerError> for AgentError {
    fn from(err: ComputerError) -> Self {
        match err {
            ComputerError::Transport(msg) => AgentError::Transport(msg),
            ComputerError::Target(msg) => AgentError::Target(msg),
        }
    }
}

/// Operating system family of the sandboxed desktop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Macos,
    Windows,
}

impl OsType {
    /// The `environment` value OpenAI-style providers expect.
    pub fn environment(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Macos => "mac",
            OsType::Windows => "windows",
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "macos" | "mac" | "darwin" => Ok(OsType::Macos),
            "windows" => Ok(OsType::Windows),
            other => Err(AgentError::Config(format!("unknown os_type: {other}"))),
        }
    }
}

/// What a session asks the pool for when it needs a computer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputerSpec {
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default = "ComputerSpec::default_provider")]
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
}

impl Default for ComputerSpec {
    fn default() -> Self {
        Self {
            os_type: OsType::default(),
            provider_type: Self::default_provider(),
            name: None,
            image: None,
            memory: None,
            cpu: None,
        }
    }
}

impl ComputerSpec {
    fn default_provider() -> String {
        "cloud".to_string()
    }

    /// Whether an idle pooled handle satisfies this spec. A named spec only
    /// matches the same name; an anonymous spec matches any handle of the
    /// same os/provider.
    pub fn matches(&self, handle: &dyn Computer) -> bool {
        if handle.os_type() != self.os_type || handle.provider_type() != self.provider_type {
            return false;
        }
        match &self.name {
            Some(name) => handle.name() == name,
            None => true,
        }
    }
}

/// Uniform interface over the sandbox's input and screenshot primitives.
///
/// All operations may fail with [`ComputerError::Transport`] (retryable) or
/// [`ComputerError::Target`] (not retryable).
#[async_trait]
pub trait Computer: Send + Sync {
    /// Capture the screen as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, ComputerError>;

    /// Current display size in pixels.
    async fn dimensions(&self) -> Result<(u32, u32), ComputerError>;

    async fn left_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn right_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn double_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ComputerError>;

    async fn mouse_down(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError>;
    async fn mouse_up(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError>;

    async fn drag(
        &self,
        path: &[Point],
        button: MouseButton,
        duration_ms: u64,
    ) -> Result<(), ComputerError>;

    /// `(scroll_x, scroll_y)` are wheel deltas at position `(x, y)`.
    async fn scroll(
        &self,
        x: i64,
        y: i64,
        scroll_x: i64,
        scroll_y: i64,
    ) -> Result<(), ComputerError>;

    async fn type_text(&self, text: &str) -> Result<(), ComputerError>;

    /// Press keys; a chord when more than one is given.
    async fn press_keys(&self, keys: &[String]) -> Result<(), ComputerError>;

    async fn wait(&self, ms: u64) -> Result<(), ComputerError>;

    fn os_type(&self) -> OsType;
    fn provider_type(&self) -> &str;
    fn name(&self) -> &str;
}

/// Opens and closes computer handles. The pool is the only caller.
///
/// Hard isolation between sandboxes is this port's responsibility, not the
/// core's.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn open(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, ComputerError>;
    async fn close(&self, handle: Arc<dyn Computer>) -> Result<(), ComputerError>;
}
