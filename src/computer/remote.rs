//! HTTP client for a sandbox-side control server.
//!
//! Speaks a small `{command, params}` JSON protocol to the automation server
//! running inside the sandbox. Screenshots come back base64-encoded in the
//! `data` field; input commands return `{success}`.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{Computer, ComputerError, ComputerSpec, OsType, Provisioner};
use crate::schema::{MouseButton, Point};

fn button_name(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "left",
        MouseButton::Right => "right",
        MouseButton::Wheel => "wheel",
        MouseButton::Back => "back",
        MouseButton::Forward => "forward",
    }
}

/// A computer handle backed by a remote control server.
pub struct HttpComputer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    os_type: OsType,
    provider_type: String,
    name: String,
}

impl HttpComputer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        os_type: OsType,
        provider_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            os_type,
            provider_type: provider_type.into(),
            name: name.into(),
        }
    }

    async fn command(&self, command: &str, params: Value) -> Result<Value, ComputerError> {
        let mut req = self
            .client
            .post(format!("{}/cmd", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&json!({ "command": command, "params": params }));
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ComputerError::Transport(format!("{command}: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ComputerError::Transport(format!("{command}: invalid response: {e}")))?;

        if status.is_server_error() {
            return Err(ComputerError::Transport(format!("{command}: HTTP {status}")));
        }
        if !status.is_success() || body["success"] == json!(false) {
            let detail = body["error"].as_str().unwrap_or("command rejected");
            return Err(ComputerError::Target(format!("{command}: {detail}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl Computer for HttpComputer {
    async fn screenshot(&self) -> Result<Vec<u8>, ComputerError> {
        let body = self.command("screenshot", json!({})).await?;
        let data = body["data"]
            .as_str()
            .ok_or_else(|| ComputerError::Target("screenshot: missing data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ComputerError::Target(format!("screenshot: bad base64: {e}")))
    }

    async fn dimensions(&self) -> Result<(u32, u32), ComputerError> {
        let body = self.command("screen_size", json!({})).await?;
        let w = body["width"].as_u64().unwrap_or(1024) as u32;
        let h = body["height"].as_u64().unwrap_or(768) as u32;
        Ok((w, h))
    }

    async fn left_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.command("left_click", json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn right_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.command("right_click", json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.command("double_click", json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.command("move_cursor", json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn mouse_down(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.command(
            "mouse_down",
            json!({ "x": x, "y": y, "button": button_name(button) }),
        )
        .await?;
        Ok(())
    }

    async fn mouse_up(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.command(
            "mouse_up",
            json!({ "x": x, "y": y, "button": button_name(button) }),
        )
        .await?;
        Ok(())
    }

    async fn drag(
        &self,
        path: &[Point],
        button: MouseButton,
        duration_ms: u64,
    ) -> Result<(), ComputerError> {
        let points: Vec<Value> = path.iter().map(|p| json!({ "x": p.x, "y": p.y })).collect();
        self.command(
            "drag",
            json!({ "path": points, "button": button_name(button), "duration_ms": duration_ms }),
        )
        .await?;
        Ok(())
    }

    async fn scroll(
        &self,
        x: i64,
        y: i64,
        scroll_x: i64,
        scroll_y: i64,
    ) -> Result<(), ComputerError> {
        self.command(
            "scroll",
            json!({ "x": x, "y": y, "scroll_x": scroll_x, "scroll_y": scroll_y }),
        )
        .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), ComputerError> {
        self.command("type_text", json!({ "text": text })).await?;
        Ok(())
    }

    async fn press_keys(&self, keys: &[String]) -> Result<(), ComputerError> {
        let command = if keys.len() > 1 { "hotkey" } else { "press_key" };
        self.command(command, json!({ "keys": keys })).await?;
        Ok(())
    }

    async fn wait(&self, ms: u64) -> Result<(), ComputerError> {
        // Waiting happens on our side; the sandbox has nothing to do.
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    fn os_type(&self) -> OsType {
        self.os_type
    }

    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provisioner that connects to pre-provisioned sandboxes by name.
///
/// `base_url` is a template with a `{name}` placeholder, e.g.
/// `https://{name}.containers.example.dev:8443`. VM lifecycle belongs to the
/// operator; `close` only drops the connection.
pub struct HttpProvisioner {
    base_url_template: String,
    api_key: Option<String>,
}

impl HttpProvisioner {
    pub fn new(base_url_template: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url_template: base_url_template.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn open(&self, spec: &ComputerSpec) -> Result<Arc<dyn Computer>, ComputerError> {
        let name = spec
            .name
            .clone()
            .ok_or_else(|| ComputerError::Target("computer spec requires a name".to_string()))?;
        let base_url = self.base_url_template.replace("{name}", &name);
        let computer = HttpComputer::new(
            base_url,
            self.api_key.clone(),
            spec.os_type,
            spec.provider_type.clone(),
            name.clone(),
        );
        // Probe the control server so a bad name fails at acquire time, not
        // mid-run.
        computer.dimensions().await?;
        tracing::info!(name = %name, os = ?spec.os_type, "opened computer handle");
        Ok(Arc::new(computer))
    }

    async fn close(&self, handle: Arc<dyn Computer>) -> Result<(), ComputerError> {
        tracing::info!(name = %handle.name(), "closed computer handle");
        Ok(())
    }
}
