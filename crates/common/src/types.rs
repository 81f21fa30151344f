//! Core types for browsercast

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Generate an opaque session identifier
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Error,
    Stopped,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Initializing => write!(f, "initializing"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Screen resolution, wire format `"WxH"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| Error::InvalidRequest(format!("invalid resolution: {s:?}")))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid resolution width: {w:?}")))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid resolution height: {h:?}")))?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidRequest(format!(
                "resolution must be non-zero: {s:?}"
            )));
        }
        Ok(Self { width, height })
    }
}

/// Kind of browser action a caller can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Scroll,
    Screenshot,
    Wait,
    Press,
    Evaluate,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Wait => "wait",
            ActionKind::Press => "press",
            ActionKind::Evaluate => "evaluate",
        };
        write!(f, "{name}")
    }
}

/// Screen-space coordinates; for scroll actions these carry the deltas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

/// One structured action request against a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

impl ActionRequest {
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Navigate,
            selector: None,
            value: Some(url.into()),
            coordinates: None,
        }
    }
}

/// Page viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Outcome of one action. Page-level failures land here as
/// `success = false` with an error message, never as an `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// Base64-encoded PNG, only for screenshot actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(action: ActionKind) -> Self {
        Self {
            success: true,
            action,
            url: None,
            title: None,
            viewport: None,
            screenshot: None,
            value: None,
            error: None,
        }
    }

    pub fn failed(action: ActionKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(action)
        }
    }
}

/// Center point of an element in screen space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One interactive element extracted from the page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageElement {
    #[serde(rename = "type")]
    pub tag: String,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub position: Position,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Page introspection snapshot for grounding next-action decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub title: String,
    pub elements: Vec<PageElement>,
    #[serde(rename = "textContent")]
    pub text_content: String,
    pub timestamp: String,
}

/// One screencast frame as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub session_id: String,
    pub frame_number: u64,
    /// Base64-encoded JPEG
    pub data: String,
    pub timestamp: String,
}

/// Lightweight session view for list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub frame_count: u64,
    pub subscriber_count: usize,
}

/// Orchestrator health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub sessions: usize,
    /// Ids stuck in `initializing` beyond the configured timeout
    #[serde(default)]
    pub stuck_sessions: Vec<String>,
}
