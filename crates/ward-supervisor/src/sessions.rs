//! Read-only view of the gateway's sessions.
//!
//! The gateway CLI is the only source of the session index location, so the
//! subprocess mechanics live behind [`SessionSource`]. Everything above it
//! works on plain text and files.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use ward_types::session::{RawContent, Role, Session, SessionMessage};

use crate::error::{WardenError, WardenResult};

/// Longest message text returned to callers, in characters.
pub const DISPLAY_LIMIT: usize = 2000;
const CONTINUATION: &str = "…";
const NON_TEXT_PLACEHOLDER: &str = "[non-text content]";
const EMPTY_PLACEHOLDER: &str = "[no content]";

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;

const TAIL_BLOCK: u64 = 8 * 1024;

#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Raw output of the gateway's session listing.
    async fn list_sessions_raw(&self, active_minutes: Option<u32>) -> Result<String>;
}

#[async_trait]
impl<T: SessionSource + ?Sized> SessionSource for std::sync::Arc<T> {
    async fn list_sessions_raw(&self, active_minutes: Option<u32>) -> Result<String> {
        (**self).list_sessions_raw(active_minutes).await
    }
}

/// Runs `<binary> sessions --json [--active <n>]` with a hard timeout.
pub struct CliSessionSource {
    binary: String,
    timeout: Duration,
}

impl CliSessionSource {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SessionSource for CliSessionSource {
    async fn list_sessions_raw(&self, active_minutes: Option<u32>) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["sessions", "--json"]);
        if let Some(minutes) = active_minutes {
            cmd.args(["--active", &minutes.to_string()]);
        }
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "`{} sessions` timed out after {:?}",
                    self.binary,
                    self.timeout
                )
            })?
            .with_context(|| format!("Failed to run `{} sessions`", self.binary))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!("`{} sessions` exited with {}", self.binary, output.status);
            return Ok(stderr);
        }
        Ok(stdout)
    }
}

/// Result of a session listing. `raw` is set when the output wasn't JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionListing {
    pub sessions: Vec<Session>,
    pub index_path: Option<PathBuf>,
    pub raw: Option<String>,
}

pub struct SessionStore<S> {
    source: S,
}

impl<S: SessionSource> SessionStore<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn list_sessions(
        &self,
        active_minutes: Option<u32>,
    ) -> WardenResult<SessionListing> {
        let raw = self.source.list_sessions_raw(active_minutes).await?;
        Ok(parse_listing(&raw))
    }

    /// The last `limit` messages of a session's transcript, oldest first.
    pub async fn get_history(&self, key: &str, limit: usize) -> WardenResult<Vec<SessionMessage>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);

        let listing = self.list_sessions(None).await?;
        let index_path = listing.index_path.ok_or_else(|| {
            WardenError::Internal(anyhow::anyhow!("session listing did not report an index path"))
        })?;

        let transcript = {
            let index_path = index_path.clone();
            let key = key.to_string();
            tokio::task::spawn_blocking(move || transcript_path(&index_path, &key))
                .await
                .context("Session index task failed")??
        };
        let Some(transcript) = transcript else {
            return Err(WardenError::SessionNotFound(key.to_string()));
        };
        debug!("Reading last {limit} lines of {}", transcript.display());

        let lines = tokio::task::spawn_blocking(move || tail_lines(&transcript, limit))
            .await
            .context("Transcript tail task failed")??;

        Ok(lines.iter().filter_map(|l| parse_message_line(l)).collect())
    }
}

/// Parse listing output. Non-JSON output degrades to an empty list plus the
/// raw text; individual malformed session records are skipped.
pub fn parse_listing(raw: &str) -> SessionListing {
    let doc: Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!("Session listing is not JSON: {e}");
            return SessionListing {
                sessions: Vec::new(),
                index_path: None,
                raw: Some(raw.to_string()),
            };
        }
    };

    let (records, index_path) = match &doc {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(obj) => (
            obj.get("sessions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            obj.get("path").and_then(Value::as_str).map(PathBuf::from),
        ),
        _ => (&[][..], None),
    };

    let sessions = records
        .iter()
        .filter_map(|r| match serde_json::from_value::<Session>(r.clone()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Skipping malformed session record: {e}");
                None
            }
        })
        .collect();

    SessionListing {
        sessions,
        index_path,
        raw: None,
    }
}

/// Resolve a session key to its transcript file using the session index.
/// `Ok(None)` means the key is not in the index.
fn transcript_path(index_path: &Path, key: &str) -> Result<Option<PathBuf>> {
    let text = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read session index {}", index_path.display()))?;
    let index: serde_json::Map<String, Value> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse session index {}", index_path.display()))?;

    let Some(entry) = index.get(key) else {
        return Ok(None);
    };

    if let Some(file) = entry.get("sessionFile").and_then(Value::as_str) {
        return Ok(Some(PathBuf::from(file)));
    }
    let session_id = entry
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Session index entry for {key} has no transcript"))?;
    let dir = index_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(Some(dir.join(format!("{session_id}.jsonl"))))
}

/// Last `n` non-empty lines of a file, reading backwards so large
/// transcripts are never loaded whole.
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open transcript {}", path.display()))?;
    let len = file.metadata()?.len();

    // Blocks are collected newest first and joined once at the end.
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut newlines = 0;
    let mut pos = len;
    while pos > 0 {
        let read = TAIL_BLOCK.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos))?;
        let mut block = vec![0u8; read as usize];
        file.read_exact(&mut block)?;
        newlines += block.iter().filter(|b| **b == b'\n').count();
        blocks.push(block);

        // One extra newline guarantees the earliest wanted line is complete.
        if newlines > n {
            break;
        }
    }
    let buf: Vec<u8> = blocks.into_iter().rev().flatten().collect();

    let text = String::from_utf8_lossy(&buf);
    let mut segments = text.split('\n');
    // The first segment may be partial when we stopped mid-file.
    if pos > 0 {
        segments.next();
    }
    let mut lines: Vec<String> = segments
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines.split_off(skip))
}

/// Parse one transcript line. Lines that aren't JSON objects are skipped.
fn parse_message_line(line: &str) -> Option<SessionMessage> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping unparseable transcript line: {e}");
            return None;
        }
    };
    let outer = value.as_object()?;
    // Either the message itself or an envelope around it.
    let msg = outer
        .get("message")
        .and_then(Value::as_object)
        .unwrap_or(outer);

    let role = msg
        .get("role")
        .and_then(Value::as_str)
        .and_then(|r| r.parse::<Role>().ok())
        .unwrap_or(Role::Unknown);

    let content = match msg.get("content").cloned().map(serde_json::from_value::<RawContent>) {
        Some(Ok(raw)) => normalize_content(&raw, msg.get("text")),
        _ => fallback_text(msg.get("text")),
    };

    let timestamp = outer
        .get("timestamp")
        .or_else(|| msg.get("timestamp"))
        .and_then(|t| match t {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Some(SessionMessage {
        role,
        content: truncate_for_display(&content),
        timestamp,
    })
}

fn normalize_content(raw: &RawContent, text_field: Option<&Value>) -> String {
    match raw {
        RawContent::Text(s) => s.clone(),
        RawContent::Parts(parts) => parts
            .iter()
            .find(|p| p.is_text())
            .and_then(|p| p.text.clone())
            .unwrap_or_else(|| NON_TEXT_PLACEHOLDER.to_string()),
        RawContent::Other(_) => fallback_text(text_field),
    }
}

fn fallback_text(text_field: Option<&Value>) -> String {
    text_field
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| EMPTY_PLACEHOLDER.to_string())
}

fn truncate_for_display(text: &str) -> String {
    match text.char_indices().nth(DISPLAY_LIMIT) {
        Some((cut, _)) => format!("{}{CONTINUATION}", &text[..cut]),
        None => text.to_string(),
    }
}
