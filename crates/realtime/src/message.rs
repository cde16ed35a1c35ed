use crate::error::RealtimeError;
use crate::path;
use serde::Deserialize;
use serde_json::Value;

/// One server-sent event as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` framer.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across network chunks survive intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event.is_empty() && self.data.is_empty() {
            return None;
        }
        let event = std::mem::take(&mut self.event);
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: if event.is_empty() {
                "message".to_string()
            } else {
                event
            },
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    #[serde(default)]
    data: Value,
}

/// Events of the Realtime Database streaming protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Replace the value at `path` (relative to the subscribed location).
    Put { path: String, data: Value },
    /// Merge the children of `data` into `path`.
    Patch { path: String, data: Value },
    KeepAlive,
    /// The server stopped the stream, typically for lack of permission.
    Cancel(String),
    /// The credential expired or was revoked.
    AuthRevoked,
    Unknown(String),
}

impl StreamEvent {
    pub fn parse(event: &SseEvent) -> Result<Self, RealtimeError> {
        Ok(match event.event.as_str() {
            "put" => {
                let body: PathData = serde_json::from_str(&event.data)?;
                StreamEvent::Put {
                    path: body.path,
                    data: body.data,
                }
            }
            "patch" => {
                let body: PathData = serde_json::from_str(&event.data)?;
                StreamEvent::Patch {
                    path: body.path,
                    data: body.data,
                }
            }
            "keep-alive" => StreamEvent::KeepAlive,
            "cancel" => {
                let reason = serde_json::from_str::<Value>(&event.data)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "subscription cancelled by server".to_string());
                StreamEvent::Cancel(reason)
            }
            "auth_revoked" => StreamEvent::AuthRevoked,
            other => StreamEvent::Unknown(other.to_string()),
        })
    }

    /// Apply a `put`/`patch` to the locally cached snapshot. Returns whether
    /// the event carried data.
    pub fn apply_to(&self, cache: &mut Value) -> Result<bool, RealtimeError> {
        match self {
            StreamEvent::Put { path: at, data } => {
                path::set(cache, at, data.clone());
                Ok(true)
            }
            StreamEvent::Patch { path: at, data } => {
                path::merge(cache, at, data.clone())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl std::fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEvent::Put { path, .. } => write!(f, "put {}", path),
            StreamEvent::Patch { path, .. } => write!(f, "patch {}", path),
            StreamEvent::KeepAlive => write!(f, "keep-alive"),
            StreamEvent::Cancel(reason) => write!(f, "cancel ({})", reason),
            StreamEvent::AuthRevoked => write!(f, "auth_revoked"),
            StreamEvent::Unknown(name) => write!(f, "unknown event '{}'", name),
        }
    }
}
