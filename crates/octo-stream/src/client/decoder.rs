//! Incremental server-sent events decoder.
//!
//! Network reads split frames at arbitrary byte offsets, including inside a
//! UTF-8 sequence. Bytes are buffered until a full line is available and
//! lines are accumulated until the blank line that ends a frame.

use bytes::BytesMut;
use log::warn;

use crate::canon::{OutboundEvent, StreamEvent};

/// One dispatched frame: optional event name plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Decode the frame into a pipeline event. Malformed payloads yield
    /// `None` and are logged.
    pub fn decode(&self) -> Option<OutboundEvent> {
        let decoded = match self.event.as_deref() {
            Some(kind) => OutboundEvent::from_wire(kind, &self.data),
            // Unnamed frames must carry their own tag.
            None => serde_json::from_str::<StreamEvent>(&self.data).map(OutboundEvent::Event),
        };

        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(
                    "Skipping malformed {} event: {} ({})",
                    self.event.as_deref().unwrap_or("unnamed"),
                    e,
                    preview(&self.data)
                );
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            match std::str::from_utf8(&line) {
                Ok(line) => {
                    if let Some(frame) = self.process_line(line) {
                        frames.push(frame);
                    }
                }
                Err(_) => warn!("Skipping SSE line with invalid UTF-8"),
            }
        }
        frames
    }

    /// Feed one network read and return the decoded events.
    pub fn push_events(&mut self, chunk: &[u8]) -> Vec<OutboundEvent> {
        self.push(chunk)
            .iter()
            .filter_map(SseFrame::decode)
            .collect()
    }

    /// Flush a trailing frame the server did not terminate with a blank
    /// line. Called once the byte stream has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&rest) {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if let Some(frame) = self.process_line(&line) {
                    return Some(frame);
                }
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment, e.g. `: keepalive`.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.filter(|e| !e.is_empty()),
            data,
        })
    }
}

fn preview(data: &str) -> String {
    const MAX: usize = 80;
    if data.chars().count() <= MAX {
        data.to_string()
    } else {
        let head: String = data.chars().take(MAX).collect();
        format!("{}...", head)
    }
}
