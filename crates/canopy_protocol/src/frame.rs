//! Incremental reader for the push-stream framing.
//!
//! The wire format is text frames separated by blank lines. Each frame is
//! one or more `field: value` lines terminated by `\n` (a trailing `\r` is
//! tolerated). Frames may span multiple socket reads, so the reader buffers
//! partial input and yields frames only once their terminating blank line
//! has arrived.

use crate::error::{ProtocolError, ProtocolResult};
use crate::path::Path;
use serde::Deserialize;

/// A decoded `field: value` frame, before event interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the `event` field, if present.
    pub event: Option<String>,
    /// Value of the `data` field, if present. Multiple `data` lines are
    /// joined with `\n`.
    pub data: Option<String>,
}

impl RawFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none()
    }
}

/// Buffers raw stream bytes and yields complete frames.
///
/// # Example
///
/// ```rust
/// use canopy_protocol::FrameReader;
///
/// let mut reader = FrameReader::new();
/// reader.push(b"event: keep-alive\ndata: ");
/// assert!(reader.next_frame().unwrap().is_none());
/// reader.push(b"null\n\n");
/// let frame = reader.next_frame().unwrap().unwrap();
/// assert_eq!(frame.event.as_deref(), Some("keep-alive"));
/// ```
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the number of buffered, unconsumed bytes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Yields the next complete frame, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a complete frame is not valid UTF-8. The
    /// offending frame is consumed, so the reader stays usable.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<RawFrame>> {
        loop {
            let Some(end) = self.find_frame_end() else {
                return Ok(None);
            };

            let raw: Vec<u8> = self.buf.drain(..end).collect();
            let text = std::str::from_utf8(&raw)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

            let frame = parse_frame(text);
            if frame.is_empty() {
                // Stray blank lines between frames.
                continue;
            }
            return Ok(Some(frame));
        }
    }

    /// Discards all buffered bytes. Used when a connection is torn down.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Finds the byte index just past the first terminated blank line.
    fn find_frame_end(&self) -> Option<usize> {
        let mut line_start = 0;
        for (i, b) in self.buf.iter().enumerate() {
            if *b != b'\n' {
                continue;
            }
            let mut line = &self.buf[line_start..i];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
        None
    }
}

fn parse_frame(text: &str) -> RawFrame {
    let mut frame = RawFrame::default();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => match frame.data {
                Some(ref mut existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => frame.data = Some(value.to_string()),
            },
            // Comment lines (empty field) and unknown fields are ignored.
            _ => {}
        }
    }
    frame
}

/// A data-bearing frame's decoded payload: the affected path and the raw
/// JSON value at that path (`null` for deletions).
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePayload {
    /// Path the update applies to, relative to the subscribed root.
    pub path: Path,
    /// The JSON value now at that path.
    pub data: serde_json::Value,
}

#[derive(Deserialize)]
struct WirePayload {
    path: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A recognized push-stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The value at a path was replaced.
    Put(UpdatePayload),
    /// The children of a path were merged.
    Patch(UpdatePayload),
    /// Idle keep-alive; resets the read timeout.
    KeepAlive,
    /// The server revoked access to the subscribed path.
    Cancel,
    /// Credentials expired; the client must reconnect.
    AuthRevoked,
}

impl StreamEvent {
    /// Interprets a raw frame as a stream event.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event tags, data-bearing events with no
    /// `data` field, or payloads that are not `{path, data}` JSON objects.
    pub fn from_frame(frame: &RawFrame) -> ProtocolResult<Self> {
        let event = frame
            .event
            .as_deref()
            .ok_or_else(|| ProtocolError::MalformedFrame("missing event field".into()))?;

        match event {
            "put" => Ok(Self::Put(decode_payload(event, frame)?)),
            "patch" => Ok(Self::Patch(decode_payload(event, frame)?)),
            "keep-alive" => Ok(Self::KeepAlive),
            "cancel" => Ok(Self::Cancel),
            "auth_revoked" => Ok(Self::AuthRevoked),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

fn decode_payload(event: &str, frame: &RawFrame) -> ProtocolResult<UpdatePayload> {
    let data = frame
        .data
        .as_deref()
        .ok_or_else(|| ProtocolError::MissingData(event.to_string()))?;

    let wire: WirePayload = serde_json::from_str(data)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

    Ok(UpdatePayload {
        path: Path::parse(&wire.path),
        data: wire.data,
    })
}
