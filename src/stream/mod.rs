//! Exec stream demultiplexing
//!
//! A non-TTY exec yields stdout and stderr as separate frame kinds on one
//! duplex stream. The demuxer assembles stdout into line-delimited JSON
//! events and classifies stderr: SDK debug lines are diagnostics, and only a
//! Node-style error signature makes the whole operation a failure. TTY
//! streams never pass through here.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Typed events recognized on the SDK's stdout
const RECOGNIZED_TYPES: &[&str] = &["session_start", "content", "output", "done", "error", "result"];

/// Reserved stderr prefix for SDK debug output
const SDK_DEBUG_PREFIX: &str = "[SDK]";

static ERROR_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z]*Error: ").expect("static regex"));
static STACK_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+at\s").expect("static regex"));

/// One event assembled from the SDK's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum SdkEvent {
    /// A parsed line-delimited JSON object carrying a recognized `type`
    Typed(Value),
    /// Plain stdout that was not a recognized JSON event
    Output(String),
}

/// Accumulates exec output and turns it into typed events.
///
/// Feed stdout and stderr chunks as they arrive; call `finish` when the
/// stream ends to flush partial lines, then `true_error` to learn whether
/// stderr amounted to a failure.
#[derive(Debug, Default)]
pub struct JsonLineDemuxer {
    stdout_buf: String,
    stderr_buf: String,
    stderr_lines: Vec<String>,
}

impl JsonLineDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a stdout chunk; returns the events completed by this chunk
    pub fn push_stdout(&mut self, data: &[u8]) -> Vec<SdkEvent> {
        self.stdout_buf.push_str(&String::from_utf8_lossy(data));

        let mut events = Vec::new();
        while let Some(pos) = self.stdout_buf.find('\n') {
            let line: String = self.stdout_buf.drain(..=pos).collect();
            if let Some(event) = classify_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Feed a stderr chunk
    pub fn push_stderr(&mut self, data: &[u8]) {
        self.stderr_buf.push_str(&String::from_utf8_lossy(data));

        while let Some(pos) = self.stderr_buf.find('\n') {
            let line: String = self.stderr_buf.drain(..=pos).collect();
            self.stderr_lines
                .push(line.trim_end_matches(['\n', '\r']).to_string());
        }
    }

    /// Flush any partial lines after the stream ends
    pub fn finish(&mut self) -> Vec<SdkEvent> {
        let mut events = Vec::new();

        if !self.stdout_buf.is_empty() {
            let rest = std::mem::take(&mut self.stdout_buf);
            if let Some(event) = classify_line(&rest) {
                events.push(event);
            }
        }

        if !self.stderr_buf.is_empty() {
            let rest = std::mem::take(&mut self.stderr_buf);
            self.stderr_lines.push(rest);
        }

        events
    }

    /// A true error requires a Node-style signature on stderr; everything
    /// else (including `[SDK]` debug lines) is diagnostic output only.
    pub fn true_error(&self) -> Option<String> {
        let significant: Vec<&str> = self
            .stderr_lines
            .iter()
            .map(String::as_str)
            .filter(|line| !line.trim_start().starts_with(SDK_DEBUG_PREFIX))
            .collect();

        let is_error = significant.iter().any(|line| {
            ERROR_HEAD.is_match(line)
                || STACK_FRAME.is_match(line)
                || line.contains("process.exit(1)")
        });

        if is_error {
            let text = significant
                .iter()
                .filter(|line| !line.trim().is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            Some(text)
        } else {
            None
        }
    }
}

/// Classify one stdout line: recognized JSON event, or raw output
fn classify_line(line: &str) -> Option<SdkEvent> {
    if line.trim().is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(line) {
        if let Some(kind) = value.get("type").and_then(Value::as_str) {
            if RECOGNIZED_TYPES.contains(&kind) {
                return Some(SdkEvent::Typed(value));
            }
        }
    }

    Some(SdkEvent::Output(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recognized_json_becomes_typed_event() {
        let mut demuxer = JsonLineDemuxer::new();
        let events =
            demuxer.push_stdout(b"{\"type\":\"content\",\"chunk\":{\"text\":\"hi\"}}\n");

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            SdkEvent::Typed(json!({"type": "content", "chunk": {"text": "hi"}}))
        );
    }

    #[test]
    fn test_unrecognized_stdout_becomes_output() {
        let mut demuxer = JsonLineDemuxer::new();

        let events = demuxer.push_stdout(b"npm WARN deprecated something\n");
        assert_eq!(
            events[0],
            SdkEvent::Output("npm WARN deprecated something".to_string())
        );

        // Valid JSON with an unknown type is still plain output
        let events = demuxer.push_stdout(b"{\"type\":\"heartbeat\"}\n");
        assert_eq!(
            events[0],
            SdkEvent::Output("{\"type\":\"heartbeat\"}".to_string())
        );
    }

    #[test]
    fn test_partial_lines_assemble_across_chunks() {
        let mut demuxer = JsonLineDemuxer::new();

        assert!(demuxer.push_stdout(b"{\"type\":\"do").is_empty());
        let events = demuxer.push_stdout(b"ne\"}\n{\"type\":\"content\",\"chunk\":1}\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SdkEvent::Typed(json!({"type": "done"})));
        assert_eq!(
            events[1],
            SdkEvent::Typed(json!({"type": "content", "chunk": 1}))
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut demuxer = JsonLineDemuxer::new();
        assert!(demuxer.push_stdout(b"tail without newline").is_empty());

        let events = demuxer.finish();
        assert_eq!(
            events,
            vec![SdkEvent::Output("tail without newline".to_string())]
        );
    }

    #[test]
    fn test_sdk_debug_stderr_is_not_an_error() {
        let mut demuxer = JsonLineDemuxer::new();
        demuxer.push_stderr(b"[SDK] resolving model alias\n[SDK] attempt 1\n");

        assert!(demuxer.true_error().is_none());
    }

    #[test]
    fn test_plain_stderr_is_diagnostic_only() {
        let mut demuxer = JsonLineDemuxer::new();
        demuxer.push_stderr(b"warning: config file missing, using defaults\n");

        assert!(demuxer.true_error().is_none());
    }

    #[test]
    fn test_node_error_signature_is_true_error() {
        let mut demuxer = JsonLineDemuxer::new();
        demuxer.push_stderr(b"TypeError: cannot read properties of undefined\n");
        demuxer.push_stderr(b"    at run (/app/sdk/claude-runner.mjs:14:9)\n");

        let error = demuxer.true_error().expect("should be a true error");
        assert!(error.contains("TypeError"));
        assert!(error.contains("at run"));
    }

    #[test]
    fn test_process_exit_trace_is_true_error() {
        let mut demuxer = JsonLineDemuxer::new();
        demuxer.push_stderr(b"fatal: process.exit(1) called\n");

        assert!(demuxer.true_error().is_some());
    }

    #[test]
    fn test_debug_lines_excluded_from_error_text() {
        let mut demuxer = JsonLineDemuxer::new();
        demuxer.push_stderr(b"[SDK] shutting down\n");
        demuxer.push_stderr(b"Error: boom\n");

        let error = demuxer.true_error().unwrap();
        assert!(!error.contains("[SDK]"));
        assert!(error.contains("Error: boom"));
    }
}
