//! WebSocket message envelope
//!
//! Every frame is a JSON object with a required `type` discriminator.
//! Unknown incoming types are ignored by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A file attachment referenced by a chat command
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub path: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Client-to-server frames, chat and shell channels combined
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Incoming {
    #[serde(rename = "claude-command", rename_all = "camelCase")]
    ClaudeCommand {
        command: String,
        #[serde(default)]
        options: Value,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },

    #[serde(rename = "cursor-command", rename_all = "camelCase")]
    CursorCommand {
        command: String,
        #[serde(default)]
        options: Value,
    },

    #[serde(rename = "codex-command", rename_all = "camelCase")]
    CodexCommand {
        command: String,
        #[serde(default)]
        options: Value,
    },

    #[serde(rename = "cursor-resume", rename_all = "camelCase")]
    CursorResume {
        session_id: String,
        #[serde(default)]
        options: Option<Value>,
    },

    #[serde(rename = "abort-session", rename_all = "camelCase")]
    AbortSession {
        session_id: String,
        #[serde(default)]
        provider: Option<String>,
    },

    #[serde(rename = "cursor-abort", rename_all = "camelCase")]
    CursorAbort { session_id: String },

    #[serde(rename = "check-session-status", rename_all = "camelCase")]
    CheckSessionStatus {
        session_id: String,
        #[serde(default)]
        provider: Option<String>,
    },

    #[serde(rename = "get-active-sessions")]
    GetActiveSessions,

    #[serde(rename = "init")]
    Init(ShellInit),

    #[serde(rename = "input")]
    Input { data: String },

    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
}

/// Shell channel `init` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInit {
    pub project_path: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub has_session: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub initial_command: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub is_plain_shell: bool,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Outgoing {
    #[serde(rename = "session_start", rename_all = "camelCase")]
    SessionStart {
        session_id: String,
        container_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "done", rename_all = "camelCase")]
    Done { session_id: String },

    #[serde(rename = "output", rename_all = "camelCase")]
    Output {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: String,
    },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },

    #[serde(rename = "session-aborted", rename_all = "camelCase")]
    SessionAborted {
        session_id: String,
        provider: String,
        success: bool,
    },

    #[serde(rename = "session-status", rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        provider: String,
        is_processing: bool,
    },

    #[serde(rename = "active-sessions")]
    ActiveSessions { sessions: Value },

    #[serde(rename = "url_open")]
    UrlOpen { url: String },

    /// TaskMaster broadcast envelope; the inner payload is opaque here
    #[serde(rename = "taskmaster-event")]
    TaskmasterEvent { event: String, payload: Value },
}

impl Outgoing {
    /// Plain shell/agent output without a session id
    pub fn output(data: impl Into<String>) -> Self {
        Outgoing::Output {
            session_id: None,
            data: data.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outgoing::Error {
            session_id: None,
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claude_command_round_trip() {
        let frame = json!({
            "type": "claude-command",
            "command": "echo hi",
            "options": {"sessionId": "a1"},
            "attachments": [{"name": "notes.md", "type": "text/markdown"}]
        });

        let incoming: Incoming = serde_json::from_value(frame).unwrap();
        match incoming {
            Incoming::ClaudeCommand {
                command,
                options,
                attachments,
            } => {
                assert_eq!(command, "echo hi");
                assert_eq!(options["sessionId"], "a1");
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].name, "notes.md");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_shell_init_defaults() {
        let incoming: Incoming =
            serde_json::from_value(json!({"type": "init", "projectPath": "foo"})).unwrap();

        match incoming {
            Incoming::Init(init) => {
                assert_eq!(init.project_path, "foo");
                assert_eq!(init.cols, 80);
                assert_eq!(init.rows, 24);
                assert!(!init.has_session);
                assert!(!init.is_plain_shell);
                assert!(init.session_id.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_fails_parse() {
        // The dispatcher relies on this to ignore unknown frames
        let result = serde_json::from_value::<Incoming>(json!({"type": "telemetry"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_outgoing_wire_names() {
        let frame = serde_json::to_value(Outgoing::SessionAborted {
            session_id: "a1".into(),
            provider: "claude".into(),
            success: true,
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({"type": "session-aborted", "sessionId": "a1", "provider": "claude", "success": true})
        );

        let frame = serde_json::to_value(Outgoing::SessionStatus {
            session_id: "a1".into(),
            provider: "cursor".into(),
            is_processing: false,
        })
        .unwrap();
        assert_eq!(frame["isProcessing"], json!(false));

        let frame = serde_json::to_value(Outgoing::output("hi")).unwrap();
        assert_eq!(frame, json!({"type": "output", "data": "hi"}));
    }

    #[test]
    fn test_session_start_omits_empty_message() {
        let frame = serde_json::to_value(Outgoing::SessionStart {
            session_id: "a1".into(),
            container_id: "c1".into(),
            message: None,
        })
        .unwrap();

        assert_eq!(
            frame,
            json!({"type": "session_start", "sessionId": "a1", "containerId": "c1"})
        );
    }
}
