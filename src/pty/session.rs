//! PTY session records, key derivation, and shell command composition

use std::pin::Pin;

use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::router::Writer;

use super::buffer::RollingBuffer;

/// Chunks retained for reconnect replay
pub const BUFFER_CAP: usize = 5000;

/// What runs inside the TTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellProvider {
    Claude,
    Cursor,
    PlainShell,
}

impl ShellProvider {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("cursor") => ShellProvider::Cursor,
            Some("plain-shell") => ShellProvider::PlainShell,
            _ => ShellProvider::Claude,
        }
    }

    /// Human name used in welcome banners
    pub fn display_name(&self) -> &'static str {
        match self {
            ShellProvider::Claude => "Claude",
            ShellProvider::Cursor => "Cursor",
            ShellProvider::PlainShell => "shell",
        }
    }
}

/// Lifecycle status of a PTY session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyStatus {
    Active,
    Ended,
    Error,
}

/// One attached TTY exec and its replay state.
///
/// The session owns the stdin half and the rolling buffer; the WebSocket
/// reference is a weak handle that disconnect clears without tearing the
/// session down.
pub struct PtySession {
    pub key: String,
    pub user_id: String,
    pub container_id: String,
    pub exec_id: String,
    pub status: PtyStatus,
    pub cols: u16,
    pub rows: u16,
    pub project_path: String,
    pub buffer: RollingBuffer,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub writer: Option<Writer>,
    pub input: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub pump_cancel: CancellationToken,
    pub idle_cancel: Option<CancellationToken>,
}

impl PtySession {
    pub fn new(
        key: String,
        user_id: String,
        container_id: String,
        exec_id: String,
        cols: u16,
        rows: u16,
        project_path: String,
        writer: Writer,
        input: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            user_id,
            container_id,
            exec_id,
            status: PtyStatus::Active,
            cols,
            rows,
            project_path,
            buffer: RollingBuffer::new(BUFFER_CAP),
            created_at: now,
            last_active: now,
            ended_at: None,
            writer: Some(writer),
            input: Some(input),
            pump_cancel: CancellationToken::new(),
            idle_cancel: None,
        }
    }

    /// Cancel a pending idle timer, if armed
    pub fn cancel_idle_timer(&mut self) {
        if let Some(token) = self.idle_cancel.take() {
            token.cancel();
        }
    }
}

/// Deterministic session key:
/// `container_<user>_<project>_<sessionId|default>[_cmd_<b64(initialCommand)[:16]>]`
pub fn session_key(
    user_id: &str,
    project_path: &str,
    session_id: Option<&str>,
    initial_command: Option<&str>,
) -> String {
    let mut key = format!(
        "container_{}_{}_{}",
        user_id,
        project_path,
        session_id.unwrap_or("default")
    );

    if let Some(command) = initial_command {
        let encoded = base64::engine::general_purpose::STANDARD.encode(command);
        let prefix: String = encoded.chars().take(16).collect();
        key.push_str("_cmd_");
        key.push_str(&prefix);
    }

    key
}

/// Login commands must never reuse a session: credentials flows get confused
/// by resumed TTY state.
pub fn is_login_command(command: &str) -> bool {
    command.contains("setup-token")
        || command.contains("auth login")
        || command.split_whitespace().any(|word| word == "login")
}

/// Compose the command typed into the fresh shell
pub fn compose_initial_command(
    _provider: ShellProvider,
    shell_cli: &str,
    working_dir: &str,
    session_id: Option<&str>,
    has_session: bool,
    initial_command: Option<&str>,
    is_plain_shell: bool,
) -> String {
    if is_plain_shell {
        return match initial_command {
            Some(command) => format!("cd {} && {}", working_dir, command),
            None => format!("cd {}", working_dir),
        };
    }

    // Resume if the client claims an SDK session; fall back to a fresh CLI
    // when the resume id is gone
    match session_id {
        Some(sid) if has_session => format!(
            "cd {} && {} --resume {} || {}",
            working_dir, shell_cli, sid, shell_cli
        ),
        _ => format!("cd {} && {}", working_dir, shell_cli),
    }
}

/// ANSI welcome line shown before any TTY bytes
pub fn welcome_banner(
    provider: ShellProvider,
    is_plain_shell: bool,
    resuming: bool,
    project_path: &str,
) -> String {
    if is_plain_shell {
        return format!(
            "\x1b[36mStarting shell in container: {}\x1b[0m\r\n",
            project_path
        );
    }

    if resuming {
        format!(
            "\x1b[36mResuming {} session in container: {}\x1b[0m\r\n",
            provider.display_name(),
            project_path
        )
    } else {
        format!(
            "\x1b[36mStarting new {} session in container: {}\x1b[0m\r\n",
            provider.display_name(),
            project_path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_shape() {
        assert_eq!(
            session_key("7", "foo", Some("s1"), None),
            "container_7_foo_s1"
        );
        assert_eq!(session_key("7", "foo", None, None), "container_7_foo_default");
    }

    #[test]
    fn test_session_key_command_suffix_is_bounded() {
        let key = session_key(
            "7",
            "foo",
            None,
            Some("npm run dev -- --port 3000 --verbose"),
        );

        let suffix = key.strip_prefix("container_7_foo_default_cmd_").unwrap();
        assert_eq!(suffix.len(), 16);
    }

    #[test]
    fn test_session_key_distinguishes_commands() {
        let a = session_key("7", "foo", None, Some("htop"));
        let b = session_key("7", "foo", None, Some("bash"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_login_command_detection() {
        assert!(is_login_command("claude setup-token"));
        assert!(is_login_command("gh auth login"));
        assert!(is_login_command("cursor-agent login"));
        assert!(!is_login_command("echo logindata"));
        assert!(!is_login_command("npm run dev"));
    }

    #[test]
    fn test_compose_plain_shell() {
        let command = compose_initial_command(
            ShellProvider::PlainShell,
            "claude",
            "/workspace/foo",
            None,
            false,
            Some("htop"),
            true,
        );
        assert_eq!(command, "cd /workspace/foo && htop");

        let bare = compose_initial_command(
            ShellProvider::PlainShell,
            "claude",
            "/workspace/foo",
            None,
            false,
            None,
            true,
        );
        assert_eq!(bare, "cd /workspace/foo");
    }

    #[test]
    fn test_compose_provider_resume_falls_back() {
        let command = compose_initial_command(
            ShellProvider::Claude,
            "claude",
            "/workspace/foo",
            Some("s1"),
            true,
            None,
            false,
        );
        assert_eq!(command, "cd /workspace/foo && claude --resume s1 || claude");
    }

    #[test]
    fn test_compose_provider_fresh_without_session() {
        let command = compose_initial_command(
            ShellProvider::Cursor,
            "cursor-agent",
            "/workspace/foo",
            Some("s1"),
            false,
            None,
            false,
        );
        assert_eq!(command, "cd /workspace/foo && cursor-agent");
    }

    #[test]
    fn test_welcome_banner_variants() {
        assert_eq!(
            welcome_banner(ShellProvider::Claude, false, false, "foo"),
            "\x1b[36mStarting new Claude session in container: foo\x1b[0m\r\n"
        );
        assert_eq!(
            welcome_banner(ShellProvider::Claude, false, true, "foo"),
            "\x1b[36mResuming Claude session in container: foo\x1b[0m\r\n"
        );
        assert_eq!(
            welcome_banner(ShellProvider::PlainShell, true, false, "foo"),
            "\x1b[36mStarting shell in container: foo\x1b[0m\r\n"
        );
    }
}
