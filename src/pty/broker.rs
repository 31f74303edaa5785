//! PTY session brokering: create, reconnect, input, resize, idle teardown

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::container::{ContainerManager, ShellOptions, UserConfig};
use crate::router::{Outgoing, ShellInit, Writer};

use super::session::{
    compose_initial_command, is_login_command, session_key, welcome_banner, PtySession,
    PtyStatus, ShellProvider,
};
use super::urls::scan_chunk;

const RECONNECT_BANNER: &str = "\x1b[36m[Reconnected to existing session]\x1b[0m\r\n";
const PROCESS_EXITED: &str = "\n<ProcessExited>\n";

/// Broker owning every PTY session on this node.
///
/// Only the broker subscribes to the raw TTY streams; everything it learns
/// is re-published through the session's `Writer`.
pub struct PtyBroker {
    manager: Arc<ContainerManager>,
    config: Arc<Configuration>,
    sessions: DashMap<String, Arc<Mutex<PtySession>>>,
}

impl PtyBroker {
    pub fn new(manager: Arc<ContainerManager>, config: Arc<Configuration>) -> Self {
        Self {
            manager,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Handle a shell `init`: reconnect to an existing session under the
    /// derived key, or spawn a fresh TTY exec. Returns the session key, or
    /// None after reporting the failure to the client.
    pub async fn handle_container_shell(
        self: &Arc<Self>,
        writer: Writer,
        init: ShellInit,
        user_id: &str,
        user_config: &UserConfig,
    ) -> Option<String> {
        let provider = ShellProvider::parse(init.provider.as_deref());
        let is_plain_shell = init.is_plain_shell
            || (init.initial_command.is_some() && !init.has_session)
            || provider == ShellProvider::PlainShell;

        let key = session_key(
            user_id,
            &init.project_path,
            init.session_id.as_deref(),
            init.initial_command.as_deref(),
        );

        // Login flows never reuse TTY state
        let is_login = init
            .initial_command
            .as_deref()
            .map(is_login_command)
            .unwrap_or(false);
        if is_login && self.sessions.contains_key(&key) {
            info!("Login command under {}, destroying previous session", key);
            self.kill_session(&key).await;
        }

        if let Some(entry) = self.sessions.get(&key) {
            let session = entry.value().clone();
            drop(entry);
            self.reconnect(&key, session, writer).await;
            return Some(key);
        }

        self.spawn_session(writer, init, user_id, user_config, provider, is_plain_shell, key)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_session(
        self: &Arc<Self>,
        writer: Writer,
        init: ShellInit,
        user_id: &str,
        user_config: &UserConfig,
        provider: ShellProvider,
        is_plain_shell: bool,
        key: String,
    ) -> Option<String> {
        let working_dir = self.resolve_working_dir(&init.project_path);

        let exec = match self
            .manager
            .attach_container_shell(
                user_id,
                user_config,
                ShellOptions {
                    working_dir: working_dir.clone(),
                    cols: init.cols,
                    rows: init.rows,
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(e) => {
                warn!("Shell attach failed for {}: {}", key, e);
                writer
                    .send(&Outgoing::error(format!("Failed to open shell: {}", e)))
                    .await;
                return None;
            }
        };

        let container_id = self
            .manager
            .get_by_user(user_id)
            .map(|info| info.container_id)
            .unwrap_or_default();

        let resuming = init.has_session && init.session_id.is_some();
        writer
            .send(&Outgoing::output(welcome_banner(
                provider,
                is_plain_shell,
                resuming,
                &init.project_path,
            )))
            .await;

        let shell_cli = self.shell_cli(provider);
        let initial = compose_initial_command(
            provider,
            shell_cli,
            &working_dir,
            init.session_id.as_deref(),
            init.has_session,
            init.initial_command.as_deref(),
            is_plain_shell,
        );

        let mut session = PtySession::new(
            key.clone(),
            user_id.to_string(),
            container_id,
            exec.exec_id,
            init.cols,
            init.rows,
            init.project_path.clone(),
            writer,
            exec.input,
        );

        // Type the composed command into the fresh shell
        if let Some(input) = session.input.as_mut() {
            let line = format!("{}\n", initial);
            if let Err(e) = input.write_all(line.as_bytes()).await {
                debug!("Initial command write failed for {}: {}", key, e);
            }
            let _ = input.flush().await;
        }

        let pump_cancel = session.pump_cancel.clone();
        let session = Arc::new(Mutex::new(session));
        self.sessions.insert(key.clone(), session.clone());

        info!("PTY session {} created in {}", key, working_dir);

        let broker = self.clone();
        let pump_key = key.clone();
        let output = exec.output;
        tokio::spawn(async move {
            broker
                .pump_output(&pump_key, session, output, pump_cancel)
                .await;
        });

        Some(key)
    }

    /// Forward TTY bytes until the stream ends or the session is killed.
    /// TTY streams are not multiplexed: chunks pass through untransformed
    /// apart from URL rewriting.
    async fn pump_output(
        &self,
        key: &str,
        session: Arc<Mutex<PtySession>>,
        mut output: std::pin::Pin<
            Box<
                dyn futures_util::Stream<
                        Item = std::result::Result<
                            bollard::container::LogOutput,
                            bollard::errors::Error,
                        >,
                    > + Send,
            >,
        >,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("PTY pump for {} cancelled", key);
                    return;
                }

                item = output.next() => match item {
                    Some(Ok(log)) => {
                        let text = String::from_utf8_lossy(&log.into_bytes()).into_owned();
                        let scan = scan_chunk(&text);

                        let mut guard = session.lock().await;
                        guard.last_active = Utc::now();
                        guard.buffer.push(scan.passthrough.clone());

                        if let Some(writer) = guard.writer.clone() {
                            // Holding the lock serializes fresh bytes behind
                            // any in-progress replay
                            writer.send(&Outgoing::output(scan.passthrough)).await;
                            for url in scan.urls {
                                writer.send(&Outgoing::UrlOpen { url }).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("PTY stream error for {}: {}", key, e);
                        let mut guard = session.lock().await;
                        guard.status = PtyStatus::Error;
                        let message = format!("\nError: {}\n", e);
                        guard.buffer.push(message.clone());
                        if let Some(writer) = guard.writer.clone() {
                            writer.send(&Outgoing::output(message)).await;
                        }
                        return;
                    }
                    None => {
                        debug!("PTY stream for {} ended", key);
                        {
                            let mut guard = session.lock().await;
                            guard.status = PtyStatus::Ended;
                            guard.ended_at = Some(Utc::now());
                            guard.input = None;
                            if let Some(writer) = guard.writer.clone() {
                                writer.send(&Outgoing::output(PROCESS_EXITED)).await;
                            }
                        }
                        self.sessions.remove(key);
                        return;
                    }
                }
            }
        }
    }

    /// Rebind a live session to a new client and replay its buffer
    async fn reconnect(&self, key: &str, session: Arc<Mutex<PtySession>>, writer: Writer) {
        info!("Reconnecting client to PTY session {}", key);

        let mut guard = session.lock().await;
        guard.cancel_idle_timer();
        guard.writer = Some(writer.clone());
        guard.last_active = Utc::now();

        writer.send(&Outgoing::output(RECONNECT_BANNER)).await;

        // Replay in order; the pump cannot interleave fresh bytes while the
        // session lock is held
        for chunk in guard.buffer.iter() {
            writer.send(&Outgoing::output(chunk.clone())).await;
        }
    }

    /// Write client keystrokes verbatim into the TTY
    pub async fn handle_input(&self, key: &str, data: &str) {
        let session = match self.sessions.get(key) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("Input for unknown PTY session {}", key);
                return;
            }
        };

        let mut guard = session.lock().await;
        guard.last_active = Utc::now();
        let user_id = guard.user_id.clone();

        if let Some(input) = guard.input.as_mut() {
            if let Err(e) = input.write_all(data.as_bytes()).await {
                warn!("PTY input write failed for {}: {}", key, e);
                return;
            }
            let _ = input.flush().await;
        }
        drop(guard);

        self.manager.touch(&user_id);
    }

    /// Update stored dimensions and resize the live TTY best-effort
    pub async fn handle_resize(&self, key: &str, cols: u16, rows: u16) {
        let session = match self.sessions.get(key) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        let exec_id = {
            let mut guard = session.lock().await;
            guard.cols = cols;
            guard.rows = rows;
            guard.exec_id.clone()
        };

        self.manager.resize_exec(&exec_id, cols, rows).await;
    }

    /// Client went away: clear the writer and arm the idle timer. The
    /// session itself stays alive for reconnect.
    pub async fn handle_disconnect(self: &Arc<Self>, key: &str) {
        let session = match self.sessions.get(key) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        let token = CancellationToken::new();
        {
            let mut guard = session.lock().await;
            guard.writer = None;
            guard.cancel_idle_timer();
            guard.idle_cancel = Some(token.clone());
        }

        let idle = Duration::from_secs(self.config.timeouts.pty_idle_secs);
        let broker = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(idle) => {
                    info!("PTY session {} idle window expired", key);
                    broker.kill_session(&key).await;
                }
            }
        });
    }

    /// Tear a session down: cancel its pump, close stdin, drop the record
    pub async fn kill_session(&self, key: &str) {
        let session = match self.sessions.remove(key) {
            Some((_, session)) => session,
            None => return,
        };

        let mut guard = session.lock().await;
        guard.pump_cancel.cancel();
        guard.cancel_idle_timer();
        guard.input = None;
        guard.status = PtyStatus::Ended;
        guard.ended_at = Some(Utc::now());

        info!("PTY session {} destroyed", key);
    }

    /// Whether a session exists under the key (any status)
    pub fn has_session(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn resolve_working_dir(&self, project_path: &str) -> String {
        let system = &self.config.system;
        if project_path.is_empty() {
            system.workspace_root.clone()
        } else {
            format!("{}/{}", system.projects_root, project_path)
        }
    }

    fn shell_cli(&self, provider: ShellProvider) -> &str {
        let providers = &self.config.providers;
        match provider {
            ShellProvider::Claude | ShellProvider::PlainShell => &providers.claude.shell_cli,
            ShellProvider::Cursor => &providers.cursor.shell_cli,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Arc<PtyBroker> {
        let config = Arc::new(Configuration::for_tests());
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        let db = Arc::new(crate::database::Database::open_in_memory().unwrap());
        let manager = Arc::new(ContainerManager::new(docker, config.clone(), db));
        Arc::new(PtyBroker::new(manager, config))
    }

    #[test]
    fn test_working_dir_resolution() {
        let broker = broker();
        assert_eq!(
            broker.resolve_working_dir("foo"),
            "/home/node/.claude/projects/foo"
        );
        assert_eq!(broker.resolve_working_dir(""), "/workspace");
    }

    #[tokio::test]
    async fn test_input_to_unknown_session_is_ignored() {
        let broker = broker();
        broker.handle_input("container_7_foo_default", "ls\n").await;
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_unknown_session_is_noop() {
        let broker = broker();
        broker.kill_session("container_7_foo_default").await;
        assert!(!broker.has_session("container_7_foo_default"));
    }
}
