//! Agent query execution

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bollard::container::LogOutput;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::container::{ContainerManager, ExecOptions, UserConfig};
use crate::error::{BackplaneError, Result};
use crate::router::{Outgoing, Writer};
use crate::stream::{JsonLineDemuxer, SdkEvent};

use super::session::{AgentSession, AgentSessionStatus, SessionRegistry};
use super::Provider;

/// Option keys that belong to the backplane, not the SDK
const NON_SDK_FIELDS: &[&str] = &["userId", "isContainerProject", "projectPath"];

/// Runs streamed SDK queries for one provider
pub struct AgentBroker {
    provider: Provider,
    manager: Arc<ContainerManager>,
    config: Arc<Configuration>,
    registry: SessionRegistry,
}

impl AgentBroker {
    pub fn new(
        provider: Provider,
        manager: Arc<ContainerManager>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            provider,
            manager,
            config,
            registry: SessionRegistry::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Run one agent query, streaming typed events to `writer`.
    ///
    /// Returns the session id as soon as the session is registered; the call
    /// itself completes when the stream ends, errors, aborts, or times out.
    pub async fn run_query(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        command: &str,
        options: Value,
        writer: Writer,
    ) -> Result<String> {
        let session_id = options
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let info = match self
            .manager
            .get_or_create_container(user_id, user_config)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                writer
                    .send(&Outgoing::Error {
                        session_id: Some(session_id.clone()),
                        error: format!("Failed to prepare container: {}", e),
                    })
                    .await;
                return Err(e);
            }
        };

        let cwd = self.resolve_cwd(&options);
        let sdk_options = filter_sdk_options(&options);

        // The whole payload rides through the shell as base64 so prompt
        // contents never interact with quoting
        let payload = json!({
            "prompt": command,
            "options": sdk_options,
        });
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&payload).map_err(|e| {
                BackplaneError::Internal(format!("payload serialization: {}", e))
            })?);

        let token = match self
            .registry
            .begin(&session_id, user_id, &info.container_id, command)
        {
            Some(token) => token,
            None => {
                let error = format!("session {} is already running", session_id);
                writer
                    .send(&Outgoing::Error {
                        session_id: Some(session_id.clone()),
                        error: error.clone(),
                    })
                    .await;
                return Err(BackplaneError::ExecFailed(error));
            }
        };

        writer
            .send(&Outgoing::SessionStart {
                session_id: session_id.clone(),
                container_id: info.container_id.clone(),
                message: None,
            })
            .await;

        info!(
            "Agent query {} ({}) for user {} in {}",
            session_id, self.provider, user_id, cwd
        );

        let runner = self.runner_invocation();
        let shell = format!("exec {} --payload-b64 {}", runner, encoded);

        let exec = self
            .manager
            .exec_in_container(
                user_id,
                vec!["/bin/sh".to_string(), "-lc".to_string(), shell],
                user_config,
                ExecOptions {
                    cwd: Some(cwd),
                    ..Default::default()
                },
            )
            .await;

        let mut exec = match exec {
            Ok(exec) => exec,
            Err(e) => {
                self.registry.finish(
                    &session_id,
                    AgentSessionStatus::Error,
                    Some(e.to_string()),
                );
                writer
                    .send(&Outgoing::Error {
                        session_id: Some(session_id.clone()),
                        error: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.timeouts.query_secs);
        let mut demuxer = JsonLineDemuxer::new();
        let mut sdk_sent_done = false;

        loop {
            tokio::select! {
                biased;

                // Abort flips the record first; stop forwarding immediately
                _ = token.cancelled() => {
                    debug!("Agent session {} aborted, dropping stream", session_id);
                    break;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Agent session {} exceeded query deadline", session_id);
                    self.registry.finish(
                        &session_id,
                        AgentSessionStatus::Error,
                        Some("timeout".to_string()),
                    );
                    writer
                        .send(&Outgoing::Error {
                            session_id: Some(session_id.clone()),
                            error: "timeout".to_string(),
                        })
                        .await;
                    break;
                }

                item = exec.output.next() => match item {
                    Some(Ok(LogOutput::StdOut { message }))
                    | Some(Ok(LogOutput::Console { message })) => {
                        for event in demuxer.push_stdout(&message) {
                            sdk_sent_done |= self.forward(&writer, &session_id, event).await;
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        demuxer.push_stderr(&message);
                    }
                    Some(Ok(LogOutput::StdIn { .. })) => {}
                    Some(Err(e)) => {
                        self.registry.finish(
                            &session_id,
                            AgentSessionStatus::Error,
                            Some(e.to_string()),
                        );
                        writer
                            .send(&Outgoing::Error {
                                session_id: Some(session_id.clone()),
                                error: format!("stream error: {}", e),
                            })
                            .await;
                        break;
                    }
                    None => {
                        for event in demuxer.finish() {
                            sdk_sent_done |= self.forward(&writer, &session_id, event).await;
                        }

                        match demuxer.true_error() {
                            Some(error) => {
                                self.registry.finish(
                                    &session_id,
                                    AgentSessionStatus::Error,
                                    Some(error.clone()),
                                );
                                writer
                                    .send(&Outgoing::Error {
                                        session_id: Some(session_id.clone()),
                                        error,
                                    })
                                    .await;
                            }
                            None => {
                                self.registry.finish(
                                    &session_id,
                                    AgentSessionStatus::Completed,
                                    None,
                                );
                                if !sdk_sent_done {
                                    writer
                                        .send(&Outgoing::Done {
                                            session_id: session_id.clone(),
                                        })
                                        .await;
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }

        self.manager.touch(user_id);
        Ok(session_id)
    }

    /// Forward one demuxed event; returns true when it was the SDK's own
    /// `done` frame
    async fn forward(&self, writer: &Writer, session_id: &str, event: SdkEvent) -> bool {
        match event {
            SdkEvent::Typed(value) => {
                let is_done = value.get("type").and_then(Value::as_str) == Some("done");
                writer.send_raw(&value).await;
                is_done
            }
            SdkEvent::Output(text) => {
                writer
                    .send(&Outgoing::Output {
                        session_id: Some(session_id.to_string()),
                        data: text,
                    })
                    .await;
                false
            }
        }
    }

    /// Mark the session aborted and interrupt its stream best-effort.
    /// Never blocks on the remote side.
    pub fn abort_session(&self, session_id: &str) -> bool {
        self.registry.abort(session_id)
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.registry.is_active(session_id)
    }

    pub fn list_active(&self) -> Vec<AgentSession> {
        self.registry.list_active()
    }

    pub fn get_session_info(&self, session_id: &str) -> Option<AgentSession> {
        self.registry.get(session_id)
    }

    /// Working directory resolution, in priority order: container project,
    /// supplied cwd basename under the workspace, workspace root.
    fn resolve_cwd(&self, options: &Value) -> String {
        let system = &self.config.system;

        let is_container_project = options
            .get("isContainerProject")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let project_path = options.get("projectPath").and_then(Value::as_str);

        if is_container_project {
            if let Some(project) = project_path {
                return format!("{}/{}", system.projects_root, project);
            }
        }

        if let Some(cwd) = options.get("cwd").and_then(Value::as_str) {
            let basename = cwd.rsplit('/').next().unwrap_or(cwd);
            if !basename.is_empty() {
                return format!("{}/{}", system.workspace_root, basename);
            }
        }

        system.workspace_root.clone()
    }

    fn runner_invocation(&self) -> &str {
        let providers = &self.config.providers;
        match self.provider {
            Provider::Claude => &providers.claude.runner,
            Provider::Cursor => &providers.cursor.runner,
            Provider::Codex => &providers.codex.runner,
        }
    }
}

/// Strip backplane-only fields from the options before they reach the SDK.
/// A `model` of `"custom"` is dropped so the container's env chooses.
fn filter_sdk_options(options: &Value) -> Value {
    let mut filtered = match options {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };

    for field in NON_SDK_FIELDS {
        filtered.remove(*field);
    }

    if filtered.get("model").and_then(Value::as_str) == Some("custom") {
        filtered.remove("model");
    }

    Value::Object(filtered)
}
