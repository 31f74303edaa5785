//! WebSocket connection handling and message dispatch

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::Provider;
use crate::config::ResourceTier;
use crate::container::UserConfig;

use super::messages::{Incoming, Outgoing};
use super::writer::Writer;
use super::AppState;

/// Connection identity. Authentication itself lives in front of the
/// backplane; by the time a socket reaches us these values are trusted.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let user_id = query.user_id;
    let user_config = UserConfig {
        tier: query
            .tier
            .as_deref()
            .and_then(ResourceTier::parse)
            .unwrap_or_default(),
    };

    info!("WebSocket connected for user {}", user_id);

    let (writer, mut outbound) = Writer::channel();
    let writer_id = state.writers.register(writer.clone());

    let (mut sink, mut stream) = socket.split();

    // Single pump serializes every frame bound for this client
    let pump = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // PTY sessions inited on this connection; released on close
    let mut shell_keys: Vec<String> = Vec::new();

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Incoming>(&text) {
                Ok(incoming) => {
                    dispatch(&state, &writer, &user_id, &user_config, &mut shell_keys, incoming)
                        .await;
                }
                Err(_) => {
                    // Unknown types are ignored by contract
                    debug!("Ignoring unrecognized frame from {}", user_id);
                }
            },
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed for user {}", user_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
        }
    }

    // Disconnect does not tear PTY sessions down; it arms their idle timers
    for key in shell_keys {
        state.pty.handle_disconnect(&key).await;
    }
    state.writers.remove(writer_id);
    pump.abort();

    info!("WebSocket disconnected for user {}", user_id);
}

async fn dispatch(
    state: &AppState,
    writer: &Writer,
    user_id: &str,
    user_config: &UserConfig,
    shell_keys: &mut Vec<String>,
    incoming: Incoming,
) {
    match incoming {
        Incoming::ClaudeCommand {
            command, options, ..
        } => {
            spawn_query(state, Provider::Claude, writer, user_id, user_config, command, options);
        }

        Incoming::CursorCommand { command, options } => {
            spawn_query(state, Provider::Cursor, writer, user_id, user_config, command, options);
        }

        Incoming::CodexCommand { command, options } => {
            spawn_query(state, Provider::Codex, writer, user_id, user_config, command, options);
        }

        Incoming::CursorResume {
            session_id,
            options,
        } => {
            // Equivalent to a cursor command with an empty prompt and resume
            // flags
            let mut resume = json!({
                "sessionId": session_id,
                "resume": true,
            });
            if let Some(cwd) = options
                .as_ref()
                .and_then(|o| o.get("cwd"))
                .and_then(|c| c.as_str())
            {
                resume["cwd"] = json!(cwd);
            }
            spawn_query(
                state,
                Provider::Cursor,
                writer,
                user_id,
                user_config,
                String::new(),
                resume,
            );
        }

        Incoming::AbortSession {
            session_id,
            provider,
        } => {
            let provider = provider
                .as_deref()
                .and_then(Provider::parse)
                .unwrap_or(Provider::Claude);
            abort(state, writer, provider, &session_id).await;
        }

        Incoming::CursorAbort { session_id } => {
            abort(state, writer, Provider::Cursor, &session_id).await;
        }

        Incoming::CheckSessionStatus {
            session_id,
            provider,
        } => {
            let provider = provider
                .as_deref()
                .and_then(Provider::parse)
                .unwrap_or(Provider::Claude);
            let is_processing = state.broker(provider).is_session_active(&session_id);
            writer
                .send(&Outgoing::SessionStatus {
                    session_id,
                    provider: provider.as_str().to_string(),
                    is_processing,
                })
                .await;
        }

        Incoming::GetActiveSessions => {
            let sessions = json!({
                "cursor": state.cursor.list_active(),
                "codex": state.codex.list_active(),
            });
            writer.send(&Outgoing::ActiveSessions { sessions }).await;
        }

        Incoming::Init(init) => {
            if let Some(key) = state
                .pty
                .handle_container_shell(writer.clone(), init, user_id, user_config)
                .await
            {
                if !shell_keys.contains(&key) {
                    shell_keys.push(key);
                }
            }
        }

        Incoming::Input { data } => {
            if let Some(key) = shell_keys.last() {
                state.pty.handle_input(key, &data).await;
            }
        }

        Incoming::Resize { cols, rows } => {
            if let Some(key) = shell_keys.last() {
                state.pty.handle_resize(key, cols, rows).await;
            }
        }
    }
}

/// Queries stream for minutes; run them off the read loop so aborts and
/// shell traffic stay responsive.
fn spawn_query(
    state: &AppState,
    provider: Provider,
    writer: &Writer,
    user_id: &str,
    user_config: &UserConfig,
    command: String,
    options: serde_json::Value,
) {
    let broker = state.broker(provider).clone();
    let writer = writer.clone();
    let user_id = user_id.to_string();
    let user_config = user_config.clone();

    tokio::spawn(async move {
        // The broker frames its own errors toward the client
        if let Err(e) = broker
            .run_query(&user_id, &user_config, &command, options, writer)
            .await
        {
            debug!("{} query for {} failed: {}", provider, user_id, e);
        }
    });
}

async fn abort(state: &AppState, writer: &Writer, provider: Provider, session_id: &str) {
    let success = state.broker(provider).abort_session(session_id);
    writer
        .send(&Outgoing::SessionAborted {
            session_id: session_id.to_string(),
            provider: provider.as_str().to_string(),
            success,
        })
        .await;
}
