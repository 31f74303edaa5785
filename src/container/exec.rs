//! Exec plumbing: one-shot execs and TTY shell attaches

use std::pin::Pin;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use futures_util::Stream;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::error::{BackplaneError, Result};

use super::manager::{ContainerManager, UserConfig};

/// Options for a one-shot exec
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

/// Options for an interactive shell attach
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub working_dir: String,
    pub cols: u16,
    pub rows: u16,
}

/// A hijacked duplex stream attached to a running exec
pub struct ExecStream {
    pub exec_id: String,
    pub output: Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl ContainerManager {
    /// Run a command inside the user's container, ensuring the container
    /// first. Returns the attached duplex stream; errors propagate upstream
    /// and are not retried.
    pub async fn exec_in_container(
        &self,
        user_id: &str,
        command: Vec<String>,
        user_config: &UserConfig,
        options: ExecOptions,
    ) -> Result<ExecStream> {
        let info = self.get_or_create_container(user_id, user_config).await?;

        debug!(
            "Exec in {}: {:?} (cwd {:?})",
            info.container_name, command, options.cwd
        );

        let exec_options = CreateExecOptions {
            cmd: Some(command),
            env: if options.env.is_empty() {
                None
            } else {
                Some(options.env)
            },
            working_dir: options.cwd,
            attach_stdin: Some(options.stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(options.tty),
            ..Default::default()
        };

        let exec = self
            .docker()
            .create_exec(&info.container_id, exec_options)
            .await
            .map_err(|e| BackplaneError::ExecFailed(e.to_string()))?;

        let started = self
            .docker()
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| BackplaneError::ExecFailed(e.to_string()))?;

        self.touch(user_id);

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                exec_id: exec.id,
                output,
                input,
            }),
            StartExecResults::Detached => Err(BackplaneError::ExecFailed(
                "unexpected detached exec".to_string(),
            )),
        }
    }

    /// Open an interactive TTY exec pre-positioned in `working_dir`.
    ///
    /// TTY streams are not multiplexed; callers forward chunks untouched.
    pub async fn attach_container_shell(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        options: ShellOptions,
    ) -> Result<ExecStream> {
        let stream = self
            .exec_in_container(
                user_id,
                vec!["/bin/bash".to_string()],
                user_config,
                ExecOptions {
                    cwd: Some(options.working_dir),
                    env: vec!["TERM=xterm-256color".to_string()],
                    tty: true,
                    stdin: true,
                },
            )
            .await?;

        // Initial sizing; later resizes go through resize_exec as well
        self.resize_exec(&stream.exec_id, options.cols, options.rows)
            .await;

        Ok(stream)
    }

    /// Best-effort dynamic resize of a TTY exec
    pub async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) {
        let options = ResizeExecOptions {
            height: rows,
            width: cols,
        };

        if let Err(e) = self.docker().resize_exec(exec_id, options).await {
            debug!("resize_exec {} to {}x{} failed: {}", exec_id, cols, rows, e);
        }
    }
}
