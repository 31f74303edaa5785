//! In-container file operations on behalf of a user

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bollard::container::LogOutput;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::container::{ContainerManager, ExecOptions, UserConfig};
use crate::error::{BackplaneError, Result};

use super::path::{join_validated, strip_host_prefix, validate_relative};

/// Maximum write payload
const MAX_WRITE_BYTES: usize = 10 * 1024 * 1024;

/// Directories never listed
const SKIPPED_DIRS: &[&str] = &["node_modules", "dist", "build"];

const DEFAULT_README: &str = "# my-workspace\n\nYour default project workspace.\n";
const DEFAULT_GITIGNORE: &str = "node_modules/\ndist/\nbuild/\n.env\n";
const DEFAULT_PACKAGE_JSON: &str =
    "{\n  \"name\": \"my-workspace\",\n  \"version\": \"0.1.0\",\n  \"private\": true\n}\n";

/// Which base directory an operation targets
#[derive(Debug, Clone, Default)]
pub struct ProjectScope {
    pub project_path: Option<String>,
    pub is_container_project: bool,
}

/// One entry from a directory listing
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: String,
    pub size: u64,
    pub modified: f64,
}

/// Result of a `stat`
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatInfo {
    pub path: String,
    pub kind: String,
    pub size: u64,
    pub modified: i64,
}

/// Path-validated file operations executed inside the user's container
pub struct FileGateway {
    manager: Arc<ContainerManager>,
    config: Arc<Configuration>,
}

impl FileGateway {
    pub fn new(manager: Arc<ContainerManager>, config: Arc<Configuration>) -> Self {
        Self { manager, config }
    }

    /// Read a file as text, with trailing whitespace trimmed
    pub async fn read(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        scope: &ProjectScope,
        path: &str,
    ) -> Result<String> {
        let full = self.resolve(scope, path)?;

        let (stdout, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec!["cat".to_string(), full.clone()],
                None,
                None,
            )
            .await?;

        // Only stderr carries the error signal; file content is opaque and
        // may itself contain a "No such file" string
        if is_not_found(&stderr) {
            return Err(BackplaneError::NotFound(path.to_string()));
        }
        if !stderr.trim().is_empty() {
            return Err(BackplaneError::ExecFailed(stderr.trim().to_string()));
        }

        Ok(stdout.trim_end().to_string())
    }

    /// Write bytes to a file, creating parent directories below the base.
    /// Content travels base64-encoded over stdin so it never meets the
    /// shell. The short timeout resolves success when no error surfaced.
    pub async fn write(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        scope: &ProjectScope,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        if content.len() > MAX_WRITE_BYTES {
            return Err(BackplaneError::PayloadTooLarge {
                size: content.len(),
                limit: MAX_WRITE_BYTES,
            });
        }

        if path.is_empty() {
            return Err(BackplaneError::PathInvalid("empty write path".to_string()));
        }

        let full = self.resolve(scope, path)?;
        let parent = match full.rfind('/') {
            Some(pos) => &full[..pos],
            None => return Err(BackplaneError::PathInvalid(full.clone())),
        };

        // Paths were validated to contain no quote characters
        let script = format!("mkdir -p '{}' && base64 -d > '{}'", parent, full);
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);

        let (_, stderr, timed_out) = self
            .exec_collect(
                user_id,
                user_config,
                vec!["/bin/sh".to_string(), "-c".to_string(), script],
                Some(encoded.into_bytes()),
                Some(Duration::from_secs(self.config.timeouts.file_write_secs)),
            )
            .await?;

        if !stderr.trim().is_empty() {
            return Err(BackplaneError::ExecFailed(stderr.trim().to_string()));
        }

        if timed_out {
            debug!("Write to {} resolved optimistically after timeout", full);
        }

        Ok(())
    }

    /// List one directory level: directories first, then by name
    pub async fn list(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        scope: &ProjectScope,
        path: &str,
        include_hidden: bool,
    ) -> Result<Vec<FileEntry>> {
        let full = self.resolve(scope, path)?;

        let (stdout, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec![
                    "find".to_string(),
                    full,
                    "-mindepth".to_string(),
                    "1".to_string(),
                    "-maxdepth".to_string(),
                    "1".to_string(),
                    "-printf".to_string(),
                    "%f|%y|%s|%T@\\n".to_string(),
                ],
                None,
                None,
            )
            .await?;

        if is_not_found(&stderr) {
            return Err(BackplaneError::NotFound(path.to_string()));
        }

        Ok(parse_find_output(&stdout, include_hidden))
    }

    /// Stat a single path
    pub async fn stat(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        scope: &ProjectScope,
        path: &str,
    ) -> Result<StatInfo> {
        let full = self.resolve(scope, path)?;

        let (stdout, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec![
                    "stat".to_string(),
                    "-c".to_string(),
                    "%n|%F|%s|%Y".to_string(),
                    full,
                ],
                None,
                None,
            )
            .await?;

        if is_not_found(&stderr) {
            return Err(BackplaneError::NotFound(path.to_string()));
        }

        parse_stat_output(stdout.trim())
            .ok_or_else(|| BackplaneError::ExecFailed(format!("unparseable stat output for {}", path)))
    }

    /// Recursively delete a path. The base directory itself is refused.
    pub async fn delete(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        scope: &ProjectScope,
        path: &str,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(BackplaneError::PathInvalid(
                "refusing to delete the workspace root".to_string(),
            ));
        }

        let full = self.resolve(scope, path)?;

        let (_, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec!["rm".to_string(), "-rf".to_string(), full],
                None,
                None,
            )
            .await?;

        if !stderr.trim().is_empty() {
            return Err(BackplaneError::ExecFailed(stderr.trim().to_string()));
        }

        Ok(())
    }

    /// List container-native projects, bootstrapping a default workspace so
    /// clients always see at least one.
    pub async fn get_projects(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> Result<Vec<String>> {
        let root = self.config.system.projects_root.clone();

        let (stdout, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec![
                    "find".to_string(),
                    root,
                    "-mindepth".to_string(),
                    "1".to_string(),
                    "-maxdepth".to_string(),
                    "1".to_string(),
                    "-type".to_string(),
                    "d".to_string(),
                    "-printf".to_string(),
                    "%f\\n".to_string(),
                ],
                None,
                None,
            )
            .await?;

        // A missing projects root just means no projects yet
        let mut projects: Vec<String> = if is_not_found(&stderr) {
            Vec::new()
        } else {
            stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        };

        if projects.is_empty() {
            self.bootstrap_default_workspace(user_id, user_config)
                .await?;
            projects.push("my-workspace".to_string());
        }

        projects.sort();
        Ok(projects)
    }

    /// Create `my-workspace` with git init and starter files, using the same
    /// base64 write path as every other write.
    async fn bootstrap_default_workspace(
        &self,
        user_id: &str,
        user_config: &UserConfig,
    ) -> Result<()> {
        info!("Bootstrapping default workspace for user {}", user_id);

        let dir = format!("{}/my-workspace", self.config.system.projects_root);

        let (_, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec!["mkdir".to_string(), "-p".to_string(), dir.clone()],
                None,
                None,
            )
            .await?;
        if !stderr.trim().is_empty() {
            return Err(BackplaneError::ExecFailed(stderr.trim().to_string()));
        }

        let scope = ProjectScope {
            project_path: Some("my-workspace".to_string()),
            is_container_project: true,
        };

        self.write(user_id, user_config, &scope, "README.md", DEFAULT_README.as_bytes())
            .await?;
        self.write(
            user_id,
            user_config,
            &scope,
            ".gitignore",
            DEFAULT_GITIGNORE.as_bytes(),
        )
        .await?;
        self.write(
            user_id,
            user_config,
            &scope,
            "package.json",
            DEFAULT_PACKAGE_JSON.as_bytes(),
        )
        .await?;

        // git prints hints to stderr; only log them
        let (_, stderr, _) = self
            .exec_collect(
                user_id,
                user_config,
                vec![
                    "git".to_string(),
                    "-C".to_string(),
                    dir,
                    "init".to_string(),
                    "-q".to_string(),
                ],
                None,
                None,
            )
            .await?;
        if !stderr.trim().is_empty() {
            debug!("git init output: {}", stderr.trim());
        }

        Ok(())
    }

    /// Resolve the base directory for a scope and join the validated path
    fn resolve(&self, scope: &ProjectScope, path: &str) -> Result<String> {
        validate_relative(path)?;

        let system = &self.config.system;
        let base = if scope.is_container_project {
            match scope.project_path.as_deref() {
                Some(project) => {
                    validate_relative(project)?;
                    format!("{}/{}", system.projects_root, project)
                }
                None => {
                    return Err(BackplaneError::PathInvalid(
                        "container project scope without a project path".to_string(),
                    ))
                }
            }
        } else {
            match scope.project_path.as_deref() {
                Some(project) => {
                    let suffix = strip_host_prefix(project);
                    validate_relative(suffix)?;
                    join_validated(&system.workspace_root, suffix)
                }
                None => system.workspace_root.clone(),
            }
        };

        Ok(join_validated(&base, path))
    }

    /// Run an exec and collect stdout/stderr. An optional payload is written
    /// to stdin and the stream closed; an optional deadline bounds the whole
    /// collection and reports expiry instead of failing.
    async fn exec_collect(
        &self,
        user_id: &str,
        user_config: &UserConfig,
        command: Vec<String>,
        stdin: Option<Vec<u8>>,
        deadline: Option<Duration>,
    ) -> Result<(String, String, bool)> {
        let mut exec = self
            .manager
            .exec_in_container(
                user_id,
                command,
                user_config,
                ExecOptions {
                    stdin: stdin.is_some(),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(payload) = stdin {
            if let Err(e) = exec.input.write_all(&payload).await {
                return Err(BackplaneError::StreamError(format!("stdin write: {}", e)));
            }
            if let Err(e) = exec.input.shutdown().await {
                debug!("stdin shutdown failed: {}", e);
            }
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        let expiry = deadline.map(|d| tokio::time::Instant::now() + d);

        loop {
            let item = match expiry {
                Some(at) => match tokio::time::timeout_at(at, exec.output.next()).await {
                    Ok(item) => item,
                    Err(_) => return Ok((stdout, stderr, true)),
                },
                None => exec.output.next().await,
            };

            match item {
                Some(Ok(LogOutput::StdOut { message }))
                | Some(Ok(LogOutput::Console { message })) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Some(Ok(LogOutput::StdErr { message })) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Some(Ok(LogOutput::StdIn { .. })) => {}
                Some(Err(e)) => {
                    warn!("Exec stream error: {}", e);
                    return Err(BackplaneError::StreamError(e.to_string()));
                }
                None => break,
            }
        }

        Ok((stdout, stderr, false))
    }
}

fn is_not_found(output: &str) -> bool {
    output.contains("No such file") || output.contains("cannot access")
}

/// Parse `find -printf '%f|%y|%s|%T@\n'` output into sorted entries
fn parse_find_output(output: &str, include_hidden: bool) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '|');
            let name = parts.next()?.to_string();
            let kind_char = parts.next()?;
            let size = parts.next()?.parse::<u64>().ok()?;
            let modified = parts.next()?.trim().parse::<f64>().ok()?;

            if name.is_empty() {
                return None;
            }
            if !include_hidden && name.starts_with('.') {
                return None;
            }
            if SKIPPED_DIRS.contains(&name.as_str()) {
                return None;
            }

            let kind = if kind_char == "d" { "directory" } else { "file" };

            Some(FileEntry {
                name,
                kind: kind.to_string(),
                size,
                modified,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        let a_dir = a.kind == "directory";
        let b_dir = b.kind == "directory";
        b_dir
            .cmp(&a_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    entries
}

/// Parse `stat -c '%n|%F|%s|%Y'` output
fn parse_stat_output(output: &str) -> Option<StatInfo> {
    let mut parts = output.splitn(4, '|');
    let path = parts.next()?.to_string();
    let kind = parts.next()?.to_string();
    let size = parts.next()?.parse::<u64>().ok()?;
    let modified = parts.next()?.trim().parse::<i64>().ok()?;

    Some(StatInfo {
        path,
        kind,
        size,
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> FileGateway {
        let config = Arc::new(Configuration::for_tests());
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        let db = Arc::new(crate::database::Database::open_in_memory().unwrap());
        let manager = Arc::new(ContainerManager::new(docker, config.clone(), db));
        FileGateway::new(manager, config)
    }

    #[test]
    fn test_resolve_container_project() {
        let gateway = gateway();
        let scope = ProjectScope {
            project_path: Some("foo".into()),
            is_container_project: true,
        };

        assert_eq!(
            gateway.resolve(&scope, "src/app.js").unwrap(),
            "/home/node/.claude/projects/foo/src/app.js"
        );
    }

    #[test]
    fn test_resolve_workspace_strips_host_prefix() {
        let gateway = gateway();
        let scope = ProjectScope {
            project_path: Some("host-1:my-app".into()),
            is_container_project: false,
        };

        assert_eq!(
            gateway.resolve(&scope, "index.js").unwrap(),
            "/workspace/my-app/index.js"
        );
    }

    #[test]
    fn test_resolve_defaults_to_workspace() {
        let gateway = gateway();
        assert_eq!(
            gateway.resolve(&ProjectScope::default(), "notes.txt").unwrap(),
            "/workspace/notes.txt"
        );
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let gateway = gateway();
        assert!(gateway
            .resolve(&ProjectScope::default(), "../etc/passwd")
            .is_err());

        let scope = ProjectScope {
            project_path: Some("../../root".into()),
            is_container_project: true,
        };
        assert!(gateway.resolve(&scope, "x").is_err());
    }

    #[test]
    fn test_parse_find_output_sorts_and_skips() {
        let raw = "\
zeta.txt|f|10|1700000000.5\n\
node_modules|d|4096|1700000000.0\n\
.env|f|12|1700000000.0\n\
src|d|4096|1700000001.0\n\
Apple.md|f|5|1700000002.0\n";

        let entries = parse_find_output(raw, false);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["src", "Apple.md", "zeta.txt"]);
        assert_eq!(entries[0].kind, "directory");

        let with_hidden = parse_find_output(raw, true);
        assert!(with_hidden.iter().any(|e| e.name == ".env"));
        assert!(!with_hidden.iter().any(|e| e.name == "node_modules"));
    }

    #[test]
    fn test_parse_find_output_ignores_garbage_lines() {
        let entries = parse_find_output("not-a-record\nname|d\n", false);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_parse_stat_output() {
        let info = parse_stat_output("/workspace/a.txt|regular file|1234|1700000000").unwrap();
        assert_eq!(info.path, "/workspace/a.txt");
        assert_eq!(info.kind, "regular file");
        assert_eq!(info.size, 1234);
        assert_eq!(info.modified, 1_700_000_000);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("cat: /workspace/x: No such file or directory"));
        assert!(is_not_found("ls: cannot access '/workspace/x'"));
        assert!(!is_not_found("total 0"));
    }
}
