//! Workspace-relative path validation
//!
//! Every user-supplied path is checked here before any command string is
//! assembled; a rejected path never reaches the container.

use crate::error::{BackplaneError, Result};

/// Characters that would interact with shell quoting inside the container.
/// Quotes and backslash are rejected along with the classic metacharacters
/// so validated paths can be safely single-quoted.
const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '$', '`', '\'', '"', '\\', '\n', '\r', '\0'];

/// Validate a workspace-relative path. The empty string is allowed and
/// refers to the base directory itself.
pub fn validate_relative(path: &str) -> Result<&str> {
    if path.starts_with('/') {
        return Err(BackplaneError::PathInvalid(format!(
            "absolute paths are not allowed: {}",
            path
        )));
    }

    if let Some(bad) = path.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(BackplaneError::PathInvalid(format!(
            "path contains forbidden character {:?}",
            bad
        )));
    }

    if path.split('/').any(|segment| segment == "..") {
        return Err(BackplaneError::PathInvalid(format!(
            "path traversal is not allowed: {}",
            path
        )));
    }

    Ok(path)
}

/// Join a validated relative path onto a base directory
pub fn join_validated(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

/// Strip a host prefix (`anything-up-to-first-colon:`) from a project path
pub fn strip_host_prefix(project: &str) -> &str {
    match project.find(':') {
        Some(pos) => &project[pos + 1..],
        None => project,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_paths() {
        for path in ["src/app.js", "README.md", "a/b/c.txt", "", "dir.with.dots/x"] {
            assert!(validate_relative(path).is_ok(), "rejected {:?}", path);
        }
    }

    #[test]
    fn test_rejects_absolute_paths() {
        assert!(validate_relative("/etc/passwd").is_err());
    }

    #[test]
    fn test_rejects_traversal() {
        for path in ["../etc/passwd", "a/../../b", "..", "foo/..", "../"] {
            assert!(validate_relative(path).is_err(), "accepted {:?}", path);
        }
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        for path in [
            "a;rm -rf /",
            "a&&b",
            "a|b",
            "a$HOME",
            "a`id`",
            "a\nb",
            "a'b",
            "a\"b",
            "a\\b",
            "a\0b",
        ] {
            assert!(validate_relative(path).is_err(), "accepted {:?}", path);
        }
    }

    #[test]
    fn test_join_validated() {
        assert_eq!(join_validated("/workspace", "src/a.js"), "/workspace/src/a.js");
        assert_eq!(join_validated("/workspace/", "a.js"), "/workspace/a.js");
        assert_eq!(join_validated("/workspace", ""), "/workspace");
    }

    #[test]
    fn test_strip_host_prefix() {
        assert_eq!(strip_host_prefix("host-7:my-app"), "my-app");
        assert_eq!(strip_host_prefix("my-app"), "my-app");
        assert_eq!(strip_host_prefix("a:b:c"), "b:c");
    }
}
