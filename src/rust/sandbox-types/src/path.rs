use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::{SandboxError, ENTRYPOINT_NAME};

/// A workspace-relative path that has already passed `validate_relative_path`. Carries its
/// normalized, forward-slash form so every downstream consumer (archive builder, diff, file
/// store key) agrees on one canonical representation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lexically validates and normalizes a caller-supplied relative path.
///
/// Rejects absolute paths, any `..` segment, paths that normalize to nothing (`""`, `"."`), and
/// the reserved entrypoint name. Empty and `.` segments are discarded rather than rejected. Does
/// not touch the filesystem — no symlink resolution, no existence check.
pub fn validate_relative_path(raw: &str) -> Result<RelativePath, SandboxError> {
    let path = Path::new(raw);

    if path.is_absolute() {
        return Err(SandboxError::InvalidPath {
            path: raw.to_string(),
            reason: "path must be relative".to_string(),
        });
    }

    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(segment) => parts.push(segment.to_string_lossy().into_owned()),
            Component::ParentDir => {
                return Err(SandboxError::InvalidPath {
                    path: raw.to_string(),
                    reason: "path must not contain '..'".to_string(),
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPath {
                    path: raw.to_string(),
                    reason: "path must be relative".to_string(),
                })
            }
        }
    }

    if parts.is_empty() {
        return Err(SandboxError::InvalidPath {
            path: raw.to_string(),
            reason: "path must not be empty".to_string(),
        });
    }

    let normalized = parts.join("/");
    if normalized == ENTRYPOINT_NAME {
        return Err(SandboxError::InvalidPath {
            path: raw.to_string(),
            reason: format!("'{ENTRYPOINT_NAME}' is reserved for the execution entrypoint"),
        });
    }

    Ok(RelativePath(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_paths() {
        assert!(validate_relative_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_escape() {
        assert!(validate_relative_path("../escape.txt").is_err());
        assert!(validate_relative_path("a/../../b").is_err());
    }

    #[test]
    fn rejects_empty_and_dot() {
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path(".").is_err());
        assert!(validate_relative_path("./").is_err());
    }

    #[test]
    fn rejects_entrypoint_collision() {
        assert!(validate_relative_path("__main__.py").is_err());
        assert!(validate_relative_path("./__main__.py").is_err());
    }

    #[test]
    fn normalizes_and_accepts_nested_paths() {
        let p = validate_relative_path("./data/input.txt").unwrap();
        assert_eq!(p.as_str(), "data/input.txt");
    }

    #[test]
    fn discards_empty_and_dot_segments_silently() {
        let p = validate_relative_path("a//./b").unwrap();
        assert_eq!(p.as_str(), "a/b");
    }
}
