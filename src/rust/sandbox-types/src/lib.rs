//! Shared data model for the sandbox execution engine.
//!
//! Every crate in the workspace speaks in terms of these types: the request/response shapes
//! the Request Coordinator assembles, the workspace snapshot produced by a Sandbox Backend, and
//! the structured errors propagated by every fallible operation in the engine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

mod error;
mod path;

pub use error::{SandboxError, StoreError};
pub use path::{validate_relative_path, RelativePath};

/// The reserved entrypoint name every archive carries at its root.
pub const ENTRYPOINT_NAME: &str = "__main__.py";

/// The fixed uid/gid every staged file and the sandbox process itself run as.
pub const SANDBOX_UID: u32 = 65532;
pub const SANDBOX_GID: u32 = 65532;

/// Literal suffix overwriting the tail of a truncated output stream.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// One path/file-id pair declared by a caller to be staged into the workspace before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub path: String,
    pub file_id: String,
}

/// A full request to execute a program inside a fresh sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub last_line_interactive: bool,
    #[serde(default)]
    pub files: Vec<InputFile>,
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

/// Resource ceilings applied to one execution; these are operator-configured, not
/// caller-supplied (the caller only controls `timeout_ms`, carried separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_output_bytes: usize,
    pub cpu_time_limit_sec: Option<u32>,
    pub memory_limit_mb: Option<u32>,
}

/// `file`- or `directory`-typed entry observed in a post-execution workspace snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Directory => write!(f, "directory"),
        }
    }
}

/// One file or directory observed in the workspace after execution. `content` is populated by
/// the Sandbox Backend's internal snapshot; external responses replace it with a stored file-id
/// (see `sandbox-coordinator`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub path: String,
    pub kind: EntryKind,
    pub content: Option<Vec<u8>>,
}

impl WorkspaceEntry {
    pub fn file(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            content: Some(content),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            content: None,
        }
    }
}

/// Result of a completed (or timed-out) sandbox execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub files: Vec<WorkspaceEntry>,
}

/// One event in a `run_stream` sequence: either an output chunk or the terminal summary.
/// Exactly one `Result` event is emitted per stream, and it is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Output { stream: OutputStream, data: String },
    Result {
        exit_code: Option<i32>,
        timed_out: bool,
        duration_ms: u64,
        files: Vec<WorkspaceEntry>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Persisted metadata for one file-store record. Does not carry the raw bytes themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub upload_time: f64,
}

/// A workspace entry as it appears in an `ExecuteResponse`: the file's bytes are not embedded,
/// a file-id referencing the File Store record is, instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// Assembled response to one `ExecuteRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub files: Vec<WorkspaceFile>,
}

/// A relative workspace path paired with the bytes staged at it, used by the Coordinator to
/// tell an unmodified staged input apart from a new or rewritten output file.
pub type StagedInputs = std::collections::BTreeMap<String, Vec<u8>>;

/// Normalizes `p` to a platform-independent forward-slash string, used when comparing or
/// recording workspace paths regardless of host OS path separator conventions.
pub fn to_slash_path(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn path_buf_from_slash(s: &str) -> PathBuf {
    PathBuf::from_iter(s.split('/'))
}
