use std::fmt;

/// The six structured error kinds the engine can produce, per the error-handling design: each
/// carries enough context for a caller to act without the core depending on an HTTP crate to
/// express a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// `timeout_ms` exceeded the configured maximum.
    InvalidTimeout { requested_ms: u64, max_ms: u64 },
    /// A staged or uploaded path failed lexical validation, or collided with the entrypoint.
    InvalidPath { path: String, reason: String },
    /// An upload exceeded the configured size ceiling.
    FileTooLarge { size_bytes: u64, max_bytes: u64 },
    /// A referenced file-id was not found in the File Store.
    UnknownFile { file_id: String, path: String },
    /// The container/pod failed to launch, become ready, or execute.
    BackendError { message: String },
    /// Archive extraction inside the sandbox failed.
    StagingError { message: String },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::InvalidTimeout {
                requested_ms,
                max_ms,
            } => write!(
                f,
                "timeout_ms {requested_ms} exceeds maximum of {max_ms} ms"
            ),
            SandboxError::InvalidPath { path, reason } => {
                write!(f, "invalid path '{path}': {reason}")
            }
            SandboxError::FileTooLarge {
                size_bytes,
                max_bytes,
            } => write!(
                f,
                "file size {size_bytes} bytes exceeds maximum of {max_bytes} bytes"
            ),
            SandboxError::UnknownFile { file_id, path } => write!(
                f,
                "file with id '{file_id}' not found for path '{path}'"
            ),
            SandboxError::BackendError { message } => write!(f, "backend error: {message}"),
            SandboxError::StagingError { message } => write!(f, "staging error: {message}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl SandboxError {
    /// The informative (non-normative within the core) HTTP status an eventual API layer would
    /// surface this error as, per the error handling table.
    pub fn http_status(&self) -> u16 {
        match self {
            SandboxError::InvalidTimeout { .. } => 422,
            SandboxError::InvalidPath { .. } => 422,
            SandboxError::FileTooLarge { .. } => 413,
            SandboxError::UnknownFile { .. } => 404,
            SandboxError::BackendError { .. } => 500,
            SandboxError::StagingError { .. } => 500,
        }
    }
}

/// A File Store lookup miss, independent of any workspace-path context. The Request Coordinator
/// is the one place that knows the path a missing file-id was destined for, so it is the one
/// that turns this into a `SandboxError::UnknownFile`; a bare file download/delete/list caller
/// has no such path and surfaces `StoreError` directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub file_id: String,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file with id '{}' not found", self.file_id)
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Attaches the workspace path this lookup was staging for, producing the structured error
    /// the Coordinator's contract promises.
    pub fn with_path(self, path: impl Into<String>) -> SandboxError {
        SandboxError::UnknownFile {
            file_id: self.file_id,
            path: path.into(),
        }
    }
}
