//! The abstract Sandbox Backend contract (§4.5): one trait implemented by the Container Backend
//! (CLI-subprocess Docker) and the Cluster Backend (Kubernetes), and mocked in-memory by tests
//! that exercise the Request Coordinator without a real container runtime.

use async_trait::async_trait;
use futures::stream::BoxStream;
use sandbox_types::{ExecutionResult, SandboxError, StagedInputs, StreamEvent};

/// Everything a backend needs to execute one program in a fresh sandbox. Resource limits are
/// operator-configured ceilings, not caller-controlled, but are threaded through per call since
/// they can vary by request class upstream of this crate.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    pub stdin: Option<String>,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    pub cpu_time_limit_sec: Option<u32>,
    pub memory_limit_mb: Option<u32>,
    pub staged_inputs: StagedInputs,
    pub last_line_interactive: bool,
}

/// Runs a user program inside an isolated sandbox, once per call.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Runs to completion (or timeout) and returns the full result in one value.
    async fn run(&self, req: &SandboxRequest) -> Result<ExecutionResult, SandboxError>;

    /// Runs to completion (or timeout), emitting output as it becomes available. The returned
    /// stream always ends with exactly one `StreamEvent::Result`. A `SandboxError` returned here
    /// (as opposed to from the stream) reflects a failure before execution could even begin —
    /// launch or staging — since at that point there is no stream to report it through yet.
    async fn run_stream(
        &self,
        req: &SandboxRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, SandboxError>;
}

/// Forwards to the boxed trait object, so a process that selects its backend at runtime (see
/// `sandbox-cli`) can hand a `Box<dyn SandboxBackend>` straight to a `Coordinator<B>` without the
/// coordinator needing to know about dynamic dispatch at all.
#[async_trait]
impl SandboxBackend for Box<dyn SandboxBackend> {
    async fn run(&self, req: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        (**self).run(req).await
    }

    async fn run_stream(
        &self,
        req: &SandboxRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, SandboxError> {
        (**self).run_stream(req).await
    }
}
