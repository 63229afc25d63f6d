//! Sandbox Backend contract and implementations: the abstract trait (§4.5), the incremental
//! UTF-8 decoder and output cap shared by every backend, and the Container Backend (§4.6) that
//! drives `docker` as a CLI subprocess.
//!
//! The Cluster Backend (§4.7) lives in the sibling `process_execution_cluster` crate, which
//! depends on this one for `SandboxBackend`, `SandboxRequest`, and the shared decode/cap helpers.

mod backend;
mod cap;
mod container;
mod decode;

pub use backend::{SandboxBackend, SandboxRequest};
pub use cap::OutputCap;
pub use container::ContainerBackend;
pub use decode::IncrementalDecoder;

#[cfg(test)]
mod mock_backend_tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{BoxStream, StreamExt};
    use sandbox_types::{ExecutionResult, OutputStream, SandboxError, StreamEvent, WorkspaceEntry};

    /// An in-memory stand-in for a real backend, used to exercise callers of `SandboxBackend`
    /// without a container runtime. Echoes the request's code as stdout, verbatim.
    struct EchoBackend;

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        async fn run(&self, req: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
            Ok(ExecutionResult {
                stdout: req.code.clone(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
                duration_ms: 1,
                files: vec![WorkspaceEntry::file("out.txt", b"hi".to_vec())],
            })
        }

        async fn run_stream(
            &self,
            req: &SandboxRequest,
        ) -> Result<BoxStream<'static, StreamEvent>, SandboxError> {
            let code = req.code.clone();
            let events = vec![
                StreamEvent::Output {
                    stream: OutputStream::Stdout,
                    data: code,
                },
                StreamEvent::Result {
                    exit_code: Some(0),
                    timed_out: false,
                    duration_ms: 1,
                    files: Vec::new(),
                },
            ];
            Ok(futures::stream::iter(events).boxed())
        }
    }

    fn request(code: &str) -> SandboxRequest {
        SandboxRequest {
            code: code.to_string(),
            stdin: None,
            timeout_ms: 2_000,
            max_output_bytes: 1_000_000,
            cpu_time_limit_sec: None,
            memory_limit_mb: None,
            staged_inputs: Default::default(),
            last_line_interactive: true,
        }
    }

    #[tokio::test]
    async fn run_returns_the_mocked_result() {
        let backend = EchoBackend;
        let result = backend.run(&request("print(1)")).await.unwrap();
        assert_eq!(result.stdout, "print(1)");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_stream_ends_with_exactly_one_result_event() {
        let backend = EchoBackend;
        let events: Vec<_> = backend
            .run_stream(&request("print(2)"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(StreamEvent::Result { .. })));
        assert_eq!(
            events.iter().filter(|e| matches!(e, StreamEvent::Result { .. })).count(),
            1
        );
    }
}
