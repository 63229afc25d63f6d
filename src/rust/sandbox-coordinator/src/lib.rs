//! Request Coordinator (§4.8): the single place that turns one `ExecuteRequest` into a staged
//! sandbox run and a finished `ExecuteResponse`, generic over whichever `SandboxBackend` the
//! process is configured with — written once against the abstract contract, not once per
//! backend.

use futures::stream::{BoxStream, StreamExt};
use log::warn;
use process_execution::{SandboxBackend, SandboxRequest};
use sandbox_store::FileStore;
use sandbox_types::{
    EntryKind, ExecuteRequest, ExecuteResponse, OutputStream, SandboxError, SandboxLimits,
    StagedInputs, StreamEvent, WorkspaceEntry, WorkspaceFile,
};

/// One event in a coordinated streaming execution: either a passthrough output chunk, or the
/// terminal summary with workspace entries already diffed against staged inputs and persisted
/// to the File Store as file-ids, mirroring `ExecuteResponse`'s own shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Output {
        stream: OutputStream,
        data: String,
    },
    Result {
        exit_code: Option<i32>,
        timed_out: bool,
        duration_ms: u64,
        files: Vec<WorkspaceFile>,
    },
}

/// Wires the File Store and a Sandbox Backend together to execute requests per §4.8.
pub struct Coordinator<B: SandboxBackend> {
    backend: B,
    store: FileStore,
    limits: SandboxLimits,
    max_exec_timeout_ms: u64,
}

impl<B: SandboxBackend> Coordinator<B> {
    pub fn new(backend: B, store: FileStore, limits: SandboxLimits, max_exec_timeout_ms: u64) -> Self {
        Self {
            backend,
            store,
            limits,
            max_exec_timeout_ms,
        }
    }

    /// Validates the request, resolves its declared inputs, invokes the backend, and diffs the
    /// returned workspace against what was staged — the full, blocking `run` path.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, SandboxError> {
        self.validate_timeout(request.timeout_ms)?;
        let staged_inputs = self.resolve_inputs(&request).await?;
        let req = self.sandbox_request(&request, staged_inputs.clone());

        let result = self.backend.run(&req).await?;

        let files = diff_and_persist(&self.store, result.files, &staged_inputs).await;
        Ok(ExecuteResponse {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms: result.duration_ms,
            files,
        })
    }

    /// The streaming counterpart: forwards every `StreamEvent::Output` verbatim, and defers the
    /// diff-and-persist step until the backend's own terminal summary has been observed.
    pub async fn execute_stream(
        &self,
        request: ExecuteRequest,
    ) -> Result<BoxStream<'static, CoordinatorEvent>, SandboxError> {
        self.validate_timeout(request.timeout_ms)?;
        let staged_inputs = self.resolve_inputs(&request).await?;
        let req = self.sandbox_request(&request, staged_inputs.clone());

        let mut events = self.backend.run_stream(&req).await?;
        let store = self.store.clone();

        let stream = async_stream::stream! {
            while let Some(event) = events.next().await {
                match event {
                    StreamEvent::Output { stream, data } => {
                        yield CoordinatorEvent::Output { stream, data };
                    }
                    StreamEvent::Result { exit_code, timed_out, duration_ms, files } => {
                        let diffed = diff_and_persist(&store, files, &staged_inputs).await;
                        yield CoordinatorEvent::Result {
                            exit_code,
                            timed_out,
                            duration_ms,
                            files: diffed,
                        };
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    fn validate_timeout(&self, timeout_ms: u64) -> Result<(), SandboxError> {
        if timeout_ms > self.max_exec_timeout_ms {
            return Err(SandboxError::InvalidTimeout {
                requested_ms: timeout_ms,
                max_ms: self.max_exec_timeout_ms,
            });
        }
        Ok(())
    }

    async fn resolve_inputs(&self, request: &ExecuteRequest) -> Result<StagedInputs, SandboxError> {
        let mut staged_inputs = StagedInputs::new();
        for input in &request.files {
            let (bytes, _meta) = self
                .store
                .get(&input.file_id)
                .await
                .map_err(|e| e.with_path(input.path.clone()))?;
            staged_inputs.insert(input.path.clone(), bytes);
        }
        Ok(staged_inputs)
    }

    fn sandbox_request(&self, request: &ExecuteRequest, staged_inputs: StagedInputs) -> SandboxRequest {
        SandboxRequest {
            code: request.code.clone(),
            stdin: request.stdin.clone(),
            timeout_ms: request.timeout_ms,
            max_output_bytes: self.limits.max_output_bytes,
            cpu_time_limit_sec: self.limits.cpu_time_limit_sec,
            memory_limit_mb: self.limits.memory_limit_mb,
            staged_inputs,
            last_line_interactive: request.last_line_interactive,
        }
    }
}

/// Free function so it can run both from `execute`'s borrow of `&self.store` and from
/// `execute_stream`'s detached `async_stream::stream!` block, which owns its own clone of the
/// store rather than borrowing `self` across the whole backend stream's lifetime.
///
/// Preserves the order the backend returned; skips directories; skips any file whose bytes are
/// byte-identical to what was staged at that same path.
async fn diff_and_persist(
    store: &FileStore,
    files: Vec<WorkspaceEntry>,
    staged_inputs: &StagedInputs,
) -> Vec<WorkspaceFile> {
    let mut out = Vec::with_capacity(files.len());
    for entry in files {
        let EntryKind::File = entry.kind else {
            continue;
        };
        let content = entry.content.unwrap_or_default();
        if staged_inputs.get(&entry.path).map(Vec::as_slice) == Some(content.as_slice()) {
            continue;
        }
        match store.put(&content, &entry.path).await {
            Ok(file_id) => out.push(WorkspaceFile {
                path: entry.path,
                kind: EntryKind::File,
                file_id: Some(file_id),
            }),
            Err(e) => warn!("failed to persist workspace file '{}': {e}", entry.path),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox_types::InputFile;

    struct MockBackend {
        response: ExecutionResultFixture,
    }

    #[derive(Clone)]
    enum ExecutionResultFixture {
        Echo,
        WithFiles,
    }

    #[async_trait]
    impl SandboxBackend for MockBackend {
        async fn run(
            &self,
            req: &SandboxRequest,
        ) -> Result<sandbox_types::ExecutionResult, SandboxError> {
            let files = match self.response {
                ExecutionResultFixture::Echo => Vec::new(),
                ExecutionResultFixture::WithFiles => {
                    let unchanged = req
                        .staged_inputs
                        .get("input.txt")
                        .cloned()
                        .unwrap_or_default();
                    vec![
                        WorkspaceEntry::directory("out"),
                        WorkspaceEntry::file("input.txt", unchanged),
                        WorkspaceEntry::file("out/result.txt", b"computed".to_vec()),
                    ]
                }
            };
            Ok(sandbox_types::ExecutionResult {
                stdout: req.code.clone(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
                duration_ms: 5,
                files,
            })
        }

        async fn run_stream(
            &self,
            req: &SandboxRequest,
        ) -> Result<BoxStream<'static, StreamEvent>, SandboxError> {
            let result = self.run(req).await?;
            let events = vec![
                StreamEvent::Output {
                    stream: OutputStream::Stdout,
                    data: result.stdout,
                },
                StreamEvent::Result {
                    exit_code: result.exit_code,
                    timed_out: result.timed_out,
                    duration_ms: result.duration_ms,
                    files: result.files,
                },
            ];
            Ok(futures::stream::iter(events).boxed())
        }
    }

    async fn store() -> (FileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FileStore::open(dir.path()).await.unwrap(), dir)
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_output_bytes: 1_000_000,
            cpu_time_limit_sec: Some(5),
            memory_limit_mb: Some(256),
        }
    }

    #[tokio::test]
    async fn rejects_timeout_above_the_configured_maximum() {
        let (store, _dir) = store().await;
        let coordinator = Coordinator::new(
            MockBackend {
                response: ExecutionResultFixture::Echo,
            },
            store,
            limits(),
            5_000,
        );
        let request = ExecuteRequest {
            code: "print(1)".to_string(),
            stdin: None,
            timeout_ms: 10_000,
            last_line_interactive: true,
            files: Vec::new(),
        };
        let err = coordinator.execute(request).await.unwrap_err();
        assert_eq!(
            err,
            SandboxError::InvalidTimeout {
                requested_ms: 10_000,
                max_ms: 5_000,
            }
        );
    }

    #[tokio::test]
    async fn unknown_file_id_surfaces_the_intended_path() {
        let (store, _dir) = store().await;
        let coordinator = Coordinator::new(
            MockBackend {
                response: ExecutionResultFixture::Echo,
            },
            store,
            limits(),
            60_000,
        );
        let request = ExecuteRequest {
            code: "print(1)".to_string(),
            stdin: None,
            timeout_ms: 1_000,
            last_line_interactive: true,
            files: vec![InputFile {
                path: "data.csv".to_string(),
                file_id: "missing-id".to_string(),
            }],
        };
        let err = coordinator.execute(request).await.unwrap_err();
        assert_eq!(
            err,
            SandboxError::UnknownFile {
                file_id: "missing-id".to_string(),
                path: "data.csv".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn diff_skips_directories_and_unchanged_staged_files() {
        let (store, _dir) = store().await;
        let file_id = store.put(b"original", "input.txt").await.unwrap();
        let coordinator = Coordinator::new(
            MockBackend {
                response: ExecutionResultFixture::WithFiles,
            },
            store,
            limits(),
            60_000,
        );
        let request = ExecuteRequest {
            code: "print(1)".to_string(),
            stdin: None,
            timeout_ms: 1_000,
            last_line_interactive: true,
            files: vec![InputFile {
                path: "input.txt".to_string(),
                file_id,
            }],
        };
        let response = coordinator.execute(request).await.unwrap();
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.files[0].path, "out/result.txt");
        assert!(response.files[0].file_id.is_some());
    }

    #[tokio::test]
    async fn execute_stream_forwards_output_then_diffed_result() {
        let (store, _dir) = store().await;
        let coordinator = Coordinator::new(
            MockBackend {
                response: ExecutionResultFixture::WithFiles,
            },
            store,
            limits(),
            60_000,
        );
        let request = ExecuteRequest {
            code: "print(1)".to_string(),
            stdin: None,
            timeout_ms: 1_000,
            last_line_interactive: true,
            files: Vec::new(),
        };
        let events: Vec<_> = coordinator
            .execute_stream(request)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events[0], CoordinatorEvent::Output { .. }));
        let CoordinatorEvent::Result { files, .. } = events.last().unwrap() else {
            panic!("expected a terminal Result event");
        };
        // input.txt was never staged this time, so it is not byte-identical to anything and is
        // persisted like any other new output file.
        assert_eq!(files.len(), 2);
    }
}
