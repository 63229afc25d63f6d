//! Cluster Backend (§4.7): drives a Kubernetes cluster API to launch an ephemeral pod per
//! execution, stage an archive into it over an exec-attach stream, run the entrypoint as an
//! unprivileged user, and tear the pod down unconditionally.
//!
//! Shares the `SandboxBackend` contract, and the incremental decoder / output cap, with the
//! sibling `process_execution` crate's Container Backend — the two differ only in which
//! mechanism (local container runtime vs. cluster API) drives the same state machine.

mod pod;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod as PodResource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{DeleteParams, Status};
use kube::api::{Api, AttachedProcess, AttachParams, PostParams};
use kube::Client;
use log::{debug, info, warn};
use process_execution::{IncrementalDecoder, OutputCap, SandboxBackend, SandboxRequest};
use sandbox_archive::{build_archive, StagedFile};
use sandbox_config::KubernetesSettings;
use sandbox_types::{EntryKind, ExecutionResult, OutputStream, SandboxError, StreamEvent, WorkspaceEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives a Kubernetes cluster via the `kube` client. Bound to one namespace/image/service
/// account; a fresh pod is created and destroyed per `run`/`run_stream` call.
#[derive(Clone)]
pub struct ClusterBackend {
    client: Client,
    settings: KubernetesSettings,
}

impl ClusterBackend {
    pub fn new(client: Client, settings: KubernetesSettings) -> Self {
        Self { client, settings }
    }

    fn pods(&self) -> Api<PodResource> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn unique_name(&self) -> String {
        format!("code-exec-{}", uuid::Uuid::new_v4().simple())
    }

    /// Step 1: submit the pod manifest.
    async fn launch(&self, name: &str, req: &SandboxRequest) -> Result<(), SandboxError> {
        let manifest = pod::build_pod_manifest(
            name,
            &self.settings.namespace,
            &self.settings.image,
            &self.settings.service_account,
            req.cpu_time_limit_sec,
            req.memory_limit_mb,
        );
        self.pods()
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| SandboxError::BackendError {
                message: format!("failed to create pod {name}: {e}"),
            })?;
        info!("created pod {name}");
        Ok(())
    }

    /// Step 2: poll pod status at 100ms intervals for up to 30s.
    async fn wait_ready(&self, name: &str) -> Result<(), SandboxError> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            let pod = self.pods().get(name).await.map_err(|e| SandboxError::BackendError {
                message: format!("failed to poll pod {name}: {e}"),
            })?;
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            if phase == Some("Running") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::BackendError {
                    message: format!("pod {name} did not become ready within {READY_TIMEOUT:?}"),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Step 3: stream the archive into the pod's workspace via `tar -x`, as raw binary — never
    /// routed through a text-decoding step, per the binary-safety invariant in §4.7.
    async fn stage(&self, name: &str, req: &SandboxRequest) -> Result<(), SandboxError> {
        let files: Vec<StagedFile> = req
            .staged_inputs
            .iter()
            .map(|(path, content)| StagedFile {
                path: path.clone(),
                content: content.clone(),
            })
            .collect();
        let archive = build_archive(&req.code, &files, req.last_line_interactive)?;

        let ap = AttachParams::default().stdin(true).stdout(false).stderr(true);
        let mut attached = self
            .pods()
            .exec(name, ["tar", "-x", "-C", "/workspace"], &ap)
            .await
            .map_err(|e| SandboxError::StagingError {
                message: format!("failed to exec tar -x in {name}: {e}"),
            })?;

        let mut stdin = attached.stdin().ok_or_else(|| SandboxError::StagingError {
            message: "exec attach did not provide a stdin channel".to_string(),
        })?;
        stdin.write_all(&archive).await.map_err(|e| SandboxError::StagingError {
            message: format!("failed to write archive to pod {name}: {e}"),
        })?;
        drop(stdin);

        let status = take_status(&mut attached).await;
        let _ = attached.join().await;
        match exit_code_of(status.as_ref()) {
            Some(0) | None => {
                debug!("staged archive into {name}");
                Ok(())
            }
            Some(code) => Err(SandboxError::StagingError {
                message: format!("tar -x exited with status {code}"),
            }),
        }
    }

    fn spawn_exec_params() -> AttachParams {
        AttachParams::default().stdin(true).stdout(true).stderr(true)
    }

    /// Step 6: `pkill -9 python` via a fresh exec-attach, ignoring failures.
    async fn kill_in_pod(&self, name: &str) {
        let ap = AttachParams::default().stdin(false).stdout(false).stderr(false);
        if let Ok(mut attached) = self.pods().exec(name, ["pkill", "-9", "python"], &ap).await {
            let _ = attached.join().await;
        }
    }

    /// Step 7: snapshot the workspace through `tar | base64`, decoding the base64 text back to
    /// the raw archive bytes before parsing — this is the only point at which the pipeline is
    /// allowed to pass through a text frame, because it is explicitly base64-encoded first.
    async fn snapshot(&self, name: &str) -> Vec<WorkspaceEntry> {
        let ap = AttachParams::default().stdin(false).stdout(true).stderr(true);
        let command = ["sh", "-c", "tar -c --exclude=__main__.py -C /workspace . | base64"];
        let mut attached = match self.pods().exec(name, command, &ap).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!("snapshot of {name} failed to exec: {e}");
                return Vec::new();
            }
        };

        let mut encoded = String::new();
        if let Some(mut stdout) = attached.stdout() {
            if let Err(e) = stdout.read_to_string(&mut encoded).await {
                warn!("snapshot of {name} failed to read stdout: {e}");
                return Vec::new();
            }
        }
        let _ = attached.join().await;

        let decoded = match base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encoded.trim(),
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("snapshot of {name} produced invalid base64: {e}");
                return Vec::new();
            }
        };
        parse_snapshot_archive(&decoded).unwrap_or_else(|e| {
            warn!("snapshot of {name} produced an unparseable archive: {e}");
            Vec::new()
        })
    }

    /// Step 8: delete the pod with grace period 0, ignoring not-found.
    async fn teardown(&self, name: &str) {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods().delete(name, &params).await {
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(e) => warn!("failed to delete pod {name}: {e}"),
        }
        debug!("tore down pod {name}");
    }
}

/// Reads `status.status` / `status.reason` / `status.details.causes` to recover the exit code
/// the way the reference deployment's client parses the exec error channel (§4.7 step 5):
/// `Success` -> 0; `NonZeroExitCode` with a parseable `ExitCode` cause -> that code; any other
/// failure status -> 1.
fn exit_code_of(status: Option<&Status>) -> Option<i32> {
    let status = status?;
    match status.status.as_deref() {
        Some("Success") => Some(0),
        Some("Failure") => {
            let code = status
                .details
                .as_ref()
                .and_then(|d| d.causes.as_ref())
                .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
                .and_then(|cause| cause.message.as_deref())
                .and_then(|msg| msg.parse::<i32>().ok());
            Some(code.unwrap_or(1))
        }
        _ => None,
    }
}

async fn take_status(attached: &mut AttachedProcess) -> Option<Status> {
    attached.take_status()?.await
}

fn parse_snapshot_archive(bytes: &[u8]) -> std::io::Result<Vec<WorkspaceEntry>> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let clean = path.trim_start_matches("./");
        if clean.is_empty() || clean == "." {
            continue;
        }
        if entry.header().entry_type().is_dir() {
            entries.push(WorkspaceEntry {
                path: clean.trim_end_matches('/').to_string(),
                kind: EntryKind::Directory,
                content: None,
            });
        } else if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content)?;
            entries.push(WorkspaceEntry {
                path: clean.to_string(),
                kind: EntryKind::File,
                content: Some(content),
            });
        }
    }
    Ok(entries)
}

/// Writes `stdin` (if any) to the attached process's stdin channel and closes it, so the
/// sandboxed program sees EOF rather than blocking on further input.
async fn write_stdin_then_close(attached: &mut AttachedProcess, stdin: &Option<String>) {
    if let Some(mut pipe) = attached.stdin() {
        if let Some(text) = stdin {
            let _ = pipe.write_all(text.as_bytes()).await;
        }
        // Dropping `pipe` closes the write end, signaling EOF to the attached process.
    }
}

struct CollectedOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

/// The supervise loop shared by `run` and `run_stream`, mirroring the Container Backend's: reads
/// both exec-attach streams concurrently, decoding incrementally and applying the per-stream
/// output cap, until the deadline elapses or both streams close and a terminal status arrives —
/// both paths end up with byte-identical buffers, since both are built from exactly the same
/// `OutputCap` admissions, truncation marker included.
async fn supervise(
    mut attached: AttachedProcess,
    timeout_ms: u64,
    max_output_bytes: usize,
    mut on_chunk: impl FnMut(OutputStream, &str),
) -> CollectedOutput {
    let mut stdout_pipe = attached.stdout();
    let mut stderr_pipe = attached.stderr();

    let mut stdout_decoder = IncrementalDecoder::new();
    let mut stderr_decoder = IncrementalDecoder::new();
    let mut stdout_cap = OutputCap::new(max_output_bytes);
    let mut stderr_cap = OutputCap::new(max_output_bytes);
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    let mut chunk = [0u8; 4096];
    let mut stdout_done = stdout_pipe.is_none();
    let mut stderr_done = stderr_pipe.is_none();

    let deadline = Duration::from_millis(timeout_ms.max(1));
    let read_loop = async {
        while !stdout_done || !stderr_done {
            tokio::select! {
                res = read_or_pending(&mut stdout_pipe, &mut chunk), if !stdout_done => {
                    match res {
                        Some(Ok(0)) | Some(Err(_)) | None => stdout_done = true,
                        Some(Ok(n)) => {
                            let text = stdout_decoder.push(&chunk[..n]);
                            let admitted = stdout_cap.admit(&text);
                            if !admitted.is_empty() {
                                on_chunk(OutputStream::Stdout, &admitted);
                                stdout_buf.push_str(&admitted);
                            }
                        }
                    }
                }
                res = read_or_pending(&mut stderr_pipe, &mut chunk), if !stderr_done => {
                    match res {
                        Some(Ok(0)) | Some(Err(_)) | None => stderr_done = true,
                        Some(Ok(n)) => {
                            let text = stderr_decoder.push(&chunk[..n]);
                            let admitted = stderr_cap.admit(&text);
                            if !admitted.is_empty() {
                                on_chunk(OutputStream::Stderr, &admitted);
                                stderr_buf.push_str(&admitted);
                            }
                        }
                    }
                }
            }
        }
    };

    let timed_out = timeout(deadline, read_loop).await.is_err();
    let status = if timed_out { None } else { take_status(&mut attached).await };
    let _ = attached.join().await;

    if let Some(tail) = stdout_decoder.flush() {
        let admitted = stdout_cap.admit(&tail);
        if !admitted.is_empty() {
            on_chunk(OutputStream::Stdout, &admitted);
            stdout_buf.push_str(&admitted);
        }
    }
    if let Some(tail) = stderr_decoder.flush() {
        let admitted = stderr_cap.admit(&tail);
        if !admitted.is_empty() {
            on_chunk(OutputStream::Stderr, &admitted);
            stderr_buf.push_str(&admitted);
        }
    }

    // Releases each stream's held-back tail if it never crossed the cap; a no-op if it did,
    // since the marker has already taken that tail's place.
    let stdout_tail = stdout_cap.finish();
    if !stdout_tail.is_empty() {
        on_chunk(OutputStream::Stdout, &stdout_tail);
        stdout_buf.push_str(&stdout_tail);
    }
    let stderr_tail = stderr_cap.finish();
    if !stderr_tail.is_empty() {
        on_chunk(OutputStream::Stderr, &stderr_tail);
        stderr_buf.push_str(&stderr_tail);
    }

    CollectedOutput {
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_code: if timed_out { None } else { exit_code_of(status.as_ref()) },
        timed_out,
    }
}

/// `tokio::select!` needs every branch's future to resolve even once its stream is gone;
/// `AttachedProcess::stdout()`/`stderr()` return `Option<impl AsyncRead>`, so a missing pipe
/// becomes a future that never completes rather than a branch we must special-case away.
async fn read_or_pending<R: tokio::io::AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> Option<std::io::Result<usize>> {
    match pipe {
        Some(r) => Some(r.read(buf).await),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl SandboxBackend for ClusterBackend {
    async fn run(&self, req: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        let name = self.unique_name();
        self.launch(&name, req).await?;
        self.wait_ready(&name).await?;

        let outcome = self.run_after_stage(&name, req, |_, _| {}).await;

        let files = self.snapshot(&name).await;
        self.teardown(&name).await;

        outcome.map(|(collected, duration_ms)| ExecutionResult {
            stdout: collected.stdout,
            stderr: collected.stderr,
            exit_code: collected.exit_code,
            timed_out: collected.timed_out,
            duration_ms,
            files,
        })
    }

    async fn run_stream(
        &self,
        req: &SandboxRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, SandboxError> {
        let name = self.unique_name();
        self.launch(&name, req).await?;
        self.wait_ready(&name).await?;
        self.stage(&name, req).await?;

        let ap = Self::spawn_exec_params();
        let mut attached = self
            .pods()
            .exec(&name, ["python", "/workspace/__main__.py"], &ap)
            .await
            .map_err(|e| SandboxError::BackendError {
                message: format!("failed to exec python in {name}: {e}"),
            })?;
        write_stdin_then_close(&mut attached, &req.stdin).await;

        let timeout_ms = req.timeout_ms;
        let max_output_bytes = req.max_output_bytes;
        let backend = self.clone();

        let stream = async_stream::stream! {
            let start = Instant::now();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let supervise_fut = supervise(attached, timeout_ms, max_output_bytes, move |stream, text| {
                let _ = tx.send(StreamEvent::Output { stream, data: text.to_string() });
            });
            tokio::pin!(supervise_fut);

            let collected = loop {
                tokio::select! {
                    biased;
                    Some(event) = rx.recv() => yield event,
                    collected = &mut supervise_fut => break collected,
                }
            };
            while let Ok(event) = rx.try_recv() {
                yield event;
            }

            if collected.timed_out {
                backend.kill_in_pod(&name).await;
            }
            let files = backend.snapshot(&name).await;
            backend.teardown(&name).await;

            yield StreamEvent::Result {
                exit_code: collected.exit_code,
                timed_out: collected.timed_out,
                duration_ms: start.elapsed().as_millis() as u64,
                files,
            };
        };

        Ok(stream.boxed())
    }
}

impl ClusterBackend {
    async fn run_after_stage(
        &self,
        name: &str,
        req: &SandboxRequest,
        on_chunk: impl FnMut(OutputStream, &str),
    ) -> Result<(CollectedOutput, u64), SandboxError> {
        let start = Instant::now();
        self.stage(name, req).await?;

        let ap = Self::spawn_exec_params();
        let mut attached = self
            .pods()
            .exec(name, ["python", "/workspace/__main__.py"], &ap)
            .await
            .map_err(|e| SandboxError::BackendError {
                message: format!("failed to exec python in {name}: {e}"),
            })?;
        write_stdin_then_close(&mut attached, &req.stdin).await;

        let collected = supervise(attached, req.timeout_ms, req.max_output_bytes, on_chunk).await;
        if collected.timed_out {
            self.kill_in_pod(name).await;
        }
        Ok((collected, start.elapsed().as_millis() as u64))
    }
}
