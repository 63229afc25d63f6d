//! Container Backend (§4.6): drives the `docker` CLI as a subprocess to launch an ephemeral,
//! network-isolated container per execution, stage an archive into it, run the entrypoint as an
//! unprivileged user, and tear the container down unconditionally.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use sandbox_archive::{build_archive, StagedFile};
use sandbox_config::DockerSettings;
use sandbox_types::{EntryKind, ExecutionResult, SandboxError, StreamEvent, WorkspaceEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::backend::{SandboxBackend, SandboxRequest};
use crate::cap::OutputCap;
use crate::decode::IncrementalDecoder;

const SANDBOX_ENV: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("MPLCONFIGDIR", "/tmp/matplotlib"),
];

/// Drives Docker as a CLI subprocess. Bound to one configured image/binary; a fresh container is
/// created and destroyed per `run`/`run_stream` call.
pub struct ContainerBackend {
    settings: DockerSettings,
}

impl ContainerBackend {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    fn unique_name(&self) -> String {
        format!("code-exec-{}", uuid::Uuid::new_v4().simple())
    }

    fn docker(&self) -> Command {
        Command::new(&self.settings.binary)
    }

    /// Runs `docker image inspect` for the configured image and, if absent, attempts a single
    /// bounded pull. Intended to run once at process startup, never mid-request: failure here is
    /// a hard startup error, not a per-call one.
    pub async fn preflight(&self) -> Result<(), SandboxError> {
        let inspect = self
            .docker()
            .args(["image", "inspect", &self.settings.image])
            .output()
            .await
            .map_err(|e| SandboxError::BackendError {
                message: format!("failed to invoke docker: {e}"),
            })?;
        if inspect.status.success() {
            return Ok(());
        }
        info!("image {} not present locally, pulling", self.settings.image);
        let pull = timeout(
            Duration::from_secs(300),
            self.docker().args(["pull", &self.settings.image]).output(),
        )
        .await
        .map_err(|_| SandboxError::BackendError {
            message: format!("timed out pulling image {}", self.settings.image),
        })?
        .map_err(|e| SandboxError::BackendError {
            message: format!("failed to invoke docker pull: {e}"),
        })?;
        if !pull.status.success() {
            return Err(SandboxError::BackendError {
                message: format!(
                    "failed to pull image {}: {}",
                    self.settings.image,
                    String::from_utf8_lossy(&pull.stderr)
                ),
            });
        }
        Ok(())
    }

    async fn launch(&self, name: &str, req: &SandboxRequest) -> Result<(), SandboxError> {
        let sleep_secs = (req.timeout_ms / 1000) + 10;

        let mut cmd = self.docker();
        cmd.args([
            "run", "-d", "--rm", "--pull", "never", "--network", "none", "--name", name,
            "--cgroupns", "host", "--pids-limit", "64", "--security-opt", "no-new-privileges",
            "--cap-drop", "ALL", "--cap-add", "CHOWN", "--workdir", "/workspace",
            "--tmpfs", "/tmp:rw,size=64m",
            "--tmpfs", "/workspace:rw,uid=65532,gid=65532",
        ]);
        for (key, value) in SANDBOX_ENV {
            cmd.args(["--env", &format!("{key}={value}")]);
        }
        if let Some(cpu_sec) = req.cpu_time_limit_sec {
            let cpu_limit = cpu_sec.max(1);
            cmd.args(["--ulimit", &format!("cpu={cpu_limit}:{cpu_limit}")]);
        }
        if let Some(memory_mb) = req.memory_limit_mb {
            let memory_mb = memory_mb.max(16);
            let flag = format!("{memory_mb}m");
            cmd.args(["--memory", &flag, "--memory-swap", &flag]);
        }
        for arg in &self.settings.extra_run_args {
            cmd.arg(arg);
        }
        cmd.args([self.settings.image.as_str(), "sleep", &sleep_secs.to_string()]);

        let output = cmd.output().await.map_err(|e| SandboxError::BackendError {
            message: format!("failed to invoke docker run: {e}"),
        })?;
        if !output.status.success() {
            return Err(SandboxError::BackendError {
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!("launched container {name}");
        Ok(())
    }

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

        let mut child = self
            .docker()
            .args(["exec", "-u", "65532:65532", "-i", name, "tar", "-x", "-C", "/workspace"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::StagingError {
                message: format!("failed to invoke docker exec tar: {e}"),
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(&archive)
            .await
            .map_err(|e| SandboxError::StagingError {
                message: format!("failed to write archive to container: {e}"),
            })?;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(|e| SandboxError::StagingError {
            message: format!("failed to wait for staging: {e}"),
        })?;
        if !output.status.success() {
            return Err(SandboxError::StagingError {
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!("staged archive into {name}");
        Ok(())
    }

    fn spawn_exec(&self, name: &str) -> io::Result<Child> {
        self.docker()
            .args(["exec", "-u", "65532:65532", "-i", name, "python", "/workspace/__main__.py"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    /// Step 5: send `pkill -9 python` inside the container as root, ignoring failures.
    async fn kill_in_container(&self, name: &str) {
        let _ = self
            .docker()
            .args(["exec", name, "pkill", "-9", "python"])
            .output()
            .await;
    }

    /// Step 6: snapshot the workspace, excluding the entrypoint. A failure yields an empty list.
    async fn snapshot(&self, name: &str) -> Vec<WorkspaceEntry> {
        let result = self
            .docker()
            .args(["exec", name, "tar", "-c", "--exclude=__main__.py", "-C", "/workspace", "."])
            .output()
            .await;
        let output = match result {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(
                    "snapshot of {name} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("snapshot of {name} failed to invoke tar: {e}");
                return Vec::new();
            }
        };
        parse_snapshot_archive(&output.stdout).unwrap_or_else(|e| {
            warn!("snapshot of {name} produced an unparseable archive: {e}");
            Vec::new()
        })
    }

    /// Step 7: kill the (auto-removing) container by name, ignoring errors.
    async fn teardown(&self, name: &str) {
        let _ = self.docker().args(["kill", name]).output().await;
        debug!("tore down container {name}");
    }
}

/// True if a `docker`-compatible binary answers on `PATH`, used to gate the integration tests
/// below — they exercise a real container runtime and have nothing to assert against on a bare
/// checkout or in a sandboxed CI runner without one.
async fn docker_on_path() -> bool {
    Command::new("docker")
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn parse_snapshot_archive(bytes: &[u8]) -> io::Result<Vec<WorkspaceEntry>> {
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
            io::Read::read_to_end(&mut entry, &mut content)?;
            entries.push(WorkspaceEntry {
                path: clean.to_string(),
                kind: EntryKind::File,
                content: Some(content),
            });
        }
    }
    Ok(entries)
}

/// Writes `stdin` (if any) to the child's stdin pipe and closes it, so the sandboxed program
/// sees EOF rather than blocking on further input.
async fn write_stdin_then_close(child: &mut Child, stdin: &Option<String>) {
    if let Some(mut pipe) = child.stdin.take() {
        if let Some(text) = stdin {
            let _ = pipe.write_all(text.as_bytes()).await;
        }
        // Dropping `pipe` closes the write end, signaling EOF to the child.
    }
}

struct CollectedOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

/// The I/O-multiplexing supervise loop shared by `run` and `run_stream`: reads both pipes in
/// 4 KiB chunks until both close or the deadline elapses, decoding incrementally and applying
/// the per-stream output cap as chunks arrive. `on_chunk` is invoked with each admitted chunk as
/// it is produced, letting `run_stream` forward it live while `run` simply accumulates it — both
/// end up with byte-identical buffers, since both are built from exactly the same `OutputCap`
/// admissions, truncation marker included.
async fn supervise(
    mut child: Child,
    timeout_ms: u64,
    max_output_bytes: usize,
    mut on_chunk: impl FnMut(sandbox_types::OutputStream, &str),
) -> CollectedOutput {
    use sandbox_types::OutputStream as Stream;

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

    let mut stdout_decoder = IncrementalDecoder::new();
    let mut stderr_decoder = IncrementalDecoder::new();
    let mut stdout_cap = OutputCap::new(max_output_bytes);
    let mut stderr_cap = OutputCap::new(max_output_bytes);
    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    let mut chunk = [0u8; 4096];
    let mut stdout_done = false;
    let mut stderr_done = false;

    let deadline = Duration::from_millis(timeout_ms);
    let read_loop = async {
        while !stdout_done || !stderr_done {
            tokio::select! {
                res = stdout_pipe.read(&mut chunk), if !stdout_done => {
                    match res {
                        Ok(0) | Err(_) => stdout_done = true,
                        Ok(n) => {
                            let text = stdout_decoder.push(&chunk[..n]);
                            let admitted = stdout_cap.admit(&text);
                            if !admitted.is_empty() {
                                on_chunk(Stream::Stdout, &admitted);
                                stdout_buf.push_str(&admitted);
                            }
                        }
                    }
                }
                res = stderr_pipe.read(&mut chunk), if !stderr_done => {
                    match res {
                        Ok(0) | Err(_) => stderr_done = true,
                        Ok(n) => {
                            let text = stderr_decoder.push(&chunk[..n]);
                            let admitted = stderr_cap.admit(&text);
                            if !admitted.is_empty() {
                                on_chunk(Stream::Stderr, &admitted);
                                stderr_buf.push_str(&admitted);
                            }
                        }
                    }
                }
            }
        }
    };

    let timed_out = timeout(deadline, read_loop).await.is_err();
    let exit_code = if timed_out {
        None
    } else {
        match child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    };

    if let Some(tail) = stdout_decoder.flush() {
        let admitted = stdout_cap.admit(&tail);
        if !admitted.is_empty() {
            on_chunk(Stream::Stdout, &admitted);
            stdout_buf.push_str(&admitted);
        }
    }
    if let Some(tail) = stderr_decoder.flush() {
        let admitted = stderr_cap.admit(&tail);
        if !admitted.is_empty() {
            on_chunk(Stream::Stderr, &admitted);
            stderr_buf.push_str(&admitted);
        }
    }

    // Releases each stream's held-back tail if it never crossed the cap; a no-op if it did,
    // since the marker has already taken that tail's place.
    let stdout_tail = stdout_cap.finish();
    if !stdout_tail.is_empty() {
        on_chunk(Stream::Stdout, &stdout_tail);
        stdout_buf.push_str(&stdout_tail);
    }
    let stderr_tail = stderr_cap.finish();
    if !stderr_tail.is_empty() {
        on_chunk(Stream::Stderr, &stderr_tail);
        stderr_buf.push_str(&stderr_tail);
    }

    CollectedOutput {
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_code,
        timed_out,
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    async fn run(&self, req: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        let name = self.unique_name();
        self.launch(&name, req).await?;

        let outcome = self.run_after_launch(&name, req, |_, _| {}).await;

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

        if let Err(e) = self.stage(&name, req).await {
            self.teardown(&name).await;
            return Err(e);
        }

        let mut child = self.spawn_exec(&name).map_err(|e| SandboxError::BackendError {
            message: format!("failed to invoke docker exec: {e}"),
        })?;
        write_stdin_then_close(&mut child, &req.stdin).await;

        let timeout_ms = req.timeout_ms;
        let max_output_bytes = req.max_output_bytes;
        let backend = self.clone_for_task();

        let stream = async_stream::stream! {
            let start = Instant::now();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let supervise_fut = supervise(child, timeout_ms, max_output_bytes, move |stream, text| {
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
                backend.kill_in_container(&name).await;
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

impl ContainerBackend {
    async fn run_after_launch(
        &self,
        name: &str,
        req: &SandboxRequest,
        on_chunk: impl FnMut(sandbox_types::OutputStream, &str),
    ) -> Result<(CollectedOutput, u64), SandboxError> {
        let start = Instant::now();
        self.stage(name, req).await?;
        let mut child = self.spawn_exec(name).map_err(|e| SandboxError::BackendError {
            message: format!("failed to invoke docker exec: {e}"),
        })?;
        write_stdin_then_close(&mut child, &req.stdin).await;

        let collected = supervise(child, req.timeout_ms, req.max_output_bytes, on_chunk).await;
        if collected.timed_out {
            self.kill_in_container(name).await;
        }
        Ok((collected, start.elapsed().as_millis() as u64))
    }

    /// A cheap handle usable from inside the `async_stream::stream!` block, which cannot borrow
    /// `self` across the generator's lifetime.
    fn clone_for_task(&self) -> ContainerBackend {
        ContainerBackend {
            settings: self.settings.clone(),
        }
    }
}

/// End-to-end tests against a real `docker` daemon. Skipped (logging a message rather than
/// failing) when no `docker`-compatible binary is on `PATH`, mirroring the reference deployment's
/// own end-to-end suite: it runs in CI where a daemon is provisioned, and is silent on a bare
/// checkout.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use sandbox_config::DockerSettings;
    use std::collections::BTreeMap;

    fn settings() -> DockerSettings {
        DockerSettings {
            binary: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
            extra_run_args: Vec::new(),
        }
    }

    fn request(code: &str) -> SandboxRequest {
        SandboxRequest {
            code: code.to_string(),
            stdin: None,
            timeout_ms: 10_000,
            max_output_bytes: 1_000_000,
            cpu_time_limit_sec: Some(5),
            memory_limit_mb: Some(256),
            staged_inputs: BTreeMap::new(),
            last_line_interactive: false,
        }
    }

    macro_rules! require_docker {
        () => {
            if !docker_on_path().await {
                eprintln!("skipping: no docker-compatible binary on PATH");
                return;
            }
        };
    }

    #[tokio::test]
    async fn runs_a_simple_program_end_to_end() {
        require_docker!();
        let backend = ContainerBackend::new(settings());
        let result = backend.run(&request("print('hello')")).await.unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn enforces_the_wall_clock_timeout() {
        require_docker!();
        let backend = ContainerBackend::new(settings());
        let mut req = request("import time; time.sleep(30)");
        req.timeout_ms = 1_000;
        let start = Instant::now();
        let result = backend.run(&req).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn snapshot_reports_a_newly_written_file() {
        require_docker!();
        let backend = ContainerBackend::new(settings());
        let result = backend
            .run(&request("open('out.txt', 'w').write('computed')"))
            .await
            .unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].path, "out.txt");
        assert_eq!(result.files[0].content.as_deref(), Some(&b"computed"[..]));
    }
}
