//! CLI entrypoint (§6A): wires `Settings::from_env`, the configured backend, and the
//! Coordinator together to execute a single script from the command line — useful for manual
//! verification and smoke-testing a freshly built sandbox image without standing up the
//! (out-of-scope) HTTP surface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use futures::stream::StreamExt;
use process_execution::SandboxBackend;
use process_execution_cluster::ClusterBackend;
use sandbox_config::{ExecutorBackend, Settings};
use sandbox_coordinator::{Coordinator, CoordinatorEvent};
use sandbox_store::FileStore;
use sandbox_types::{ExecuteRequest, OutputStream, SandboxLimits};

/// Executes a Python script inside a freshly provisioned sandbox, using whichever backend
/// `EXECUTOR_BACKEND` selects, and prints its stdout/stderr/exit code to the terminal.
#[derive(Parser)]
#[command(name = "sandbox-cli", about = "Run a Python script inside a sandbox")]
struct Args {
    /// Path to the script to execute. Pass `-` to read the script from stdin.
    script: PathBuf,

    /// Overrides the request timeout; falls back to the settings default when unset.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Disables "last line interactive" wrapping (the script's final expression is not echoed).
    #[arg(long)]
    no_last_line_interactive: bool,

    /// Stream output as it becomes available instead of waiting for the full result.
    #[arg(long)]
    stream: bool,

    /// Increases log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(logging::verbosity_from_u8(args.verbose.min(4)));

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let settings = Settings::from_env();

    let code = if args.script.as_os_str() == "-" {
        read_stdin().await?
    } else {
        tokio::fs::read_to_string(&args.script).await?
    };

    let store = FileStore::open(&settings.file_storage_dir).await?;
    let backend = build_backend(&settings).await?;

    let limits = SandboxLimits {
        max_output_bytes: settings.max_output_bytes,
        cpu_time_limit_sec: Some(settings.cpu_time_limit_sec),
        memory_limit_mb: Some(settings.memory_limit_mb),
    };
    let coordinator = Coordinator::new(backend, store, limits, settings.max_exec_timeout_ms);

    let request = ExecuteRequest {
        code,
        stdin: None,
        timeout_ms: args.timeout_ms.unwrap_or(settings.max_exec_timeout_ms),
        last_line_interactive: !args.no_last_line_interactive,
        files: Vec::new(),
    };

    if args.stream {
        run_streaming(&coordinator, request).await
    } else {
        run_blocking(&coordinator, request).await
    }
}

async fn run_blocking(
    coordinator: &Coordinator<Box<dyn SandboxBackend>>,
    request: ExecuteRequest,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let response = coordinator.execute(request).await?;
    print!("{}", response.stdout);
    eprint!("{}", response.stderr);
    for file in &response.files {
        eprintln!("# wrote {} ({:?})", file.path, file.kind);
    }
    if response.timed_out {
        eprintln!("# timed out after {}ms", response.duration_ms);
        return Ok(ExitCode::FAILURE);
    }
    Ok(exit_code_from(response.exit_code))
}

async fn run_streaming(
    coordinator: &Coordinator<Box<dyn SandboxBackend>>,
    request: ExecuteRequest,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut events = coordinator.execute_stream(request).await?;
    let mut exit_code = None;
    let mut timed_out = false;
    while let Some(event) = events.next().await {
        match event {
            CoordinatorEvent::Output { stream, data } => match stream {
                OutputStream::Stdout => print!("{data}"),
                OutputStream::Stderr => eprint!("{data}"),
            },
            CoordinatorEvent::Result {
                exit_code: code,
                timed_out: out,
                files,
                ..
            } => {
                exit_code = code;
                timed_out = out;
                for file in &files {
                    eprintln!("# wrote {} ({:?})", file.path, file.kind);
                }
            }
        }
    }
    if timed_out {
        eprintln!("# timed out");
        return Ok(ExitCode::FAILURE);
    }
    Ok(exit_code_from(exit_code))
}

fn exit_code_from(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(_) => ExitCode::FAILURE,
        None => ExitCode::FAILURE,
    }
}

async fn read_stdin() -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    tokio::io::stdin().read_to_string(&mut buf).await?;
    Ok(buf)
}

async fn build_backend(
    settings: &Settings,
) -> Result<Box<dyn SandboxBackend>, Box<dyn std::error::Error>> {
    match settings.executor_backend {
        ExecutorBackend::Docker => {
            let backend = process_execution::ContainerBackend::new(settings.docker.clone());
            backend.preflight().await?;
            Ok(Box::new(backend))
        }
        ExecutorBackend::Kubernetes => {
            let client = kube::Client::try_default().await?;
            Ok(Box::new(ClusterBackend::new(client, settings.kubernetes.clone())))
        }
    }
}
