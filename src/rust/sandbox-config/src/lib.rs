//! Typed, environment-derived configuration shared by the coordinator, the file store, and
//! whichever backend is selected.
//!
//! `Settings::from_env` loads once at process start following the reference deployment's
//! "env var or default" pattern exactly: an unset or unparsable variable silently falls back to
//! its documented default rather than failing startup or merging with some other config source.
//! `Settings::from_map` is the same logic over an explicit map, so tests never touch the real
//! process environment.

use std::collections::HashMap;
use std::env;

/// Which subprocess-or-cluster mechanism executes submitted programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorBackend {
    Docker,
    Kubernetes,
}

impl ExecutorBackend {
    fn parse(raw: &str) -> Self {
        match raw {
            "kubernetes" => ExecutorBackend::Kubernetes,
            _ => ExecutorBackend::Docker,
        }
    }
}

/// Settings for the Docker (CLI-subprocess) backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSettings {
    pub binary: String,
    pub image: String,
    pub extra_run_args: Vec<String>,
}

/// Settings for the Kubernetes (cluster) backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesSettings {
    pub namespace: String,
    pub image: String,
    pub service_account: String,
}

/// Resolved, immutable configuration for one process lifetime. Cheap to clone; pass by value or
/// by `&Settings` into the coordinator, the file store, and the active backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub executor_backend: ExecutorBackend,
    pub docker: DockerSettings,
    pub kubernetes: KubernetesSettings,

    pub max_exec_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub cpu_time_limit_sec: u32,
    pub memory_limit_mb: u32,

    pub file_storage_dir: String,
    pub max_file_size_mb: u64,
    pub file_ttl_sec: u64,
}

impl Settings {
    /// Loads settings from the real process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_map(&vars)
    }

    /// Loads settings from an explicit variable map, used by tests and by the CLI entrypoint's
    /// `--env-file`-style overrides alike.
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).map(String::as_str);

        Settings {
            executor_backend: get("EXECUTOR_BACKEND")
                .map(ExecutorBackend::parse)
                .unwrap_or(ExecutorBackend::Docker),
            docker: DockerSettings {
                binary: non_empty_or(get("PYTHON_EXECUTOR_DOCKER_BIN"), "docker"),
                image: non_empty_or(
                    get("PYTHON_EXECUTOR_DOCKER_IMAGE"),
                    "onyxdotapp/python-executor-sci",
                ),
                extra_run_args: get("PYTHON_EXECUTOR_DOCKER_RUN_ARGS")
                    .unwrap_or("")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            },
            kubernetes: KubernetesSettings {
                namespace: non_empty_or(get("KUBERNETES_EXECUTOR_NAMESPACE"), "default"),
                image: non_empty_or(
                    get("KUBERNETES_EXECUTOR_IMAGE"),
                    "onyxdotapp/python-executor-sci",
                ),
                service_account: get("KUBERNETES_EXECUTOR_SERVICE_ACCOUNT")
                    .unwrap_or("")
                    .to_string(),
            },
            max_exec_timeout_ms: parse_or(get("MAX_EXEC_TIMEOUT_MS"), 60_000),
            max_output_bytes: parse_or(get("MAX_OUTPUT_BYTES"), 1_000_000),
            cpu_time_limit_sec: parse_or(get("CPU_TIME_LIMIT_SEC"), 5),
            memory_limit_mb: parse_or(get("MEMORY_LIMIT_MB"), 256),
            file_storage_dir: non_empty_or(
                get("FILE_STORAGE_DIR"),
                "/tmp/code-interpreter-files",
            ),
            max_file_size_mb: parse_or(get("MAX_FILE_SIZE_MB"), 100),
            file_ttl_sec: parse_or(get("FILE_TTL_SEC"), 3600),
        }
    }
}

fn non_empty_or(raw: Option<&str>, default: &str) -> String {
    match raw {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_mirror_reference_deployment() {
        let settings = Settings::from_map(&HashMap::new());
        assert_eq!(settings.executor_backend, ExecutorBackend::Docker);
        assert_eq!(settings.docker.binary, "docker");
        assert_eq!(settings.docker.image, "onyxdotapp/python-executor-sci");
        assert!(settings.docker.extra_run_args.is_empty());
        assert_eq!(settings.kubernetes.namespace, "default");
        assert_eq!(settings.max_exec_timeout_ms, 60_000);
        assert_eq!(settings.max_output_bytes, 1_000_000);
        assert_eq!(settings.cpu_time_limit_sec, 5);
        assert_eq!(settings.memory_limit_mb, 256);
        assert_eq!(settings.file_storage_dir, "/tmp/code-interpreter-files");
        assert_eq!(settings.max_file_size_mb, 100);
        assert_eq!(settings.file_ttl_sec, 3600);
    }

    #[test]
    fn unparsable_numeric_falls_back_to_default() {
        let settings = Settings::from_map(&map(&[("MAX_OUTPUT_BYTES", "not-a-number")]));
        assert_eq!(settings.max_output_bytes, 1_000_000);
    }

    #[test]
    fn empty_string_is_treated_as_unset() {
        let settings = Settings::from_map(&map(&[("FILE_STORAGE_DIR", "")]));
        assert_eq!(settings.file_storage_dir, "/tmp/code-interpreter-files");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let settings = Settings::from_map(&map(&[
            ("EXECUTOR_BACKEND", "kubernetes"),
            ("MAX_EXEC_TIMEOUT_MS", "2000"),
            ("KUBERNETES_EXECUTOR_NAMESPACE", "sandboxes"),
            ("PYTHON_EXECUTOR_DOCKER_RUN_ARGS", "--network none --read-only"),
        ]));
        assert_eq!(settings.executor_backend, ExecutorBackend::Kubernetes);
        assert_eq!(settings.max_exec_timeout_ms, 2_000);
        assert_eq!(settings.kubernetes.namespace, "sandboxes");
        assert_eq!(
            settings.docker.extra_run_args,
            vec!["--network", "none", "--read-only"]
        );
    }

    #[test]
    fn unknown_backend_value_falls_back_to_docker() {
        let settings = Settings::from_map(&map(&[("EXECUTOR_BACKEND", "nonsense")]));
        assert_eq!(settings.executor_backend, ExecutorBackend::Docker);
    }
}
