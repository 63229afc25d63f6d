//! Pod manifest construction for the Cluster Backend (§4.7 step 1).

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sandbox_types::{SANDBOX_GID, SANDBOX_UID};
use std::collections::BTreeMap;

const SANDBOX_ENV: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("MPLCONFIGDIR", "/tmp/matplotlib"),
];

/// Builds the pod manifest described in §4.7 step 1: a single `executor` container running a
/// long sleep, no network policy of its own (isolation here is the cluster's NetworkPolicy, out
/// of scope for this engine), resource requests/limits derived from the caller's ceilings, and
/// two `emptyDir` volumes sized per the spec.
pub fn build_pod_manifest(
    name: &str,
    namespace: &str,
    image: &str,
    service_account: &str,
    cpu_time_limit_sec: Option<u32>,
    memory_limit_mb: Option<u32>,
) -> Pod {
    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    if let Some(memory_mb) = memory_limit_mb {
        let memory_mb = memory_mb.max(16);
        limits.insert("memory".to_string(), Quantity(format!("{memory_mb}Mi")));
        requests.insert(
            "memory".to_string(),
            Quantity(format!("{}Mi", memory_mb.min(64))),
        );
    }
    if let Some(cpu_sec) = cpu_time_limit_sec {
        let cpu_limit = cpu_sec.max(1);
        limits.insert("cpu".to_string(), Quantity(cpu_limit.to_string()));
        requests.insert("cpu".to_string(), Quantity("100m".to_string()));
    }

    let resources = if limits.is_empty() {
        None
    } else {
        Some(ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        })
    };

    let container = Container {
        name: "executor".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["sleep".to_string(), "3600".to_string()]),
        working_dir: Some("/workspace".to_string()),
        resources,
        security_context: Some(SecurityContext {
            run_as_user: Some(SANDBOX_UID as i64),
            run_as_group: Some(SANDBOX_GID as i64),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(false),
            capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                add: None,
            }),
            ..Default::default()
        }),
        env: Some(
            SANDBOX_ENV
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                    value_from: None,
                })
                .collect(),
        ),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "workspace".to_string(),
                mount_path: "/workspace".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "tmp".to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        service_account_name: if service_account.is_empty() {
            None
        } else {
            Some(service_account.to_string())
        },
        volumes: Some(vec![
            Volume {
                name: "workspace".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    size_limit: Some(Quantity("100Mi".to_string())),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "tmp".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    size_limit: Some(Quantity("64Mi".to_string())),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            fs_group: Some(SANDBOX_GID as i64),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "code-interpreter".to_string());
    labels.insert("component".to_string(), "executor".to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}
