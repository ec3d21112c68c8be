//! The runtime document. This is the Linglong dialect of the OCI runtime
//! spec: a fully resolved description of one container, produced by the
//! outer tooling and consumed here exactly once.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub oci_version: String,
    pub hostname: String,
    pub root: Root,
    pub process: Process,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    pub linux: Linux,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Runtime {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("failed to parse runtime document {}", path.display()))
    }

    /// Reads a document from an inherited file descriptor until EOF.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let mut file = unsafe { File::from_raw_fd(fd) };
        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("failed to read runtime document from fd {}", fd))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime document from fd {}", fd))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub typ: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Namespace request. Parsing rejects any token outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinuxNamespaceType {
    Ipc,
    Uts,
    Mount,
    Pid,
    Network,
    User,
    Cgroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub typ: LinuxNamespaceType,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(rename = "containerID", default)]
    pub container_id: u64,
    #[serde(rename = "hostID", default)]
    pub host_id: u64,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<LinuxNamespace>,
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<Seccomp>,
    #[serde(default)]
    pub cgroups_path: String,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory: ResourceMemory,
    #[serde(default)]
    pub cpu: ResourceCpu,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceMemory {
    #[serde(default = "default_memory_value")]
    pub limit: i64,
    #[serde(default = "default_memory_value")]
    pub reservation: i64,
    #[serde(default = "default_memory_value")]
    pub swap: i64,
}

fn default_memory_value() -> i64 {
    -1
}

impl Default for ResourceMemory {
    fn default() -> Self {
        Self {
            limit: -1,
            reservation: -1,
            swap: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceCpu {
    #[serde(default = "default_cpu_shares")]
    pub shares: u64,
    #[serde(default = "default_cpu_bandwidth")]
    pub quota: i64,
    #[serde(default = "default_cpu_bandwidth_u64")]
    pub period: u64,
}

fn default_cpu_shares() -> u64 {
    1024
}

fn default_cpu_bandwidth() -> i64 {
    100_000
}

fn default_cpu_bandwidth_u64() -> u64 {
    100_000
}

impl Default for ResourceCpu {
    fn default() -> Self {
        Self {
            shares: 1024,
            quota: 100_000,
            period: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seccomp {
    pub default_action: String,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub syscalls: Vec<Syscall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syscall {
    pub names: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub args: Vec<SyscallArg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallArg {
    pub index: u32,
    pub value: u64,
    #[serde(rename = "valueTwo", default)]
    pub value_two: u64,
    pub op: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestart: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststart: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststop: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_container: Option<Vec<Hook>>,
}

/// Side channel from the configuration generator: rootfs driver selection,
/// extra mounts, and the identifiers the state record reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_root_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeExtra>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlayfs: Option<OverlayfsInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuse_proxy: Option<FuseProxyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Extra bind mounts the generator wants in addition to `mounts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NativeExtra {
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

/// Lower/upper/work configuration for the fuse-overlayfs driver; the mount
/// point is the document's `root.path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayfsInfo {
    pub lower_dirs: Vec<PathBuf>,
    pub upper: PathBuf,
    pub workdir: PathBuf,
}

/// Mount descriptors (`source:destination` pairs) served by the out-of-process
/// fuse proxy; the mount point is the document's `root.path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuseProxyInfo {
    #[serde(default)]
    pub mounts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> &'static str {
        r#"
        {
            "ociVersion": "1.0.1",
            "hostname": "linglong",
            "process": {
                "args": ["/bin/true"],
                "env": ["PATH=/usr/bin:/bin"],
                "cwd": "/"
            },
            "root": { "path": "/run/user/1000/linglong/abc123/root", "readonly": false },
            "mounts": [
                { "destination": "/proc", "source": "proc", "type": "proc", "options": [] },
                { "destination": "/data", "source": "/tmp/data", "type": "bind",
                  "options": ["rbind", "ro"] }
            ],
            "linux": {
                "namespaces": [
                    { "type": "pid" }, { "type": "mount" }, { "type": "user" }
                ],
                "uidMappings": [ { "containerID": 0, "hostID": 1000, "size": 1 } ],
                "gidMappings": [ { "containerID": 0, "hostID": 1000, "size": 1 } ],
                "cgroupsPath": "",
                "resources": { "memory": { "limit": 67108864 } }
            },
            "hooks": {
                "prestart": [ { "path": "/bin/sh", "args": ["sh", "-c", "true"] } ]
            },
            "annotations": { "app": "org.example.demo", "base": "org.deepin.base" }
        }
        "#
    }

    #[test]
    fn test_parse_full_document() {
        let runtime: Runtime = serde_json::from_str(sample_document()).unwrap();
        assert_eq!(runtime.oci_version, "1.0.1");
        assert_eq!(runtime.process.args, vec!["/bin/true"]);
        assert_eq!(runtime.mounts.len(), 2);
        assert_eq!(runtime.mounts[1].options, vec!["rbind", "ro"]);
        assert_eq!(runtime.linux.namespaces.len(), 3);
        assert_eq!(runtime.linux.uid_mappings[0].host_id, 1000);
        assert_eq!(runtime.linux.resources.memory.limit, 64 * 1024 * 1024);
        let hooks = runtime.hooks.unwrap();
        assert_eq!(hooks.prestart.unwrap().len(), 1);
        let annotations = runtime.annotations.unwrap();
        assert_eq!(annotations.app.as_deref(), Some("org.example.demo"));
    }

    #[test]
    fn test_resource_defaults() {
        let runtime: Runtime = serde_json::from_str(
            r#"{
                "ociVersion": "1.0.1",
                "hostname": "h",
                "process": { "args": ["/bin/true"], "env": [], "cwd": "/" },
                "root": { "path": "/tmp/rootfs" },
                "linux": { "namespaces": [ { "type": "mount" } ] }
            }"#,
        )
        .unwrap();

        let res = runtime.linux.resources;
        assert_eq!(res.memory.limit, -1);
        assert_eq!(res.memory.swap, -1);
        assert_eq!(res.cpu.shares, 1024);
        assert_eq!(res.cpu.period, 100_000);
        assert_eq!(res.cpu.quota, 100_000);
        assert!(runtime.mounts.is_empty());
    }

    #[test]
    fn test_missing_required_field_fails() {
        // no process section
        let err = serde_json::from_str::<Runtime>(
            r#"{
                "ociVersion": "1.0.1",
                "hostname": "h",
                "root": { "path": "/tmp/rootfs" },
                "linux": { "namespaces": [] }
            }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_namespace_rejected() {
        let err = serde_json::from_str::<LinuxNamespace>(r#"{ "type": "time" }"#);
        assert!(err.is_err());

        let ns: LinuxNamespace = serde_json::from_str(r#"{ "type": "network" }"#).unwrap();
        assert_eq!(ns.typ, LinuxNamespaceType::Network);
    }
}
