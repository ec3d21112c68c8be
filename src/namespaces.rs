//! Namespace selection and user-namespace id mapping.
//!
//! The engine always runs the entry process in fresh mount and user
//! namespaces; the document only widens the set. A requested cgroup
//! namespace is not passed to clone but switches the cgroup-v2 manager on.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sched::CloneFlags;

use crate::oci::{IdMapping, LinuxNamespace, LinuxNamespaceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub clone_flags: CloneFlags,
    pub use_cgroup_ns: bool,
}

pub fn from_namespaces(namespaces: &[LinuxNamespace]) -> NamespaceConfig {
    let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUSER;
    let mut use_cgroup_ns = false;

    for ns in namespaces {
        match ns.typ {
            LinuxNamespaceType::Ipc => flags |= CloneFlags::CLONE_NEWIPC,
            LinuxNamespaceType::Uts => flags |= CloneFlags::CLONE_NEWUTS,
            LinuxNamespaceType::Mount => flags |= CloneFlags::CLONE_NEWNS,
            LinuxNamespaceType::Pid => flags |= CloneFlags::CLONE_NEWPID,
            LinuxNamespaceType::Network => flags |= CloneFlags::CLONE_NEWNET,
            // the first user namespace is unconditional; the payload gets
            // its own later
            LinuxNamespaceType::User => {}
            LinuxNamespaceType::Cgroup => use_cgroup_ns = true,
        }
    }

    NamespaceConfig {
        clone_flags: flags,
        use_cgroup_ns,
    }
}

/// Writes `uid_map`, `setgroups` and `gid_map` for the current process.
/// Must run before any exec in the new user namespace; `setgroups` has to
/// be denied before a gid map becomes writable for an unprivileged writer.
pub fn configure_user_namespace(
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<()> {
    configure_user_namespace_at(Path::new("/proc/self"), uid_mappings, gid_mappings)
}

pub fn configure_user_namespace_at(
    proc_self: &Path,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<()> {
    write_id_mappings(&proc_self.join("uid_map"), uid_mappings)?;

    let setgroups = proc_self.join("setgroups");
    fs::write(&setgroups, "deny")
        .with_context(|| format!("couldn't write {}", setgroups.display()))?;

    write_id_mappings(&proc_self.join("gid_map"), gid_mappings)?;
    Ok(())
}

fn write_id_mappings(path: &Path, mappings: &[IdMapping]) -> Result<()> {
    let mut content = String::new();
    for m in mappings {
        content.push_str(&format!("{} {} {}\n", m.container_id, m.host_id, m.size));
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("couldn't open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("couldn't write {}", path.display()))?;
    Ok(())
}

/// The identity mapping the non-privileged init uses: processes inside see
/// themselves as the host user.
pub fn identity_mapping(id: u64) -> Vec<IdMapping> {
    vec![IdMapping {
        container_id: id,
        host_id: id,
        size: 1,
    }]
}
