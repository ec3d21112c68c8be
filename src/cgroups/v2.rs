//! The cgroup-v2 manager. Only active when the document requested a cgroup
//! namespace; every failure in here is then fatal for the container.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use nix::unistd::Pid;

use super::{write_cgroup_file, write_cgroup_file_str};
use crate::oci::Resources;
use crate::syscall::Syscall;

const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_MEMORY_MAX: &str = "memory.max";
const CGROUP_MEMORY_SWAP_MAX: &str = "memory.swap.max";
const CGROUP_MEMORY_LOW: &str = "memory.low";
const CGROUP_CPU_MAX: &str = "cpu.max";
const CGROUP_CPU_WEIGHT: &str = "cpu.weight";

/// All descendants share one leaf under the configured hierarchy.
const SUB_CGROUP: &str = "ll-box";

const MAX_CPU_WEIGHT: i64 = 10_000;

pub struct Manager {
    cgroups_path: PathBuf,
}

impl Manager {
    pub fn new(cgroups_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroups_path: cgroups_path.into(),
        }
    }

    /// Mounts a cgroup2 hierarchy at the configured path, creates the
    /// engine leaf, translates the resource limits and moves `pid` (and
    /// with it all future children) into the leaf.
    pub fn apply(&self, resources: &Resources, pid: Pid, syscall: &dyn Syscall) -> Result<()> {
        create_dir_0755(&self.cgroups_path)?;

        syscall
            .mount(
                Some(Path::new("cgroup2")),
                &self.cgroups_path,
                Some("cgroup2"),
                MsFlags::empty(),
                None,
            )
            .with_context(|| {
                format!("failed to mount cgroup2 at {}", self.cgroups_path.display())
            })?;

        let leaf = self.cgroups_path.join(SUB_CGROUP);
        create_dir_0755(&leaf)?;

        apply_resources(&leaf, resources)?;

        write_cgroup_file(leaf.join(CGROUP_PROCS), pid)
            .context("failed to move the entry process into the cgroup leaf")?;
        log::debug!("moved {} into {}", pid, leaf.display());

        Ok(())
    }
}

fn create_dir_0755(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .with_context(|| format!("failed to create {}", path.display()))
}

/// Writes the limit files for every non-default resource setting.
fn apply_resources(leaf: &Path, resources: &Resources) -> Result<()> {
    let memory = &resources.memory;
    if memory.limit > 0 {
        write_cgroup_file(leaf.join(CGROUP_MEMORY_MAX), memory.limit)
            .context("failed to write memory limit")?;

        if memory.swap > 0 {
            write_cgroup_file(leaf.join(CGROUP_MEMORY_SWAP_MAX), memory.swap - memory.limit)
                .context("failed to write swap limit")?;
        }

        if memory.reservation > 0 {
            write_cgroup_file(leaf.join(CGROUP_MEMORY_LOW), memory.reservation)
                .context("failed to write memory reservation")?;
        }
    }

    let cpu = &resources.cpu;
    write_cgroup_file_str(
        leaf.join(CGROUP_CPU_MAX),
        &format!("{} {}", cpu.quota, cpu.period),
    )
    .context("failed to write cpu bandwidth")?;

    write_cgroup_file(
        leaf.join(CGROUP_CPU_WEIGHT),
        convert_shares_to_weight(cpu.shares),
    )
    .context("failed to write cpu weight")?;

    Ok(())
}

/// Maps cgroup-v1 cpu shares [2, 262144] onto the v2 weight range
/// [1, 10000].
pub fn convert_shares_to_weight(shares: u64) -> i64 {
    // wide arithmetic so absurd share values clamp instead of overflowing
    let weight = 1 + ((shares as i128 - 2) * 9999) / 262_142;
    weight.clamp(1, MAX_CPU_WEIGHT as i128) as i64
}
