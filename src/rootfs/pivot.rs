//! The two-stage root switch. Runs in the entry process after
//! `finalize_mounts`; any failure here aborts the container.

use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::{MntFlags, MsFlags};

use super::utils::ensure_directory;
use crate::syscall::Syscall;

/// Directory inside the new root where the old root is parked before it is
/// detached. Visible inside the container as an empty `/run/ll-host`.
pub const PUT_OLD: &str = "run/ll-host";

pub fn pivot_root(host_root: &Path, syscall: &dyn Syscall) -> Result<()> {
    syscall
        .chdir(host_root)
        .with_context(|| format!("failed to chdir to {}", host_root.display()))?;

    // pivot_root requires the new root to be a mount point
    syscall
        .mount(
            Some(Path::new(".")),
            Path::new("."),
            Some("bind"),
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .context("failed to bind the container root onto itself")?;

    let put_old = host_root.join(PUT_OLD);
    ensure_directory(&put_old)
        .with_context(|| format!("failed to create {}", put_old.display()))?;

    syscall
        .pivot_root(host_root, &put_old)
        .with_context(|| format!("pivot_root into {} failed", host_root.display()))?;

    syscall
        .chdir(Path::new("/"))
        .context("failed to chdir to the new root")?;
    syscall
        .chroot(Path::new("."))
        .context("chroot into the new root failed")?;
    syscall
        .chdir(Path::new("/"))
        .context("failed to chdir after chroot")?;

    syscall
        .umount2(Path::new(PUT_OLD), MntFlags::MNT_DETACH)
        .context("failed to detach the old root")?;

    Ok(())
}
