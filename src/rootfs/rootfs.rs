//! Mount-propagation preparation run in the entry process before the tree
//! is assembled: recursively remount `/` as a slave so nothing the engine
//! does leaks back to the host, and make the parent mount of the rootfs
//! private, which `pivot_root` requires.

use anyhow::{anyhow, Context, Result};
use nix::mount::MsFlags;
use procfs::process::{MountInfo, MountOptFields, Process};
use std::path::Path;

use crate::syscall::Syscall;

pub fn prepare_propagation(rootfs: &Path, syscall: &dyn Syscall) -> Result<()> {
    syscall
        .mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None,
        )
        .context("failed to remount / as recursive slave")?;

    make_parent_mount_private(rootfs, &Process::myself()?.mountinfo()?, syscall)
        .context("failed to change parent mount of rootfs to private")?;

    Ok(())
}

/// Find parent mount of rootfs in given mount infos
fn find_parent_mount<'a>(rootfs: &Path, mount_infos: &'a [MountInfo]) -> Result<&'a MountInfo> {
    // the longest mount point below the rootfs is its parent
    mount_infos
        .iter()
        .filter(|mi| rootfs.starts_with(&mi.mount_point))
        .max_by(|mi1, mi2| {
            mi1.mount_point
                .as_os_str()
                .len()
                .cmp(&mi2.mount_point.as_os_str().len())
        })
        .ok_or_else(|| anyhow!("couldn't find parent mount of {}", rootfs.display()))
}

fn make_parent_mount_private(
    rootfs: &Path,
    mount_infos: &[MountInfo],
    syscall: &dyn Syscall,
) -> Result<()> {
    let parent_mount = find_parent_mount(rootfs, mount_infos)?;

    if parent_mount
        .opt_fields
        .iter()
        .any(|field| matches!(field, MountOptFields::Shared(_)))
    {
        syscall.mount(
            None,
            &parent_mount.mount_point,
            None,
            MsFlags::MS_PRIVATE,
            None,
        )?;
    }

    Ok(())
}
