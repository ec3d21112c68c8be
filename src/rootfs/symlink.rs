//! Compatibility symlinks the container expects under `/dev`.

use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;

use crate::syscall::Syscall;

/// Post-pivot `/dev` links. An already existing link is fine; anything else
/// is a setup failure.
pub fn setup_default_symlinks(syscall: &dyn Syscall) -> Result<()> {
    syscall
        .chdir(Path::new("/"))
        .context("failed to chdir to / for symlink setup")?;

    let defaults = [
        ("/proc/kcore", "/dev/core"),
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ];

    for (original, link) in defaults {
        match syscall.symlink(Path::new(original), Path::new(link)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to symlink {} to {}", original, link))
            }
        }
    }

    Ok(())
}

/// The control node for the new devpts instance; created before the pivot
/// inside the staged rootfs.
pub fn setup_ptmx(host_root: &Path, syscall: &dyn Syscall) -> Result<()> {
    let link = host_root.join("dev/ptmx");
    match syscall.symlink(Path::new("/dev/pts/ptmx"), &link) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("failed to symlink ptmx at {}", link.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use crate::utils::create_temp_dir;
    use std::path::PathBuf;

    #[test]
    fn test_default_symlinks() -> Result<()> {
        let syscall = TestHelperSyscall::default();
        setup_default_symlinks(&syscall)?;

        let links = syscall.get_symlink_args();
        assert_eq!(links.len(), 5);
        assert!(links.contains(&(PathBuf::from("/proc/kcore"), PathBuf::from("/dev/core"))));
        assert!(links.contains(&(PathBuf::from("/proc/self/fd"), PathBuf::from("/dev/fd"))));
        assert!(links.contains(&(
            PathBuf::from("/proc/self/fd/1"),
            PathBuf::from("/dev/stdout")
        )));
        Ok(())
    }

    #[test]
    fn test_ptmx_link_under_host_root() -> Result<()> {
        let root = create_temp_dir("ll_box_ptmx")?;
        let syscall = TestHelperSyscall::default();
        setup_ptmx(root.path(), &syscall)?;

        let links = syscall.get_symlink_args();
        assert_eq!(
            links,
            vec![(PathBuf::from("/dev/pts/ptmx"), root.path().join("dev/ptmx"))]
        );
        Ok(())
    }
}
