//! Implements the Syscall trait against the running kernel.

use std::any::Any;
use std::os::unix::fs::symlink;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use super::Syscall;

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno> {
        mount(source, target, fstype, flags, data)
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<(), Errno> {
        umount2(target, flags)
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<(), Errno> {
        symlink(original, link).map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(0)))
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<(), Errno> {
        unistd::pivot_root(new_root, put_old)
    }

    fn chroot(&self, path: &Path) -> Result<(), Errno> {
        unistd::chroot(path)
    }

    fn chdir(&self, path: &Path) -> Result<(), Errno> {
        unistd::chdir(path)
    }
}
