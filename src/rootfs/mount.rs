//! The mount engine. Each request is classified against its source, the
//! destination is created with the matching file type and resolved through
//! an `O_PATH` descriptor so that a crafted symlink cannot redirect the
//! mount outside the container root, and read-only binds are deferred until
//! the whole tree is assembled.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sys::statfs::statfs;
use nix::sys::statvfs::FsFlags;
use once_cell::sync::OnceCell;
use thiserror::Error;

use super::driver::FilesystemDriver;
use super::utils::{
    ensure_directory, ensure_file, load_filesystems, parse_mount, ExtensionFlags, FsType,
    MountOptionConfig,
};
use crate::oci::Mount;
use crate::syscall::{create_syscall, Syscall};

#[derive(Debug, Error)]
pub enum MountError {
    /// The destination resolved outside the container root. This aborts the
    /// whole container; everything else is a per-mount failure.
    #[error("possibly malicious path detected ({target:?} vs {resolved:?}) -- refusing to operate")]
    MaliciousPath { target: PathBuf, resolved: PathBuf },
    #[error("unsupported filesystem type: {0}")]
    UnsupportedType(String),
    #[error("refusing to mount missing source {src_path:?} with device-backed filesystem {typ}")]
    MissingSource { src_path: PathBuf, typ: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mount failed: {0}")]
    Sys(#[from] Errno),
}

type Result<T> = std::result::Result<T, MountError>;

/// A bind whose final flags can only be applied once every initial mount is
/// in place. The `O_PATH` descriptor pins the destination so the remount
/// cannot be redirected in the meantime.
struct DeferredRemount {
    target: File,
    flags: MsFlags,
    data: String,
}

pub struct MountEngine<'a> {
    syscall: Box<dyn Syscall>,
    driver: &'a dyn FilesystemDriver,
    remounts: Vec<DeferredRemount>,
    sysfs_bound: bool,
    filesystems: OnceCell<HashMap<String, bool>>,
}

const PROPAGATION_FLAGS: MsFlags = MsFlags::from_bits_truncate(
    MsFlags::MS_SHARED.bits()
        | MsFlags::MS_PRIVATE.bits()
        | MsFlags::MS_SLAVE.bits()
        | MsFlags::MS_UNBINDABLE.bits(),
);

impl<'a> MountEngine<'a> {
    pub fn new(driver: &'a dyn FilesystemDriver) -> Self {
        Self {
            syscall: create_syscall(),
            driver,
            remounts: Vec::new(),
            sysfs_bound: false,
            filesystems: OnceCell::new(),
        }
    }

    fn container_root(&self) -> &Path {
        self.driver.root()
    }

    /// Classifies a filesystem type via `/proc/filesystems`: `Some(true)`
    /// for dummy (`nodev`) types, `Some(false)` for device-backed ones,
    /// `None` when the kernel does not list it.
    fn is_dummy(&self, typ: &str) -> Option<bool> {
        let types = self.filesystems.get_or_init(|| {
            load_filesystems().unwrap_or_else(|e| {
                log::warn!("couldn't read /proc/filesystems: {}", e);
                HashMap::new()
            })
        });
        types.get(typ).copied()
    }

    /// Mounts one request into the container tree.
    pub fn mount_node(&mut self, m: &Mount) -> Result<()> {
        let fs_type =
            FsType::from_str(&m.typ).map_err(MountError::UnsupportedType)?;
        let config = parse_mount(m);
        let destination = self.driver.host_path(&m.destination);

        let mut source = PathBuf::from(&m.source);
        // Keeps an O_PATH view of a `nosymfollow` source alive until the
        // mount call went through.
        let mut _source_fd: Option<File> = None;

        match fs::symlink_metadata(&source) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let parent = destination.parent().unwrap_or_else(|| Path::new("/"));
                ensure_directory(parent)?;

                if config.extensions.contains(ExtensionFlags::COPY_SYMLINK) {
                    let link_target = fs::read_link(&source)?;
                    self.syscall.symlink(&link_target, &destination)?;
                    return Ok(());
                }

                if config.extensions.contains(ExtensionFlags::NOSYMFOLLOW) {
                    ensure_file(&destination)?;
                    let fd = OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC)
                        .open(&source)?;
                    source = PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()));
                    _source_fd = Some(fd);
                } else {
                    if fs::metadata(&source)?.is_dir() {
                        ensure_directory(&destination)?;
                    } else {
                        ensure_file(&destination)?;
                    }
                    source = fs::read_link(&source)?;
                }
            }
            Ok(meta) if meta.is_dir() => ensure_directory(&destination)?,
            // regular files, devices, fifos and sockets all bind onto a file
            Ok(_) => ensure_file(&destination)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match self.is_dummy(&m.typ) {
                    Some(false) => {
                        return Err(MountError::MissingSource {
                            src_path: source,
                            typ: m.typ.clone(),
                        })
                    }
                    Some(true) => {}
                    None => log::warn!(
                        "filesystem type {} is not listed in /proc/filesystems",
                        m.typ
                    ),
                }
                ensure_directory(&destination)?;
                source = PathBuf::from(&m.typ);
            }
            Err(e) => return Err(e.into()),
        }

        let data = if config.data.is_empty() {
            None
        } else {
            Some(config.data.as_str())
        };

        match fs_type {
            FsType::Bind => self.mount_bind(&source, &destination, &config),
            FsType::Proc | FsType::Devpts | FsType::Tmpfs => self
                .mount_with_fd(Some(&source), &destination, Some(m.typ.as_str()), config.flags, data)
                .map(|_| ()),
            FsType::Mqueue => {
                match self.mount_with_fd(
                    Some(&source),
                    &destination,
                    Some(m.typ.as_str()),
                    config.flags,
                    data,
                ) {
                    Ok(()) => Ok(()),
                    Err(e @ MountError::MaliciousPath { .. }) => Err(e),
                    Err(e) => {
                        log::warn!("mqueue mount failed ({}), binding /dev/mqueue instead", e);
                        self.mount_with_fd(
                            Some(Path::new("/dev/mqueue")),
                            &destination,
                            None,
                            MsFlags::MS_BIND | MsFlags::MS_REC,
                            None,
                        )
                    }
                }
            }
            FsType::Sysfs => {
                match self.mount_with_fd(
                    Some(&source),
                    &destination,
                    Some(m.typ.as_str()),
                    config.flags,
                    data,
                ) {
                    Ok(()) => Ok(()),
                    Err(e @ MountError::MaliciousPath { .. }) => Err(e),
                    Err(e) => {
                        log::warn!("sysfs mount failed ({}), binding /sys instead", e);
                        self.mount_with_fd(
                            Some(Path::new("/sys")),
                            &destination,
                            None,
                            MsFlags::MS_BIND | MsFlags::MS_REC,
                            None,
                        )?;
                        self.sysfs_bound = true;
                        Ok(())
                    }
                }
            }
            FsType::Cgroup | FsType::Cgroup2 => {
                match self.mount_with_fd(
                    Some(&source),
                    &destination,
                    Some(m.typ.as_str()),
                    config.flags,
                    data,
                ) {
                    Ok(()) => Ok(()),
                    Err(e @ MountError::MaliciousPath { .. }) => Err(e),
                    // the bound sysfs already exposes the cgroup tree
                    Err(e) if self.sysfs_bound => {
                        log::warn!("cgroup mount failed ({}), covered by bound sysfs", e);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn mount_bind(
        &mut self,
        source: &Path,
        destination: &Path,
        config: &MountOptionConfig,
    ) -> Result<()> {
        // the kernel ignores everything but MS_BIND|MS_REC on the initial
        // bind call; data and the remaining flags are applied by remounting
        let initial = (config.flags | MsFlags::MS_BIND) & (MsFlags::MS_BIND | MsFlags::MS_REC);
        self.mount_with_fd(Some(source), destination, None, initial, None)?;

        if source == Path::new("/sys") {
            self.sysfs_bound = true;
        }

        let propagation = config.propagation & PROPAGATION_FLAGS;
        if !propagation.is_empty() {
            let rec = config.propagation & MsFlags::MS_REC;
            self.mount_with_fd(None, destination, None, propagation | rec, None)?;
        }

        let residue = config.flags
            & !(MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT);
        if config.data.is_empty() && residue.is_empty() {
            return Ok(());
        }

        if config.extensions.contains(ExtensionFlags::NOSYMFOLLOW) {
            return Ok(());
        }

        let remount_flags = config.flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT;
        if !remount_flags.contains(MsFlags::MS_RDONLY) {
            return self.remount(destination, remount_flags, &config.data);
        }

        // a read-only remount issued now could be undone by a later mount
        // under the same subtree; pin the destination and apply it last
        let target = self.open_path_fd(destination)?;
        self.remounts.push(DeferredRemount {
            target,
            flags: remount_flags,
            data: config.data.clone(),
        });
        Ok(())
    }

    /// Applies the recorded read-only remounts, oldest first, against the
    /// pinned descriptors. Failures are logged; the tree stays usable.
    pub fn finalize_mounts(&mut self) {
        let remounts = std::mem::take(&mut self.remounts);
        for node in remounts {
            let target = PathBuf::from(format!("/proc/self/fd/{}", node.target.as_raw_fd()));
            if let Err(e) = self.remount(&target, node.flags, &node.data) {
                log::warn!("failed to remount {}: {}", target.display(), e);
            }
        }
    }

    /// Remounts `target`. On EINVAL the flags the filesystem insists on
    /// keeping (nosuid/nodev/noexec, read-only for a read-only fs) are ORed
    /// in and the call retried once.
    fn remount(&self, target: &Path, flags: MsFlags, data: &str) -> Result<()> {
        let data_opt = if flags.intersects(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY)
            || data.is_empty()
        {
            None
        } else {
            Some(data)
        };

        match self.syscall.mount(None, target, None, flags, data_opt) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) => {
                let fs_flags = statfs(target).map(|s| s.flags()).map_err(MountError::Sys)?;
                let mut kept = MsFlags::empty();
                if fs_flags.contains(FsFlags::ST_NOSUID) {
                    kept |= MsFlags::MS_NOSUID;
                }
                if fs_flags.contains(FsFlags::ST_NODEV) {
                    kept |= MsFlags::MS_NODEV;
                }
                if fs_flags.contains(FsFlags::ST_NOEXEC) {
                    kept |= MsFlags::MS_NOEXEC;
                }
                if fs_flags.contains(FsFlags::ST_RDONLY) {
                    kept |= MsFlags::MS_RDONLY;
                }
                self.syscall
                    .mount(None, target, None, flags | kept, data_opt)
                    .map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub(crate) fn syscall_helper(&self) -> &crate::syscall::test::TestHelperSyscall {
        self.syscall
            .as_any()
            .downcast_ref()
            .expect("tests run against the recording syscall")
    }

    fn open_path_fd(&self, path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
            .open(path)?)
    }

    /// Resolves the destination through `/proc/self/fd` and issues the mount
    /// against that path, refusing to operate when the canonical destination
    /// escapes the container root.
    fn mount_with_fd(
        &self,
        source: Option<&Path>,
        destination: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        let fd = self.open_path_fd(destination)?;
        let target = PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()));
        let resolved = fs::read_link(&target)?;

        if !resolved.starts_with(self.container_root()) {
            log::debug!("container root: {}", self.container_root().display());
            return Err(MountError::MaliciousPath {
                target: destination.to_owned(),
                resolved,
            });
        }

        self.syscall
            .mount(source, &target, fstype, flags, data)
            .map_err(|errno| {
                log::error!(
                    "mount {:?} to {} failed: {} (fstype {:?}, flags {:?}, data {:?})",
                    source,
                    resolved.display(),
                    errno,
                    fstype,
                    flags,
                    data
                );
                MountError::Sys(errno)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::driver::NativeDriver;
    use crate::syscall::test::TestHelperSyscall;
    use crate::utils::{create_temp_dir, TempDir};
    use std::os::unix::fs::symlink;

    fn engine_fixture(name: &str) -> (TempDir, NativeDriver) {
        let dir = create_temp_dir(name).unwrap();
        // resolve /tmp symlinks (e.g. on systems where /tmp is a link) so
        // the prefix check compares canonical paths
        let root = fs::canonicalize(dir.path()).unwrap();
        (dir, NativeDriver::new(root))
    }

    fn helper<'a>(engine: &'a MountEngine<'a>) -> &'a TestHelperSyscall {
        engine.syscall.as_any().downcast_ref().unwrap()
    }

    fn bind_mount(source: &Path, destination: &str, options: &[&str]) -> Mount {
        Mount {
            destination: PathBuf::from(destination),
            typ: "bind".to_string(),
            source: source.to_string_lossy().into_owned(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn test_unsupported_type_is_rejected() {
        let (_dir, driver) = engine_fixture("ll_box_mount_unsupported");
        let mut engine = MountEngine::new(&driver);
        let m = Mount {
            destination: PathBuf::from("/x"),
            typ: "ext4".to_string(),
            source: "/dev/sda1".to_string(),
            options: vec![],
        };
        assert!(matches!(
            engine.mount_node(&m),
            Err(MountError::UnsupportedType(t)) if t == "ext4"
        ));
    }

    #[test]
    fn test_mount_targets_proc_self_fd() {
        let (dir, driver) = engine_fixture("ll_box_mount_proc_fd");
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(&source, "/data", &["rbind"]))
            .unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].target.starts_with("/proc/self/fd/"));
        assert_eq!(calls[0].flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(calls[0].data, None);
    }

    #[test]
    fn test_symlink_destination_outside_root_is_refused() {
        let (dir, driver) = engine_fixture("ll_box_mount_hostile");
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();
        // /link escapes the rootfs
        symlink("/etc/passwd", driver.root().join("link")).unwrap();

        let mut engine = MountEngine::new(&driver);
        let err = engine
            .mount_node(&bind_mount(&source, "/link", &["rbind"]))
            .unwrap_err();

        assert!(matches!(err, MountError::MaliciousPath { .. }));
        assert!(helper(&engine).get_mount_args().is_empty());
    }

    #[test]
    fn test_read_only_bind_is_deferred() {
        let (dir, driver) = engine_fixture("ll_box_mount_ro_defer");
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(&source, "/mnt", &["rbind", "ro"]))
            .unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 1, "read-only remount must not happen yet");
        assert_eq!(calls[0].flags, MsFlags::MS_BIND | MsFlags::MS_REC);

        assert_eq!(engine.remounts.len(), 1);
        assert_eq!(
            engine.remounts[0].flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY
        );

        engine.finalize_mounts();
        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].target.starts_with("/proc/self/fd/"));
        assert_eq!(
            calls[1].flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY
        );
        assert!(engine.remounts.is_empty());
    }

    #[test]
    fn test_propagation_issues_second_call() {
        let (dir, driver) = engine_fixture("ll_box_mount_propagation");
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(&source, "/mnt", &["rbind", "rslave"]))
            .unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(calls[1].flags, MsFlags::MS_SLAVE | MsFlags::MS_REC);
        assert_eq!(calls[1].source, None);
    }

    #[test]
    fn test_writable_bind_with_data_remounts_inline() {
        let (dir, driver) = engine_fixture("ll_box_mount_rw_remount");
        let source = dir.join("source");
        fs::create_dir_all(&source).unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(&source, "/mnt", &["rbind", "noexec"]))
            .unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_NOEXEC
        );
        assert!(engine.remounts.is_empty());
    }

    #[test]
    fn test_bind_file_source_creates_file_destination() {
        let (dir, driver) = engine_fixture("ll_box_mount_file_dest");
        let source = dir.join("timezone");
        fs::write(&source, "UTC").unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(&source, "/etc/timezone", &["bind"]))
            .unwrap();

        assert!(driver.root().join("etc/timezone").is_file());
    }

    #[test]
    fn test_copy_symlink_copies_the_link_itself() {
        let (dir, driver) = engine_fixture("ll_box_mount_copy_symlink");
        let source = dir.join("localtime");
        symlink("/usr/share/zoneinfo/UTC", &source).unwrap();

        let mut engine = MountEngine::new(&driver);
        engine
            .mount_node(&bind_mount(
                &source,
                "/etc/localtime",
                &["bind", "copy-symlink"],
            ))
            .unwrap();

        assert!(helper(&engine).get_mount_args().is_empty());
        let links = helper(&engine).get_symlink_args();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, PathBuf::from("/usr/share/zoneinfo/UTC"));
        assert_eq!(links[0].1, driver.root().join("etc/localtime"));
    }

    #[test]
    fn test_dummy_source_uses_type_token() {
        let (_dir, driver) = engine_fixture("ll_box_mount_dummy");
        let mut engine = MountEngine::new(&driver);
        let m = Mount {
            destination: PathBuf::from("/proc"),
            typ: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        };
        engine.mount_node(&m).unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].source, Some(PathBuf::from("proc")));
        assert_eq!(calls[0].fstype.as_deref(), Some("proc"));
        assert!(driver.root().join("proc").is_dir());
    }

    #[test]
    fn test_mqueue_falls_back_to_bind() {
        let (_dir, driver) = engine_fixture("ll_box_mount_mqueue");
        let mut engine = MountEngine::new(&driver);
        helper(&engine).fail_mounts_with(&[Errno::ENODEV]);

        let m = Mount {
            destination: PathBuf::from("/dev/mqueue"),
            typ: "mqueue".to_string(),
            source: "mqueue".to_string(),
            options: vec![],
        };
        engine.mount_node(&m).unwrap();

        let calls = helper(&engine).get_mount_args();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].source, Some(PathBuf::from("/dev/mqueue")));
        assert_eq!(calls[1].flags, MsFlags::MS_BIND | MsFlags::MS_REC);
    }

    #[test]
    fn test_cgroup_tolerated_after_sysfs_bind() {
        let (_dir, driver) = engine_fixture("ll_box_mount_cgroup");
        let mut engine = MountEngine::new(&driver);

        // sysfs request that falls back to binding /sys
        helper(&engine).fail_mounts_with(&[Errno::EPERM]);
        let sys = Mount {
            destination: PathBuf::from("/sys"),
            typ: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![],
        };
        engine.mount_node(&sys).unwrap();
        assert!(engine.sysfs_bound);

        // now a failing cgroup mount is fine
        helper(&engine).fail_mounts_with(&[Errno::EPERM]);
        let cgroup = Mount {
            destination: PathBuf::from("/sys/fs/cgroup"),
            typ: "cgroup".to_string(),
            source: "cgroup".to_string(),
            options: vec![],
        };
        engine.mount_node(&cgroup).unwrap();
    }
}
