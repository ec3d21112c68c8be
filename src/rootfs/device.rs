//! Default device provisioning. The engine runs in an unprivileged user
//! namespace where mknod is off the table, so every default device is a
//! bind mount of the host node of the same name.

use std::path::PathBuf;

use super::mount::{MountEngine, MountError};
use crate::oci::Mount;

const DEFAULT_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

/// Binds the default device set into the rootfs. A device the host does not
/// have is logged and skipped; a hostile destination still aborts.
pub fn bind_default_devices(engine: &mut MountEngine) -> Result<(), MountError> {
    for dev in DEFAULT_DEVICES {
        let mount = Mount {
            destination: PathBuf::from(dev),
            typ: "bind".to_string(),
            source: dev.to_string(),
            options: vec!["bind".to_string()],
        };

        match engine.mount_node(&mount) {
            Ok(()) => {}
            Err(e @ MountError::MaliciousPath { .. }) => return Err(e),
            Err(e) => log::warn!("failed to bind default device {}: {}", dev, e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::driver::{FilesystemDriver, NativeDriver};
    use crate::syscall::test::TestHelperSyscall;
    use crate::utils::create_temp_dir;
    use nix::mount::MsFlags;

    #[test]
    fn test_devices_bound_from_host() -> anyhow::Result<()> {
        let dir = create_temp_dir("ll_box_default_devices")?;
        let root = std::fs::canonicalize(dir.path())?;
        let driver = NativeDriver::new(root);
        let mut engine = MountEngine::new(&driver);

        bind_default_devices(&mut engine)?;

        let helper: &TestHelperSyscall = engine_syscall(&engine);
        let calls = helper.get_mount_args();
        // every host node that exists gets exactly one bind call
        assert_eq!(calls.len(), DEFAULT_DEVICES.len());
        for call in &calls {
            assert!(call.target.starts_with("/proc/self/fd/"));
            assert_eq!(call.flags, MsFlags::MS_BIND);
        }
        // destinations were created as files inside the rootfs
        assert!(driver.host_path(std::path::Path::new("/dev/null")).is_file());
        Ok(())
    }

    fn engine_syscall<'e>(engine: &'e MountEngine) -> &'e TestHelperSyscall {
        engine.syscall_helper()
    }
}
