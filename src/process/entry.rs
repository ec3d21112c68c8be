//! The entry process: first child of the engine, cloned into all configured
//! namespaces. It owns the mount assembly and the root switch, then clones
//! the non-privileged init and lingers as its reaper.

use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{getpid, Gid, Uid};

use crate::cgroups::v2::Manager;
use crate::container::drop_permissions;
use crate::namespaces;
use crate::oci::{Hooks, Mount, Process, Resources, Seccomp};
use crate::process::fork;
use crate::process::init::InitTask;
use crate::process::supervisor::{unblock_all_signals, wait_all_until};
use crate::rootfs::device::bind_default_devices;
use crate::rootfs::mount::{MountEngine, MountError};
use crate::rootfs::pivot;
use crate::rootfs::rootfs::prepare_propagation;
use crate::rootfs::symlink::{setup_default_symlinks, setup_ptmx};
use crate::rootfs::FilesystemDriver;
use crate::syscall::create_syscall;

/// Everything the entry child needs, copied out of the parent before the
/// clone; the child must not reach back into parent-owned state.
pub struct EntryTask {
    pub uid_mappings: Vec<crate::oci::IdMapping>,
    pub gid_mappings: Vec<crate::oci::IdMapping>,
    pub mounts: Vec<Mount>,
    pub host_root: PathBuf,
    pub driver: Box<dyn FilesystemDriver>,
    pub use_cgroup_ns: bool,
    pub cgroups_path: String,
    pub resources: Resources,
    pub hooks: Option<Hooks>,
    pub seccomp: Option<Seccomp>,
    pub process: Process,
    pub host_uid: Uid,
    pub host_gid: Gid,
}

extern "C" fn on_sigterm(_: libc::c_int) {
    unsafe { libc::_exit(libc::EXIT_FAILURE) };
}

impl EntryTask {
    /// Clone callback shim: errors become a non-zero exit status for the
    /// parent's waitpid.
    pub fn run_as_child(&mut self) -> isize {
        match self.run() {
            Ok(code) => code as isize,
            Err(e) => {
                log::error!("container entry failed: {:?}", e);
                -1
            }
        }
    }

    fn run(&mut self) -> Result<i32> {
        unblock_all_signals()?;

        namespaces::configure_user_namespace(&self.uid_mappings, &self.gid_mappings)
            .context("failed to configure the user namespace")?;

        // the hostname stays inherited: applying it breaks the X authority
        // handshake of sandboxed desktop applications

        let syscall = create_syscall();
        prepare_propagation(&self.host_root, &*syscall)?;

        {
            let mut engine = MountEngine::new(&*self.driver);
            for m in &self.mounts {
                match engine.mount_node(m) {
                    Ok(()) => {}
                    Err(e @ MountError::MaliciousPath { .. }) => {
                        log::error!("{}", e);
                        return Err(e.into());
                    }
                    Err(e) => log::error!(
                        "failed to mount {} to {}: {}",
                        m.source,
                        m.destination.display(),
                        e
                    ),
                }
            }

            if self.use_cgroup_ns {
                if self.cgroups_path.is_empty() {
                    log::warn!("skipping cgroup setup with an empty cgroupsPath");
                } else {
                    Manager::new(&self.cgroups_path)
                        .apply(&self.resources, getpid(), &*syscall)
                        .context("failed to configure cgroup v2")?;
                }
            }

            if let Err(e) = bind_default_devices(&mut engine) {
                // only the hostile-destination case aborts device setup
                return Err(e).context("failed to prepare default devices");
            }
            if let Err(e) = setup_ptmx(&self.host_root, &*syscall) {
                log::warn!("{:#}", e);
            }

            engine.finalize_mounts();
        }

        pivot::pivot_root(&self.host_root, &*syscall).context("pivot root failed")?;
        setup_default_symlinks(&*syscall).context("failed to prepare default symlinks")?;

        let mut init = Some(InitTask {
            process: self.process.clone(),
            hooks: self.hooks.take(),
            seccomp: self.seccomp.take(),
            host_uid: self.host_uid,
            host_gid: self.host_gid,
        });
        let init_pid = fork::clone(
            Box::new(move || match init.take() {
                Some(mut task) => task.run_as_child(),
                None => -1,
            }),
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS,
        )
        .context("failed to clone the non-privileged init")?;
        log::debug!("non-privileged init cloned as {}", init_pid);

        if let Err(e) = drop_permissions() {
            log::warn!("drop permissions failed: {}", e);
        }
        prctl::set_death_signal(Signal::SIGKILL as isize)
            .map_err(|e| anyhow::anyhow!("failed to set parent death signal: {}", e))?;

        // teardown on SIGTERM; the reap loop below otherwise runs until the
        // init goes down
        unsafe { signal(Signal::SIGTERM, SigHandler::Handler(on_sigterm)) }
            .context("failed to install the SIGTERM handler")?;

        let info = wait_all_until(init_pid)?;
        log::debug!("non-privileged init {}", info);
        Ok(info.into_exit_code())
    }
}
