use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::{geteuid, getegid, getgid, getuid, seteuid, setgroups};

use crate::namespaces;
use crate::oci::{Mount, Runtime};
use crate::process::entry::EntryTask;
use crate::process::fork;
use crate::process::supervisor::{ChildRole, Supervisor};
use crate::rootfs::{
    FilesystemDriver, FuseProxyDriver, NativeDriver, OverlayfsFuseDriver,
};

use super::state::{default_state_dir, StateRecord};

pub struct Container {
    id: String,
    bundle: PathBuf,
    runtime: Runtime,
    host_root: PathBuf,
    mounts: Vec<Mount>,
    driver: Box<dyn FilesystemDriver>,
}

impl Container {
    pub fn new(bundle: PathBuf, id: String, runtime: Runtime) -> Result<Self> {
        let host_root = resolve_host_root(&bundle, &runtime);
        let driver = select_driver(&runtime, &host_root);
        let mounts = assemble_mounts(&bundle, &runtime);

        Ok(Self {
            id,
            bundle,
            runtime,
            host_root,
            mounts,
            driver,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Runs the container to completion and returns the engine exit code.
    pub fn start(mut self) -> Result<i32> {
        let host_uid = geteuid();
        let host_gid = getegid();

        let config = namespaces::from_namespaces(&self.runtime.linux.namespaces);

        self.driver
            .setup()
            .context("failed to set up the filesystem driver")?;

        // the supervisor must block SIGCHLD before the first clone or an
        // early exit never reaches the signalfd
        let mut supervisor = Supervisor::new()?;

        let mut entry = Some(EntryTask {
            uid_mappings: self.runtime.linux.uid_mappings.clone(),
            gid_mappings: self.runtime.linux.gid_mappings.clone(),
            mounts: std::mem::take(&mut self.mounts),
            host_root: self.host_root.clone(),
            driver: self.driver,
            use_cgroup_ns: config.use_cgroup_ns,
            cgroups_path: self.runtime.linux.cgroups_path.clone(),
            resources: self.runtime.linux.resources,
            hooks: self.runtime.hooks.clone(),
            seccomp: self.runtime.linux.seccomp.clone(),
            process: self.runtime.process.clone(),
            host_uid,
            host_gid,
        });

        let entry_pid = fork::clone(
            Box::new(move || match entry.take() {
                Some(mut task) => task.run_as_child(),
                None => -1,
            }),
            config.clone_flags,
        )
        .context("failed to clone the entry process")?;
        supervisor.track(entry_pid, "ll-box:entry", ChildRole::Entry);
        log::debug!("entry process cloned as {}", entry_pid);

        if let Err(e) = drop_permissions() {
            log::warn!("drop permissions failed: {}", e);
        }
        prctl::set_death_signal(Signal::SIGKILL as isize)
            .map_err(|e| anyhow::anyhow!("failed to set parent death signal: {}", e))?;

        let record = StateRecord::new(&self.id, entry_pid, self.runtime.annotations.as_ref());
        let _state_guard = record
            .save(&default_state_dir())
            .context("failed to write the container state record")?;

        let info = supervisor.run(entry_pid)?;
        log::debug!("entry process {}", info);
        Ok(info.into_exit_code())
    }
}

/// Returns the effective identity to the real user. When the engine was
/// started through a setuid wrapper the supplementary groups collapse to
/// the real gid first.
pub fn drop_permissions() -> Result<()> {
    let real_gid = getgid();
    let real_uid = getuid();

    if geteuid().is_root() {
        if let Err(e) = setgroups(&[real_gid]) {
            log::warn!("setgroups failed: {}", e);
        }
    }

    seteuid(real_uid).context("failed to return to the real uid")?;
    Ok(())
}

fn resolve_host_root(bundle: &Path, runtime: &Runtime) -> PathBuf {
    let configured = &runtime.root.path;
    let absolute = if configured.is_absolute() {
        configured.clone()
    } else {
        bundle.join(configured)
    };
    // the mount engine compares canonical destination paths against this
    // prefix, so symlinks in the configured path must be resolved up front
    fs::canonicalize(&absolute).unwrap_or(absolute)
}

fn select_driver(runtime: &Runtime, host_root: &Path) -> Box<dyn FilesystemDriver> {
    if let Some(annotations) = &runtime.annotations {
        if let Some(overlayfs) = &annotations.overlayfs {
            return Box::new(OverlayfsFuseDriver::new(
                overlayfs.lower_dirs.clone(),
                overlayfs.upper.clone(),
                overlayfs.workdir.clone(),
                host_root.to_path_buf(),
            ));
        }
        if let Some(proxy) = &annotations.fuse_proxy {
            return Box::new(FuseProxyDriver::new(
                proxy.mounts.clone(),
                host_root.to_path_buf(),
            ));
        }
    }
    Box::new(NativeDriver::new(host_root.to_path_buf()))
}

/// The document mounts plus whatever the generator appended through the
/// `native` annotation, with relative sources completed against the bundle.
fn assemble_mounts(bundle: &Path, runtime: &Runtime) -> Vec<Mount> {
    let extra = runtime
        .annotations
        .as_ref()
        .and_then(|a| a.native.as_ref())
        .map(|n| n.mounts.clone())
        .unwrap_or_default();

    runtime
        .mounts
        .iter()
        .cloned()
        .chain(extra)
        .map(|mut m| {
            if !m.source.is_empty() && !m.source.starts_with('/') {
                m.source = bundle.join(&m.source).to_string_lossy().into_owned();
            }
            m
        })
        .collect()
}
