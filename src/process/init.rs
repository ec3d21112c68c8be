//! The non-privileged init: pid 1 of the payload's world. It maps itself to
//! the host user, mounts a fresh proc, runs the hooks and execs the payload
//! in one more child, reaping everything until the payload exits.

use std::ffi::CString;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::unistd::{execvpe, fork, ForkResult, Gid, Uid};

use crate::hooks::run_hooks;
use crate::namespaces::{configure_user_namespace, identity_mapping};
use crate::oci::{Hooks, Process, Seccomp};
use crate::process::supervisor::{unblock_all_signals, wait_all_until};
use crate::seccomp;
use crate::syscall::create_syscall;

pub struct InitTask {
    pub process: Process,
    pub hooks: Option<Hooks>,
    pub seccomp: Option<Seccomp>,
    pub host_uid: Uid,
    pub host_gid: Gid,
}

impl InitTask {
    pub fn run_as_child(&mut self) -> isize {
        match self.run() {
            Ok(code) => code as isize,
            Err(e) => {
                log::error!("container init failed: {:?}", e);
                -1
            }
        }
    }

    fn run(&mut self) -> Result<i32> {
        unblock_all_signals()?;

        // identity map: the payload sees itself as the host user, not root
        configure_user_namespace(
            &identity_mapping(self.host_uid.as_raw() as u64),
            &identity_mapping(self.host_gid.as_raw() as u64),
        )
        .context("failed to configure the payload user namespace")?;

        let syscall = create_syscall();
        syscall
            .mount(
                Some(Path::new("proc")),
                Path::new("/proc"),
                Some("proc"),
                MsFlags::empty(),
                None,
            )
            .context("failed to mount a fresh proc")?;

        if let Some(hooks) = &self.hooks {
            if let Some(prestart) = &hooks.prestart {
                run_hooks(prestart)?;
            }
            if let Some(start_container) = &hooks.start_container {
                run_hooks(start_container)?;
            }
        }

        let payload_pid = self.fork_payload()?;
        let info = wait_all_until(payload_pid)?;
        log::debug!("payload {}", info);
        Ok(info.into_exit_code())
    }

    fn fork_payload(&mut self) -> Result<nix::unistd::Pid> {
        prctl::set_death_signal(Signal::SIGKILL as isize)
            .map_err(|e| anyhow::anyhow!("failed to set parent death signal: {}", e))?;

        match unsafe { fork() }.context("failed to fork the payload")? {
            ForkResult::Child => {
                // never returns to the init logic
                if let Err(e) = self.exec_payload() {
                    log::error!("exec failed: {:?}", e);
                }
                std::process::exit(-1);
            }
            ForkResult::Parent { child } => {
                log::debug!(
                    "payload {:?} forked as {}",
                    self.process.args.first(),
                    child
                );
                Ok(child)
            }
        }
    }

    /// Runs in the payload child: enter the working directory, export PATH
    /// for the program lookup, arm the seccomp filter, exec.
    fn exec_payload(&self) -> Result<()> {
        let process = &self.process;

        nix::unistd::chdir(&process.cwd)
            .with_context(|| format!("failed to chdir to {}", process.cwd.display()))?;

        // execvpe resolves the program through the caller's PATH
        for env in &process.env {
            if let Some(path) = env.strip_prefix("PATH=") {
                std::env::set_var("PATH", path);
            }
        }

        if let Some(seccomp_spec) = &self.seccomp {
            seccomp::initialize(seccomp_spec).context("failed to load the seccomp filter")?;
        }

        let Some(program) = process.args.first() else {
            bail!("process.args is empty");
        };
        log::info!("start exec {}", program);

        let program_c = CString::new(program.as_str()).context("NUL in program name")?;
        let args: Vec<CString> = process
            .args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .context("NUL in process arguments")?;
        let env: Vec<CString> = process
            .env
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<std::result::Result<_, _>>()
            .context("NUL in process environment")?;

        execvpe(&program_c, &args, &env).context("execvpe failed")?;
        Ok(())
    }
}
