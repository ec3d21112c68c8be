//! Hook execution. Hooks run in order inside the non-privileged init,
//! each waited for before the next starts; a failing hook is reported but
//! never takes the container down.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use anyhow::Result;

use crate::oci::Hook;
use crate::utils;

pub fn run_hooks(hooks: &[Hook]) -> Result<()> {
    for hook in hooks {
        run_hook(hook);
    }
    Ok(())
}

fn run_hook(hook: &Hook) {
    let mut command = Command::new(&hook.path);

    // By convention args[0] is the program name and may differ from path.
    // Command keeps arg0 separate from the rest, so split accordingly.
    if let Some((arg0, args)) = hook.args.as_ref().and_then(|a| a.split_first()) {
        log::debug!("hook arg0: {:?}, args: {:?}", arg0, args);
        command.arg0(arg0).args(args);
    } else {
        command.arg0(hook.path.as_os_str());
    }

    let envs = hook
        .env
        .as_ref()
        .map(|env| utils::parse_env(env))
        .unwrap_or_default();

    let result = command
        .env_clear()
        .envs(envs)
        .stdin(Stdio::null())
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("hook {} failed: {}", hook.path.display(), status),
        Err(e) => log::warn!("couldn't execute hook {}: {}", hook.path.display(), e),
    }
}
