//! Compiles the document's seccomp section into a loaded BPF filter.
//! Everything here fails closed: an unknown action, architecture, operator
//! or syscall name aborts the container rather than running it with a
//! weaker filter than requested.

use std::ffi::CString;

use anyhow::{bail, Context, Result};
use libseccomp::{
    scmp_arg_cmp, scmp_compare, scmp_filter_ctx, seccomp_arch_add, seccomp_arch_exist,
    seccomp_arch_resolve_name, seccomp_init, seccomp_load, seccomp_release,
    seccomp_rule_add_array, seccomp_syscall_resolve_name, SCMP_ACT_ALLOW, SCMP_ACT_ERRNO,
    SCMP_ACT_KILL, SCMP_ACT_TRAP, SCMP_ACT_TRACE, __NR_SCMP_ERROR,
};

use crate::oci::{Seccomp, Syscall, SyscallArg};

/// Owns the filter state until it is loaded or dropped.
struct FilterContext {
    ctx: scmp_filter_ctx,
}

impl FilterContext {
    fn new(default_action: u32) -> Result<Self> {
        let ctx = unsafe { seccomp_init(default_action) };
        if ctx.is_null() {
            bail!("seccomp_init failed");
        }
        Ok(Self { ctx })
    }
}

impl Drop for FilterContext {
    fn drop(&mut self) {
        unsafe { seccomp_release(self.ctx) };
    }
}

fn action_token(action: &str) -> Result<u32> {
    // ERRNO and TRACE both surface as EPERM inside the container
    let token = match action {
        "SCMP_ACT_KILL" => SCMP_ACT_KILL,
        "SCMP_ACT_TRAP" => SCMP_ACT_TRAP,
        "SCMP_ACT_ERRNO" => SCMP_ACT_ERRNO(libc::EPERM as u32),
        "SCMP_ACT_TRACE" => SCMP_ACT_TRACE(libc::EPERM as u32),
        "SCMP_ACT_ALLOW" => SCMP_ACT_ALLOW,
        unknown => bail!("unknown seccomp action: {}", unknown),
    };
    Ok(token)
}

fn compare_op(op: &str) -> Result<scmp_compare> {
    let token = match op {
        "SCMP_CMP_NE" => scmp_compare::SCMP_CMP_NE,
        "SCMP_CMP_LT" => scmp_compare::SCMP_CMP_LT,
        "SCMP_CMP_LE" => scmp_compare::SCMP_CMP_LE,
        "SCMP_CMP_EQ" => scmp_compare::SCMP_CMP_EQ,
        "SCMP_CMP_GE" => scmp_compare::SCMP_CMP_GE,
        "SCMP_CMP_GT" => scmp_compare::SCMP_CMP_GT,
        "SCMP_CMP_MASKED_EQ" => scmp_compare::SCMP_CMP_MASKED_EQ,
        unknown => bail!("unknown seccomp comparison operator: {}", unknown),
    };
    Ok(token)
}

fn comparators(args: &[SyscallArg]) -> Result<Vec<scmp_arg_cmp>> {
    args.iter()
        .map(|arg| {
            Ok(scmp_arg_cmp {
                arg: arg.index,
                op: compare_op(&arg.op)?,
                datum_a: arg.value,
                datum_b: arg.value_two,
            })
        })
        .collect()
}

fn resolve_arch(name: &str) -> Result<u32> {
    let c_name = CString::new(name).context("architecture name contains a NUL")?;
    let token = unsafe { seccomp_arch_resolve_name(c_name.as_ptr()) };
    if token == 0 {
        bail!("unknown seccomp architecture: {}", name);
    }
    Ok(token)
}

fn resolve_syscall(name: &str) -> Result<libc::c_int> {
    let c_name = CString::new(name).context("syscall name contains a NUL")?;
    let number = unsafe { seccomp_syscall_resolve_name(c_name.as_ptr()) };
    if number == __NR_SCMP_ERROR {
        bail!("unknown syscall name: {}", name);
    }
    Ok(number)
}

fn add_rule(filter: &FilterContext, action: u32, syscall: &Syscall) -> Result<()> {
    let args = comparators(&syscall.args)?;

    for name in &syscall.names {
        let number = resolve_syscall(name)?;
        let ret = unsafe {
            seccomp_rule_add_array(
                filter.ctx,
                action,
                number,
                args.len() as libc::c_uint,
                args.as_ptr(),
            )
        };
        if ret != 0 {
            bail!("failed to add seccomp rule for {} ({})", name, ret);
        }
    }

    Ok(())
}

/// Builds the filter from the document and loads it into the kernel.
pub fn initialize(seccomp: &Seccomp) -> Result<()> {
    let default_action = action_token(&seccomp.default_action)
        .context("invalid seccomp default action")?;
    let filter = FilterContext::new(default_action)?;

    for architecture in &seccomp.architectures {
        let token = resolve_arch(architecture)?;
        if unsafe { seccomp_arch_exist(filter.ctx, token) } == -libc::EEXIST {
            let ret = unsafe { seccomp_arch_add(filter.ctx, token) };
            if ret != 0 {
                bail!("failed to add architecture {} ({})", architecture, ret);
            }
        }
    }

    for syscall in &seccomp.syscalls {
        let action = action_token(&syscall.action)
            .with_context(|| format!("invalid action for syscalls {:?}", syscall.names))?;
        add_rule(&filter, action, syscall)?;
    }

    let ret = unsafe { seccomp_load(filter.ctx) };
    if ret != 0 {
        bail!("seccomp_load failed ({})", ret);
    }

    log::debug!(
        "loaded seccomp filter with {} rules",
        seccomp.syscalls.len()
    );
    Ok(())
}
