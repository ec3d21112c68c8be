//! Hand-maintained bindings to the subset of libseccomp(3) the engine uses:
//! filter construction, architecture and syscall-name resolution, and
//! loading the compiled BPF program into the kernel.

use std::os::raw::{c_char, c_int, c_uint, c_void};

/// Returned by the name resolvers when a syscall is unknown.
pub const __NR_SCMP_ERROR: c_int = -1;

pub const SCMP_ACT_KILL: u32 = 0;
pub const SCMP_ACT_TRAP: u32 = 0x0003_0000;
pub const SCMP_ACT_ALLOW: u32 = 0x7fff_0000;

#[allow(non_snake_case)]
pub fn SCMP_ACT_ERRNO(errno: u32) -> u32 {
    0x0005_0000 | (errno & 0x0000_ffff)
}

#[allow(non_snake_case)]
pub fn SCMP_ACT_TRACE(msg: u32) -> u32 {
    0x7ff0_0000 | (msg & 0x0000_ffff)
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum scmp_compare {
    _SCMP_CMP_MIN = 0,
    SCMP_CMP_NE = 1,
    SCMP_CMP_LT = 2,
    SCMP_CMP_LE = 3,
    SCMP_CMP_EQ = 4,
    SCMP_CMP_GE = 5,
    SCMP_CMP_GT = 6,
    SCMP_CMP_MASKED_EQ = 7,
    _SCMP_CMP_MAX = 8,
}

#[allow(non_camel_case_types)]
pub type scmp_datum_t = u64;

/// Opaque filter handle; owned by whoever called `seccomp_init` until
/// released.
#[allow(non_camel_case_types)]
pub type scmp_filter_ctx = *mut c_void;

/// One argument comparison of a syscall rule.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct scmp_arg_cmp {
    pub arg: c_uint,
    pub op: scmp_compare,
    pub datum_a: scmp_datum_t,
    pub datum_b: scmp_datum_t,
}

#[link(name = "seccomp")]
extern "C" {
    /// Initialize a filter with the given default action. Returns null on
    /// failure.
    pub fn seccomp_init(def_action: u32) -> scmp_filter_ctx;

    /// Release the filter state. Does not unload an already loaded filter.
    pub fn seccomp_release(ctx: scmp_filter_ctx);

    /// Load the filter into the kernel; enforced once this returns zero.
    pub fn seccomp_load(ctx: scmp_filter_ctx) -> c_int;

    /// Zero if the architecture is already present in the filter, -EEXIST
    /// if it is not.
    pub fn seccomp_arch_exist(ctx: scmp_filter_ctx, arch_token: u32) -> c_int;

    /// Add an architecture to the filter.
    pub fn seccomp_arch_add(ctx: scmp_filter_ctx, arch_token: u32) -> c_int;

    /// Resolve an architecture name (e.g. "SCMP_ARCH_X86_64") to a token;
    /// zero on failure.
    pub fn seccomp_arch_resolve_name(arch_name: *const c_char) -> u32;

    /// Resolve a syscall name to its number for the native architecture;
    /// `__NR_SCMP_ERROR` on failure.
    pub fn seccomp_syscall_resolve_name(name: *const c_char) -> c_int;

    /// Add a rule with an array of argument comparisons.
    pub fn seccomp_rule_add_array(
        ctx: scmp_filter_ctx,
        action: u32,
        syscall: c_int,
        arg_cnt: c_uint,
        arg_array: *const scmp_arg_cmp,
    ) -> c_int;
}
