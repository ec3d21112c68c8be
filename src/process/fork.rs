//! clone(2) wrapper used for both the entry process and the non-privileged
//! init. clone gives us direct namespace entry with a single new process,
//! where unshare+fork would need two.

use std::mem;
use std::ptr;

use anyhow::{Context, Result};
use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::Pid;

/// The task a cloned child runs. Must own everything it touches; nothing in
/// the child may borrow from the parent's stack.
pub type CloneCb = Box<dyn FnMut() -> isize>;

pub fn clone(mut cb: CloneCb, clone_flags: CloneFlags) -> Result<Pid> {
    extern "C" fn callback(data: *mut CloneCb) -> c_int {
        let cb: &mut CloneCb = unsafe { &mut *data };
        (*cb)() as c_int
    }

    let page_size: usize = unsafe {
        match libc::sysconf(libc::_SC_PAGE_SIZE) {
            -1 => 4 * 1024,
            x => x as usize,
        }
    };

    // Size the child stack like the default thread stack. mmap only
    // reserves the address space; pages materialize as the child touches
    // them, and exec releases the mapping again.
    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { Errno::result(libc::getrlimit(libc::RLIMIT_STACK, &mut rlimit))? };
    let stack_size = rlimit.rlim_cur as usize;

    let child_stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            stack_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if child_stack == libc::MAP_FAILED {
        return Err(Errno::last()).context("failed to mmap the child stack");
    }

    let pid = unsafe {
        // The stack grows downward, so the guard page sits at the lowest
        // address and the clone call receives the top.
        Errno::result(libc::mprotect(child_stack, page_size, libc::PROT_NONE))
            .context("failed to create the stack guard page")?;

        let child_stack_top = child_stack.add(stack_size);

        // SIGCHLD in the flags mimics fork for the parent's waitpid.
        let combined = clone_flags.bits() | libc::SIGCHLD;
        let raw = libc::clone(
            mem::transmute::<
                extern "C" fn(*mut CloneCb) -> c_int,
                extern "C" fn(*mut c_void) -> c_int,
            >(callback),
            child_stack_top,
            combined,
            &mut cb as *mut _ as *mut c_void,
        );
        Errno::result(raw).map(Pid::from_raw)?
    };

    Ok(pid)
}
