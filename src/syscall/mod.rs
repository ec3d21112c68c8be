//! An interface trait so that the rest of the engine can issue kernel calls
//! without having to worry about their implementation details, and so tests
//! can record the exact calls that would have been made.

pub mod linux;
pub mod syscall;

pub use syscall::{create_syscall, Syscall};
