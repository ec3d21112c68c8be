//! Process management: the clone(2) wrapper, the entry and init tasks the
//! cloned children run, and the supervisor that reaps them.

pub mod entry;
pub mod fork;
pub mod init;
pub mod supervisor;
