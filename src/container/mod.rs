//! The container value: owns the parsed document, the filesystem driver and
//! the supervision state, and drives the lifecycle from clone to reap.

pub mod container;
pub mod state;

pub use container::{drop_permissions, Container};
pub use state::{StateFileGuard, StateRecord};
