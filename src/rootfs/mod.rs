//! Assembly of the container mount tree: filesystem drivers, the mount
//! engine with its deferred remounts, mount propagation preparation, the
//! pivot-root sequence and the default device nodes and symlinks.

pub mod device;
pub mod driver;
pub mod mount;
pub mod pivot;
pub mod rootfs;
pub mod symlink;
pub mod utils;

pub use driver::{FilesystemDriver, FuseProxyDriver, NativeDriver, OverlayfsFuseDriver};
pub use mount::{MountEngine, MountError};
