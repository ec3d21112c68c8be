//! Backings for the container rootfs. The engine only ever talks to the
//! trait: where a container path lives on the host, and how to bring the
//! backing up before any mount is attempted.

use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::unistd::pipe;

use super::utils::ensure_directory;

const FUSE_OVERLAYFS_BIN: &str = "/usr/bin/fuse-overlayfs";
const FUSE_PROXY_BIN: &str = "/usr/bin/ll-fuse-proxy";

/// The fd number on which the proxy helper expects its mount list.
const FUSE_PROXY_FD: i32 = 112;

pub trait FilesystemDriver {
    /// Brings the backing up. Runs in the parent, before any namespace is
    /// entered, because the fuse helpers must outlive the mount phase.
    fn setup(&self) -> Result<()>;

    /// The assembled container rootfs as seen on the host.
    fn root(&self) -> &Path;

    /// Maps a container destination to the host path the engine operates on.
    fn host_path(&self, container_path: &Path) -> PathBuf {
        match container_path.strip_prefix("/") {
            Ok(rel) => self.root().join(rel),
            Err(_) => self.root().join(container_path),
        }
    }

    /// Maps a container path to the path a mount source should use.
    fn host_source(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn create_destination(&self, container_path: &Path) -> Result<()> {
        ensure_directory(&self.host_path(container_path)).with_context(|| {
            format!(
                "failed to create destination {} under {}",
                container_path.display(),
                self.root().display()
            )
        })
    }
}

/// Host rootfs used in place.
pub struct NativeDriver {
    root: PathBuf,
}

impl NativeDriver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl FilesystemDriver for NativeDriver {
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Rootfs assembled by fuse-overlayfs from read-only lower layers plus an
/// upper/work pair.
pub struct OverlayfsFuseDriver {
    lower_dirs: Vec<PathBuf>,
    upper_dir: PathBuf,
    work_dir: PathBuf,
    mount_point: PathBuf,
}

impl OverlayfsFuseDriver {
    pub fn new(
        lower_dirs: Vec<PathBuf>,
        upper_dir: PathBuf,
        work_dir: PathBuf,
        mount_point: PathBuf,
    ) -> Self {
        Self {
            lower_dirs,
            upper_dir,
            work_dir,
            mount_point,
        }
    }

    fn lowerdir_option(&self) -> String {
        let dirs: Vec<String> = self
            .lower_dirs
            .iter()
            .map(|d| d.to_string_lossy().into_owned())
            .collect();
        format!("lowerdir={}", dirs.join(":"))
    }
}

impl FilesystemDriver for OverlayfsFuseDriver {
    fn setup(&self) -> Result<()> {
        ensure_directory(&self.upper_dir)?;
        ensure_directory(&self.work_dir)?;
        ensure_directory(&self.mount_point)?;

        let status = Command::new(FUSE_OVERLAYFS_BIN)
            .arg("-o")
            .arg(self.lowerdir_option())
            .arg("-o")
            .arg(format!("upperdir={}", self.upper_dir.display()))
            .arg("-o")
            .arg(format!("workdir={}", self.work_dir.display()))
            .arg(&self.mount_point)
            .status()
            .context("failed to spawn fuse-overlayfs")?;

        if !status.success() {
            bail!("fuse-overlayfs exited with {}", status);
        }

        Ok(())
    }

    fn root(&self) -> &Path {
        &self.mount_point
    }
}

/// Rootfs served by an out-of-process fuse helper which proxies container
/// reads to configured host paths.
pub struct FuseProxyDriver {
    mounts: Vec<String>,
    mount_point: PathBuf,
}

impl FuseProxyDriver {
    pub fn new(mounts: Vec<String>, mount_point: PathBuf) -> Self {
        Self {
            mounts,
            mount_point,
        }
    }

    /// One `source:destination` descriptor per line, with the implicit
    /// `.root` mapping of the container root first.
    fn mount_lines(&self) -> String {
        let mut lines = format!("{}/.root:/\n", self.mount_point.display());
        for m in &self.mounts {
            lines.push_str(m);
            lines.push('\n');
        }
        lines
    }
}

impl FilesystemDriver for FuseProxyDriver {
    fn setup(&self) -> Result<()> {
        ensure_directory(&self.mount_point)?;
        ensure_directory(&self.mount_point.join(".root"))?;

        let (read_end, write_end) = pipe().context("failed to create fuse-proxy pipe")?;
        let read_fd = read_end.into_raw_fd();

        let mut command = Command::new(FUSE_PROXY_BIN);
        command
            .arg(FUSE_PROXY_FD.to_string())
            .arg(&self.mount_point);
        unsafe {
            command.pre_exec(move || {
                // hand the read end over on the agreed fd; dup2 clears
                // O_CLOEXEC on the duplicate
                if libc::dup2(read_fd, FUSE_PROXY_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().context("failed to spawn ll-fuse-proxy")?;
        log::debug!("ll-fuse-proxy running as pid {}", child.id());

        // only the helper needs the read end from here on
        let _ = nix::unistd::close(read_fd);

        let mut pipe_writer = std::fs::File::from(write_end);
        pipe_writer
            .write_all(self.mount_lines().as_bytes())
            .context("failed to write mount list to ll-fuse-proxy")?;

        Ok(())
    }

    fn root(&self) -> &Path {
        &self.mount_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_host_path() {
        let driver = NativeDriver::new(PathBuf::from("/run/user/1000/linglong/abc/root"));
        assert_eq!(
            driver.host_path(Path::new("/opt/apps")),
            PathBuf::from("/run/user/1000/linglong/abc/root/opt/apps")
        );
        assert_eq!(
            driver.host_path(Path::new("relative")),
            PathBuf::from("/run/user/1000/linglong/abc/root/relative")
        );
    }

    #[test]
    fn test_overlayfs_lowerdir_option() {
        let driver = OverlayfsFuseDriver::new(
            vec![PathBuf::from("/layers/base"), PathBuf::from("/layers/app")],
            PathBuf::from("/tmp/upper"),
            PathBuf::from("/tmp/work"),
            PathBuf::from("/tmp/rootfs"),
        );
        assert_eq!(driver.lowerdir_option(), "lowerdir=/layers/base:/layers/app");
        assert_eq!(driver.root(), Path::new("/tmp/rootfs"));
    }

    #[test]
    fn test_fuse_proxy_mount_lines() {
        let driver = FuseProxyDriver::new(
            vec!["/usr:/usr".to_string(), "/etc:/etc".to_string()],
            PathBuf::from("/tmp/rootfs"),
        );
        assert_eq!(
            driver.mount_lines(),
            "/tmp/rootfs/.root:/\n/usr:/usr\n/etc:/etc\n"
        );
    }
}
