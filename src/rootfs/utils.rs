use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::str::FromStr;

use bitflags::bitflags;
use nix::mount::MsFlags;

use crate::oci::Mount;

/// Filesystem-type tag of a mount request. Determines how the source token
/// is interpreted and which fallbacks apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Bind,
    Proc,
    Sysfs,
    Devpts,
    Mqueue,
    Tmpfs,
    Cgroup,
    Cgroup2,
}

impl FromStr for FsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(FsType::Bind),
            "proc" => Ok(FsType::Proc),
            "sysfs" => Ok(FsType::Sysfs),
            "devpts" => Ok(FsType::Devpts),
            "mqueue" => Ok(FsType::Mqueue),
            "tmpfs" => Ok(FsType::Tmpfs),
            "cgroup" => Ok(FsType::Cgroup),
            "cgroup2" => Ok(FsType::Cgroup2),
            unknown => Err(unknown.to_string()),
        }
    }
}

bitflags! {
    /// Engine-local mount options without a kernel flag.
    pub struct ExtensionFlags: u32 {
        const COPY_SYMLINK = 0b01;
        const NOSYMFOLLOW = 0b10;
    }
}

/// Decoded option vector of one mount request. `flags` feeds the primary
/// mount call, `propagation` a second call, `data` the kernel data argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptionConfig {
    pub flags: MsFlags,
    pub propagation: MsFlags,
    pub extensions: ExtensionFlags,
    pub data: String,
}

/// Decodes the option strings of a mount entry against the closed option
/// table. Unknown tokens are passed through verbatim in `data`.
pub fn parse_mount(m: &Mount) -> MountOptionConfig {
    let mut flags = if m.typ == "bind" {
        MsFlags::MS_BIND
    } else {
        MsFlags::empty()
    };
    let mut propagation = MsFlags::empty();
    let mut extensions = ExtensionFlags::empty();
    let mut data = Vec::new();

    for s in &m.options {
        if let Some((is_clear, flag)) = match s.as_str() {
            "defaults" => Some((false, MsFlags::empty())),
            "acl" => Some((false, MsFlags::MS_POSIXACL)),
            "noacl" => Some((true, MsFlags::MS_POSIXACL)),
            "async" => Some((true, MsFlags::MS_SYNCHRONOUS)),
            "sync" => Some((false, MsFlags::MS_SYNCHRONOUS)),
            "atime" => Some((true, MsFlags::MS_NOATIME)),
            "noatime" => Some((false, MsFlags::MS_NOATIME)),
            "bind" => Some((false, MsFlags::MS_BIND)),
            "rbind" => Some((false, MsFlags::MS_BIND | MsFlags::MS_REC)),
            "dev" => Some((true, MsFlags::MS_NODEV)),
            "nodev" => Some((false, MsFlags::MS_NODEV)),
            "diratime" => Some((true, MsFlags::MS_NODIRATIME)),
            "nodiratime" => Some((false, MsFlags::MS_NODIRATIME)),
            "dirsync" => Some((false, MsFlags::MS_DIRSYNC)),
            "exec" => Some((true, MsFlags::MS_NOEXEC)),
            "noexec" => Some((false, MsFlags::MS_NOEXEC)),
            "iversion" => Some((false, MsFlags::MS_I_VERSION)),
            "noiversion" => Some((true, MsFlags::MS_I_VERSION)),
            "lazytime" => Some((false, MsFlags::MS_LAZYTIME)),
            "nolazytime" => Some((true, MsFlags::MS_LAZYTIME)),
            "loud" => Some((true, MsFlags::MS_SILENT)),
            "silent" => Some((false, MsFlags::MS_SILENT)),
            "mand" => Some((false, MsFlags::MS_MANDLOCK)),
            "nomand" => Some((true, MsFlags::MS_MANDLOCK)),
            "relatime" => Some((false, MsFlags::MS_RELATIME)),
            "norelatime" => Some((true, MsFlags::MS_RELATIME)),
            "remount" => Some((false, MsFlags::MS_REMOUNT)),
            "ro" => Some((false, MsFlags::MS_RDONLY)),
            "rw" => Some((true, MsFlags::MS_RDONLY)),
            "strictatime" => Some((false, MsFlags::MS_STRICTATIME)),
            "nostrictatime" => Some((true, MsFlags::MS_STRICTATIME)),
            "suid" => Some((true, MsFlags::MS_NOSUID)),
            "nosuid" => Some((false, MsFlags::MS_NOSUID)),
            _ => None,
        } {
            if is_clear {
                flags &= !flag;
            } else {
                flags |= flag;
            }
            continue;
        }

        if let Some(flag) = match s.as_str() {
            "shared" => Some(MsFlags::MS_SHARED),
            "rshared" => Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
            "slave" => Some(MsFlags::MS_SLAVE),
            "rslave" => Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
            "private" => Some(MsFlags::MS_PRIVATE),
            "rprivate" => Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "unbindable" => Some(MsFlags::MS_UNBINDABLE),
            "runbindable" => Some(MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
            _ => None,
        } {
            propagation |= flag;
            continue;
        }

        match s.as_str() {
            "nosymfollow" => extensions |= ExtensionFlags::NOSYMFOLLOW,
            "copy-symlink" => extensions |= ExtensionFlags::COPY_SYMLINK,
            other => data.push(other),
        }
    }

    MountOptionConfig {
        flags,
        propagation,
        extensions,
        data: data.join(","),
    }
}

/// Parses `/proc/filesystems` content: a type is dummy when its line carries
/// the `nodev` marker, device-backed otherwise.
pub fn parse_filesystems(content: &str) -> HashMap<String, bool> {
    let mut types = HashMap::new();
    for line in content.lines() {
        let (dummy, name) = match line.strip_prefix("nodev") {
            Some(rest) => (true, rest.trim()),
            None => (false, line.trim()),
        };
        if !name.is_empty() {
            types.insert(name.to_string(), dummy);
        }
    }
    types
}

pub fn load_filesystems() -> std::io::Result<HashMap<String, bool>> {
    Ok(parse_filesystems(&fs::read_to_string("/proc/filesystems")?))
}

/// Creates the directory and its parents with mode 0755. An existing
/// destination of any file type is left alone; the mount resolution decides
/// whether it is acceptable.
pub fn ensure_directory(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

/// Makes sure an empty file exists at `path`, creating parents as needed.
pub fn ensure_file(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    OpenOptions::new().create(true).write(true).open(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mount_with_options(typ: &str, options: &[&str]) -> Mount {
        Mount {
            destination: PathBuf::from("/target"),
            typ: typ.to_string(),
            source: "/source".to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_mount_single_tokens() {
        let cases: &[(&str, MsFlags)] = &[
            ("ro", MsFlags::MS_RDONLY),
            ("nosuid", MsFlags::MS_NOSUID),
            ("nodev", MsFlags::MS_NODEV),
            ("noexec", MsFlags::MS_NOEXEC),
            ("sync", MsFlags::MS_SYNCHRONOUS),
            ("dirsync", MsFlags::MS_DIRSYNC),
            ("remount", MsFlags::MS_REMOUNT),
            ("mand", MsFlags::MS_MANDLOCK),
            ("noatime", MsFlags::MS_NOATIME),
            ("nodiratime", MsFlags::MS_NODIRATIME),
            ("relatime", MsFlags::MS_RELATIME),
            ("strictatime", MsFlags::MS_STRICTATIME),
            ("silent", MsFlags::MS_SILENT),
            ("acl", MsFlags::MS_POSIXACL),
            ("iversion", MsFlags::MS_I_VERSION),
            ("lazytime", MsFlags::MS_LAZYTIME),
        ];

        for (token, flag) in cases {
            let config = parse_mount(&mount_with_options("tmpfs", &[token]));
            assert_eq!(config.flags, *flag, "token {}", token);
            assert!(config.data.is_empty());
        }
    }

    #[test]
    fn test_parse_mount_inverse_tokens_clear() {
        let cases: &[(&str, &str)] = &[
            ("ro", "rw"),
            ("nosuid", "suid"),
            ("nodev", "dev"),
            ("noexec", "exec"),
            ("sync", "async"),
            ("noatime", "atime"),
            ("nodiratime", "diratime"),
            ("mand", "nomand"),
            ("relatime", "norelatime"),
            ("strictatime", "nostrictatime"),
            ("silent", "loud"),
            ("acl", "noacl"),
            ("iversion", "noiversion"),
            ("lazytime", "nolazytime"),
        ];

        for (token, inverse) in cases {
            let config = parse_mount(&mount_with_options("tmpfs", &[token, inverse]));
            assert_eq!(
                config.flags,
                MsFlags::empty(),
                "pair {} then {}",
                token,
                inverse
            );
        }
    }

    #[test]
    fn test_parse_mount_bind_type_and_tokens() {
        // the bind fs type alone implies MS_BIND
        let config = parse_mount(&mount_with_options("bind", &[]));
        assert_eq!(config.flags, MsFlags::MS_BIND);

        let config = parse_mount(&mount_with_options("bind", &["rbind", "ro"]));
        assert_eq!(
            config.flags,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY
        );
    }

    #[test]
    fn test_parse_mount_propagation_kept_separate() {
        let config = parse_mount(&mount_with_options("bind", &["rbind", "rslave"]));
        assert_eq!(config.flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(config.propagation, MsFlags::MS_SLAVE | MsFlags::MS_REC);

        let config = parse_mount(&mount_with_options("bind", &["shared"]));
        assert_eq!(config.propagation, MsFlags::MS_SHARED);

        let config = parse_mount(&mount_with_options("bind", &["unbindable"]));
        assert_eq!(config.propagation, MsFlags::MS_UNBINDABLE);
    }

    #[test]
    fn test_parse_mount_extension_tokens() {
        let config = parse_mount(&mount_with_options("bind", &["nosymfollow"]));
        assert_eq!(config.extensions, ExtensionFlags::NOSYMFOLLOW);

        let config = parse_mount(&mount_with_options("bind", &["copy-symlink"]));
        assert_eq!(config.extensions, ExtensionFlags::COPY_SYMLINK);
    }

    #[test]
    fn test_parse_mount_unknown_tokens_to_data() {
        let config = parse_mount(&mount_with_options(
            "tmpfs",
            &["nosuid", "mode=0755", "size=65536k"],
        ));
        assert_eq!(config.flags, MsFlags::MS_NOSUID);
        assert_eq!(config.data, "mode=0755,size=65536k");
    }

    #[test]
    fn test_parse_mount_defaults_is_noop() {
        let config = parse_mount(&mount_with_options("tmpfs", &["defaults"]));
        assert_eq!(config.flags, MsFlags::empty());
        assert!(config.data.is_empty());
    }

    #[test]
    fn test_fs_type_from_str() {
        assert_eq!(FsType::from_str("bind").unwrap(), FsType::Bind);
        assert_eq!(FsType::from_str("cgroup2").unwrap(), FsType::Cgroup2);
        assert!(FsType::from_str("ext4").is_err());
    }

    #[test]
    fn test_parse_filesystems() {
        let content = "nodev\tsysfs\n\
                       nodev\ttmpfs\n\
                       nodev\tproc\n\
                       nodev\tdevpts\n\
                       nodev\tmqueue\n\
                       nodev\tcgroup\n\
                       nodev\tcgroup2\n\
                       \text4\n\
                       \tbtrfs\n";
        let types = parse_filesystems(content);

        for dummy in ["proc", "tmpfs", "sysfs", "devpts", "mqueue", "cgroup", "cgroup2"] {
            assert_eq!(types.get(dummy), Some(&true), "{} should be dummy", dummy);
        }
        assert_eq!(types.get("ext4"), Some(&false));
        assert_eq!(types.get("xfs"), None);
    }

    #[test]
    fn test_ensure_file_creates_parents() -> anyhow::Result<()> {
        let dir = crate::utils::create_temp_dir("ll_box_ensure_file")?;
        let target = dir.join("a/b/c.txt");
        ensure_file(&target)?;
        assert!(target.is_file());
        // idempotent
        ensure_file(&target)?;
        ensure_directory(&dir.join("a/b"))?;
        Ok(())
    }
}
