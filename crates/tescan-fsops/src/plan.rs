//! Path classification and per-transfer planning.
//!
//! # Design
//! - Classification is by path shape first, so a UNC-style path is recognised on any host.
//! - On Linux an existing path mounted from NFS/SMB/CIFS also counts as network storage.
//! - Plans are computed per call and never cached; mounts come and go between calls.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Where a path lives, as far as the transfer engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    /// Local disk.
    Local,
    /// `\\server\share\...` (or `//server/share/...`) network path.
    Unc,
    /// Network share reached through a local mount point.
    Mount,
}

impl PathKind {
    /// Whether data written here crosses a network.
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(self, Self::Unc | Self::Mount)
    }
}

const MOUNT_PREFIXES: &[&str] = &["/mnt/", "/media/", "/net/", "/smb/", "/cifs/", "/Volumes/"];

/// Classify `path` by its shape alone.
#[must_use]
pub fn classify_path(path: &Path) -> PathKind {
    let text = path.to_string_lossy();
    if text.starts_with(r"\\") || text.starts_with("//") {
        return PathKind::Unc;
    }
    let slashed = if text.ends_with('/') {
        text.into_owned()
    } else {
        format!("{text}/")
    };
    if MOUNT_PREFIXES
        .iter()
        .any(|prefix| slashed.starts_with(prefix))
    {
        return PathKind::Mount;
    }
    PathKind::Local
}

/// Classify `path`, upgrading a shape-local path to [`PathKind::Mount`] when
/// the filesystem backing it is a network filesystem.
#[must_use]
pub fn probe_path(path: &Path) -> PathKind {
    match classify_path(path) {
        PathKind::Local if mounted_from_network(path) => PathKind::Mount,
        kind => kind,
    }
}

#[cfg(target_os = "linux")]
fn mounted_from_network(path: &Path) -> bool {
    use nix::sys::statfs::{NFS_SUPER_MAGIC, SMB_SUPER_MAGIC, statfs};

    const CIFS_MAGIC: u64 = 0xFF53_4D42;
    const SMB2_MAGIC: u64 = 0xFE53_4D42;

    let Some(existing) = nearest_existing(path) else {
        return false;
    };
    let Ok(stat) = statfs(existing.as_path()) else {
        return false;
    };
    let fs_type = stat.filesystem_type();
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let magic = (fs_type.0 as u64) & 0xFFFF_FFFF;
    fs_type == NFS_SUPER_MAGIC || fs_type == SMB_SUPER_MAGIC || magic == CIFS_MAGIC || magic == SMB2_MAGIC
}

#[cfg(not(target_os = "linux"))]
fn mounted_from_network(_path: &Path) -> bool {
    false
}

/// Nearest ancestor of `path` (inclusive) that exists.
pub(crate) fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
        .map(Path::to_path_buf)
}

/// When a copy must be verified by re-hashing the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Verify only when either side is a network path.
    #[default]
    Auto,
    /// Verify every copy.
    Always,
    /// Never verify.
    Never,
}

/// Strategy for one transfer, derived from the resolved paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    /// Classification of the source path.
    pub source_kind: PathKind,
    /// Classification of the destination path.
    pub destination_kind: PathKind,
    /// Both paths live on the same volume.
    pub same_volume: bool,
    /// Either side is network storage.
    pub is_network_path: bool,
    /// The copy must be verified by digest.
    pub requires_checksum: bool,
}

impl TransferPlan {
    /// Compute a plan for moving `source` to `destination`.
    #[must_use]
    pub fn compute(source: &Path, destination: &Path, policy: ChecksumPolicy) -> Self {
        let source_kind = probe_path(source);
        let destination_kind = probe_path(destination);
        let is_network_path = source_kind.is_network() || destination_kind.is_network();
        let requires_checksum = match policy {
            ChecksumPolicy::Auto => is_network_path,
            ChecksumPolicy::Always => true,
            ChecksumPolicy::Never => false,
        };
        Self {
            source_kind,
            destination_kind,
            same_volume: same_volume(source, destination),
            is_network_path,
            requires_checksum,
        }
    }

    /// Whether a plain rename should be attempted first.
    #[must_use]
    pub const fn prefers_rename(&self) -> bool {
        self.same_volume && !self.requires_checksum
    }
}

#[cfg(unix)]
fn same_volume(source: &Path, destination: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let device = |path: &Path| {
        nearest_existing(path)
            .and_then(|existing| std::fs::metadata(existing).ok())
            .map(|meta| meta.dev())
    };
    match (device(source), device(destination)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_volume(source: &Path, destination: &Path) -> bool {
    use std::path::Component;

    let volume = |path: &Path| match path.components().next() {
        Some(Component::Prefix(prefix)) => Some(prefix.as_os_str().to_ascii_lowercase()),
        _ => None,
    };
    volume(source) == volume(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unc_paths_are_recognised_on_any_host() {
        assert_eq!(
            classify_path(Path::new(r"\\fileserver\share\in\a.txt")),
            PathKind::Unc
        );
        assert_eq!(
            classify_path(Path::new("//fileserver/share/a.txt")),
            PathKind::Unc
        );
    }

    #[test]
    fn mount_prefixes_are_network_paths() {
        assert_eq!(classify_path(Path::new("/mnt/share/a.txt")), PathKind::Mount);
        assert_eq!(classify_path(Path::new("/media/usb")), PathKind::Mount);
        assert_eq!(classify_path(Path::new("/mnt")), PathKind::Mount);
        assert_eq!(classify_path(Path::new("/mntx/a")), PathKind::Local);
        assert_eq!(classify_path(Path::new("/srv/in/a.txt")), PathKind::Local);
        assert!(PathKind::Mount.is_network());
        assert!(!PathKind::Local.is_network());
    }

    #[test]
    fn network_destination_requires_checksum() {
        let plan = TransferPlan::compute(
            Path::new("/srv/in/a.txt"),
            Path::new("/mnt/nas/out/a.txt"),
            ChecksumPolicy::Auto,
        );
        assert!(plan.is_network_path);
        assert!(plan.requires_checksum);
        assert!(!plan.prefers_rename());
    }

    #[test]
    fn local_same_volume_prefers_rename() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"x")?;
        let plan = TransferPlan::compute(
            &source,
            &dir.path().join("out/a.txt"),
            ChecksumPolicy::Auto,
        );
        if plan.is_network_path {
            // Temp dirs on a network filesystem legitimately take the copy path.
            return Ok(());
        }
        assert!(plan.same_volume);
        assert!(plan.prefers_rename());

        let forced = TransferPlan::compute(
            &source,
            &dir.path().join("out/a.txt"),
            ChecksumPolicy::Always,
        );
        assert!(forced.requires_checksum);
        assert!(!forced.prefers_rename());
        Ok(())
    }
}
