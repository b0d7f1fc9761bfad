use std::fs;
use std::path::Path;
use sysinfo::Disks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Hdd,
    Ssd,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct HwInfo {
    pub logical_cpus: usize,
    pub disk_kind: DiskKind,
}

/// Disk holding `p`: the mount point that is the longest prefix of the path.
pub fn disk_kind_for_path(p: &Path) -> DiskKind {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .iter()
        .filter(|d| p.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().components().count());

    match best.map(|d| d.kind()) {
        Some(sysinfo::DiskKind::HDD) => DiskKind::Hdd,
        Some(sysinfo::DiskKind::SSD) => DiskKind::Ssd,
        _ => DiskKind::Unknown,
    }
}

/// `root` may be relative; mount points are matched against its absolute form.
pub fn detect_hw(root: &Path) -> HwInfo {
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    HwInfo {
        logical_cpus: num_cpus::get().max(1),
        disk_kind: disk_kind_for_path(&root),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_root_resolves_like_absolute() {
        let abs = fs::canonicalize(".").unwrap();
        assert_eq!(detect_hw(Path::new(".")).disk_kind, disk_kind_for_path(&abs));
        assert!(detect_hw(Path::new(".")).logical_cpus >= 1);
    }
}
