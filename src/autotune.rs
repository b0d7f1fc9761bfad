use crate::hw::{DiskKind, HwInfo};

/// Refresh is I/O bound: parallel reads help on SSDs, only thrash an HDD.
pub fn auto_tune_workers(hw: &HwInfo) -> usize {
    let cores = hw.logical_cpus.max(1);
    match hw.disk_kind {
        DiskKind::Ssd => 4.min(cores),
        DiskKind::Hdd => 1,
        DiskKind::Unknown => 2.min(cores),
    }
}

/// Configured value wins; otherwise autotune.
pub fn resolve_workers(configured: Option<usize>, hw: &HwInfo) -> usize {
    configured.unwrap_or_else(|| auto_tune_workers(hw)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(cpus: usize, disk_kind: DiskKind) -> HwInfo {
        HwInfo {
            logical_cpus: cpus,
            disk_kind,
        }
    }

    #[test]
    fn hdd_gets_one_worker() {
        assert_eq!(auto_tune_workers(&hw(16, DiskKind::Hdd)), 1);
    }

    #[test]
    fn ssd_scales_with_cores_up_to_four() {
        assert_eq!(auto_tune_workers(&hw(2, DiskKind::Ssd)), 2);
        assert_eq!(auto_tune_workers(&hw(32, DiskKind::Ssd)), 4);
        assert_eq!(auto_tune_workers(&hw(1, DiskKind::Unknown)), 1);
        assert_eq!(auto_tune_workers(&hw(8, DiskKind::Unknown)), 2);
    }

    #[test]
    fn configured_workers_override() {
        assert_eq!(resolve_workers(Some(6), &hw(2, DiskKind::Hdd)), 6);
        assert_eq!(resolve_workers(None, &hw(2, DiskKind::Hdd)), 1);
    }
}
