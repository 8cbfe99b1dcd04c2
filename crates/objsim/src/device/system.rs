// Host metrics behind the SystemData Publisher's computed fields

use parking_lot::Mutex;
use sysinfo::{Disks, System};

pub struct SystemProbe {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 * 100.0 / total as f64
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    pub fn disk_usage(&self) -> f64 {
        let mut disks = self.disks.lock();
        disks.refresh();
        let (used, total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
            let size = disk.total_space();
            (
                used + size.saturating_sub(disk.available_space()),
                total + size,
            )
        });
        percent(used, total)
    }

    pub fn memory_usage(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        percent(system.used_memory(), system.total_memory())
    }

    /// Load since the previous call; the first reading is 0
    pub fn cpu_usage(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        f64::from(system.global_cpu_info().cpu_usage())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_percentages() {
        let probe = SystemProbe::new();
        for reading in [probe.disk_usage(), probe.memory_usage(), probe.cpu_usage()] {
            assert!((0.0..=100.0).contains(&reading), "{reading} out of range");
        }
    }

    #[test]
    fn percent_of_nothing_is_zero() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
