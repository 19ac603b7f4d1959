use util::{DeviceClass, GIB};

pub mod pressure;
pub mod procfs;

pub use pressure::{MemoryPressure, MemoryPressureThresholds};
pub use procfs::{os_version, ProcStatistics};

/// Canonical RAM tiers, in GiB, that raw physical memory is rounded to.
pub const RAM_TIERS_GB: [u64; 6] = [3, 4, 6, 8, 12, 16];

/// Point-in-time view of host memory.
///
/// `total_bytes` is the classified tier, not the raw physical size, so two
/// devices of the same tier report the same total.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub active_bytes: u64,
    pub inactive_bytes: u64,
    pub wired_bytes: u64,
    pub app_resident_bytes: u64,
}

impl MemorySnapshot {
    pub fn ram_tier_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB as f64
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Active and inactive memory not attributable to this process.
    pub fn other_apps_bytes(&self) -> u64 {
        self.active_bytes
            .saturating_add(self.inactive_bytes)
            .saturating_sub(self.app_resident_bytes)
    }
}

/// Memory counters from one host query, already scaled to bytes.
///
/// Fields the host does not report are zero.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct VmCounters {
    pub physical_bytes: u64,
    pub free_bytes: u64,
    pub active_bytes: u64,
    pub inactive_bytes: u64,
    pub wired_bytes: u64,
}

/// Raw host statistics queries. Each returns `None` when the host cannot answer.
pub trait HostStatistics {
    fn vm_counters(&mut self) -> Option<VmCounters>;

    fn resident_size(&mut self) -> Option<u64>;
}

/// Source of memory snapshots.
///
/// Implementations must not fail: missing data is reported as zero.
pub trait TelemetrySampler {
    fn sample(&mut self) -> MemorySnapshot;
}

/// Builds snapshots from a [`HostStatistics`] source.
#[derive(Debug, Default)]
pub struct SnapshotSampler<H> {
    stats: H,
}

impl<H: HostStatistics> SnapshotSampler<H> {
    pub fn new(stats: H) -> Self {
        Self { stats }
    }
}

impl SnapshotSampler<ProcStatistics> {
    pub fn system() -> Self {
        Self::new(ProcStatistics::new())
    }
}

impl<H: HostStatistics> TelemetrySampler for SnapshotSampler<H> {
    fn sample(&mut self) -> MemorySnapshot {
        let counters = self.stats.vm_counters().unwrap_or_else(|| {
            tracing::debug!("vm counters unavailable; reporting zeroed snapshot fields");
            VmCounters::default()
        });
        let resident = self.stats.resident_size().unwrap_or(0);

        MemorySnapshot {
            total_bytes: classify_ram_tier_gb(counters.physical_bytes) * GIB,
            free_bytes: counters.free_bytes,
            active_bytes: counters.active_bytes,
            inactive_bytes: counters.inactive_bytes,
            wired_bytes: counters.wired_bytes,
            app_resident_bytes: resident,
        }
    }
}

/// Rounds raw physical RAM to the nearest canonical tier.
///
/// Ties go to the lower tier; unknown RAM (zero) lands on the lowest.
pub fn classify_ram_tier_gb(physical_bytes: u64) -> u64 {
    let mut best = RAM_TIERS_GB[0];
    let mut best_distance = u64::MAX;
    for tier in RAM_TIERS_GB {
        let distance = (tier * GIB).abs_diff(physical_bytes);
        if distance < best_distance {
            best = tier;
            best_distance = distance;
        }
    }
    best
}

/// Static facts about the device a run is performed on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub class: DeviceClass,
    pub ram_tier_gb: f64,
    pub os_version: String,
}

impl DeviceProfile {
    /// Captures the tier from one sample and the OS version from the host.
    pub fn detect(class: DeviceClass, sampler: &mut dyn TelemetrySampler) -> Self {
        Self {
            class,
            ram_tier_gb: sampler.sample().ram_tier_gb(),
            os_version: os_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::MIB;

    #[derive(Default)]
    struct FixedStats {
        counters: Option<VmCounters>,
        resident: Option<u64>,
        queries: usize,
    }

    impl HostStatistics for FixedStats {
        fn vm_counters(&mut self) -> Option<VmCounters> {
            self.queries += 1;
            self.counters
        }

        fn resident_size(&mut self) -> Option<u64> {
            self.resident
        }
    }

    #[test]
    fn classifies_to_nearest_tier() {
        assert_eq!(classify_ram_tier_gb(5_800 * MIB), 6);
        assert_eq!(classify_ram_tier_gb(3_700 * MIB), 4);
        assert_eq!(classify_ram_tier_gb(2 * GIB), 3);
        assert_eq!(classify_ram_tier_gb(64 * GIB), 16);
        assert_eq!(classify_ram_tier_gb(0), 3);
    }

    #[test]
    fn ties_go_to_lower_tier() {
        assert_eq!(classify_ram_tier_gb(5 * GIB), 4);
        assert_eq!(classify_ram_tier_gb(10 * GIB), 8);
        assert_eq!(classify_ram_tier_gb(14 * GIB), 12);
    }

    #[test]
    fn derived_fields_saturate() {
        let snapshot = MemorySnapshot {
            total_bytes: 4 * GIB,
            free_bytes: GIB,
            active_bytes: 100,
            inactive_bytes: 50,
            wired_bytes: 0,
            app_resident_bytes: 500,
        };
        assert_eq!(snapshot.used_bytes(), 3 * GIB);
        assert_eq!(snapshot.other_apps_bytes(), 0);
        assert!((snapshot.ram_tier_gb() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sampler_degrades_to_zeroed_fields() {
        let mut sampler = SnapshotSampler::new(FixedStats::default());
        let snapshot = sampler.sample();
        assert_eq!(snapshot.total_bytes, 3 * GIB);
        assert_eq!(snapshot.free_bytes, 0);
        assert_eq!(snapshot.app_resident_bytes, 0);
    }

    #[test]
    fn sampler_queries_counters_once_per_sample() {
        let mut sampler = SnapshotSampler::new(FixedStats {
            counters: Some(VmCounters {
                physical_bytes: 7_900 * MIB,
                ..VmCounters::default()
            }),
            ..FixedStats::default()
        });
        assert_eq!(sampler.sample().total_bytes, 8 * GIB);
        sampler.sample();
        assert_eq!(sampler.stats.queries, 2);
    }

    #[test]
    fn sampler_reports_counters() {
        let mut sampler = SnapshotSampler::new(FixedStats {
            counters: Some(VmCounters {
                physical_bytes: 12 * GIB,
                free_bytes: 2 * GIB,
                active_bytes: 3 * GIB,
                inactive_bytes: GIB,
                wired_bytes: GIB / 2,
            }),
            resident: Some(GIB),
            ..FixedStats::default()
        });
        let snapshot = sampler.sample();
        assert_eq!(snapshot.ram_tier_gb(), 12.0);
        assert_eq!(snapshot.used_bytes(), 10 * GIB);
        assert_eq!(snapshot.other_apps_bytes(), 3 * GIB);
    }
}
