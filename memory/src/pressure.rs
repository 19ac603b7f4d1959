use crate::MemorySnapshot;

/// Coarse memory pressure signal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MemoryPressure {
    Low,
    Moderate,
    Severe,
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::Low
    }
}

/// Pressure thresholds expressed as headroom per-mille (0-1000).
///
/// - Moderate starts below 20% headroom. This is where Linux reclaim activity is common.
/// - Severe starts below 10% headroom, where the OOM killer is close.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressureThresholds {
    pub moderate_headroom_per_mille: u16,
    pub severe_headroom_per_mille: u16,
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            moderate_headroom_per_mille: 200,
            severe_headroom_per_mille: 100,
        }
    }
}

impl MemorySnapshot {
    /// Free memory relative to the classified tier, in per-mille.
    ///
    /// Returns `None` when the tier is unknown.
    pub fn headroom_per_mille(&self) -> Option<u16> {
        headroom_per_mille(self.free_bytes, self.total_bytes)
    }

    /// Maps the snapshot's headroom onto a pressure level. A snapshot without
    /// usable counters reports `Low`; telemetry never escalates on missing data.
    pub fn pressure(&self, thresholds: &MemoryPressureThresholds) -> MemoryPressure {
        if self.free_bytes == 0 && self.active_bytes == 0 && self.inactive_bytes == 0 {
            return MemoryPressure::Low;
        }
        self.headroom_per_mille()
            .map(|headroom| map_headroom_per_mille(headroom, thresholds))
            .unwrap_or_default()
    }
}

pub(crate) fn map_headroom_per_mille(
    headroom_per_mille: u16,
    thresholds: &MemoryPressureThresholds,
) -> MemoryPressure {
    if headroom_per_mille <= thresholds.severe_headroom_per_mille {
        MemoryPressure::Severe
    } else if headroom_per_mille <= thresholds.moderate_headroom_per_mille {
        MemoryPressure::Moderate
    } else {
        MemoryPressure::Low
    }
}

pub(crate) fn headroom_per_mille(available: u64, total: u64) -> Option<u16> {
    if total == 0 {
        return None;
    }
    let ratio = available.saturating_mul(1000) / total;
    Some(ratio.min(1000) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::GIB;

    #[test]
    fn maps_headroom_to_pressure() {
        let thresholds = MemoryPressureThresholds::default();

        assert_eq!(map_headroom_per_mille(250, &thresholds), MemoryPressure::Low);
        assert_eq!(map_headroom_per_mille(150, &thresholds), MemoryPressure::Moderate);
        assert_eq!(map_headroom_per_mille(100, &thresholds), MemoryPressure::Severe);
        assert_eq!(map_headroom_per_mille(5, &thresholds), MemoryPressure::Severe);
    }

    #[test]
    fn headroom_is_capped_and_guarded() {
        assert_eq!(headroom_per_mille(10, 0), None);
        assert_eq!(headroom_per_mille(8 * GIB, 4 * GIB), Some(1000));
        assert_eq!(headroom_per_mille(GIB, 4 * GIB), Some(250));
    }

    #[test]
    fn snapshot_pressure_follows_free_memory() {
        let snapshot = MemorySnapshot {
            total_bytes: 4 * GIB,
            free_bytes: GIB / 4,
            active_bytes: 2 * GIB,
            ..MemorySnapshot::default()
        };
        assert_eq!(
            snapshot.pressure(&MemoryPressureThresholds::default()),
            MemoryPressure::Severe
        );
        assert_eq!(
            MemorySnapshot::default().pressure(&MemoryPressureThresholds::default()),
            MemoryPressure::Low
        );
    }
}
