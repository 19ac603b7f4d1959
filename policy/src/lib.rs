//! Chunk sizing for the allocation loop.
//!
//! Everything here is a pure function of the device class, the RAM tier and
//! the bytes already committed by the current run, so the whole policy can be
//! tested without touching the allocator.

use util::{DeviceClass, GIB, KIB, MIB};

/// Base chunk size for RAM tiers up to (and including) the given GiB bound.
struct TierBase {
    max_tier_gb: f64,
    base: u64,
}

/// Size picked once the committed fraction of the tier reaches `threshold`.
#[derive(Clone, Copy)]
enum Step {
    Fixed(u64),
    BaseDiv(u64),
}

struct Deceleration {
    threshold: f64,
    step: Step,
}

const fn tier(max_tier_gb: f64, base: u64) -> TierBase {
    TierBase { max_tier_gb, base }
}

const fn fixed(threshold: f64, size: u64) -> Deceleration {
    Deceleration {
        threshold,
        step: Step::Fixed(size),
    }
}

const fn base_div(threshold: f64, divisor: u64) -> Deceleration {
    Deceleration {
        threshold,
        step: Step::BaseDiv(divisor),
    }
}

const PHONE_BASES: &[TierBase] = &[
    tier(3.5, 32 * MIB),
    tier(4.5, 48 * MIB),
    tier(6.5, 64 * MIB),
    tier(8.5, 96 * MIB),
    tier(12.5, 128 * MIB),
];
const PHONE_LARGEST_BASE: u64 = 160 * MIB;

const TABLET_BASES: &[TierBase] = &[
    tier(3.5, 64 * MIB),
    tier(4.5, 96 * MIB),
    tier(6.5, 128 * MIB),
    tier(8.5, 192 * MIB),
    tier(12.5, 256 * MIB),
];
const TABLET_LARGEST_BASE: u64 = 384 * MIB;

// Ordered from the highest threshold down.
const PHONE_DECELERATION: &[Deceleration] = &[
    fixed(0.95, 256 * KIB),
    fixed(0.90, 512 * KIB),
    fixed(0.85, MIB),
    fixed(0.80, 2 * MIB),
    fixed(0.75, 4 * MIB),
    base_div(0.70, 8),
    base_div(0.60, 4),
    base_div(0.50, 2),
];

const TABLET_DECELERATION: &[Deceleration] = &[
    fixed(0.90, 4 * MIB),
    fixed(0.80, 16 * MIB),
    base_div(0.65, 4),
    base_div(0.50, 2),
];

const PHONE_FLOOR: u64 = 64 * KIB;
const TABLET_FLOOR: u64 = MIB;

/// Absorbs float error so a byte count that is meant to sit on a threshold
/// (e.g. 95% of a tier) is not classified just below it.
const THRESHOLD_TOLERANCE: f64 = 1e-9;

/// Retry sizes are kept on a KiB boundary.
const SHRINK_ALIGNMENT: u64 = KIB;

/// Smallest chunk the shrink-and-retry loop will attempt.
pub fn floor(class: DeviceClass) -> u64 {
    match class {
        DeviceClass::Phone => PHONE_FLOOR,
        DeviceClass::Tablet => TABLET_FLOOR,
    }
}

/// Full-speed chunk size for a tier, before any deceleration.
pub fn base_chunk_size(class: DeviceClass, ram_tier_gb: f64) -> u64 {
    let (table, largest) = match class {
        DeviceClass::Phone => (PHONE_BASES, PHONE_LARGEST_BASE),
        DeviceClass::Tablet => (TABLET_BASES, TABLET_LARGEST_BASE),
    };
    table
        .iter()
        .find(|entry| ram_tier_gb <= entry.max_tier_gb)
        .map(|entry| entry.base)
        .unwrap_or(largest)
}

/// Fraction of the tier already committed. A non-positive tier counts as full.
pub fn allocated_fraction(ram_tier_gb: f64, allocated_so_far: u64) -> f64 {
    let tier_bytes = ram_tier_gb * GIB as f64;
    if tier_bytes <= 0.0 {
        return 1.0;
    }
    allocated_so_far as f64 / tier_bytes
}

/// Size of the next chunk to commit.
///
/// Non-increasing in `allocated_so_far` and always within
/// `[floor(class), base_chunk_size(class, ram_tier_gb)]`.
pub fn next_chunk_size(class: DeviceClass, ram_tier_gb: f64, allocated_so_far: u64) -> u64 {
    let base = base_chunk_size(class, ram_tier_gb);
    let fraction = allocated_fraction(ram_tier_gb, allocated_so_far);
    let table = match class {
        DeviceClass::Phone => PHONE_DECELERATION,
        DeviceClass::Tablet => TABLET_DECELERATION,
    };

    let size = table
        .iter()
        .find(|entry| fraction + THRESHOLD_TOLERANCE >= entry.threshold)
        .map(|entry| match entry.step {
            Step::Fixed(size) => size,
            Step::BaseDiv(divisor) => base / divisor,
        })
        .unwrap_or(base);

    size.clamp(floor(class), base)
}

/// Next size to try after the host refused `size`.
///
/// Tablets halve; phones back off by roughly 1.2x. A step that would land
/// below the class floor lands on the floor instead, so the floor itself is
/// always tried. Returns `None` once `size` is already at the floor, which
/// ends the run.
pub fn shrink(class: DeviceClass, size: u64) -> Option<u64> {
    let floor = floor(class);
    if size <= floor {
        return None;
    }
    let shrunk = match class {
        DeviceClass::Tablet => size / 2,
        DeviceClass::Phone => size.saturating_mul(5) / 6,
    };
    let aligned = shrunk - shrunk % SHRINK_ALIGNMENT;
    Some(aligned.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TIERS: [f64; 6] = [3.0, 4.0, 6.0, 8.0, 12.0, 16.0];

    #[test]
    fn phone_four_gig_starts_at_base() {
        assert_eq!(next_chunk_size(DeviceClass::Phone, 4.0, 0), 48 * MIB);
    }

    #[test]
    fn phone_near_ceiling_uses_smallest_step() {
        let allocated = (3.8 * GIB as f64) as u64;
        assert_eq!(next_chunk_size(DeviceClass::Phone, 4.0, allocated), 256 * KIB);
    }

    #[test]
    fn tablet_bases_exceed_phone_bases() {
        for tier in TIERS {
            let tablet = base_chunk_size(DeviceClass::Tablet, tier);
            assert!(tablet > base_chunk_size(DeviceClass::Phone, tier), "tier {tier}");
        }
    }

    #[test]
    fn middle_range_uses_fraction_of_base() {
        let tier_bytes = 8 * GIB;
        let base = base_chunk_size(DeviceClass::Tablet, 8.0);
        assert_eq!(next_chunk_size(DeviceClass::Tablet, 8.0, tier_bytes / 2), base / 2);
        assert_eq!(
            next_chunk_size(DeviceClass::Tablet, 8.0, tier_bytes * 7 / 10),
            base / 4
        );
        assert_eq!(next_chunk_size(DeviceClass::Tablet, 8.0, tier_bytes), 4 * MIB);
    }

    #[test]
    fn overshooting_the_tier_stays_at_smallest_step() {
        assert_eq!(next_chunk_size(DeviceClass::Phone, 3.0, 5 * GIB), 256 * KIB);
        assert_eq!(next_chunk_size(DeviceClass::Tablet, 3.0, 5 * GIB), 4 * MIB);
    }

    #[test]
    fn tablet_shrink_halves_down_to_floor() {
        assert_eq!(shrink(DeviceClass::Tablet, 4 * MIB), Some(2 * MIB));
        assert_eq!(shrink(DeviceClass::Tablet, 2 * MIB), Some(MIB));
        assert_eq!(shrink(DeviceClass::Tablet, 3 * MIB / 2), Some(MIB));
        assert_eq!(shrink(DeviceClass::Tablet, MIB), None);
    }

    #[test]
    fn phone_shrink_backs_off_gently() {
        assert_eq!(shrink(DeviceClass::Phone, 48 * MIB), Some(40 * MIB));
        let next = shrink(DeviceClass::Phone, 100 * KIB).unwrap();
        assert_eq!(next, 83 * KIB);
        assert_eq!(shrink(DeviceClass::Phone, 70 * KIB), Some(64 * KIB));
        assert_eq!(shrink(DeviceClass::Phone, 64 * KIB), None);
    }

    #[test]
    fn shrink_sequence_ends_on_the_floor() {
        for class in [DeviceClass::Phone, DeviceClass::Tablet] {
            let mut size = base_chunk_size(class, 16.0);
            let mut steps = 0;
            while let Some(next) = shrink(class, size) {
                assert!(next < size);
                assert!(next >= floor(class));
                size = next;
                steps += 1;
            }
            assert!(steps > 0);
            assert_eq!(size, floor(class));
        }
    }

    #[test]
    fn below_floor_sizes_do_not_shrink() {
        assert_eq!(shrink(DeviceClass::Tablet, 512 * KIB), None);
        assert_eq!(shrink(DeviceClass::Phone, 0), None);
    }

    fn class_strategy() -> impl Strategy<Value = DeviceClass> {
        prop_oneof![Just(DeviceClass::Phone), Just(DeviceClass::Tablet)]
    }

    proptest! {
        #[test]
        fn chunk_size_never_grows(
            class in class_strategy(),
            tier_index in 0usize..TIERS.len(),
            a in 0u64..(20 * GIB),
            b in 0u64..(20 * GIB),
        ) {
            let tier = TIERS[tier_index];
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(next_chunk_size(class, tier, high) <= next_chunk_size(class, tier, low));
        }

        #[test]
        fn chunk_size_within_bounds(
            class in class_strategy(),
            tier_index in 0usize..TIERS.len(),
            allocated in 0u64..(20 * GIB),
        ) {
            let tier = TIERS[tier_index];
            let size = next_chunk_size(class, tier, allocated);
            prop_assert!(size >= floor(class));
            prop_assert!(size <= base_chunk_size(class, tier));
        }
    }
}
