use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Converts a byte count to GiB as a float.
pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

/// Converts GiB to bytes, truncating any fractional byte.
pub fn gib_to_bytes(gib: f64) -> u64 {
    if gib <= 0.0 {
        return 0;
    }
    (gib * GIB as f64) as u64
}

/// Formats a byte count with the largest binary unit that keeps it above one.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2} GiB", bytes_to_gib(bytes))
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Form factor of the device under test.
///
/// Chunk sizing and backoff differ between the two: phones get smaller
/// chunks and finer pacing near the ceiling.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Phone,
    Tablet,
}

impl Default for DeviceClass {
    fn default() -> Self {
        Self::Tablet
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phone => write!(f, "Phone"),
            Self::Tablet => write!(f, "Tablet"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unknown device class `{0}` (expected phone or tablet)")]
pub struct UnknownDeviceClass(pub String);

impl FromStr for DeviceClass {
    type Err = UnknownDeviceClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phone" => Ok(Self::Phone),
            "tablet" => Ok(Self::Tablet),
            _ => Err(UnknownDeviceClass(s.to_owned())),
        }
    }
}
