use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::{HostStatistics, VmCounters};

const MEMINFO_PATH: &str = "/proc/meminfo";
const STATUS_PATH: &str = "/proc/self/status";
const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Linux host statistics read from procfs.
///
/// Buffers are kept between samples so a sample does not allocate once warm.
#[derive(Debug)]
pub struct ProcStatistics {
    meminfo_path: PathBuf,
    status_path: PathBuf,
    meminfo_buffer: Vec<u8>,
    status_buffer: Vec<u8>,
}

impl ProcStatistics {
    pub fn new() -> Self {
        Self::with_paths(MEMINFO_PATH, STATUS_PATH)
    }

    /// Reads from alternative files laid out like `/proc/meminfo` and
    /// `/proc/self/status`.
    pub fn with_paths(meminfo: impl Into<PathBuf>, status: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo.into(),
            status_path: status.into(),
            meminfo_buffer: Vec::with_capacity(4096),
            status_buffer: Vec::with_capacity(2048),
        }
    }

    /// Parses `/proc/meminfo` once; every counter in a sample comes from the
    /// same read.
    fn meminfo(&mut self) -> Option<Meminfo> {
        match read_to_buffer(&self.meminfo_path, &mut self.meminfo_buffer) {
            Ok(bytes) => Some(parse_meminfo(bytes)),
            Err(err) => {
                tracing::debug!(path = %self.meminfo_path.display(), %err, "meminfo unavailable");
                None
            }
        }
    }
}

impl Default for ProcStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStatistics for ProcStatistics {
    fn vm_counters(&mut self) -> Option<VmCounters> {
        let info = self.meminfo()?;
        Some(VmCounters {
            physical_bytes: info.total.unwrap_or(0),
            free_bytes: info.free.unwrap_or(0),
            active_bytes: info.active.unwrap_or(0),
            inactive_bytes: info.inactive.unwrap_or(0),
            wired_bytes: info
                .unevictable
                .unwrap_or(0)
                .saturating_add(info.mlocked.unwrap_or(0)),
        })
    }

    fn resident_size(&mut self) -> Option<u64> {
        let bytes = read_to_buffer(&self.status_path, &mut self.status_buffer).ok()?;
        find_kb_field(bytes, b"VmRSS:")
    }
}

/// Kernel release string, or the target OS name when procfs is unavailable.
pub fn os_version() -> String {
    let mut buffer = Vec::with_capacity(64);
    read_to_buffer(Path::new(OSRELEASE_PATH), &mut buffer)
        .ok()
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .map(str::trim)
        .filter(|release| !release.is_empty())
        .map(|release| format!("{} {release}", std::env::consts::OS))
        .unwrap_or_else(|| std::env::consts::OS.to_owned())
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
struct Meminfo {
    total: Option<u64>,
    free: Option<u64>,
    active: Option<u64>,
    inactive: Option<u64>,
    unevictable: Option<u64>,
    mlocked: Option<u64>,
}

fn parse_meminfo(bytes: &[u8]) -> Meminfo {
    let mut info = Meminfo::default();
    for line in bytes.split(|b| *b == b'\n') {
        let slot = if line.starts_with(b"MemTotal:") {
            &mut info.total
        } else if line.starts_with(b"MemFree:") {
            &mut info.free
        } else if line.starts_with(b"Active:") {
            &mut info.active
        } else if line.starts_with(b"Inactive:") {
            &mut info.inactive
        } else if line.starts_with(b"Unevictable:") {
            &mut info.unevictable
        } else if line.starts_with(b"Mlocked:") {
            &mut info.mlocked
        } else {
            continue;
        };
        if slot.is_none() {
            *slot = parse_kb_value(line).map(|v| v.saturating_mul(1024));
        }
    }
    info
}

fn find_kb_field(bytes: &[u8], key: &[u8]) -> Option<u64> {
    bytes
        .split(|b| *b == b'\n')
        .find(|line| line.starts_with(key))
        .and_then(parse_kb_value)
        .map(|v| v.saturating_mul(1024))
}

fn read_to_buffer<'a>(path: &Path, buffer: &'a mut Vec<u8>) -> io::Result<&'a [u8]> {
    buffer.clear();
    let mut file = File::open(path)?;
    file.read_to_end(buffer)?;
    Ok(buffer.as_slice())
}

fn parse_kb_value(line: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut saw_digit = false;
    for byte in line.iter().copied() {
        if byte.is_ascii_digit() {
            saw_digit = true;
            value = value
                .saturating_mul(10)
                .saturating_add((byte - b'0') as u64);
        } else if saw_digit {
            break;
        }
    }
    if saw_digit {
        Some(value)
    } else {
        None
    }
}
