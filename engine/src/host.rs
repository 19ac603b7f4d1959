/// Host memory primitives used by the allocation loop.
///
/// `commit` returning `None` is the host declining the request; it is the
/// normal end signal of a run, not an error.
pub trait HostMemory: Send + 'static {
    /// Opaque handle to a committed region.
    type Region: Send + 'static;

    fn commit(&mut self, size: u64) -> Option<Self::Region>;

    /// Forces every page of the region to become resident.
    fn touch(&mut self, region: &mut Self::Region);

    fn release(&mut self, region: Self::Region);
}

/// Region obtained from the process heap.
#[derive(Debug)]
pub struct HeapRegion {
    bytes: Vec<u8>,
    len: usize,
}

impl HeapRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Commits memory from the global allocator with fallible reservation.
///
/// An optional ceiling makes the heap refuse requests that would take the
/// committed total past it, which bounds a run on shared machines.
#[derive(Debug, Default)]
pub struct SystemHeap {
    ceiling: Option<u64>,
    committed: u64,
}

impl SystemHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ceiling(ceiling: u64) -> Self {
        Self {
            ceiling: Some(ceiling),
            committed: 0,
        }
    }

    /// Bytes currently held by live regions.
    pub fn committed(&self) -> u64 {
        self.committed
    }
}

impl HostMemory for SystemHeap {
    type Region = HeapRegion;

    fn commit(&mut self, size: u64) -> Option<HeapRegion> {
        if size == 0 {
            return None;
        }
        if let Some(ceiling) = self.ceiling {
            if self.committed.saturating_add(size) > ceiling {
                return None;
            }
        }
        let len = usize::try_from(size).ok()?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).ok()?;
        self.committed += size;
        Some(HeapRegion { bytes, len })
    }

    fn touch(&mut self, region: &mut HeapRegion) {
        region.bytes.resize(region.len, 0);
        std::hint::black_box(region.bytes.as_slice());
    }

    fn release(&mut self, region: HeapRegion) {
        self.committed = self.committed.saturating_sub(region.len as u64);
        drop(region);
    }
}
