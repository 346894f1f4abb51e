use core::sync::atomic::{AtomicUsize, Ordering};

/// Global memory usage counters, in pages.
#[derive(Clone, Copy)]
pub enum MemUsage {
    PageTable = 0,
    PageCache = 1,
    Dma = 2,
}

static COUNTERS: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

pub fn inc(usage: MemUsage) {
    COUNTERS[usage as usize].fetch_add(1, Ordering::Relaxed);
}

pub fn dec(usage: MemUsage) {
    COUNTERS[usage as usize].fetch_sub(1, Ordering::Relaxed);
}

pub fn count(usage: MemUsage) -> usize {
    COUNTERS[usage as usize].load(Ordering::Relaxed)
}
