use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Freelist link terminator.
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Reserved,
    Free,
    Allocated,
}

/// One record per physical frame, indexed by PFN.
///
/// `state`, `order` and the freelist links are guarded by the allocator's
/// zone lock; only the leader frame of a free block carries `Free` state and
/// the block order. The refcount and dirty bit are shared with mappers and
/// the page cache and are atomic.
pub struct Frame {
    state: Cell<FrameState>,
    order: Cell<u8>,
    prev: Cell<u32>,
    next: Cell<u32>,
    refcount: AtomicU32,
    dirty: AtomicBool,
}

// SAFETY: the Cell fields are only accessed with the zone lock held.
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            state: Cell::new(FrameState::Reserved),
            order: Cell::new(0),
            prev: Cell::new(NIL),
            next: Cell::new(NIL),
            refcount: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state.get()
    }

    pub fn order(&self) -> u32 {
        self.order.get() as u32
    }

    pub fn refcount(&self) -> &AtomicU32 {
        &self.refcount
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: FrameState) {
        self.state.set(state);
    }

    pub(crate) fn set_order(&self, order: u32) {
        self.order.set(order as u8);
    }

    pub(crate) fn prev(&self) -> u32 {
        self.prev.get()
    }

    pub(crate) fn next(&self) -> u32 {
        self.next.get()
    }

    pub(crate) fn set_prev(&self, prev: u32) {
        self.prev.set(prev);
    }

    pub(crate) fn set_next(&self, next: u32) {
        self.next.set(next);
    }

    pub(crate) fn link_init(&self) {
        self.prev.set(NIL);
        self.next.set(NIL);
    }
}
