use log::warn;

use crate::frame::{Frame, FrameState, NIL};

/// Orders 0..=MAX_ORDER; 2^MAX_ORDER frames is the largest block tracked.
pub const MAX_ORDER: u32 = 25;
pub(crate) const AREAS: usize = MAX_ORDER as usize + 1;

pub(crate) fn order_of(nframes: usize) -> u32 {
    assert!(nframes > 0);
    if nframes == 1 {
        0
    } else {
        usize::BITS - (nframes - 1).leading_zeros()
    }
}

/// Per-order freelists threaded through the frame table. Heads and links are
/// PFN indices; each list is kept sorted by ascending PFN so allocation is
/// deterministic.
pub(crate) struct Zone {
    heads: [u32; AREAS],
    count: [usize; AREAS],
}

impl Zone {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [NIL; AREAS],
            count: [0; AREAS],
        }
    }

    pub(crate) fn head(&self, order: u32) -> Option<usize> {
        let head = self.heads[order as usize];
        (head != NIL).then_some(head as usize)
    }

    pub(crate) fn free_blocks(&self, order: u32) -> usize {
        self.count[order as usize]
    }

    fn insert(&mut self, frames: &[Frame], order: u32, pfn: usize) {
        let frame = &frames[pfn];
        debug_assert!(frame.prev() == NIL && frame.next() == NIL);

        frame.set_state(FrameState::Free);
        frame.set_order(order);

        let mut prev = NIL;
        let mut node = self.heads[order as usize];
        while node != NIL && (node as usize) < pfn {
            prev = node;
            node = frames[node as usize].next();
        }

        frame.set_prev(prev);
        frame.set_next(node);
        if prev == NIL {
            self.heads[order as usize] = pfn as u32;
        } else {
            frames[prev as usize].set_next(pfn as u32);
        }
        if node != NIL {
            frames[node as usize].set_prev(pfn as u32);
        }
        self.count[order as usize] += 1;
    }

    fn remove(&mut self, frames: &[Frame], pfn: usize) {
        let frame = &frames[pfn];
        assert_eq!(frame.state(), FrameState::Free);

        let order = frame.order() as usize;
        let (prev, next) = (frame.prev(), frame.next());
        if prev == NIL {
            assert_eq!(self.heads[order], pfn as u32);
            self.heads[order] = next;
        } else {
            frames[prev as usize].set_next(next);
        }
        if next != NIL {
            frames[next as usize].set_prev(prev);
        }
        frame.link_init();
        self.count[order] -= 1;
    }

    /// Seed `[start, start + nframes)` with the largest blocks that fit,
    /// recursing into lower orders for the trailing remainder.
    pub(crate) fn populate(
        &mut self,
        frames: &[Frame],
        mut start: usize,
        mut nframes: usize,
        top_order: u32,
    ) {
        let mut order = top_order;
        loop {
            let step = 1usize << order;
            while nframes >= step {
                frames[start].link_init();
                self.insert(frames, order, start);
                start += step;
                nframes -= step;
            }
            if nframes == 0 {
                break;
            }
            order -= 1;
        }
    }

    /// Split one block of `order` into two halves one order down.
    fn break_this_pfn(&mut self, frames: &[Frame], pfn: usize, order: u32) {
        assert!(order > 0);
        let frame = &frames[pfn];
        assert_eq!(frame.state(), FrameState::Free);
        self.remove(frames, pfn);

        let half = pfn + (1usize << (order - 1));
        frames[half].link_init();

        self.insert(frames, order - 1, pfn);
        self.insert(frames, order - 1, half);
    }

    /// Refill `order - 1` by splitting a block at `order`, pulling from even
    /// higher orders if needed.
    fn break_the_order(&mut self, frames: &[Frame], order: u32) {
        if order > MAX_ORDER {
            return;
        }
        if self.heads[order as usize] == NIL {
            self.break_the_order(frames, order + 1);
        }
        let head = self.heads[order as usize];
        if head == NIL {
            return; // out of memory
        }
        self.break_this_pfn(frames, head as usize, order);
    }

    /// Carve exactly `[start, start + nframes)` out of the freelists, marking
    /// consumed block leaders with `state`. An already-`Reserved` frame at
    /// order 0 is skipped when reserving, so overlapping reservations are
    /// tolerated.
    fn extract_exact_range(
        &mut self,
        frames: &[Frame],
        mut start: usize,
        mut nframes: usize,
        state: FrameState,
    ) {
        let mut last_nframes = 0;

        while nframes > 0 {
            if last_nframes == nframes {
                let frame = &frames[start];
                if state == FrameState::Reserved && frame.state() == FrameState::Reserved {
                    assert_eq!(frame.order(), 0);
                    start += 1;
                    nframes -= 1;
                    continue;
                }
                panic!("buddy: no progress extracting {} frames at pfn {:#x}", nframes, start);
            }
            last_nframes = nframes;

            for order in (0..=MAX_ORDER).rev() {
                let mut node = self.heads[order as usize];
                while node != NIL {
                    let block_start = node as usize;
                    let block_end = block_start + (1usize << order) - 1;
                    let next = frames[block_start].next();

                    if block_start == start {
                        if (1usize << order) <= nframes {
                            self.remove(frames, block_start);
                            frames[block_start].set_state(state);
                            frames[block_start].set_order(0);
                            nframes -= 1usize << order;
                            start += 1usize << order;
                        } else {
                            // Narrow down so a later pass finds an exact fit.
                            self.break_this_pfn(frames, block_start, order);
                        }
                        break;
                    }

                    if block_start < start && block_end >= start {
                        self.break_this_pfn(frames, block_start, order);
                        break;
                    }

                    node = next;
                }

                if nframes == 0 {
                    break;
                }
            }
        }
    }

    /// True when `n` contiguous frames starting at the free block leader
    /// `start` are covered by free blocks.
    fn run_available(&self, frames: &[Frame], start: usize, n: usize) -> bool {
        let end = start + n;
        let mut pos = start;
        while pos < end {
            if pos >= frames.len() {
                return false;
            }
            let frame = &frames[pos];
            if frame.state() != FrameState::Free {
                return false;
            }
            pos += 1usize << frame.order();
        }
        true
    }

    fn lowest_leader(&self, frames: &[Frame], above: Option<usize>) -> Option<usize> {
        let mut best = None;
        for order in 0..=MAX_ORDER {
            let mut node = self.heads[order as usize];
            while node != NIL {
                let pfn = node as usize;
                if above.map_or(true, |a| pfn > a) {
                    if best.map_or(true, |b| pfn < b) {
                        best = Some(pfn);
                    }
                    break; // lists are sorted, the rest is larger
                }
                node = frames[pfn].next();
            }
        }
        best
    }

    /// Allocate exactly `n` contiguous frames at the lowest possible PFN.
    ///
    /// Consumed frames are left `Allocated` at order 0 so they can be freed
    /// individually.
    pub(crate) fn alloc_exact(&mut self, frames: &[Frame], n: usize) -> Option<usize> {
        let order = order_of(n);
        if order > MAX_ORDER {
            return None;
        }

        if self.heads[order as usize] == NIL {
            self.break_the_order(frames, order + 1);
        }
        if self.heads[order as usize] == NIL {
            warn!("buddy: out of memory allocating {} frames", n);
            return None;
        }

        let mut candidate = self.lowest_leader(frames, None)?;
        while !self.run_available(frames, candidate, n) {
            candidate = self.lowest_leader(frames, Some(candidate))?;
        }

        self.extract_exact_range(frames, candidate, n, FrameState::Allocated);

        for pfn in candidate..candidate + n {
            let frame = &frames[pfn];
            frame.set_state(FrameState::Allocated);
            frame.set_order(0);
            frame.set_dirty(false);
        }

        Some(candidate)
    }

    pub(crate) fn reserve(&mut self, frames: &[Frame], start: usize, nframes: usize) {
        self.extract_exact_range(frames, start, nframes, FrameState::Reserved);
        for pfn in start..start + nframes {
            let frame = &frames[pfn];
            frame.set_state(FrameState::Reserved);
            frame.set_order(0);
        }
    }

    /// Free one frame and merge it with its buddies as far as possible.
    pub(crate) fn free_one(&mut self, frames: &[Frame], pfn: usize) {
        let frame = &frames[pfn];
        assert_eq!(
            frame.state(),
            FrameState::Allocated,
            "freeing pfn {:#x} which is not allocated",
            pfn
        );
        assert_eq!(frame.refcount().load(core::sync::atomic::Ordering::Relaxed), 0);
        frame.set_state(FrameState::Free);
        frame.set_dirty(false);

        let mut pfn = pfn;
        let mut order = 0;

        while order < MAX_ORDER {
            let buddy = pfn ^ (1usize << order);
            if buddy >= frames.len() {
                break;
            }

            let buddy_frame = &frames[buddy];
            if buddy_frame.state() != FrameState::Free || buddy_frame.order() != order {
                break;
            }

            self.remove(frames, buddy);

            // The higher half stops being a block leader.
            let (leader, absorbed) = if pfn < buddy { (pfn, buddy) } else { (buddy, pfn) };
            frames[absorbed].set_state(FrameState::Reserved);
            frames[leader].set_state(FrameState::Free);

            pfn = leader;
            order += 1;
        }

        frames[pfn].set_state(FrameState::Free);
        self.insert(frames, order, pfn);
    }
}
