//! Non-moving mark-and-sweep collector.
//!
//! Every stub allocation consumes one unit of ballast. When the ballast
//! runs out a collection is requested and runs at the next
//! [`Runtime::safepoint`]; [`Runtime::recycle`] collects immediately.
//!
//! Marking starts from the root table, manual stubs, the guard stack, the
//! levels, the occupied part of the value stack, live API cells and an
//! optional [`RootProvider`]. Children are found through a [`TraceFn`] and
//! queued instead of recursed into. Sweeping walks the stub pool and frees
//! every managed, unmarked, non-root stub.

use std::mem;

use crate::{
    cell::Cell,
    node::{FREE_BYTE, NodeFlags, NodeKind},
    pool::{CELL_POOL, STUB_POOL},
    runtime::Runtime,
    stub::{Stub, StubRef},
};

/// Reports every stub directly reachable from `stub`.
pub type TraceFn = fn(stub: &Stub, visit: &mut dyn FnMut(StubRef));

/// A root handed to the collector by a [`RootProvider`].
#[derive(Debug, Clone, Copy)]
pub enum Root<'a> {
    Stub(StubRef),
    Cell(&'a Cell),
}

/// Supplies roots the runtime cannot see on its own, such as frames of a
/// suspended evaluator.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Root<'_>));
}

struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(Root<'_>)) {}
}

/// Flavor-directed tracing used unless [`Runtime::set_tracer`] replaces it.
pub fn trace_stub(stub: &Stub, visit: &mut dyn FnMut(StubRef)) {
    let flavor = stub.flavor();
    if flavor.holds_cells() {
        for cell in stub.cells() {
            cell.for_each_node(visit);
        }
    } else if flavor.holds_pointers() {
        for &pointer in stub.pointers().iter().flatten() {
            visit(pointer);
        }
    }
    if let Some(link) = stub.link().filter(|_| flavor.link_is_node()) {
        visit(link);
    }
    if let Some(misc) = stub.misc().filter(|_| flavor.misc_is_node()) {
        visit(misc);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub last_marked: usize,
    pub last_swept: usize,
    pub total_swept: usize,
}

pub(crate) struct GcState {
    ballast: usize,
    pending: bool,
    disabled: usize,
    queue: Vec<StubRef>,
    scratch: Vec<StubRef>,
    stats: GcStats,
    tracer: TraceFn,
}

impl GcState {
    pub(crate) fn new(ballast: usize) -> Self {
        Self {
            ballast,
            pending: false,
            disabled: 0,
            queue: Vec::new(),
            scratch: Vec::new(),
            stats: GcStats::default(),
            tracer: trace_stub,
        }
    }

    #[inline(always)]
    pub(crate) fn consume_ballast(&mut self) {
        self.ballast = self.ballast.saturating_sub(1);
        if self.ballast == 0 {
            self.pending = true;
        }
    }
}

struct Marker<'q> {
    queue: &'q mut Vec<StubRef>,
    marked: usize,
    checked: bool,
}

impl Marker<'_> {
    fn mark(&mut self, stub: StubRef) {
        let tag_ptr = stub.as_ptr().cast::<u8>();
        // SAFETY: roots and traced edges point into the stub pool
        let byte = unsafe { *tag_ptr };
        if self.checked {
            assert_ne!(byte, FREE_BYTE, "marking freed stub {stub:?}");
        }
        let tag = NodeFlags::from_byte(byte);
        if tag.contains(NodeFlags::MARKED) {
            return;
        }
        // SAFETY: only the tag byte is written
        unsafe { *tag_ptr = (tag | NodeFlags::MARKED).bits() };

        if self.queue.try_reserve(1).is_err() {
            log::error!("mark queue exhausted after {} stubs", self.marked);
            panic!("mark queue exhausted");
        }
        self.queue.push(stub);
        self.marked += 1;
    }

    fn mark_cell(&mut self, cell: &Cell) {
        cell.for_each_node(&mut |stub| self.mark(stub));
    }
}

impl Runtime {
    /// Replace the function used to find the children of a stub.
    pub fn set_tracer(&mut self, tracer: TraceFn) {
        self.gc.tracer = tracer;
    }

    #[inline(always)]
    pub fn gc_pending(&self) -> bool {
        self.gc.pending
    }

    #[inline(always)]
    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats
    }

    /// Suppress collections until the matching [`enable_gc`](Self::enable_gc).
    /// Calls nest.
    pub fn disable_gc(&mut self) {
        self.gc.disabled += 1;
    }

    pub fn enable_gc(&mut self) {
        assert!(self.gc.disabled > 0, "enable_gc without matching disable_gc");
        self.gc.disabled -= 1;
    }

    /// Collect if the ballast ran out. Returns whether a collection ran.
    pub fn safepoint(&mut self) -> bool {
        self.safepoint_with(&mut NoRoots)
    }

    pub fn safepoint_with(&mut self, extra: &mut dyn RootProvider) -> bool {
        if !self.gc.pending {
            return false;
        }
        self.recycle_with(extra)
    }

    /// Collect now, unless collections are disabled.
    pub fn recycle(&mut self) -> bool {
        self.recycle_with(&mut NoRoots)
    }

    pub fn recycle_with(&mut self, extra: &mut dyn RootProvider) -> bool {
        if self.gc.disabled > 0 {
            log::debug!("collection skipped, disabled {} times", self.gc.disabled);
            return false;
        }

        let mut queue = mem::take(&mut self.gc.queue);
        let mut children = mem::take(&mut self.gc.scratch);
        let mut marker = Marker {
            queue: &mut queue,
            marked: 0,
            checked: self.settings.checked,
        };

        self.mark_roots(&mut marker, extra);

        let tracer = self.gc.tracer;
        while let Some(stub) = marker.queue.pop() {
            // SAFETY: only live stubs are queued
            tracer(unsafe { stub.as_ref() }, &mut |child| children.push(child));
            for child in children.drain(..) {
                marker.mark(child);
            }
        }
        let marked = marker.marked;
        self.gc.queue = queue;
        self.gc.scratch = children;

        let swept = self.sweep();

        let stats = &mut self.gc.stats;
        stats.collections += 1;
        stats.last_marked = marked;
        stats.last_swept = swept;
        stats.total_swept += swept;
        self.gc.ballast = self.settings.ballast;
        self.gc.pending = false;

        log::debug!(
            "collection {}: marked {marked}, swept {swept}, {} bytes in use",
            stats.collections,
            self.pools.mem_usage()
        );
        true
    }

    fn mark_roots(&self, marker: &mut Marker<'_>, extra: &mut dyn RootProvider) {
        for &stub in self.roots.values() {
            marker.mark(stub);
        }

        // contents of manual stubs stay reachable while they are built up
        for &stub in &self.manuals {
            marker.mark(stub);
        }

        for guard in self.guards.iter() {
            match guard.kind {
                NodeKind::HeapObject => {
                    marker.mark(StubRef::from_unit(guard.ptr));
                }
                NodeKind::Cell => {
                    // SAFETY: guarded cells stay valid until popped
                    marker.mark_cell(unsafe { guard.ptr.cast::<Cell>().as_ref() });
                }
                NodeKind::ForeignText | NodeKind::Free | NodeKind::End => {}
            }
        }

        for level in &self.levels {
            level.for_each_node(&mut |stub| marker.mark(stub));
        }

        for cell in self.stack.occupied() {
            marker.mark_cell(cell);
        }

        for span in self.pools.segment_spans(CELL_POOL) {
            for unit in span.iter() {
                // SAFETY: segments stay allocated for the runtime's lifetime
                if unsafe { *unit.as_ptr() } == FREE_BYTE {
                    continue;
                }
                // SAFETY: live units of the cell pool are API cells
                marker.mark_cell(unsafe { unit.cast::<Cell>().as_ref() });
            }
        }

        extra.visit_roots(&mut |root| match root {
            Root::Stub(stub) => marker.mark(stub),
            Root::Cell(cell) => marker.mark_cell(cell),
        });
    }

    fn sweep(&mut self) -> usize {
        let mut swept = 0;
        for span in self.pools.segment_spans(STUB_POOL) {
            for unit in span.iter() {
                let stub = StubRef::from_unit(unit);
                // SAFETY: segments stay allocated for the runtime's lifetime
                let byte = unsafe { stub.raw_tag() };
                if byte == FREE_BYTE {
                    continue;
                }
                let tag = NodeFlags::from_byte(byte);
                if tag.contains(NodeFlags::MARKED) {
                    // SAFETY: live unit, no outstanding borrows during sweep
                    unsafe { stub.as_mut() }.set_tag(tag - NodeFlags::MARKED);
                } else if tag.contains(NodeFlags::MANAGED) && !tag.contains(NodeFlags::ROOT) {
                    self.free_stub(stub);
                    swept += 1;
                }
            }
        }
        swept
    }
}
