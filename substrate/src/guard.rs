use std::ptr::NonNull;

use crate::{
    node::{NodeKind, classify},
    runtime::Runtime,
    stub::StubRef,
};

/// One entry of the guard stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Guard {
    pub ptr: NonNull<u8>,
    pub kind: NodeKind,
}

/// Addresses kept alive across collections until explicitly popped.
#[derive(Debug, Default)]
pub(crate) struct GuardStack {
    entries: Vec<Guard>,
}

impl GuardStack {
    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Guard> {
        self.entries.iter()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.entries.truncate(depth);
    }
}

impl Runtime {
    /// Protect the stub or cell at `ptr` from collection until the matching
    /// [`pop_guard`](Self::pop_guard).
    ///
    /// # Safety
    /// `ptr` must point at a live stub or cell that stays valid until it is
    /// popped.
    pub unsafe fn push_guard(&mut self, ptr: NonNull<u8>) {
        // SAFETY: caller contract
        let kind = unsafe { classify(ptr.as_ptr()) };
        if self.settings.checked {
            assert!(
                matches!(kind, NodeKind::HeapObject | NodeKind::Cell),
                "guarding {ptr:p}, which is {kind:?}, not a node"
            );
        }
        self.guards.entries.push(Guard { ptr, kind });
    }

    /// Drop the most recent guard, which must be `ptr`.
    pub fn pop_guard(&mut self, ptr: NonNull<u8>) {
        let top = self.guards.entries.pop();
        if self.settings.checked {
            let Some(top) = top else {
                panic!("popping guard {ptr:p} from an empty guard stack");
            };
            assert_eq!(
                top.ptr, ptr,
                "guard LIFO violation: popped {ptr:p} but {:p} was pushed last",
                top.ptr
            );
        }
    }

    pub fn push_guard_stub(&mut self, stub: StubRef) {
        assert!(self.is_live(stub), "guarding dead stub {stub:?}");
        // SAFETY: a guarded stub is never swept
        unsafe { self.push_guard(stub.as_unit()) };
    }

    pub fn pop_guard_stub(&mut self, stub: StubRef) {
        self.pop_guard(stub.as_unit());
    }

    #[inline(always)]
    pub fn guard_depth(&self) -> usize {
        self.guards.depth()
    }
}
