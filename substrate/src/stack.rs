//! The transient value stack.
//!
//! Scratch cells for operations that collect or build several values.
//! Depth only moves through [`Runtime::stack_push`], [`Runtime::stack_drop`]
//! and [`Runtime::stack_rewind`]; storage grows at the tail in chunks of
//! `stack_chunk` cells, so references into the stack must not be held
//! across a push. [`ExtantPtr`] is the checked way to do that anyway.

use std::{ops::Deref, ptr::NonNull, rc::Rc};

use crate::{Error, Result, cell::Cell, node::NodeFlags, runtime::Runtime, stub::StubRef};

/// A recorded stack depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackIndex(pub(crate) usize);

impl StackIndex {
    #[inline(always)]
    pub fn depth(self) -> usize {
        self.0
    }
}

pub(crate) struct ValueStack {
    cells: Vec<Cell>,
    depth: usize,
    chunk: usize,
    extant: Rc<std::cell::Cell<usize>>,
    checked: bool,
}

impl ValueStack {
    pub fn new(chunk: usize, checked: bool) -> Self {
        Self {
            cells: Vec::new(),
            depth: 0,
            chunk,
            extant: Rc::new(std::cell::Cell::new(0)),
            checked,
        }
    }

    #[inline(always)]
    fn check_no_extant(&self, op: &str) {
        if self.checked {
            assert_eq!(
                self.extant.get(),
                0,
                "stack {op} while extant pointers are outstanding"
            );
        }
    }

    pub fn push(&mut self) -> Result<()> {
        self.check_no_extant("push");
        if self.depth == self.cells.len() {
            self.cells
                .try_reserve_exact(self.chunk)
                .map_err(|_| Error::OutOfMemory {
                    requested: self.chunk * size_of::<Cell>(),
                })?;
            let tail = self.cells.len() + self.chunk;
            self.cells.resize(tail, Cell::erased_at(NodeFlags::STACK));
            log::trace!("value stack grew to {tail} cells");
        }
        self.cells[self.depth].erase();
        self.depth += 1;
        Ok(())
    }

    #[inline(always)]
    pub fn top_mut(&mut self) -> &mut Cell {
        &mut self.cells[self.depth - 1]
    }

    pub fn drop_top(&mut self) {
        self.check_no_extant("drop");
        assert!(self.depth > 0, "value stack underflow");
        self.depth -= 1;
        if self.checked {
            self.cells[self.depth].poison();
        }
    }

    #[inline(always)]
    pub fn mark(&self) -> StackIndex {
        StackIndex(self.depth)
    }

    pub fn rewind(&mut self, mark: StackIndex) {
        assert!(
            mark.0 <= self.depth,
            "rewinding to depth {} above current depth {}",
            mark.0,
            self.depth
        );
        while self.depth > mark.0 {
            self.drop_top();
        }
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Extant pointers currently outstanding.
    #[inline(always)]
    pub fn extant(&self) -> usize {
        self.extant.get()
    }

    #[inline(always)]
    pub fn occupied(&self) -> &[Cell] {
        &self.cells[..self.depth]
    }

    #[inline(always)]
    pub fn occupied_mut(&mut self) -> &mut [Cell] {
        &mut self.cells[..self.depth]
    }
}

/// A raw pointer to a stack cell that may outlive a borrow of the runtime.
///
/// While any `ExtantPtr` exists, checked runtimes refuse to push or drop,
/// since either could invalidate it.
pub struct ExtantPtr {
    cell: NonNull<Cell>,
    extant: Rc<std::cell::Cell<usize>>,
}

impl Deref for ExtantPtr {
    type Target = Cell;

    fn deref(&self) -> &Cell {
        // SAFETY: push/drop are refused while this pointer exists
        unsafe { self.cell.as_ref() }
    }
}

impl ExtantPtr {
    pub fn get_mut(&mut self) -> &mut Cell {
        // SAFETY: as in deref
        unsafe { self.cell.as_mut() }
    }
}

impl Drop for ExtantPtr {
    fn drop(&mut self) {
        self.extant.set(self.extant.get() - 1);
    }
}

impl Runtime {
    /// Push an erased cell and return it.
    pub fn stack_push(&mut self) -> Result<&mut Cell> {
        if let Err(err) = self.stack.push() {
            return Err(self.raise_failure(err));
        }
        Ok(self.stack.top_mut())
    }

    pub fn stack_drop(&mut self) {
        self.stack.drop_top();
    }

    #[inline(always)]
    pub fn stack_mark(&self) -> StackIndex {
        self.stack.mark()
    }

    /// Drop back to `mark`. Rewinding to the current depth does nothing.
    pub fn stack_rewind(&mut self, mark: StackIndex) {
        self.stack.rewind(mark);
    }

    #[inline(always)]
    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn stack_top(&self) -> Option<&Cell> {
        self.stack.occupied().last()
    }

    /// Cell at `index`, counted from the bottom.
    pub fn stack_at(&self, index: usize) -> &Cell {
        &self.stack.occupied()[index]
    }

    pub fn stack_at_mut(&mut self, index: usize) -> &mut Cell {
        &mut self.stack.occupied_mut()[index]
    }

    /// Pointer to the cell at `index` that does not borrow the runtime.
    ///
    /// # Safety
    /// Unchecked runtimes do not track the pointer: it must not be used
    /// after a push, a drop or the runtime itself going away.
    pub unsafe fn stack_extant(&mut self, index: usize) -> ExtantPtr {
        let cell = NonNull::from(&mut self.stack.occupied_mut()[index]);
        let extant = Rc::clone(&self.stack.extant);
        extant.set(extant.get() + 1);
        ExtantPtr { cell, extant }
    }

    /// Move everything pushed since `mark` into a new manual cell array.
    pub fn pop_to_array(&mut self, mark: StackIndex) -> Result<StubRef> {
        assert!(mark.0 <= self.stack.depth(), "collecting above current depth");
        let count = self.stack.depth() - mark.0;
        let array = self.alloc_cell_array(count)?;
        // SAFETY: freshly allocated manual stub, disjoint from the stack
        let stub = unsafe { array.as_mut() };
        stub.set_len(count);
        for (slot, value) in stub.cells_mut().iter_mut().zip(&self.stack.occupied()[mark.0..]) {
            slot.copy_from(value);
        }
        self.stack.rewind(mark);
        Ok(array)
    }
}
