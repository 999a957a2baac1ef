use std::{collections::HashMap, marker::PhantomData, ptr};

use ahash::RandomState;

use crate::{
    Error, Result,
    cell::Cell,
    gc::GcState,
    guard::GuardStack,
    level::Level,
    node::{FREE_BYTE, NodeFlags},
    pool::{Pools, STUB_POOL},
    scope::{LinkField, Scopes},
    settings::{RuntimeCreateInfo, RuntimeSettings},
    stack::{StackIndex, ValueStack},
    stub::{Flavor, Stub, StubFlags, StubRef},
};

/// One independent instance of the node heap.
///
/// Owns the pools, the collector state, the guard stack, the value stack,
/// the levels and the scope records. Instances share nothing, so several
/// can run on separate threads; a single instance stays on the thread
/// that created it.
pub struct Runtime {
    pub(crate) settings: RuntimeSettings,
    pub(crate) pools: Pools,
    pub(crate) gc: GcState,
    pub(crate) guards: GuardStack,
    pub(crate) stack: ValueStack,
    pub(crate) levels: Vec<Level>,
    pub(crate) scopes: Scopes,
    /// stubs not yet handed to the collector, in allocation order
    pub(crate) manuals: Vec<StubRef>,
    pub(crate) roots: HashMap<&'static str, StubRef, RandomState>,
    _marker: PhantomData<*const ()>,
}

/// Depths of every stack-like structure in a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub stack: StackIndex,
    pub guards: usize,
    pub manuals: usize,
    pub levels: usize,
    pub scopes: usize,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Result<Self> {
        let settings = RuntimeSettings::from_info(info)?;
        log::debug!(
            "runtime: {} pool tiers, ballast {}, checked {}",
            settings.pool_tiers.len(),
            settings.ballast,
            settings.checked
        );
        Ok(Self {
            pools: Pools::new(&settings),
            gc: GcState::new(settings.ballast),
            guards: GuardStack::default(),
            stack: ValueStack::new(settings.stack_chunk, settings.checked),
            levels: Vec::new(),
            scopes: Scopes::default(),
            manuals: Vec::new(),
            roots: HashMap::with_hasher(RandomState::new()),
            settings,
            _marker: PhantomData,
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    #[inline(always)]
    pub fn manual_count(&self) -> usize {
        self.manuals.len()
    }

    // ── Stub construction ─────────────────────────────────────────────

    /// Allocate a manual stub with room for `capacity` elements. Cell
    /// slots start erased, every other flavor starts zeroed; the length
    /// is 0.
    fn alloc_stub(&mut self, flavor: Flavor, capacity: usize) -> Result<StubRef> {
        match self.try_alloc_stub(flavor, capacity) {
            Ok(stub) => Ok(stub),
            Err(err) => Err(self.raise_failure(err)),
        }
    }

    fn try_alloc_stub(&mut self, flavor: Flavor, capacity: usize) -> Result<StubRef> {
        let tag = NodeFlags::live(NodeFlags::empty());
        let stub = if capacity <= Stub::inline_capacity(flavor) {
            Stub::new_inline(flavor, tag)
        } else {
            let bytes = (capacity + flavor.terminator())
                .checked_mul(flavor.width())
                .ok_or(Error::OutOfMemory {
                    requested: usize::MAX,
                })?;
            let (data, size) = self.pools.alloc_buffer(bytes)?;
            // SAFETY: fresh buffer of `size` bytes
            unsafe { data.as_ptr().write_bytes(0, size) };
            Stub::new_dynamic(flavor, tag, data, size)
        };

        let unit = match self.pools.allocate(STUB_POOL) {
            Ok(unit) => unit,
            Err(err) => {
                if let Some((data, size)) = stub.buffer() {
                    // SAFETY: the buffer was never published
                    unsafe { self.pools.free_buffer(data, size) };
                }
                return Err(err);
            }
        };

        let handle = StubRef::from_unit(unit);
        // SAFETY: unit is an unused stub-sized slot
        let stub = unsafe {
            ptr::write(handle.as_ptr(), stub);
            handle.as_mut()
        };
        if flavor.holds_cells() {
            stub.cell_slots_mut().fill(Cell::erased());
        }

        self.manuals.push(handle);
        self.gc.consume_ballast();
        Ok(handle)
    }

    /// Cell array with room for `capacity` cells, length 0.
    pub fn alloc_cell_array(&mut self, capacity: usize) -> Result<StubRef> {
        self.alloc_stub(Flavor::CellArray, capacity)
    }

    /// Zeroed byte buffer of length `size`.
    pub fn alloc_bytes(&mut self, size: usize) -> Result<StubRef> {
        let bytes = self.alloc_stub(Flavor::Bytes, size)?;
        // SAFETY: freshly allocated manual stub
        unsafe { bytes.as_mut() }.set_len(size);
        Ok(bytes)
    }

    pub fn alloc_bytes_from(&mut self, data: &[u8]) -> Result<StubRef> {
        let bytes = self.alloc_bytes(data.len())?;
        // SAFETY: freshly allocated manual stub
        unsafe { bytes.as_mut() }.bytes_mut().copy_from_slice(data);
        Ok(bytes)
    }

    /// Interned-style symbol: fixed size, alone in its synonym ring.
    pub fn alloc_symbol(&mut self, text: &str) -> Result<StubRef> {
        let symbol = self.alloc_stub(Flavor::Symbol, text.len())?;
        // SAFETY: freshly allocated manual stub
        let stub = unsafe { symbol.as_mut() };
        stub.set_len(text.len());
        stub.bytes_mut().copy_from_slice(text.as_bytes());
        stub.set_fixed_size();
        stub.set_link(Some(symbol));
        Ok(symbol)
    }

    /// Splice the lone `synonym` into the ring of `symbol`.
    pub fn link_synonym(&mut self, symbol: StubRef, synonym: StubRef) {
        assert_eq!(self.stub(symbol).flavor(), Flavor::Symbol);
        assert_eq!(
            self.stub(synonym).link(),
            Some(synonym),
            "synonym already belongs to a ring"
        );
        let next = self.stub(symbol).link();
        self.write_link(synonym, LinkField::Link, next);
        self.write_link(symbol, LinkField::Link, Some(synonym));
    }

    /// Every member of the synonym ring of `symbol`, starting with itself.
    pub fn synonyms(&self, symbol: StubRef) -> Vec<StubRef> {
        let mut ring = vec![symbol];
        let mut next = self.stub(symbol).link();
        while let Some(member) = next.filter(|&member| member != symbol) {
            ring.push(member);
            next = self.stub(member).link();
        }
        ring
    }

    pub fn alloc_keylist(&mut self, symbols: &[StubRef]) -> Result<StubRef> {
        let keylist = self.alloc_stub(Flavor::Keylist, symbols.len())?;
        // SAFETY: freshly allocated manual stub
        let stub = unsafe { keylist.as_mut() };
        stub.set_len(symbols.len());
        for (slot, &symbol) in stub.pointers_mut().iter_mut().zip(symbols) {
            *slot = Some(symbol);
        }
        Ok(keylist)
    }

    /// Varlist with one blank variable per key of `keylist`.
    pub fn alloc_varlist(
        &mut self,
        keylist: StubRef,
        parent: Option<StubRef>,
    ) -> Result<StubRef> {
        let keys = self.stub(keylist);
        assert_eq!(keys.flavor(), Flavor::Keylist);
        let count = keys.len();
        let varlist = self.alloc_stub(Flavor::Varlist, count)?;
        // SAFETY: freshly allocated manual stub
        let stub = unsafe { varlist.as_mut() };
        stub.set_len(count);
        for cell in stub.cells_mut() {
            cell.init_blank();
        }
        stub.set_link(Some(keylist));
        stub.set_misc(parent);
        Ok(varlist)
    }

    /// Zeroed hash index of `slots` entries for `array`.
    pub fn alloc_hashlist(&mut self, array: StubRef, slots: usize) -> Result<StubRef> {
        assert_eq!(self.stub(array).flavor(), Flavor::CellArray);
        let hashlist = self.alloc_stub(Flavor::Hashlist, slots)?;
        // SAFETY: freshly allocated manual stub
        let stub = unsafe { hashlist.as_mut() };
        stub.set_len(slots);
        stub.set_misc(Some(array));
        self.write_link(array, LinkField::Link, Some(hashlist));
        Ok(hashlist)
    }

    // ── Ownership ─────────────────────────────────────────────────────

    /// Free a stub that was never handed to the collector.
    pub fn free_manual(&mut self, stub: StubRef) {
        if self.settings.checked {
            assert!(
                !self.stub(stub).is_managed(),
                "free_manual on managed stub {stub:?}"
            );
        }
        self.forget_manual(stub);
        self.free_stub(stub);
    }

    /// Hand a manual stub to the collector. This is the only transition a
    /// stub's ownership ever makes.
    pub fn manage(&mut self, stub: StubRef) {
        let tag = self.stub(stub).tag();
        if self.settings.checked {
            assert!(
                !tag.contains(NodeFlags::MANAGED),
                "stub {stub:?} is already managed"
            );
        }
        self.forget_manual(stub);
        self.stub_mut(stub).set_tag(tag | NodeFlags::MANAGED);
    }

    pub fn is_manual(&self, stub: StubRef) -> bool {
        !self.stub(stub).is_managed()
    }

    fn forget_manual(&mut self, stub: StubRef) {
        let Some(index) = self.manuals.iter().rposition(|&manual| manual == stub) else {
            panic!("stub {stub:?} is not on the manual list");
        };
        self.manuals.remove(index);
        self.scopes.forget_manual(index);
    }

    /// Release a stub's buffer and its unit.
    pub(crate) fn free_stub(&mut self, stub: StubRef) {
        self.scopes.forget_stub(stub);
        // SAFETY: caller passes a live stub that nothing else references
        if let Some((data, bytes)) = unsafe { stub.as_ref() }.buffer() {
            // SAFETY: the buffer is owned exclusively by the stub
            unsafe { self.pools.free_buffer(data, bytes) };
        }
        // SAFETY: stubs always come from STUB_POOL
        unsafe { self.pools.release(STUB_POOL, stub.as_unit()) };
    }

    // ── Access ────────────────────────────────────────────────────────

    /// Whether `stub` still refers to a live unit of this runtime.
    pub fn is_live(&self, stub: StubRef) -> bool {
        // SAFETY: owned units lie in allocated segments
        self.pools.owns(STUB_POOL, stub.as_ptr().cast())
            && unsafe { stub.raw_tag() } != FREE_BYTE
    }

    #[inline]
    fn check_live(&self, stub: StubRef) {
        if self.settings.checked {
            assert!(self.is_live(stub), "use of dead stub {stub:?}");
        }
    }

    pub fn stub(&self, stub: StubRef) -> &Stub {
        self.check_live(stub);
        // SAFETY: live stubs are valid for as long as the runtime is borrowed
        unsafe { stub.as_ref() }
    }

    pub fn stub_mut(&mut self, stub: StubRef) -> &mut Stub {
        self.check_live(stub);
        // SAFETY: as above, and the runtime is mutably borrowed
        unsafe { stub.as_mut() }
    }

    /// Grow `stub` so that `delta` more elements fit after its length.
    /// Capacity at least doubles.
    pub fn expand(&mut self, stub: StubRef, delta: usize) -> Result<()> {
        let (flavor, len, capacity, flags) = {
            let current = self.stub(stub);
            (current.flavor(), current.len(), current.capacity(), current.flags())
        };
        if flags.contains(StubFlags::FIXED_SIZE) {
            let err = Error::InvalidArgument(format!("cannot expand fixed-size {flavor:?}"));
            return Err(self.raise_failure(err));
        }
        let Some(needed) = len.checked_add(delta) else {
            return Err(self.raise_failure(Error::OutOfMemory {
                requested: usize::MAX,
            }));
        };
        if needed <= capacity {
            return Ok(());
        }

        let new_capacity = needed.max(capacity.saturating_mul(2));
        let Some(bytes) = new_capacity
            .checked_add(flavor.terminator())
            .and_then(|elements| elements.checked_mul(flavor.width()))
        else {
            return Err(self.raise_failure(Error::OutOfMemory {
                requested: usize::MAX,
            }));
        };
        let (data, size) = match self.pools.alloc_buffer(bytes) {
            Ok(buffer) => buffer,
            Err(err) => return Err(self.raise_failure(err)),
        };

        // SAFETY: live stub, exclusive through &mut self
        let current = unsafe { stub.as_mut() };
        let old = current.buffer();
        // SAFETY: the new buffer is larger than the used part of the old one
        unsafe {
            data.as_ptr().write_bytes(0, size);
            ptr::copy_nonoverlapping(
                current.data_ptr(),
                data.as_ptr(),
                (len + flavor.terminator()) * flavor.width(),
            );
        }
        current.set_buffer(data, size, len);
        if flavor.holds_cells() {
            current.cell_slots_mut()[len..].fill(Cell::erased());
        }
        if let Some((old_data, old_bytes)) = old {
            // SAFETY: the stub no longer refers to its old buffer
            unsafe { self.pools.free_buffer(old_data, old_bytes) };
        }
        log::trace!("expanded {flavor:?} {stub:?} to {new_capacity} elements");
        Ok(())
    }

    /// Copy `value` to the end of a cell-holding stub.
    pub fn append_cell(&mut self, stub: StubRef, value: &Cell) -> Result<()> {
        self.expand(stub, 1)?;
        let target = self.stub_mut(stub);
        let len = target.len();
        target.cell_slots_mut()[len].copy_from(value);
        target.set_len(len + 1);
        Ok(())
    }

    // ── Root table ────────────────────────────────────────────────────

    /// Make `stub` permanently live under `name`. A manual stub becomes
    /// managed. A stub previously registered under `name` loses its root
    /// status and is returned.
    pub fn register_root(&mut self, name: &'static str, stub: StubRef) -> Option<StubRef> {
        if !self.stub(stub).is_managed() {
            self.manage(stub);
        }
        let tag = self.stub(stub).tag();
        self.stub_mut(stub).set_tag(tag | NodeFlags::ROOT);

        let previous = self.roots.insert(name, stub).filter(|&old| old != stub);
        if let Some(old) = previous {
            self.clear_root_flag(old);
        }
        previous
    }

    pub fn unregister_root(&mut self, name: &str) -> Option<StubRef> {
        let stub = self.roots.remove(name)?;
        self.clear_root_flag(stub);
        Some(stub)
    }

    fn clear_root_flag(&mut self, stub: StubRef) {
        // another name may still hold it
        if self.roots.values().any(|&other| other == stub) {
            return;
        }
        let tag = self.stub(stub).tag();
        self.stub_mut(stub).set_tag(tag - NodeFlags::ROOT);
    }

    pub fn root(&self, name: &str) -> Option<StubRef> {
        self.roots.get(name).copied()
    }

    /// Cell table registered as a root under `name`.
    pub fn alloc_root_table(&mut self, name: &'static str, capacity: usize) -> Result<StubRef> {
        let table = self.alloc_stub(Flavor::RootTable, capacity)?;
        self.register_root(name, table);
        Ok(table)
    }

    // ── Balance ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            stack: self.stack.mark(),
            guards: self.guards.depth(),
            manuals: self.manuals.len(),
            levels: self.levels.len(),
            scopes: self.scopes.depth(),
        }
    }

    /// Panic unless every stack-like structure is back where `snapshot`
    /// recorded it.
    pub fn assert_balanced(&self, snapshot: &Snapshot) {
        assert_eq!(&self.snapshot(), snapshot, "runtime state is unbalanced");
    }
}

impl Runtime {
    /// Give every live stub's buffer back and tag its unit free. The pools
    /// are about to go away, so free lists are left alone.
    fn shutdown_sweep(&mut self) -> usize {
        let mut released = 0;
        for span in self.pools.segment_spans(STUB_POOL) {
            for unit in span.iter() {
                let stub = StubRef::from_unit(unit);
                // SAFETY: segments are still allocated
                if unsafe { stub.raw_tag() } == FREE_BYTE {
                    continue;
                }
                // SAFETY: live unit
                if let Some((data, bytes)) = unsafe { stub.as_ref() }.buffer() {
                    // SAFETY: owned exclusively by the stub
                    unsafe { self.pools.discard_buffer(data, bytes) };
                }
                // SAFETY: only the tag byte is written
                unsafe { *unit.as_ptr() = FREE_BYTE };
                released += 1;
            }
        }
        released
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if !self.manuals.is_empty() {
            log::warn!(
                "runtime dropped with {} manual stubs outstanding",
                self.manuals.len()
            );
        }
        let released = self.shutdown_sweep();
        log::debug!("shutdown sweep released {released} stubs");
    }
}
