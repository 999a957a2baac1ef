//! Stubs: the header of every variable-length heap object.
//!
//! One 64-byte shape backs every aggregate. The [`Flavor`] byte decides the
//! element width, whether elements are cells, stub pointers or raw data,
//! and what the `link` and `misc` fields mean:
//!
//! | flavor      | elements        | link              | misc              |
//! |-------------|-----------------|-------------------|-------------------|
//! | `CellArray` | cells           | hashlist (opt.)   | -                 |
//! | `Varlist`   | cells           | keylist           | parent (opt.)     |
//! | `RootTable` | cells           | -                 | -                 |
//! | `Keylist`   | symbol pointers | -                 | -                 |
//! | `Symbol`    | UTF-8 bytes     | next synonym      | -                 |
//! | `Bytes`     | raw bytes       | -                 | -                 |
//! | `Hashlist`  | `u32` slots     | -                 | indexed array     |

use std::{fmt, mem, ptr::NonNull, slice};

use bitflags::bitflags;

use crate::{cell::Cell, node::NodeFlags};

/// Bytes of payload a stub can hold without a separate buffer.
pub const INLINE_BYTES: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubRef(NonNull<Stub>);

impl fmt::Debug for StubRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StubRef({:p})", self.0)
    }
}

impl StubRef {
    #[inline(always)]
    pub(crate) fn from_unit(unit: NonNull<u8>) -> Self {
        Self(unit.cast())
    }

    #[inline(always)]
    pub(crate) fn as_unit(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline(always)]
    pub(crate) fn from_bits(bits: u64) -> Option<Self> {
        NonNull::new(bits as usize as *mut Stub).map(Self)
    }

    #[inline(always)]
    pub(crate) fn to_bits(self) -> u64 {
        self.0.as_ptr() as usize as u64
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut Stub {
        self.0.as_ptr()
    }

    /// # Safety
    /// The stub must be live and not mutably borrowed elsewhere.
    #[inline(always)]
    pub unsafe fn as_ref<'a>(self) -> &'a Stub {
        // SAFETY: caller contract
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    /// The stub must be live and not borrowed elsewhere.
    #[inline(always)]
    pub unsafe fn as_mut<'a>(mut self) -> &'a mut Stub {
        // SAFETY: caller contract
        unsafe { self.0.as_mut() }
    }

    /// Tag byte at this address, whether the unit is live or free.
    ///
    /// # Safety
    /// The address must lie inside a pool segment that is still allocated.
    #[inline(always)]
    pub unsafe fn raw_tag(self) -> u8 {
        // SAFETY: caller contract
        unsafe { *self.0.as_ptr().cast::<u8>() }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flavor {
    CellArray,
    Varlist,
    RootTable,
    Keylist,
    Symbol,
    Bytes,
    Hashlist,
}

impl Flavor {
    /// Element width in bytes.
    #[inline(always)]
    pub const fn width(self) -> usize {
        match self {
            Flavor::CellArray | Flavor::Varlist | Flavor::RootTable => mem::size_of::<Cell>(),
            Flavor::Keylist => mem::size_of::<Option<StubRef>>(),
            Flavor::Symbol | Flavor::Bytes => 1,
            Flavor::Hashlist => mem::size_of::<u32>(),
        }
    }

    #[inline(always)]
    pub const fn holds_cells(self) -> bool {
        matches!(self, Flavor::CellArray | Flavor::Varlist | Flavor::RootTable)
    }

    #[inline(always)]
    pub const fn holds_pointers(self) -> bool {
        matches!(self, Flavor::Keylist)
    }

    #[inline(always)]
    pub const fn holds_bytes(self) -> bool {
        matches!(self, Flavor::Symbol | Flavor::Bytes)
    }

    #[inline(always)]
    pub const fn link_is_node(self) -> bool {
        matches!(self, Flavor::CellArray | Flavor::Varlist | Flavor::Symbol)
    }

    #[inline(always)]
    pub const fn misc_is_node(self) -> bool {
        matches!(self, Flavor::Varlist | Flavor::Hashlist)
    }

    /// Extra elements reserved past the capacity (the NUL of byte flavors).
    #[inline(always)]
    pub const fn terminator(self) -> usize {
        if self.holds_bytes() { 1 } else { 0 }
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct StubFlags: u8 {
        /// content lives in a separately allocated buffer
        const DYNAMIC = 1 << 0;
        /// may not be expanded
        const FIXED_SIZE = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Leader {
    tag: NodeFlags,
    flavor: Flavor,
    flags: StubFlags,
    wide: u8,
    /// length while the content is inline
    used: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Dynamic {
    data: NonNull<u8>,
    used: usize,
    /// capacity in elements, terminator included
    rest: usize,
    /// size of the buffer as returned by the allocator
    bytes: usize,
}

#[repr(C)]
union Content {
    fixed: [u64; 4],
    dynamic: Dynamic,
}

#[repr(C)]
pub struct Stub {
    leader: Leader,
    content: Content,
    link: Option<StubRef>,
    misc: Option<StubRef>,
    info: u64,
}

const _: () = assert!(mem::size_of::<Stub>() == 64);
const _: () = assert!(mem::size_of::<Content>() == INLINE_BYTES);

impl Stub {
    pub(crate) fn new_inline(flavor: Flavor, tag: NodeFlags) -> Self {
        Self {
            leader: Leader {
                tag,
                flavor,
                flags: StubFlags::empty(),
                wide: flavor.width() as u8,
                used: 0,
            },
            content: Content { fixed: [0; 4] },
            link: None,
            misc: None,
            info: 0,
        }
    }

    pub(crate) fn new_dynamic(
        flavor: Flavor,
        tag: NodeFlags,
        data: NonNull<u8>,
        bytes: usize,
    ) -> Self {
        let mut stub = Self::new_inline(flavor, tag);
        stub.set_buffer(data, bytes, 0);
        stub
    }

    /// Elements that fit inline for `flavor`, terminator excluded.
    #[inline(always)]
    pub const fn inline_capacity(flavor: Flavor) -> usize {
        INLINE_BYTES / flavor.width() - flavor.terminator()
    }

    #[inline(always)]
    pub fn tag(&self) -> NodeFlags {
        self.leader.tag
    }

    #[inline(always)]
    pub(crate) fn set_tag(&mut self, tag: NodeFlags) {
        self.leader.tag = tag;
    }

    #[inline(always)]
    pub fn flavor(&self) -> Flavor {
        self.leader.flavor
    }

    #[inline(always)]
    pub fn flags(&self) -> StubFlags {
        self.leader.flags
    }

    #[inline(always)]
    pub fn set_fixed_size(&mut self) {
        self.leader.flags.insert(StubFlags::FIXED_SIZE);
    }

    #[inline(always)]
    pub fn is_dynamic(&self) -> bool {
        self.leader.flags.contains(StubFlags::DYNAMIC)
    }

    #[inline(always)]
    pub fn is_managed(&self) -> bool {
        self.leader.tag.contains(NodeFlags::MANAGED)
    }

    #[inline(always)]
    pub fn is_root(&self) -> bool {
        self.leader.tag.contains(NodeFlags::ROOT)
    }

    #[inline(always)]
    pub fn width(&self) -> usize {
        self.leader.wide as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.is_dynamic() {
            // SAFETY: DYNAMIC selects the dynamic variant
            unsafe { self.content.dynamic.used }
        } else {
            self.leader.used as usize
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        if self.is_dynamic() {
            // SAFETY: DYNAMIC selects the dynamic variant
            let rest = unsafe { self.content.dynamic.rest };
            rest - self.flavor().terminator()
        } else {
            Self::inline_capacity(self.flavor())
        }
    }

    /// Buffer to hand back to the allocator, if any.
    pub(crate) fn buffer(&self) -> Option<(NonNull<u8>, usize)> {
        // SAFETY: DYNAMIC selects the dynamic variant
        self.is_dynamic()
            .then(|| unsafe { (self.content.dynamic.data, self.content.dynamic.bytes) })
    }

    /// Point the stub at a new buffer, keeping `len` elements.
    pub(crate) fn set_buffer(&mut self, data: NonNull<u8>, bytes: usize, len: usize) {
        let rest = bytes / self.width();
        debug_assert!(len + self.flavor().terminator() <= rest);
        self.content = Content {
            dynamic: Dynamic {
                data,
                used: len,
                rest,
                bytes,
            },
        };
        self.leader.flags.insert(StubFlags::DYNAMIC);
    }

    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        if self.is_dynamic() {
            // SAFETY: DYNAMIC selects the dynamic variant
            unsafe { self.content.dynamic.data.as_ptr() }
        } else {
            // SAFETY: the inline variant is plain words
            unsafe { self.content.fixed.as_ptr() as *mut u8 }
        }
    }

    #[inline]
    pub(crate) fn data_ptr_mut(&mut self) -> *mut u8 {
        if self.is_dynamic() {
            // SAFETY: DYNAMIC selects the dynamic variant
            unsafe { self.content.dynamic.data.as_ptr() }
        } else {
            // SAFETY: the inline variant is plain words
            unsafe { self.content.fixed.as_mut_ptr().cast() }
        }
    }

    /// Set the length. Byte flavors get a NUL written after the last byte.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "length {len} exceeds capacity {}",
            self.capacity()
        );
        if self.is_dynamic() {
            // SAFETY: DYNAMIC selects the dynamic variant
            unsafe { self.content.dynamic.used = len };
        } else {
            self.leader.used = len as u32;
        }
        if self.flavor().holds_bytes() {
            // SAFETY: capacity reserves room for the terminator
            unsafe { *self.data_ptr_mut().add(len) = 0 };
        }
    }

    /// Every element slot up to capacity, as raw memory.
    ///
    /// # Safety
    /// `T` must match the flavor's element type.
    #[inline]
    unsafe fn slots<T>(&self) -> &[T] {
        debug_assert_eq!(mem::size_of::<T>(), self.width());
        // SAFETY: the content holds `capacity` initialized elements of T
        unsafe { slice::from_raw_parts(self.data_ptr().cast_const().cast::<T>(), self.capacity()) }
    }

    /// # Safety
    /// `T` must match the flavor's element type.
    #[inline]
    unsafe fn slots_mut<T>(&mut self) -> &mut [T] {
        debug_assert_eq!(mem::size_of::<T>(), self.width());
        let capacity = self.capacity();
        // SAFETY: the content holds `capacity` initialized elements of T
        unsafe { slice::from_raw_parts_mut(self.data_ptr_mut().cast::<T>(), capacity) }
    }

    /// Cells in use.
    pub fn cells(&self) -> &[Cell] {
        assert!(self.flavor().holds_cells(), "{:?} does not hold cells", self.flavor());
        // SAFETY: flavor checked
        unsafe { &self.slots::<Cell>()[..self.len()] }
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        assert!(self.flavor().holds_cells(), "{:?} does not hold cells", self.flavor());
        let len = self.len();
        // SAFETY: flavor checked
        unsafe { &mut self.slots_mut::<Cell>()[..len] }
    }

    /// Cells up to capacity, including erased ones past the length.
    pub fn cell_slots_mut(&mut self) -> &mut [Cell] {
        assert!(self.flavor().holds_cells(), "{:?} does not hold cells", self.flavor());
        // SAFETY: flavor checked
        unsafe { self.slots_mut::<Cell>() }
    }

    pub fn pointers(&self) -> &[Option<StubRef>] {
        assert!(self.flavor().holds_pointers(), "{:?} does not hold pointers", self.flavor());
        // SAFETY: flavor checked; zeroed slots read as None
        unsafe { &self.slots::<Option<StubRef>>()[..self.len()] }
    }

    pub fn pointers_mut(&mut self) -> &mut [Option<StubRef>] {
        assert!(self.flavor().holds_pointers(), "{:?} does not hold pointers", self.flavor());
        let len = self.len();
        // SAFETY: flavor checked
        unsafe { &mut self.slots_mut::<Option<StubRef>>()[..len] }
    }

    pub fn hashes(&self) -> &[u32] {
        assert_eq!(self.flavor(), Flavor::Hashlist);
        // SAFETY: flavor checked
        unsafe { &self.slots::<u32>()[..self.len()] }
    }

    pub fn hashes_mut(&mut self) -> &mut [u32] {
        assert_eq!(self.flavor(), Flavor::Hashlist);
        let len = self.len();
        // SAFETY: flavor checked
        unsafe { &mut self.slots_mut::<u32>()[..len] }
    }

    pub fn bytes(&self) -> &[u8] {
        assert!(self.flavor().holds_bytes(), "{:?} does not hold bytes", self.flavor());
        // SAFETY: flavor checked
        unsafe { &self.slots::<u8>()[..self.len()] }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(self.flavor().holds_bytes(), "{:?} does not hold bytes", self.flavor());
        let len = self.len();
        // SAFETY: flavor checked
        unsafe { &mut self.slots_mut::<u8>()[..len] }
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(self.bytes()).ok()
    }

    #[inline(always)]
    pub fn link(&self) -> Option<StubRef> {
        self.link
    }

    #[inline(always)]
    pub fn set_link(&mut self, link: Option<StubRef>) {
        self.link = link;
    }

    #[inline(always)]
    pub fn misc(&self) -> Option<StubRef> {
        self.misc
    }

    #[inline(always)]
    pub fn set_misc(&mut self, misc: Option<StubRef>) {
        self.misc = misc;
    }

    #[inline(always)]
    pub fn info(&self) -> u64 {
        self.info
    }

    #[inline(always)]
    pub fn set_info(&mut self, info: u64) {
        self.info = info;
    }
}
