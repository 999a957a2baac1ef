//! Value cells.
//!
//! A [`Cell`] is the fixed-size value slot used inside cell arrays, on the
//! value stack, in levels and as standalone API handles. Its first byte is
//! a node tag, so a bare `*const Cell` can be told apart from a stub or
//! from text with [`classify`](crate::node::classify).

use bitflags::bitflags;

use crate::{node::NodeFlags, stub::StubRef};

/// Tag bits describing where a cell lives rather than what it holds.
/// Writing a new value into a cell never changes them.
const LOCATION: NodeFlags = NodeFlags::STACK.union(NodeFlags::ROOT);

/// What a cell currently holds.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Heart {
    /// Freshly created, not readable.
    Erased = 0,
    /// Logically removed in checked mode, not readable.
    Poisoned,
    Blank,
    Logic,
    Integer,
    Decimal,
    Block,
    Binary,
    Text,
    Word,
    Varlist,
}

impl Heart {
    /// Hearts whose payload is `(stub, index)`.
    #[inline(always)]
    pub const fn is_series(self) -> bool {
        matches!(self, Heart::Block | Heart::Binary | Heart::Text)
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CellFlags: u8 {
        const CONST = 1 << 0;
        const NEWLINE_BEFORE = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Cell {
    tag: NodeFlags,
    heart: Heart,
    flags: CellFlags,
    _reserved: [u8; 5],
    /// binding of a word
    extra: u64,
    payload: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<Cell>() == 32);

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("tag", &self.tag)
            .field("heart", &self.heart)
            .field("payload", &self.payload)
            .finish()
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::erased()
    }
}

impl Cell {
    #[inline(always)]
    pub const fn erased() -> Self {
        Self::erased_at(NodeFlags::empty())
    }

    /// An erased cell carrying location bits (`STACK`, `ROOT`).
    #[inline(always)]
    pub(crate) const fn erased_at(location: NodeFlags) -> Self {
        Self {
            tag: NodeFlags::live(NodeFlags::CELL.union(location)),
            heart: Heart::Erased,
            flags: CellFlags::empty(),
            _reserved: [0; 5],
            extra: 0,
            payload: [0; 2],
        }
    }

    #[inline(always)]
    pub fn tag(&self) -> NodeFlags {
        self.tag
    }

    #[inline(always)]
    pub fn heart(&self) -> Heart {
        self.heart
    }

    #[inline(always)]
    pub fn flags(&self) -> CellFlags {
        self.flags
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: CellFlags) {
        self.flags.insert(flag);
    }

    #[inline(always)]
    pub fn is_readable(&self) -> bool {
        !matches!(self.heart, Heart::Erased | Heart::Poisoned)
    }

    #[inline(always)]
    pub fn erase(&mut self) {
        *self = Self::erased_at(self.tag & LOCATION);
    }

    /// Make the cell unreadable so a stale reader trips an assertion.
    #[inline(always)]
    pub fn poison(&mut self) {
        self.erase();
        self.heart = Heart::Poisoned;
        self.payload = [u64::from_ne_bytes([0xDB; 8]); 2];
    }

    #[inline(always)]
    fn write(&mut self, heart: Heart, extra: u64, payload: [u64; 2]) -> &mut Self {
        self.tag = NodeFlags::live(NodeFlags::CELL | (self.tag & LOCATION));
        self.heart = heart;
        self.flags = CellFlags::empty();
        self.extra = extra;
        self.payload = payload;
        self
    }

    pub fn init_blank(&mut self) -> &mut Self {
        self.write(Heart::Blank, 0, [0; 2])
    }

    pub fn init_logic(&mut self, value: bool) -> &mut Self {
        self.write(Heart::Logic, 0, [value as u64, 0])
    }

    pub fn init_integer(&mut self, value: i64) -> &mut Self {
        self.write(Heart::Integer, 0, [value as u64, 0])
    }

    pub fn init_decimal(&mut self, value: f64) -> &mut Self {
        self.write(Heart::Decimal, 0, [value.to_bits(), 0])
    }

    pub fn init_block(&mut self, array: StubRef, index: usize) -> &mut Self {
        self.write(Heart::Block, 0, [array.to_bits(), index as u64])
    }

    pub fn init_binary(&mut self, bytes: StubRef, index: usize) -> &mut Self {
        self.write(Heart::Binary, 0, [bytes.to_bits(), index as u64])
    }

    pub fn init_text(&mut self, bytes: StubRef, index: usize) -> &mut Self {
        self.write(Heart::Text, 0, [bytes.to_bits(), index as u64])
    }

    pub fn init_word(&mut self, symbol: StubRef, binding: Option<StubRef>) -> &mut Self {
        let extra = binding.map_or(0, StubRef::to_bits);
        self.write(Heart::Word, extra, [symbol.to_bits(), 0])
    }

    pub fn init_varlist(&mut self, varlist: StubRef) -> &mut Self {
        self.write(Heart::Varlist, 0, [varlist.to_bits(), 0])
    }

    /// Copy the value of `other`, keeping this cell's location bits.
    pub fn copy_from(&mut self, other: &Cell) -> &mut Self {
        debug_assert!(other.is_readable(), "copying an unreadable cell");
        self.write(other.heart, other.extra, other.payload);
        self.flags = other.flags;
        self
    }

    #[inline(always)]
    fn check_readable(&self) {
        debug_assert!(
            self.is_readable(),
            "reading a {:?} cell",
            self.heart
        );
    }

    pub fn as_logic(&self) -> Option<bool> {
        self.check_readable();
        (self.heart == Heart::Logic).then_some(self.payload[0] != 0)
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.check_readable();
        (self.heart == Heart::Integer).then_some(self.payload[0] as i64)
    }

    pub fn as_decimal(&self) -> Option<f64> {
        self.check_readable();
        (self.heart == Heart::Decimal).then(|| f64::from_bits(self.payload[0]))
    }

    /// `(stub, index)` of a block, binary or text cell.
    pub fn as_series(&self) -> Option<(StubRef, usize)> {
        self.check_readable();
        if !self.heart.is_series() {
            return None;
        }
        StubRef::from_bits(self.payload[0]).map(|stub| (stub, self.payload[1] as usize))
    }

    pub fn as_word(&self) -> Option<StubRef> {
        self.check_readable();
        (self.heart == Heart::Word)
            .then(|| StubRef::from_bits(self.payload[0]))
            .flatten()
    }

    pub fn binding(&self) -> Option<StubRef> {
        self.check_readable();
        (self.heart == Heart::Word)
            .then(|| StubRef::from_bits(self.extra))
            .flatten()
    }

    pub fn as_varlist(&self) -> Option<StubRef> {
        self.check_readable();
        (self.heart == Heart::Varlist)
            .then(|| StubRef::from_bits(self.payload[0]))
            .flatten()
    }

    /// Report every stub this cell keeps alive. Unreadable cells hold none.
    pub fn for_each_node(&self, visit: &mut dyn FnMut(StubRef)) {
        match self.heart {
            Heart::Block | Heart::Binary | Heart::Text | Heart::Varlist => {
                if let Some(stub) = StubRef::from_bits(self.payload[0]) {
                    visit(stub);
                }
            }
            Heart::Word => {
                if let Some(symbol) = StubRef::from_bits(self.payload[0]) {
                    visit(symbol);
                }
                if let Some(binding) = StubRef::from_bits(self.extra) {
                    visit(binding);
                }
            }
            Heart::Erased
            | Heart::Poisoned
            | Heart::Blank
            | Heart::Logic
            | Heart::Integer
            | Heart::Decimal => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, classify};
    use std::ptr::NonNull;

    fn fake_stub(addr: usize) -> StubRef {
        StubRef::from_bits(addr as u64).unwrap()
    }

    #[test]
    fn test_erased_cell_is_a_node() {
        let cell = Cell::erased();
        assert!(!cell.is_readable());
        let ptr = NonNull::from(&cell).cast::<u8>();
        assert_eq!(unsafe { classify(ptr.as_ptr()) }, NodeKind::Cell);
    }

    #[test]
    fn test_scalars() {
        let mut cell = Cell::erased();
        assert_eq!(cell.init_integer(-42).as_integer(), Some(-42));
        assert_eq!(cell.as_logic(), None);
        assert_eq!(cell.init_logic(true).as_logic(), Some(true));
        assert_eq!(cell.init_decimal(1.5).as_decimal(), Some(1.5));
        cell.init_blank();
        assert_eq!(cell.heart(), Heart::Blank);
        assert_eq!(cell.as_integer(), None);
    }

    #[test]
    fn test_location_bits_survive_writes() {
        let mut cell = Cell::erased_at(NodeFlags::STACK);
        cell.init_integer(1);
        assert!(cell.tag().contains(NodeFlags::STACK));

        let mut plain = Cell::erased();
        plain.copy_from(&cell);
        assert!(!plain.tag().contains(NodeFlags::STACK));
        assert_eq!(plain.as_integer(), Some(1));

        cell.poison();
        assert!(cell.tag().contains(NodeFlags::STACK));
        assert_eq!(cell.heart(), Heart::Poisoned);
    }

    #[test]
    fn test_series_and_word_nodes() {
        let array = fake_stub(0x1000);
        let symbol = fake_stub(0x2000);
        let context = fake_stub(0x3000);

        let mut cell = Cell::erased();
        cell.init_block(array, 3);
        assert_eq!(cell.as_series(), Some((array, 3)));

        let mut seen = Vec::new();
        cell.for_each_node(&mut |stub| seen.push(stub));
        assert_eq!(seen, vec![array]);

        cell.init_word(symbol, Some(context));
        assert_eq!(cell.as_word(), Some(symbol));
        assert_eq!(cell.binding(), Some(context));
        seen.clear();
        cell.for_each_node(&mut |stub| seen.push(stub));
        assert_eq!(seen, vec![symbol, context]);

        cell.init_word(symbol, None);
        assert_eq!(cell.binding(), None);
    }

    #[test]
    fn test_flags_are_copied_and_reset() {
        let mut source = Cell::erased();
        source.init_integer(5).set_flag(CellFlags::NEWLINE_BEFORE);
        let mut target = Cell::erased();
        target.copy_from(&source);
        assert!(target.flags().contains(CellFlags::NEWLINE_BEFORE));
        target.init_integer(6);
        assert!(target.flags().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reading a Poisoned cell")]
    fn test_reading_poisoned_cell_asserts() {
        let mut cell = Cell::erased();
        cell.init_integer(1);
        cell.poison();
        let _ = cell.as_integer();
    }
}
