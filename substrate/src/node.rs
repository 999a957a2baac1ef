//! Node classification.
//!
//! Every unit handed out by the pools begins with a single tag byte. The
//! byte is chosen so that it can never be mistaken for the first byte of
//! UTF-8 text:
//!
//! ```text
//! 0x80 NODE     always set on a node
//! 0x40 FREE     only on free pool slots (0xC0) and the END sentinel (0xF7)
//! 0x20 MANAGED  the collector owns the node
//! 0x10 MARKED   reached during the current trace
//! 0x08 ROOT     permanently live
//! 0x04 CELL     value cell (clear: stub / heap object header)
//! 0x02 STACK    cell lives on the value stack or in a level
//! 0x01          reserved
//! ```
//!
//! A live node therefore always starts with a byte in `0x80..=0xBF`, the
//! UTF-8 continuation range, which no valid text starts with. `0xC0` and
//! `0xF7` are never legal UTF-8 leading bytes either.

use bitflags::bitflags;

bitflags! {
    /// Bits of the leading tag byte shared by cells and stubs.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u8 {
        const NODE = 1 << 7;
        const FREE = 1 << 6;
        const MANAGED = 1 << 5;
        const MARKED = 1 << 4;
        const ROOT = 1 << 3;
        const CELL = 1 << 2;
        const STACK = 1 << 1;
    }
}

/// Tag byte of a unit sitting on a pool free list.
pub const FREE_BYTE: u8 = NodeFlags::NODE.bits() | NodeFlags::FREE.bits();

/// First byte of the two-byte END sentinel.
pub const END_BYTE: u8 = 0xF7;

/// Marks the end of a raw argument list crossing the API boundary.
pub static END_NODE: [u8; 2] = [END_BYTE, 0];

/// What a raw pointer handed to [`classify`] refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// NUL-terminated UTF-8 text owned by someone outside the runtime.
    ForeignText,
    /// A stub (heap object header).
    HeapObject,
    /// A value cell.
    Cell,
    /// A unit on a pool free list.
    Free,
    /// The [`END_NODE`] sentinel.
    End,
}

impl NodeFlags {
    #[inline(always)]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Tag byte for a freshly constructed live node.
    #[inline(always)]
    pub const fn live(extra: Self) -> Self {
        Self::NODE.union(extra)
    }
}

/// Classify a tag byte on its own.
///
/// `End` is reported for [`END_BYTE`] regardless of what follows it; use
/// [`classify`] when the second byte is available.
#[inline]
pub const fn classify_byte(byte: u8) -> NodeKind {
    if byte & NodeFlags::NODE.bits() == 0 {
        return NodeKind::ForeignText;
    }
    if byte & NodeFlags::FREE.bits() == 0 {
        if byte & NodeFlags::CELL.bits() != 0 {
            return NodeKind::Cell;
        }
        return NodeKind::HeapObject;
    }
    match byte {
        FREE_BYTE => NodeKind::Free,
        END_BYTE => NodeKind::End,
        // 0xC2..=0xF4 minus the two above: leading bytes of multi-byte text
        _ => NodeKind::ForeignText,
    }
}

/// Inspect the first byte(s) at `ptr` and report what lives there.
///
/// This is the single place where raw addresses are interpreted; every
/// other API that accepts "a value or some text" goes through here.
///
/// # Safety
///
/// `ptr` must point either at a node owned by a runtime, at the
/// [`END_NODE`] sentinel, or at NUL-terminated UTF-8 text. At most two
/// bytes are read.
#[inline]
pub unsafe fn classify(ptr: *const u8) -> NodeKind {
    // SAFETY: caller guarantees at least one readable byte
    let byte = unsafe { *ptr };
    let kind = classify_byte(byte);
    if kind == NodeKind::End {
        // SAFETY: 0xF7 is not valid UTF-8, so by contract this is the sentinel
        let second = unsafe { *ptr.add(1) };
        debug_assert_eq!(second, 0, "END sentinel must be followed by NUL");
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::CString;

    #[test]
    fn free_and_end_bytes_are_illegal_utf8_leaders() {
        assert_eq!(FREE_BYTE, 0xC0);
        assert!(std::str::from_utf8(&[FREE_BYTE, 0x80]).is_err());
        assert!(std::str::from_utf8(&[END_BYTE, 0x80, 0x80, 0x80]).is_err());
    }

    #[test]
    fn classify_sentinels() {
        let free = [FREE_BYTE, 0];
        unsafe {
            assert_eq!(classify(free.as_ptr()), NodeKind::Free);
            assert_eq!(classify(END_NODE.as_ptr()), NodeKind::End);
        }
    }

    #[test]
    fn classify_live_tags() {
        let stub = [NodeFlags::live(NodeFlags::MANAGED).bits()];
        let cell = [NodeFlags::live(NodeFlags::CELL | NodeFlags::STACK).bits()];
        unsafe {
            assert_eq!(classify(stub.as_ptr()), NodeKind::HeapObject);
            assert_eq!(classify(cell.as_ptr()), NodeKind::Cell);
        }
    }

    #[test]
    fn classify_text() {
        for text in ["", "a", "hello world", "ünïcödé", "日本語", "🦀 crab"] {
            let c = CString::new(text).unwrap();
            let kind = unsafe { classify(c.as_ptr().cast()) };
            assert_eq!(kind, NodeKind::ForeignText, "misclassified {text:?}");
        }
    }

    #[test]
    fn every_valid_leading_byte_is_text() {
        for ch in ['\u{1}', '\u{7f}', '\u{80}', '\u{7ff}', '\u{800}', '\u{ffff}', '\u{10000}', '\u{10ffff}'] {
            let mut buf = [0u8; 4];
            let lead = ch.encode_utf8(&mut buf).as_bytes()[0];
            assert_eq!(classify_byte(lead), NodeKind::ForeignText, "lead byte {lead:#x}");
        }
    }

    fn live_flags() -> impl Strategy<Value = NodeFlags> {
        (0u8..32).prop_map(|bits| {
            let extra = NodeFlags::from_bits_truncate(bits << 1)
                & (NodeFlags::MANAGED
                    | NodeFlags::MARKED
                    | NodeFlags::ROOT
                    | NodeFlags::CELL
                    | NodeFlags::STACK);
            NodeFlags::live(extra)
        })
    }

    proptest! {
        #[test]
        fn live_nodes_never_look_like_text(flags in live_flags()) {
            let kind = classify_byte(flags.bits());
            prop_assert!(matches!(kind, NodeKind::Cell | NodeKind::HeapObject));
            prop_assert_eq!(kind == NodeKind::Cell, flags.contains(NodeFlags::CELL));
        }

        #[test]
        fn text_never_looks_like_a_node(text in "[^\\x00]{0,64}") {
            let c = CString::new(text).unwrap();
            let kind = unsafe { classify(c.as_ptr().cast()) };
            prop_assert_eq!(kind, NodeKind::ForeignText);
        }
    }
}
