//! The raw API boundary.
//!
//! Outside code holds values in standalone ROOT cells taken from
//! `CELL_POOL` and passes arguments as lists of untyped pointers, each of
//! which is a cell, a stub or NUL-terminated text. The list ends at
//! [`END_NODE`](crate::END_NODE).

use std::{ffi::CStr, ptr::NonNull};

use crate::{
    Error, Result,
    cell::Cell,
    node::{FREE_BYTE, NodeFlags, NodeKind, classify},
    pool::CELL_POOL,
    runtime::Runtime,
    stub::{Flavor, StubRef},
};

/// A cell owned by the runtime on behalf of outside code. It is a root
/// until [`Runtime::release_api_cell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiHandle(NonNull<Cell>);

impl ApiHandle {
    /// Address suitable for an argument list passed to
    /// [`Runtime::feed_api`].
    #[inline(always)]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr().cast_const().cast()
    }
}

impl Runtime {
    pub fn alloc_api_cell(&mut self) -> Result<ApiHandle> {
        let unit = match self.pools.allocate(CELL_POOL) {
            Ok(unit) => unit,
            Err(err) => return Err(self.raise_failure(err)),
        };
        let cell = unit.cast::<Cell>();
        // SAFETY: unit is an unused cell-sized slot
        unsafe { cell.as_ptr().write(Cell::erased_at(NodeFlags::ROOT)) };
        Ok(ApiHandle(cell))
    }

    #[inline]
    fn check_api_cell(&self, handle: ApiHandle) {
        if self.settings.checked {
            let ptr = handle.as_ptr();
            assert!(
                self.pools.owns(CELL_POOL, ptr),
                "{handle:?} is not an API cell of this runtime"
            );
            // SAFETY: owned units are always readable
            assert_ne!(unsafe { *ptr }, FREE_BYTE, "use of released {handle:?}");
        }
    }

    pub fn api_cell(&self, handle: ApiHandle) -> &Cell {
        self.check_api_cell(handle);
        // SAFETY: live API cells stay put until released
        unsafe { handle.0.as_ref() }
    }

    pub fn api_cell_mut(&mut self, handle: ApiHandle) -> &mut Cell {
        self.check_api_cell(handle);
        let mut cell = handle.0;
        // SAFETY: as above, and the runtime is mutably borrowed
        unsafe { cell.as_mut() }
    }

    pub fn release_api_cell(&mut self, handle: ApiHandle) {
        self.check_api_cell(handle);
        // SAFETY: handles are only made by alloc_api_cell
        unsafe { self.pools.release(CELL_POOL, handle.0.cast()) };
    }

    /// Build a managed block from a raw argument list.
    ///
    /// Cells are copied, stubs become the value of their flavor (block,
    /// binary, word or varlist) and foreign text is copied into a new text
    /// value. Anything allocated for a list that turns out to be malformed
    /// is rolled back before the failure is raised.
    ///
    /// # Safety
    /// Every pointer up to the END sentinel must satisfy the contract of
    /// [`classify`](crate::classify).
    pub unsafe fn feed_api(&mut self, args: &[*const u8]) -> Result<StubRef> {
        // SAFETY: caller contract
        let fed = self.rescue(|rt| unsafe { rt.feed_values(args) });
        fed.map_err(|err| self.raise_failure(err))
    }

    unsafe fn feed_values(&mut self, args: &[*const u8]) -> Result<StubRef> {
        let mark = self.stack_mark();
        for (position, &arg) in args.iter().enumerate() {
            // SAFETY: caller contract
            match unsafe { classify(arg) } {
                NodeKind::End => {
                    let block = self.pop_to_array(mark)?;
                    self.manage(block);
                    return Ok(block);
                }
                NodeKind::Cell => {
                    // SAFETY: classified as a cell
                    let cell = unsafe { &*arg.cast::<Cell>() };
                    if !cell.is_readable() {
                        return Err(Error::InvalidArgument(format!(
                            "argument {position} is an unreadable cell"
                        )));
                    }
                    self.stack_push()?.copy_from(cell);
                }
                NodeKind::HeapObject => {
                    let Some(unit) = NonNull::new(arg.cast_mut()) else {
                        return Err(Error::InvalidArgument(format!("argument {position} is null")));
                    };
                    let stub = StubRef::from_unit(unit);
                    if !self.is_live(stub) {
                        return Err(Error::InvalidArgument(format!(
                            "argument {position} is not a stub of this runtime"
                        )));
                    }
                    let flavor = self.stub(stub).flavor();
                    let init: fn(&mut Cell, StubRef) = match flavor {
                        Flavor::CellArray | Flavor::RootTable => |cell, stub| {
                            cell.init_block(stub, 0);
                        },
                        Flavor::Bytes => |cell, stub| {
                            cell.init_binary(stub, 0);
                        },
                        Flavor::Symbol => |cell, stub| {
                            cell.init_word(stub, None);
                        },
                        Flavor::Varlist => |cell, stub| {
                            cell.init_varlist(stub);
                        },
                        Flavor::Keylist | Flavor::Hashlist => {
                            return Err(Error::InvalidArgument(format!(
                                "argument {position}: a {flavor:?} has no value form"
                            )));
                        }
                    };
                    init(self.stack_push()?, stub);
                }
                NodeKind::ForeignText => {
                    // SAFETY: classified as NUL-terminated text
                    let text = unsafe { CStr::from_ptr(arg.cast()) };
                    let Ok(text) = text.to_str() else {
                        return Err(Error::InvalidArgument(format!(
                            "argument {position} is not valid UTF-8"
                        )));
                    };
                    let bytes = self.alloc_bytes_from(text.as_bytes())?;
                    self.manage(bytes);
                    self.stack_push()?.init_text(bytes, 0);
                }
                NodeKind::Free => {
                    return Err(Error::InvalidArgument(format!(
                        "argument {position} refers to a freed node"
                    )));
                }
            }
        }
        Err(Error::InvalidArgument(
            "argument list is missing its END sentinel".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{END_NODE, cell::Heart, pool::STUB_POOL, runtime::tests::create_test_runtime};

    #[test]
    fn test_api_cells_are_root_cells() {
        let mut rt = create_test_runtime();
        let handle = rt.alloc_api_cell().unwrap();
        let tag = rt.api_cell(handle).tag();
        assert!(tag.contains(NodeFlags::ROOT | NodeFlags::CELL));
        assert_eq!(unsafe { classify(handle.as_ptr()) }, NodeKind::Cell);

        rt.api_cell_mut(handle).init_integer(5);
        assert_eq!(rt.api_cell(handle).as_integer(), Some(5));
        assert!(rt.api_cell(handle).tag().contains(NodeFlags::ROOT));
        assert_eq!(rt.pools().stats(CELL_POOL).live, 1);

        rt.release_api_cell(handle);
        assert_eq!(rt.pools().stats(CELL_POOL).live, 0);
        assert_eq!(unsafe { classify(handle.as_ptr()) }, NodeKind::Free);
    }

    #[test]
    #[should_panic(expected = "use of released")]
    fn test_released_api_cell_is_rejected() {
        let mut rt = create_test_runtime();
        let handle = rt.alloc_api_cell().unwrap();
        rt.release_api_cell(handle);
        let _ = rt.api_cell(handle);
    }

    #[test]
    fn test_feed_mixed_arguments() {
        let mut rt = create_test_runtime();
        let number = rt.alloc_api_cell().unwrap();
        rt.api_cell_mut(number).init_integer(42);
        let array = rt.alloc_cell_array(1).unwrap();
        let symbol = rt.alloc_symbol("print").unwrap();

        let args = [
            number.as_ptr(),
            array.as_ptr().cast_const().cast(),
            c"hello".as_ptr().cast(),
            symbol.as_ptr().cast_const().cast(),
            END_NODE.as_ptr(),
        ];
        let block = unsafe { rt.feed_api(&args) }.unwrap();

        assert!(rt.stub(block).is_managed());
        assert_eq!(rt.stack_depth(), 0);
        let cells = rt.stub(block).cells();
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[0].as_integer(), Some(42));
        assert!(!cells[0].tag().contains(NodeFlags::ROOT));
        assert_eq!(cells[1].heart(), Heart::Block);
        assert_eq!(cells[1].as_series(), Some((array, 0)));
        assert_eq!(cells[2].heart(), Heart::Text);
        assert_eq!(cells[3].as_word(), Some(symbol));

        let (text, _) = cells[2].as_series().unwrap();
        assert_eq!(rt.stub(text).as_text(), Some("hello"));
        assert!(rt.stub(text).is_managed());
    }

    #[test]
    fn test_arguments_after_end_are_ignored() {
        let mut rt = create_test_runtime();
        let args = [c"a".as_ptr().cast(), END_NODE.as_ptr(), std::ptr::null()];
        let block = unsafe { rt.feed_api(&args) }.unwrap();
        assert_eq!(rt.stub(block).len(), 1);
    }

    #[test]
    fn test_malformed_feed_rolls_back() {
        let mut rt = create_test_runtime();
        let keys = rt.alloc_keylist(&[]).unwrap();
        let before = rt.snapshot();

        let cases: [Vec<*const u8>; 3] = [
            vec![c"ok".as_ptr().cast(), b"\xFF\xFE\0".as_ptr()],
            vec![c"ok".as_ptr().cast(), keys.as_ptr().cast_const().cast()],
            vec![c"no end".as_ptr().cast()],
        ];
        for args in &cases {
            let err = rt.rescue(|rt| unsafe { rt.feed_api(args) }).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
            rt.assert_balanced(&before);
        }

        rt.recycle();
        assert_eq!(rt.pools().stats(STUB_POOL).live, 1);
    }

    #[test]
    fn test_freed_cell_argument_is_rejected() {
        let mut rt = create_test_runtime();
        let handle = rt.alloc_api_cell().unwrap();
        rt.release_api_cell(handle);
        let args = [handle.as_ptr(), END_NODE.as_ptr()];
        let err = rt.rescue(|rt| unsafe { rt.feed_api(&args) }).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidArgument("argument 0 refers to a freed node".into())
        );
    }
}
