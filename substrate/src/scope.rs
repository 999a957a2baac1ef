//! Recoverable scopes.
//!
//! A scope is a rollback point. Failures travel as `Err` through `?`, and
//! the scope that catches one restores the value stack, guard stack and
//! levels to their depths at entry and frees every manual stub allocated
//! since. [`Runtime::rescue`] pairs entry with both ways out; the
//! lower-level [`Runtime::enter_scope`], [`Runtime::leave_scope_cleanly`]
//! and [`Runtime::unwind_scope`] are there for callers that cannot wrap
//! their work in a closure.
//!
//! Any failure meant to be caught must be announced with
//! [`Runtime::raise_failure`] (allocation failures are announced by the
//! runtime itself). A scope left cleanly while a failure is pending is a
//! protocol violation, as is raising with no scope active.
//!
//! Link and misc fields the runtime rewrites on older stubs (a hashlist
//! attached to an array, a synonym spliced into a ring) are logged and put
//! back on unwind. Cells are not: a cell older than the scope must not be
//! pointed at a manual stub made inside it until that stub is managed.
//! Extant stack pointers must be dropped before a failure is raised.

use crate::{
    Error, Result,
    runtime::{Runtime, Snapshot},
    stub::StubRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Entered,
    /// left through `leave_scope_cleanly`
    FellThrough,
    /// caught a failure and rolled back
    Unwound,
    /// a failure was raised and is on its way out
    Propagating,
}

/// Proof of entry, handed back when the scope is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a scope must be left with leave_scope_cleanly or unwind_scope"]
pub struct ScopeToken {
    id: u64,
}

#[derive(Debug)]
struct JumpRecord {
    id: u64,
    state: ScopeState,
    saved: Snapshot,
    /// length of the write log at entry
    writes: usize,
    error: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkField {
    Link,
    Misc,
}

#[derive(Debug)]
struct LinkWrite {
    /// `None` once the stub has been freed
    target: Option<StubRef>,
    field: LinkField,
    previous: Option<StubRef>,
}

#[derive(Debug, Default)]
pub(crate) struct Scopes {
    /// innermost last
    records: Vec<JumpRecord>,
    /// link and misc writes made while any scope is active
    writes: Vec<LinkWrite>,
    next_id: u64,
    last_exit: Option<ScopeState>,
}

impl Scopes {
    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.records.len()
    }

    /// `stub` is being freed; nothing may write to it on unwind.
    pub fn forget_stub(&mut self, stub: StubRef) {
        for write in &mut self.writes {
            if write.target == Some(stub) {
                write.target = None;
            }
        }
    }

    /// The manual stub at `index` is gone; shift every record that counted
    /// it.
    pub fn forget_manual(&mut self, index: usize) {
        for record in &mut self.records {
            if record.saved.manuals > index {
                record.saved.manuals -= 1;
            }
        }
    }
}

impl Runtime {
    pub fn enter_scope(&mut self) -> ScopeToken {
        let saved = self.snapshot();
        let id = self.scopes.next_id;
        self.scopes.next_id += 1;
        self.scopes.records.push(JumpRecord {
            id,
            state: ScopeState::Entered,
            saved,
            writes: self.scopes.writes.len(),
            error: None,
        });
        ScopeToken { id }
    }

    /// Leave the innermost scope on the normal path.
    pub fn leave_scope_cleanly(&mut self, token: ScopeToken) {
        let Some(record) = self.scopes.records.pop() else {
            panic!("leaving scope {} with no scope active", token.id);
        };
        if self.settings.checked {
            assert_eq!(record.id, token.id, "scopes must be left innermost first");
            if let Some(err) = &record.error {
                panic!("scope {} left cleanly with a failure pending: {err}", token.id);
            }
        }
        if self.scopes.records.is_empty() {
            self.scopes.writes.clear();
        }
        self.scopes.last_exit = Some(ScopeState::FellThrough);
    }

    /// Overwrite the link or misc field of `stub`. Inside a scope the old
    /// value is logged so an unwind can restore it.
    pub(crate) fn write_link(&mut self, stub: StubRef, field: LinkField, value: Option<StubRef>) {
        let target = self.stub_mut(stub);
        let previous = match field {
            LinkField::Link => target.link(),
            LinkField::Misc => target.misc(),
        };
        match field {
            LinkField::Link => target.set_link(value),
            LinkField::Misc => target.set_misc(value),
        }
        if !self.scopes.records.is_empty() {
            self.scopes.writes.push(LinkWrite {
                target: Some(stub),
                field,
                previous,
            });
        }
    }

    /// Announce `err` to the innermost scope and hand it back for `?`.
    ///
    /// With no scope active the failure cannot be caught: the diagnostic is
    /// logged and the thread panics.
    pub fn raise_failure(&mut self, err: Error) -> Error {
        let Some(record) = self.scopes.records.last_mut() else {
            log::error!("uncaught failure: {err}");
            panic!("uncaught failure: {err}");
        };
        record.state = ScopeState::Propagating;
        record.error = Some(err.clone());
        err
    }

    /// Catch `err` in the scope of `token`: roll back everything done since
    /// entry, drop the scope and any inner scopes abandoned on the way, and
    /// return the error.
    pub fn unwind_scope(&mut self, token: ScopeToken, err: Error) -> Error {
        let Some(position) = self
            .scopes
            .records
            .iter()
            .rposition(|record| record.id == token.id)
        else {
            panic!("unwinding to scope {}, which is not active", token.id);
        };
        let abandoned = self.scopes.records.len() - position - 1;
        if abandoned > 0 {
            log::debug!("scope {}: discarding {abandoned} abandoned inner scopes", token.id);
            self.scopes.records.truncate(position + 1);
        }
        let saved = self.scopes.records[position].saved;
        if self.settings.checked {
            let extant = self.stack.extant();
            assert_eq!(
                extant, 0,
                "scope {} unwound while {extant} extant stack pointers are outstanding",
                token.id
            );
        }

        let undo = self.scopes.writes.split_off(self.scopes.records[position].writes);
        for write in undo.into_iter().rev() {
            let Some(target) = write.target else {
                continue;
            };
            let stub = self.stub_mut(target);
            match write.field {
                LinkField::Link => stub.set_link(write.previous),
                LinkField::Misc => stub.set_misc(write.previous),
            }
        }

        self.stack.rewind(saved.stack);
        let mut freed = 0;
        while self.manuals.len() > saved.manuals {
            if let Some(stub) = self.manuals.pop() {
                self.free_stub(stub);
                freed += 1;
            }
        }
        self.guards.truncate(saved.guards);
        self.levels.truncate(saved.levels);

        if let Some(mut record) = self.scopes.records.pop() {
            record.state = ScopeState::Unwound;
            self.scopes.last_exit = Some(record.state);
        }
        log::debug!("scope {} unwound, {freed} manual stubs freed: {err}", token.id);
        err
    }

    /// Run `body` inside a new scope. On `Err` the scope rolls back and the
    /// error is returned unchanged; re-raise it with
    /// [`raise_failure`](Self::raise_failure) to pass it outward.
    pub fn rescue<T>(&mut self, body: impl FnOnce(&mut Runtime) -> Result<T>) -> Result<T> {
        let token = self.enter_scope();
        match body(self) {
            Ok(value) => {
                self.leave_scope_cleanly(token);
                Ok(value)
            }
            Err(err) => Err(self.unwind_scope(token, err)),
        }
    }

    pub fn scope_state(&self, token: ScopeToken) -> Option<ScopeState> {
        self.scopes
            .records
            .iter()
            .find(|record| record.id == token.id)
            .map(|record| record.state)
    }

    /// How the most recently closed scope was left.
    #[inline(always)]
    pub fn last_scope_exit(&self) -> Option<ScopeState> {
        self.scopes.last_exit
    }

    #[inline(always)]
    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runtime::tests::create_test_runtime, stub::StubRef};

    fn boom() -> Error {
        Error::raised("test", "boom")
    }

    #[test]
    fn test_failure_rolls_back_stack_and_manuals() {
        let mut rt = create_test_runtime();
        for _ in 0..3 {
            rt.stack_push().unwrap().init_blank();
        }
        let mut made: Vec<StubRef> = Vec::new();

        let result: Result<()> = rt.rescue(|rt| {
            for n in 0..5 {
                rt.stack_push()?.init_integer(n);
            }
            assert_eq!(rt.stack_depth(), 8);
            made.push(rt.alloc_cell_array(4)?);
            made.push(rt.alloc_bytes(100)?);
            Err(rt.raise_failure(boom()))
        });

        assert_eq!(result, Err(boom()));
        assert_eq!(rt.stack_depth(), 3);
        assert_eq!(made.len(), 2);
        for stub in made {
            assert!(!rt.is_live(stub));
        }
        assert_eq!(rt.manual_count(), 0);
        assert_eq!(rt.last_scope_exit(), Some(ScopeState::Unwound));
        assert_eq!(rt.scope_depth(), 0);
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_clean_exit_keeps_allocations() {
        let mut rt = create_test_runtime();
        let array = rt.rescue(|rt| rt.alloc_cell_array(2)).unwrap();
        assert!(rt.is_live(array));
        assert_eq!(rt.last_scope_exit(), Some(ScopeState::FellThrough));
        rt.free_manual(array);
    }

    #[test]
    fn test_managed_and_earlier_manuals_survive_unwind() {
        let mut rt = create_test_runtime();
        let early = rt.alloc_cell_array(1).unwrap();
        let kept = rt.alloc_cell_array(1).unwrap();
        let mut managed = None;

        let _ = rt.rescue(|rt| {
            rt.free_manual(early);
            let fresh = rt.alloc_cell_array(1)?;
            rt.manage(fresh);
            managed = Some(fresh);
            rt.alloc_cell_array(1)?;
            Err::<(), _>(rt.raise_failure(boom()))
        });

        assert!(!rt.is_live(early));
        assert!(rt.is_live(kept));
        assert!(rt.is_live(managed.unwrap()));
        assert_eq!(rt.manual_count(), 1);
    }

    #[test]
    fn test_guards_and_levels_are_truncated() {
        let mut rt = create_test_runtime();
        let before = rt.snapshot();
        let _ = rt.rescue(|rt| {
            let array = rt.alloc_cell_array(1)?;
            rt.push_guard_stub(array);
            rt.push_level("doomed");
            rt.stack_push()?;
            Err::<(), _>(rt.raise_failure(boom()))
        });
        rt.assert_balanced(&before);
    }

    #[test]
    fn test_nested_scopes_see_one_level_at_a_time() {
        let mut rt = create_test_runtime();
        let mut inner_saw = None;

        let outer = rt.rescue(|rt| {
            let inner = rt.rescue(|rt| {
                rt.stack_push()?.init_integer(1);
                Err::<(), _>(rt.raise_failure(boom()))
            });
            assert_eq!(rt.scope_depth(), 1);
            assert_eq!(rt.last_scope_exit(), Some(ScopeState::Unwound));
            let err = inner.unwrap_err();
            inner_saw = Some(err.clone());
            Err::<(), _>(rt.raise_failure(err))
        });

        assert_eq!(inner_saw, Some(boom()));
        assert_eq!(outer, Err(boom()));
        assert_eq!(rt.stack_depth(), 0);
        assert_eq!(rt.scope_depth(), 0);
    }

    #[test]
    fn test_inner_catch_stops_propagation() {
        let mut rt = create_test_runtime();
        let outer = rt.rescue(|rt| {
            let recovered = rt
                .rescue(|rt| Err::<i64, _>(rt.raise_failure(boom())))
                .unwrap_or(-1);
            rt.stack_push()?.init_integer(recovered);
            let value = rt.stack_top().and_then(|cell| cell.as_integer());
            rt.stack_drop();
            Ok(value)
        });
        assert_eq!(outer, Ok(Some(-1)));
        assert_eq!(rt.last_scope_exit(), Some(ScopeState::FellThrough));
    }

    #[test]
    fn test_state_transitions() {
        let mut rt = create_test_runtime();
        let token = rt.enter_scope();
        assert_eq!(rt.scope_state(token), Some(ScopeState::Entered));
        let err = rt.raise_failure(boom());
        assert_eq!(rt.scope_state(token), Some(ScopeState::Propagating));
        let err = rt.unwind_scope(token, err);
        assert_eq!(err, boom());
        assert_eq!(rt.scope_state(token), None);
    }

    #[test]
    fn test_unwind_discards_abandoned_inner_scopes() {
        let mut rt = create_test_runtime();
        let outer = rt.enter_scope();
        let _inner = rt.enter_scope();
        rt.stack_push().unwrap();
        let err = rt.raise_failure(boom());
        rt.unwind_scope(outer, err);
        assert_eq!(rt.scope_depth(), 0);
        assert_eq!(rt.stack_depth(), 0);
    }

    #[test]
    fn test_unwind_detaches_hashlist_from_outer_array() {
        let mut rt = create_test_runtime();
        let array = rt.alloc_cell_array(1).unwrap();
        rt.register_root("array", array);

        let _ = rt.rescue(|rt| {
            rt.alloc_hashlist(array, 4)?;
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.stub(array).link(), None);

        rt.recycle();
        assert!(rt.is_live(array));
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_unwind_restores_replaced_hashlist() {
        let mut rt = create_test_runtime();
        let array = rt.alloc_cell_array(1).unwrap();
        let old = rt.alloc_hashlist(array, 2).unwrap();
        rt.manage(old);
        rt.register_root("array", array);

        let _ = rt.rescue(|rt| {
            let fresh = rt.alloc_hashlist(array, 4)?;
            assert_eq!(rt.stub(array).link(), Some(fresh));
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.stub(array).link(), Some(old));

        rt.recycle();
        assert!(rt.is_live(old));
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_unwind_unsplices_synonym_from_outer_ring() {
        let mut rt = create_test_runtime();
        let symbol = rt.alloc_symbol("append").unwrap();
        let kept = rt.alloc_symbol("Append").unwrap();
        rt.link_synonym(symbol, kept);
        rt.register_root("symbol", symbol);
        rt.manage(kept);

        let _ = rt.rescue(|rt| {
            let upper = rt.alloc_symbol("APPEND")?;
            rt.link_synonym(symbol, upper);
            assert_eq!(rt.synonyms(symbol).len(), 3);
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.synonyms(symbol), vec![symbol, kept]);

        rt.recycle();
        assert!(rt.is_live(kept));
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_unwind_drops_levels_and_stack_cells_into_the_scope() {
        let mut rt = create_test_runtime();
        let _ = rt.rescue(|rt| {
            let level = rt.push_level("inner");
            let out = rt.alloc_cell_array(1)?;
            rt.level_mut(level).out.init_block(out, 0);
            let pushed = rt.alloc_cell_array(1)?;
            rt.stack_push()?.init_block(pushed, 0);
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.level_depth(), 0);
        assert_eq!(rt.stack_depth(), 0);

        rt.recycle();
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_outer_failure_undoes_cleanly_left_inner_writes() {
        let mut rt = create_test_runtime();
        let array = rt.alloc_cell_array(1).unwrap();
        rt.register_root("array", array);

        let _ = rt.rescue(|rt| {
            rt.rescue(|rt| rt.alloc_hashlist(array, 4))?;
            assert!(rt.stub(array).link().is_some());
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.stub(array).link(), None);
        rt.recycle();
        rt.pools().check().unwrap();
    }

    #[test]
    fn test_clean_exit_keeps_writes_and_clears_log() {
        let mut rt = create_test_runtime();
        let array = rt.alloc_cell_array(1).unwrap();
        let index = rt.rescue(|rt| rt.alloc_hashlist(array, 4)).unwrap();
        assert_eq!(rt.stub(array).link(), Some(index));
        assert!(rt.scopes.writes.is_empty());
    }

    #[test]
    fn test_writes_to_freed_stubs_are_skipped() {
        let mut rt = create_test_runtime();
        let _ = rt.rescue(|rt| {
            let array = rt.alloc_cell_array(1)?;
            let index = rt.alloc_hashlist(array, 4)?;
            rt.free_manual(index);
            rt.free_manual(array);
            Err::<(), _>(rt.raise_failure(boom()))
        });
        assert_eq!(rt.manual_count(), 0);
        rt.pools().check().unwrap();
    }

    #[test]
    #[should_panic(expected = "extant stack pointers are outstanding")]
    fn test_unwinding_with_extant_pointer_panics() {
        let mut rt = create_test_runtime();
        let token = rt.enter_scope();
        rt.stack_push().unwrap().init_integer(1);
        let _extant = unsafe { rt.stack_extant(0) };
        let err = rt.raise_failure(boom());
        let _ = rt.unwind_scope(token, err);
    }

    #[test]
    #[should_panic(expected = "left cleanly with a failure pending")]
    fn test_leaving_with_pending_failure_panics() {
        let mut rt = create_test_runtime();
        let token = rt.enter_scope();
        let _ = rt.raise_failure(boom());
        rt.leave_scope_cleanly(token);
    }

    #[test]
    #[should_panic(expected = "innermost first")]
    fn test_out_of_order_leave_panics() {
        let mut rt = create_test_runtime();
        let outer = rt.enter_scope();
        let _inner = rt.enter_scope();
        rt.leave_scope_cleanly(outer);
    }

    #[test]
    #[should_panic(expected = "uncaught failure: ** test error: boom")]
    fn test_uncaught_failure_is_fatal() {
        let mut rt = create_test_runtime();
        let _ = rt.raise_failure(boom());
    }
}
