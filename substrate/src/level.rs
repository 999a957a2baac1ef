use crate::{cell::Cell, node::NodeFlags, runtime::Runtime, stack::StackIndex, stub::StubRef};

/// Handle to a pushed [`Level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelId(usize);

/// One frame of the execution-state stack.
///
/// Whatever a suspended frame still needs lives here, so the collector
/// finds it without scanning the native stack.
#[derive(Debug)]
pub struct Level {
    pub label: &'static str,
    pub out: Cell,
    pub spare: Cell,
    pub varlist: Option<StubRef>,
    stack_base: StackIndex,
}

impl Level {
    #[inline(always)]
    pub fn stack_base(&self) -> StackIndex {
        self.stack_base
    }

    pub(crate) fn for_each_node(&self, visit: &mut dyn FnMut(StubRef)) {
        self.out.for_each_node(visit);
        self.spare.for_each_node(visit);
        if let Some(varlist) = self.varlist {
            visit(varlist);
        }
    }
}

impl Runtime {
    /// Start a level at the current stack depth.
    pub fn push_level(&mut self, label: &'static str) -> LevelId {
        self.levels.push(Level {
            label,
            out: Cell::erased_at(NodeFlags::STACK),
            spare: Cell::erased_at(NodeFlags::STACK),
            varlist: None,
            stack_base: self.stack.mark(),
        });
        LevelId(self.levels.len() - 1)
    }

    pub fn level(&self, id: LevelId) -> &Level {
        &self.levels[id.0]
    }

    pub fn level_mut(&mut self, id: LevelId) -> &mut Level {
        &mut self.levels[id.0]
    }

    #[inline(always)]
    pub fn level_depth(&self) -> usize {
        self.levels.len()
    }

    /// Drop the innermost level, which must be `id`.
    pub fn drop_level(&mut self, id: LevelId) {
        assert_eq!(
            id.0 + 1,
            self.levels.len(),
            "levels must be dropped innermost first"
        );
        let Some(level) = self.levels.pop() else {
            return;
        };
        if self.settings.checked {
            assert_eq!(
                level.stack_base.depth(),
                self.stack.depth(),
                "level `{}` left the value stack unbalanced",
                level.label
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::create_test_runtime;

    #[test]
    fn test_levels_nest() {
        let mut rt = create_test_runtime();
        let outer = rt.push_level("outer");
        rt.stack_push().unwrap().init_blank();
        let inner = rt.push_level("inner");
        assert_eq!(rt.level(inner).stack_base().depth(), 1);
        assert_eq!(rt.level_depth(), 2);

        rt.level_mut(inner).out.init_integer(3);
        assert!(rt.level(inner).out.tag().contains(NodeFlags::STACK));
        rt.drop_level(inner);

        rt.stack_drop();
        rt.drop_level(outer);
        assert_eq!(rt.level_depth(), 0);
    }

    #[test]
    #[should_panic(expected = "innermost first")]
    fn test_out_of_order_drop_panics() {
        let mut rt = create_test_runtime();
        let outer = rt.push_level("outer");
        let _inner = rt.push_level("inner");
        rt.drop_level(outer);
    }

    #[test]
    #[should_panic(expected = "left the value stack unbalanced")]
    fn test_unbalanced_level_panics() {
        let mut rt = create_test_runtime();
        let level = rt.push_level("leaky");
        rt.stack_push().unwrap();
        rt.drop_level(level);
    }
}
