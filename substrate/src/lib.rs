mod api;
mod cell;
mod error;
mod gc;
mod guard;
mod level;
mod node;
mod pool;
mod runtime;
mod scope;
mod settings;
mod stack;
mod stub;

pub use api::ApiHandle;
pub use cell::{Cell, CellFlags, Heart};
pub use error::{Error, Result};
pub use gc::{GcStats, Root, RootProvider, TraceFn, trace_stub};
pub use level::{Level, LevelId};
pub use node::{END_BYTE, END_NODE, FREE_BYTE, NodeFlags, NodeKind, classify, classify_byte};
pub use pool::{CELL_POOL, PoolId, PoolSpec, PoolStats, Pools, STUB_POOL, SegmentSpan};
pub use runtime::{Runtime, Snapshot};
pub use scope::{ScopeState, ScopeToken};
pub use settings::{DEFAULT_POOL_TIERS, RuntimeCreateInfo, RuntimeSettings};
pub use stack::{ExtantPtr, StackIndex};
pub use stub::{Flavor, INLINE_BYTES, Stub, StubFlags, StubRef};
