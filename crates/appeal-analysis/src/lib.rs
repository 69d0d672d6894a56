//! The annotation-tree analyzer ("parameter grouper").
//!
//! Given a root callable, this crate decides which parameters are
//! *really* required and partitions the tree's positional parameters into
//! ordered argument groups. The problem it solves: a parameter with a
//! default is locally optional, but if something deeper in its subtree is
//! required, every ancestor feeding into that subtree must be satisfied
//! too. Grouping mirrors that nested optionality so the compiler can emit
//! `set_group` transitions in the right places.
//!
//! The analysis runs in three passes over the tree:
//!
//! 1. **Downward:** a parameter's optionality is its parent's optionality,
//!    plus one if it has a default.
//! 2. **Upward, right-to-left:** a parameter whose subtree carries a
//!    required descendant at a lower optionality is upgraded to required
//!    at that optionality.
//! 3. **Linearization:** DFS order, partitioned into contiguous runs of
//!    equal optionality; the leading run of level-0 required parameters
//!    becomes the required prefix.
//!
//! Consumers iterate the result with [`ParameterGrouper::iter`] (leaf
//! parameters only, for argument counting) or
//! [`ParameterGrouper::iter_all`] (every parameter, for compilers that
//! need to see group transitions on interior nodes).

mod grouper;
mod tree;

pub use grouper::{GroupedParameter, GrouperIter, ParameterGrouper};
pub use tree::{FnNode, ParamNode};
