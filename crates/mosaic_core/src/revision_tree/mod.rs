//! Revision trees.
//!
//! A revision tree summarizes the set of live document revisions of a
//! collection so that two replicas can find differing key ranges without
//! exchanging the revisions themselves. Commits buffer their changes in a
//! [`RevisionTreeBuffer`]; metadata sync folds them into the live tree once
//! no in-flight transaction can still commit below them.

mod buffer;
mod tree;

pub use buffer::{BufferedTreeUpdate, RevisionTreeBuffer};
pub use tree::{hash_key, NodeValue, RevisionTree};
