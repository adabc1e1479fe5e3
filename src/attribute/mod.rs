//! Hierarchical attribute namespace.
//!
//! Attributes live in a flat, append-only arena indexed by quark. Parents
//! are plain indices, so the tree never forms reference cycles and a quark
//! stays addressable for the whole life of the state system.

mod tree;

pub use tree::{split_path, AttributeTree, PARENT_ELEMENT, WILDCARD_ELEMENT};
