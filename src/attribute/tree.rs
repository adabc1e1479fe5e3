//! Attribute tree implementation.

use crate::error::{Result, StateSystemError};
use crate::types::Quark;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Pattern element matching every child of the current node.
pub const WILDCARD_ELEMENT: &str = "*";

/// Pattern element moving up to the parent of the current node.
pub const PARENT_ELEMENT: &str = "..";

/// Split a slash-separated path into its elements, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|e| !e.is_empty()).collect()
}

/// A node of the tree.
#[derive(Clone, Debug)]
struct Attribute {
    name: String,
    parent: Quark,
    /// Children in creation order.
    children: Vec<Quark>,
    child_index: HashMap<String, Quark>,
}

#[derive(Default)]
struct TreeInner {
    nodes: Vec<Attribute>,
    roots: Vec<Quark>,
    root_index: HashMap<String, Quark>,
}

/// On-disk form of the tree: `(name, parent)` per quark, in quark order.
#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    entries: Vec<(String, Quark)>,
}

impl TreeInner {
    fn check(&self, quark: Quark) -> Result<&Attribute> {
        self.nodes
            .get(quark.index())
            .ok_or(StateSystemError::OutOfBounds {
                quark,
                count: self.nodes.len(),
            })
    }

    fn check_start(&self, start: Quark) -> Result<()> {
        if start.is_root() {
            Ok(())
        } else {
            self.check(start).map(|_| ())
        }
    }

    fn child(&self, parent: Quark, name: &str) -> Option<Quark> {
        if parent.is_root() {
            self.root_index.get(name).copied()
        } else {
            self.nodes[parent.index()].child_index.get(name).copied()
        }
    }

    fn children(&self, parent: Quark) -> &[Quark] {
        if parent.is_root() {
            &self.roots
        } else {
            &self.nodes[parent.index()].children
        }
    }

    fn add_child(&mut self, parent: Quark, name: &str) -> Quark {
        let quark = Quark(self.nodes.len() as u32);
        self.nodes.push(Attribute {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
        });
        if parent.is_root() {
            self.roots.push(quark);
            self.root_index.insert(name.to_string(), quark);
        } else {
            let node = &mut self.nodes[parent.index()];
            node.children.push(quark);
            node.child_index.insert(name.to_string(), quark);
        }
        quark
    }

    fn find<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Option<Quark> {
        let mut current = start;
        for element in path {
            current = self.child(current, element.as_ref())?;
        }
        Some(current)
    }

    fn collect_children(&self, quark: Quark, recursive: bool, out: &mut Vec<Quark>) {
        for &child in self.children(quark) {
            out.push(child);
            if recursive {
                self.collect_children(child, true, out);
            }
        }
    }
}

/// Bidirectional mapping between attribute paths and quarks.
///
/// Readers and the single writer share the tree; lookups take a read lock
/// and creation takes the write lock for the whole path.
pub struct AttributeTree {
    inner: RwLock<TreeInner>,
}

impl AttributeTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TreeInner::default()),
        }
    }

    /// Number of attributes.
    pub fn count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Resolve `path` below `start`, creating missing nodes.
    ///
    /// `on_new` runs for every created quark, in creation order, while the
    /// tree is still write-locked: a reader can never observe a quark before
    /// the callback has finished with it.
    pub fn get_or_create<S, F>(&self, start: Quark, path: &[S], mut on_new: F) -> Result<Quark>
    where
        S: AsRef<str>,
        F: FnMut(Quark),
    {
        if start.is_root() && path.is_empty() {
            return Err(StateSystemError::InvalidArgument(
                "empty attribute path".into(),
            ));
        }

        // Fast path: everything already exists.
        {
            let inner = self.inner.read();
            inner.check_start(start)?;
            if let Some(quark) = inner.find(start, path) {
                return Ok(quark);
            }
        }

        let mut inner = self.inner.write();
        let mut current = start;
        for element in path {
            let element = element.as_ref();
            current = match inner.child(current, element) {
                Some(quark) => quark,
                None => {
                    let quark = inner.add_child(current, element);
                    on_new(quark);
                    quark
                }
            };
        }
        Ok(current)
    }

    /// Resolve `path` below `start` without creating anything.
    pub fn find<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Option<Quark>> {
        let inner = self.inner.read();
        inner.check_start(start)?;
        if start.is_root() && path.is_empty() {
            return Ok(None);
        }
        Ok(inner.find(start, path))
    }

    /// Base name of an attribute.
    pub fn name(&self, quark: Quark) -> Result<String> {
        Ok(self.inner.read().check(quark)?.name.clone())
    }

    /// Parent of an attribute; [`Quark::ROOT`] for top-level attributes.
    pub fn parent(&self, quark: Quark) -> Result<Quark> {
        Ok(self.inner.read().check(quark)?.parent)
    }

    /// Path elements from the top of the tree down to `quark`.
    pub fn full_path_elements(&self, quark: Quark) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut node = inner.check(quark)?;
        let mut elements = vec![node.name.clone()];
        while !node.parent.is_root() {
            node = &inner.nodes[node.parent.index()];
            elements.push(node.name.clone());
        }
        elements.reverse();
        Ok(elements)
    }

    /// Slash-joined full path of an attribute.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        Ok(self.full_path_elements(quark)?.join("/"))
    }

    /// Children of `quark` (or top-level attributes for [`Quark::ROOT`]).
    ///
    /// With `recursive`, the whole subtree is returned depth-first.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        let inner = self.inner.read();
        inner.check_start(quark)?;
        let mut out = Vec::new();
        inner.collect_children(quark, recursive, &mut out);
        Ok(out)
    }

    /// Like [`sub_attributes`](Self::sub_attributes), keeping only names that
    /// fully match the regular expression `pattern`.
    pub fn sub_attributes_matching(
        &self,
        quark: Quark,
        recursive: bool,
        pattern: &str,
    ) -> Result<Vec<Quark>> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))?;
        let all = self.sub_attributes(quark, recursive)?;
        let inner = self.inner.read();
        Ok(all
            .into_iter()
            .filter(|q| regex.is_match(&inner.nodes[q.index()].name))
            .collect())
    }

    /// Quarks matching a path pattern below `start`.
    ///
    /// Each element is a literal name, [`WILDCARD_ELEMENT`] or
    /// [`PARENT_ELEMENT`]. An empty pattern returns `start` itself.
    pub fn quarks_matching<S: AsRef<str>>(&self, start: Quark, pattern: &[S]) -> Result<Vec<Quark>> {
        let inner = self.inner.read();
        inner.check_start(start)?;
        if pattern.is_empty() {
            return Ok(if start.is_root() { Vec::new() } else { vec![start] });
        }

        let mut frontier = vec![start];
        for element in pattern {
            let element = element.as_ref();
            let mut next = Vec::new();
            for quark in frontier {
                match element {
                    WILDCARD_ELEMENT => next.extend_from_slice(inner.children(quark)),
                    PARENT_ELEMENT => {
                        if !quark.is_root() {
                            next.push(inner.nodes[quark.index()].parent);
                        }
                    }
                    name => next.extend(inner.child(quark, name)),
                }
            }
            frontier = next;
        }

        let mut seen = HashSet::new();
        Ok(frontier
            .into_iter()
            .filter(|q| !q.is_root() && seen.insert(*q))
            .collect())
    }

    /// Serialize the tree for storage next to a history.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let snapshot = TreeSnapshot {
            entries: inner
                .nodes
                .iter()
                .map(|n| (n.name.clone(), n.parent))
                .collect(),
        };
        Ok(rmp_serde::to_vec(&snapshot)?)
    }

    /// Rebuild a tree from [`encode`](Self::encode) output.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snapshot: TreeSnapshot = rmp_serde::from_slice(bytes)?;
        let mut inner = TreeInner::default();
        for (name, parent) in snapshot.entries {
            if !parent.is_root() && parent.index() >= inner.nodes.len() {
                return Err(StateSystemError::InvalidFormat(format!(
                    "attribute {} references unknown parent {}",
                    name, parent
                )));
            }
            inner.add_child(parent, &name);
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}
