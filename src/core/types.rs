//! Shared value types of the frame cache: frames, item ids, id trees.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Sequence position. No intrinsic payload.
pub type Frame = i32;

/// Inclusive `(first, last)` run of frames.
pub type FrameRange = (Frame, Frame);

/// Identity of an upstream content producer (graph node).
pub type ProducerId = Uuid;

/// Identifier of a resident content blob.
///
/// Backed by `Arc<str>` so cloning into the frame and item maps is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Arc<str>);

impl ItemId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Opaque sized content blob produced by the pipeline for one or more frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Item {
    pub id: ItemId,
    pub bytes: usize,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, bytes: usize) -> Self {
        Self { id: id.into(), bytes }
    }
}

/// Item ids making up one frame's composite, one list per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTree(pub Vec<Vec<ItemId>>);

impl IdTree {
    /// Single-layer tree.
    pub fn single(ids: impl IntoIterator<Item = ItemId>) -> Self {
        Self(vec![ids.into_iter().collect()])
    }

    /// Iterate over all leaf ids, skipping empty ids.
    pub fn leaves(&self) -> impl Iterator<Item = &ItemId> {
        self.0.iter().flatten().filter(|id| !id.as_str().is_empty())
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().count()
    }
}

/// Result of checking an id tree against store residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeResult {
    /// Every leaf id is resident
    HasAllIds,
    /// Some leaf ids are resident
    HasSomeIds,
    /// No leaf id is resident
    HasNoIds,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_cheap_clone_and_order() {
        let a = ItemId::new("src0.layer1.f10");
        let b = a.clone();
        assert_eq!(a, b);
        assert!(ItemId::new("a") < ItemId::new("b"));
        assert_eq!(a.to_string(), "src0.layer1.f10");
    }

    #[test]
    fn test_id_tree_leaves_skip_empty() {
        let tree = IdTree(vec![
            vec![ItemId::new("a"), ItemId::new("")],
            vec![ItemId::new("b")],
        ]);
        let leaves: Vec<_> = tree.leaves().map(|id| id.as_str()).collect();
        assert_eq!(leaves, vec!["a", "b"]);
        assert_eq!(tree.leaf_count(), 2);
    }
}
