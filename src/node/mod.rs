//! Tree node model (spec §3, §9 "Polymorphism over variants").
//!
//! `TreeNode` has exactly two real variants, `Branch` and `Leaf`; a
//! special-sparse leaf is represented separately as [`leaf::SparseLeaf`]
//! since it never needs an owned payload and is never a parent.

pub mod branch;
pub mod leaf;

pub use branch::Branch;
pub use leaf::{Leaf, SparseLeaf};

/// A node fetched from the heap or the store. Sparse leaves are modeled as a
/// distinct variant rather than folded into `Leaf` because they carry no
/// buffer at all (spec §9).
#[derive(Debug, Clone)]
pub enum TreeNode {
    Branch(Branch),
    Leaf(Leaf),
    Sparse(SparseLeaf),
}

impl TreeNode {
    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            TreeNode::Branch(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            TreeNode::Branch(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_leaf_like(&self) -> bool {
        matches!(self, TreeNode::Leaf(_) | TreeNode::Sparse(_))
    }

    /// Byte size of this node if it is leaf-like; `None` for a branch (whose
    /// "size" is the sum of its children's subtree byte counts instead).
    pub fn leaf_size(&self) -> Option<u32> {
        match self {
            TreeNode::Leaf(l) => Some(l.size()),
            TreeNode::Sparse(s) => Some(s.size()),
            TreeNode::Branch(_) => None,
        }
    }

    /// Materializes a sparse leaf into an owned [`Leaf`] so it can be
    /// mutated; leaves a real leaf untouched.
    pub fn into_mutable_leaf(self) -> Option<Leaf> {
        match self {
            TreeNode::Leaf(l) if l.is_frozen() => Some(l.unfreeze()),
            TreeNode::Leaf(l) => Some(l),
            TreeNode::Sparse(s) => Some(s.materialize()),
            TreeNode::Branch(_) => None,
        }
    }
}
