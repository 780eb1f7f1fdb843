// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

pub type NodeChild<T> = Arc<Node<T>>;

/// A node of an ordered tree.
///
/// `T` is the type of the node's kind. Children are shared, so cloning a
/// compiled program does not copy its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<T>
where
    T: Clone,
{
    pub kind: T,
    pub children: Vec<NodeChild<T>>,
}

impl<T> Node<T>
where
    T: Clone,
{
    pub fn new(kind: T) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: T, children: Vec<NodeChild<T>>) -> Self {
        Self { kind, children }
    }

    /// Visits the node and its descendants depth first, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a T, usize)) {
        self.walk_at(0, visit);
    }

    fn walk_at<'a>(&'a self, depth: usize, visit: &mut impl FnMut(&'a T, usize)) {
        visit(&self.kind, depth);
        for child in &self.children {
            child.walk_at(depth + 1, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Node<i32> {
        let inner = Node::with_children(1, vec![Node::new(2).into()]);
        Node::with_children(0, vec![inner.into(), Node::new(3).into()])
    }

    #[test]
    fn test_walk_order_and_depth() {
        let mut seen = vec![];
        tree().walk(&mut |kind, depth| seen.push((*kind, depth)));
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2), (3, 1)]);
    }

    #[test]
    fn test_clone_shares_children() {
        let root = tree();
        let copy = root.clone();
        assert!(Arc::ptr_eq(&root.children[0], &copy.children[0]));
        assert_eq!(copy, root);
    }
}
