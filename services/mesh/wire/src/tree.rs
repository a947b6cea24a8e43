//! Rooted trees, used to describe multicast hop plans.

/// A rooted tree of values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree<T> {
    /// Value at the root of this (sub)tree
    pub value: T,
    /// Child subtrees
    pub subtrees: Vec<Tree<T>>,
}

impl<T> Tree<T> {
    /// Create a single-vertex tree
    pub fn leaf(value: T) -> Self {
        Self {
            value,
            subtrees: Vec::new(),
        }
    }

    /// Create a tree with the given children
    pub fn with_subtrees(value: T, subtrees: Vec<Tree<T>>) -> Self {
        Self { value, subtrees }
    }

    /// Whether this tree has no children
    pub fn is_leaf(&self) -> bool {
        self.subtrees.is_empty()
    }

    /// Number of vertices, the root included
    pub fn vertex_count(&self) -> usize {
        1 + self.subtrees.iter().map(Tree::vertex_count).sum::<usize>()
    }

    /// Number of levels (a leaf has depth 1)
    pub fn depth(&self) -> usize {
        1 + self.subtrees.iter().map(Tree::depth).max().unwrap_or(0)
    }

    /// All values in pre-order
    pub fn values(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.vertex_count());
        self.collect_values(&mut out);
        out
    }

    fn collect_values<'a>(&'a self, out: &mut Vec<&'a T>) {
        out.push(&self.value);
        for subtree in &self.subtrees {
            subtree.collect_values(out);
        }
    }
}

impl<T: PartialEq> Tree<T> {
    /// Whether any vertex holds `value`
    pub fn contains(&self, value: &T) -> bool {
        self.value == *value || self.subtrees.iter().any(|s| s.contains(value))
    }

    /// Path of values from the root down to `value`, if present
    pub fn path_to(&self, value: &T) -> Option<Vec<&T>> {
        if self.value == *value {
            return Some(vec![&self.value]);
        }
        self.subtrees.iter().find_map(|subtree| {
            subtree.path_to(value).map(|mut path| {
                path.insert(0, &self.value);
                path
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree<u32> {
        Tree::with_subtrees(
            1,
            vec![
                Tree::with_subtrees(2, vec![Tree::leaf(4), Tree::leaf(5)]),
                Tree::leaf(3),
            ],
        )
    }

    #[test]
    fn test_shape() {
        let tree = sample();
        assert_eq!(tree.vertex_count(), 5);
        assert_eq!(tree.depth(), 3);
        assert!(!tree.is_leaf());
        assert!(tree.subtrees[1].is_leaf());
        assert_eq!(tree.values(), vec![&1, &2, &4, &5, &3]);
    }

    #[test]
    fn test_contains_and_path() {
        let tree = sample();
        assert!(tree.contains(&5));
        assert!(!tree.contains(&6));
        assert_eq!(tree.path_to(&5), Some(vec![&1, &2, &5]));
        assert_eq!(tree.path_to(&6), None);
    }
}
