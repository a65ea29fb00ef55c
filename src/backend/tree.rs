//! An AVL tree of free blocks, keyed by address.
//!
//! The tree owns no memory: its nodes are the free blocks themselves, and a
//! [`TreeRep`] decides where a node's links are kept. Keys are block
//! addresses and `0` is the null node.

use core::{
    ptr::{self, NonNull},
    sync::atomic::Ordering::*,
};

use super::pagemap::{BACKEND_RESERVED_MASK, META_BOUNDARY_BIT, Pagemap, REMOTE_BACKEND_MARKER};
use crate::{config::MIN_CHUNK_BITS, sizeclass::MIN_CHUNK_SIZE};

/// Where the links of a tree node live.
pub trait TreeRep {
    fn left(&self, node: usize) -> usize;
    fn right(&self, node: usize) -> usize;
    fn height(&self, node: usize) -> u8;
    fn set_left(&self, node: usize, left: usize);
    fn set_right(&self, node: usize, right: usize);
    fn set_height(&self, node: usize, height: u8);

    /// Takes ownership of a block about to become a node.
    fn init(&self, node: usize) {
        self.set_left(node, 0);
        self.set_right(node, 0);
        self.set_height(node, 1);
    }

    /// Whether a block may merge with the block starting at `higher`, its
    /// buddy right above it.
    fn can_consolidate(&self, higher: usize) -> bool {
        let _ = higher;
        true
    }
}

/// Keeps the links in the pagemap entries of backend-owned chunks.
///
/// The metadata word holds the left child and the height, the remote word
/// the right child. Children are chunk-aligned, which leaves the reserved
/// low bits free.
#[derive(Debug, Clone, Copy)]
pub struct PagemapRep<'a> {
    pagemap: &'a Pagemap,
}

const HEIGHT_SHIFT: usize = 8;
const HEIGHT_MASK: usize = 0x3f << HEIGHT_SHIFT;
const ADDR_MASK: usize = !(MIN_CHUNK_SIZE - 1);

const _: () = assert!(MIN_CHUNK_BITS >= 14 && HEIGHT_MASK & BACKEND_RESERVED_MASK == 0);

impl<'a> PagemapRep<'a> {
    pub fn new(pagemap: &'a Pagemap) -> Self {
        PagemapRep { pagemap }
    }

    fn update(&self, node: usize, meta: impl FnOnce(usize) -> usize, ras: impl FnOnce(usize) -> usize) {
        if let Some((m, r)) = self.pagemap.backend_words(node) {
            m.store(meta(m.load(Relaxed)), Relaxed);
            r.store(ras(r.load(Relaxed)), Relaxed);
        }
    }

    fn words(&self, node: usize) -> (usize, usize) {
        self.pagemap
            .backend_words(node)
            .map_or((0, 0), |(m, r)| (m.load(Relaxed), r.load(Relaxed)))
    }
}

impl TreeRep for PagemapRep<'_> {
    fn left(&self, node: usize) -> usize {
        self.words(node).0 & ADDR_MASK
    }

    fn right(&self, node: usize) -> usize {
        self.words(node).1 & ADDR_MASK
    }

    fn height(&self, node: usize) -> u8 {
        ((self.words(node).0 & HEIGHT_MASK) >> HEIGHT_SHIFT) as u8
    }

    fn set_left(&self, node: usize, left: usize) {
        self.update(node, |m| (m & !ADDR_MASK) | left, |r| r)
    }

    fn set_right(&self, node: usize, right: usize) {
        self.update(node, |m| m, |r| (r & !ADDR_MASK) | right)
    }

    fn set_height(&self, node: usize, height: u8) {
        self.update(node, |m| (m & !HEIGHT_MASK) | ((height as usize) << HEIGHT_SHIFT), |r| r)
    }

    fn init(&self, node: usize) {
        self.update(node, |m| m & META_BOUNDARY_BIT | 1 << HEIGHT_SHIFT, |_| REMOTE_BACKEND_MARKER)
    }

    fn can_consolidate(&self, higher: usize) -> bool {
        !self.pagemap.get(higher).is_boundary()
    }
}

/// Keeps the links in the first three words of the free block itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineRep;

/// The smallest block an [`InlineRep`] can describe.
pub const INLINE_MIN_SIZE: usize = (3 * size_of::<usize>()).next_power_of_two();

impl InlineRep {
    fn word(node: usize, index: usize) -> NonNull<usize> {
        debug_assert_ne!(node, 0);
        // SAFETY: nodes are non-null free blocks of at least `INLINE_MIN_SIZE`
        // accessible bytes, handed to the tree by their owner.
        unsafe { NonNull::new_unchecked(ptr::with_exposed_provenance_mut::<usize>(node).add(index)) }
    }

    fn read(node: usize, index: usize) -> usize {
        // SAFETY: see `word`.
        unsafe { Self::word(node, index).read() }
    }

    fn write(node: usize, index: usize, value: usize) {
        // SAFETY: see `word`.
        unsafe { Self::word(node, index).write(value) }
    }
}

impl TreeRep for InlineRep {
    fn left(&self, node: usize) -> usize {
        Self::read(node, 0)
    }

    fn right(&self, node: usize) -> usize {
        Self::read(node, 1)
    }

    fn height(&self, node: usize) -> u8 {
        Self::read(node, 2) as u8
    }

    fn set_left(&self, node: usize, left: usize) {
        Self::write(node, 0, left)
    }

    fn set_right(&self, node: usize, right: usize) {
        Self::write(node, 1, right)
    }

    fn set_height(&self, node: usize, height: u8) {
        Self::write(node, 2, height as usize)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tree {
    root: usize,
}

fn height<R: TreeRep>(rep: &R, node: usize) -> u8 {
    if node == 0 { 0 } else { rep.height(node) }
}

fn fix_height<R: TreeRep>(rep: &R, node: usize) {
    let h = height(rep, rep.left(node)).max(height(rep, rep.right(node)));
    rep.set_height(node, h + 1);
}

fn rotate_right<R: TreeRep>(rep: &R, node: usize) -> usize {
    let left = rep.left(node);
    rep.set_left(node, rep.right(left));
    rep.set_right(left, node);
    fix_height(rep, node);
    fix_height(rep, left);
    left
}

fn rotate_left<R: TreeRep>(rep: &R, node: usize) -> usize {
    let right = rep.right(node);
    rep.set_right(node, rep.left(right));
    rep.set_left(right, node);
    fix_height(rep, node);
    fix_height(rep, right);
    right
}

fn rebalance<R: TreeRep>(rep: &R, node: usize) -> usize {
    fix_height(rep, node);
    let (left, right) = (rep.left(node), rep.right(node));
    let factor = height(rep, left) as i32 - height(rep, right) as i32;
    if factor > 1 {
        if height(rep, rep.left(left)) < height(rep, rep.right(left)) {
            rep.set_left(node, rotate_left(rep, left));
        }
        return rotate_right(rep, node);
    }
    if factor < -1 {
        if height(rep, rep.right(right)) < height(rep, rep.left(right)) {
            rep.set_right(node, rotate_right(rep, right));
        }
        return rotate_left(rep, node);
    }
    node
}

fn insert_at<R: TreeRep>(rep: &R, node: usize, key: usize) -> usize {
    if node == 0 {
        rep.init(key);
        return key;
    }
    debug_assert_ne!(node, key, "block {key:#x} inserted twice");
    if key < node {
        rep.set_left(node, insert_at(rep, rep.left(node), key));
    } else {
        rep.set_right(node, insert_at(rep, rep.right(node), key));
    }
    rebalance(rep, node)
}

/// Returns the new subtree root and the detached minimum.
fn remove_min_at<R: TreeRep>(rep: &R, node: usize) -> (usize, usize) {
    let left = rep.left(node);
    if left == 0 {
        return (rep.right(node), node);
    }
    let (left, min) = remove_min_at(rep, left);
    rep.set_left(node, left);
    (rebalance(rep, node), min)
}

fn remove_at<R: TreeRep>(rep: &R, node: usize, key: usize, found: &mut bool) -> usize {
    if node == 0 {
        return 0;
    }
    if key < node {
        rep.set_left(node, remove_at(rep, rep.left(node), key, found));
    } else if key > node {
        rep.set_right(node, remove_at(rep, rep.right(node), key, found));
    } else {
        *found = true;
        let (left, right) = (rep.left(node), rep.right(node));
        if right == 0 {
            return left;
        }
        if left == 0 {
            return right;
        }
        let (right, min) = remove_min_at(rep, right);
        rep.set_left(min, left);
        rep.set_right(min, right);
        return rebalance(rep, min);
    }
    rebalance(rep, node)
}

impl Tree {
    pub const fn new() -> Self {
        Tree { root: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub fn contains<R: TreeRep>(&self, rep: &R, key: usize) -> bool {
        let mut node = self.root;
        while node != 0 {
            match key.cmp(&node) {
                core::cmp::Ordering::Less => node = rep.left(node),
                core::cmp::Ordering::Greater => node = rep.right(node),
                core::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    pub fn insert<R: TreeRep>(&mut self, rep: &R, key: usize) {
        debug_assert_ne!(key, 0);
        self.root = insert_at(rep, self.root, key);
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove<R: TreeRep>(&mut self, rep: &R, key: usize) -> bool {
        let mut found = false;
        self.root = remove_at(rep, self.root, key, &mut found);
        found
    }

    /// Removes the lowest address.
    pub fn remove_min<R: TreeRep>(&mut self, rep: &R) -> Option<usize> {
        if self.root == 0 {
            return None;
        }
        let (root, min) = remove_min_at(rep, self.root);
        self.root = root;
        Some(min)
    }

    /// Walks the tree in order, checking the search and balance properties.
    #[cfg(test)]
    pub fn check<R: TreeRep>(&self, rep: &R) -> std::vec::Vec<usize> {
        fn walk<R: TreeRep>(rep: &R, node: usize, out: &mut std::vec::Vec<usize>) -> u8 {
            if node == 0 {
                return 0;
            }
            let l = walk(rep, rep.left(node), out);
            out.push(node);
            let r = walk(rep, rep.right(node), out);
            assert!(l.abs_diff(r) <= 1, "unbalanced at {node:#x}");
            assert_eq!(rep.height(node), l.max(r) + 1);
            l.max(r) + 1
        }
        let mut out = std::vec::Vec::new();
        walk(rep, self.root, &mut out);
        assert!(out.is_sorted());
        out
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::{collections::BTreeMap, vec::Vec};

    use super::*;

    #[derive(Default)]
    struct MapRep(RefCell<BTreeMap<usize, (usize, usize, u8)>>);

    impl MapRep {
        fn with(&self, node: usize, f: impl FnOnce(&mut (usize, usize, u8))) {
            f(self.0.borrow_mut().entry(node).or_default())
        }

        fn get(&self, node: usize) -> (usize, usize, u8) {
            self.0.borrow().get(&node).copied().unwrap_or_default()
        }
    }

    impl TreeRep for MapRep {
        fn left(&self, node: usize) -> usize {
            self.get(node).0
        }
        fn right(&self, node: usize) -> usize {
            self.get(node).1
        }
        fn height(&self, node: usize) -> u8 {
            self.get(node).2
        }
        fn set_left(&self, node: usize, left: usize) {
            self.with(node, |n| n.0 = left)
        }
        fn set_right(&self, node: usize, right: usize) {
            self.with(node, |n| n.1 = right)
        }
        fn set_height(&self, node: usize, height: u8) {
            self.with(node, |n| n.2 = height)
        }
    }

    #[test]
    fn random_operations() {
        let rep = MapRep::default();
        let mut tree = Tree::new();
        let mut model = std::collections::BTreeSet::new();
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for _ in 0..4000 {
            let key = rng.usize(1..512) * 64;
            match rng.u8(0..3) {
                0 | 1 if !model.contains(&key) => {
                    tree.insert(&rep, key);
                    model.insert(key);
                }
                _ => assert_eq!(tree.remove(&rep, key), model.remove(&key)),
            }
            assert_eq!(tree.contains(&rep, key), model.contains(&key));
        }
        assert_eq!(tree.check(&rep), model.iter().copied().collect::<Vec<_>>());

        while let Some(min) = tree.remove_min(&rep) {
            assert_eq!(Some(min), model.pop_first());
        }
        assert!(model.is_empty() && tree.is_empty());
    }

    #[test]
    fn inline_nodes() {
        let mut blocks = [[0usize; 4]; 16];
        let addrs: Vec<usize> = blocks.iter_mut().map(|b| b.as_mut_ptr().expose_provenance()).collect();
        let mut tree = Tree::new();
        for &addr in addrs.iter().rev() {
            tree.insert(&InlineRep, addr);
        }
        assert_eq!(tree.check(&InlineRep), addrs);
        assert!(tree.remove(&InlineRep, addrs[7]));
        assert!(!tree.contains(&InlineRep, addrs[7]));
        assert_eq!(tree.remove_min(&InlineRep), Some(addrs[0]));
    }
}
