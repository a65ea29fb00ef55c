//! Intrusive lists of slab metadata, owned by a single heap.

use core::{cell::Cell, fmt, ptr};

/// Something that can be filed into a [`SlabList`].
pub trait SlabLinked<'a>: 'a {
    fn link(&'a self) -> &'a SlabLink<'a, Self>;
}

/// The link fields embedded in every [`SlabLinked`] item. An item is in at
/// most one list at a time.
pub struct SlabLink<'a, T: ?Sized> {
    /// The address of the list holding the item, or 0.
    list: Cell<usize>,
    prev: Cell<Option<&'a T>>,
    next: Cell<Option<&'a T>>,
}

impl<T: ?Sized> fmt::Debug for SlabLink<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.list.get() {
            0 => f.write_str("SlabLink(-)"),
            list => write!(f, "SlabLink(in {list:#x})"),
        }
    }
}

impl<T> SlabLink<'_, T> {
    pub const fn new() -> Self {
        SlabLink { list: Cell::new(0), prev: Cell::new(None), next: Cell::new(None) }
    }

    pub fn is_linked(&self) -> bool {
        self.list.get() != 0
    }
}

impl<T> Default for SlabLink<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A doubly-linked list of slabs.
///
/// [`push`](Self::push) inserts at the front, so [`pop_front`](Self::pop_front)
/// takes the newest item and [`pop_back`](Self::pop_back) the oldest.
pub struct SlabList<'a, T> {
    ends: Cell<Option<(&'a T, &'a T)>>,
    len: Cell<usize>,
}

impl<T> fmt::Debug for SlabList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabList").field("len", &self.len.get()).finish_non_exhaustive()
    }
}

impl<T> Default for SlabList<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> SlabList<'a, T> {
    pub const fn new() -> Self {
        SlabList { ends: Cell::new(None), len: Cell::new(0) }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.get().is_none()
    }
}

impl<'a, T: SlabLinked<'a>> SlabList<'a, T> {
    fn addr(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    pub fn push(&self, item: &'a T) {
        let link = item.link();
        debug_assert!(!link.is_linked(), "slab filed twice");
        link.list.set(self.addr());
        link.prev.set(None);
        let ends = match self.ends.get() {
            None => {
                link.next.set(None);
                (item, item)
            }
            Some((head, tail)) => {
                link.next.set(Some(head));
                head.link().prev.set(Some(item));
                (item, tail)
            }
        };
        self.ends.set(Some(ends));
        self.len.set(self.len.get() + 1);
    }

    pub fn pop_front(&self) -> Option<&'a T> {
        let (head, _) = self.ends.get()?;
        self.unlink(head);
        Some(head)
    }

    pub fn pop_back(&self) -> Option<&'a T> {
        let (_, tail) = self.ends.get()?;
        self.unlink(tail);
        Some(tail)
    }

    pub fn contains(&self, item: &'a T) -> bool {
        item.link().list.get() == self.addr()
    }

    /// Takes `item` out of the list. Returns `false` if it is not in it.
    pub fn remove(&self, item: &'a T) -> bool {
        let present = self.contains(item);
        if present {
            self.unlink(item);
        }
        present
    }

    fn unlink(&self, item: &'a T) {
        let link = item.link();
        let (prev, next) = (link.prev.take(), link.next.take());
        link.list.set(0);

        if let Some(prev) = prev {
            prev.link().next.set(next);
        }
        if let Some(next) = next {
            next.link().prev.set(prev);
        }
        let ends = self.ends.get().and_then(|(head, tail)| {
            let head = if ptr::eq(head, item) { next } else { Some(head) };
            let tail = if ptr::eq(tail, item) { prev } else { Some(tail) };
            head.zip(tail)
        });
        self.ends.set(ends);
        self.len.set(self.len.get() - 1);
    }

    /// Front to back.
    pub fn iter(&self) -> impl Iterator<Item = &'a T> + use<'a, T> {
        let head = self.ends.get().map(|(head, _)| head);
        core::iter::successors(head, |item| item.link().next.get())
    }

    /// Removes and yields, front to back, the items for which `pred` holds.
    ///
    /// Items are removed as the iterator reaches them; dropping it early
    /// still visits the rest.
    pub fn drain<F>(&self, pred: F) -> Drain<'a, '_, T, F>
    where
        F: FnMut(&'a T) -> bool,
    {
        Drain { list: self, cursor: self.ends.get().map(|(head, _)| head), pred }
    }
}

pub struct Drain<'a, 'l, T: SlabLinked<'a>, F: FnMut(&'a T) -> bool> {
    list: &'l SlabList<'a, T>,
    cursor: Option<&'a T>,
    pred: F,
}

impl<'a, T: SlabLinked<'a>, F: FnMut(&'a T) -> bool> Iterator for Drain<'a, '_, T, F> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while let Some(item) = self.cursor {
            self.cursor = item.link().next.get();
            if (self.pred)(item) {
                self.list.unlink(item);
                return Some(item);
            }
        }
        None
    }
}

impl<'a, T: SlabLinked<'a>, F: FnMut(&'a T) -> bool> Drop for Drain<'a, '_, T, F> {
    fn drop(&mut self) {
        self.for_each(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    struct Node<'a> {
        value: usize,
        link: SlabLink<'a, Node<'a>>,
    }

    impl<'a> SlabLinked<'a> for Node<'a> {
        fn link(&'a self) -> &'a SlabLink<'a, Self> {
            &self.link
        }
    }

    fn nodes<'a>() -> [Node<'a>; 4] {
        core::array::from_fn(|value| Node { value, link: SlabLink::new() })
    }

    fn values<'a>(list: &SlabList<'a, Node<'a>>) -> Vec<usize> {
        list.iter().map(|n| n.value).collect()
    }

    #[test]
    fn newest_and_oldest() {
        let nodes = nodes();
        let list = SlabList::new();
        nodes.iter().for_each(|n| list.push(n));
        assert_eq!(list.len(), 4);
        assert_eq!(values(&list), [3, 2, 1, 0]);

        assert_eq!(list.pop_back().map(|n| n.value), Some(0));
        assert_eq!(list.pop_front().map(|n| n.value), Some(3));
        assert!(!list.contains(&nodes[0]));
        assert!(list.contains(&nodes[1]));
        assert_eq!(values(&list), [2, 1]);

        list.pop_back();
        list.pop_back();
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());
        // Unlinked items can be filed again.
        list.push(&nodes[0]);
        assert_eq!(values(&list), [0]);
    }

    #[test]
    fn remove_and_drain() {
        let nodes = nodes();
        let list = SlabList::new();
        let other = SlabList::new();
        nodes.iter().for_each(|n| list.push(n));

        assert!(!other.remove(&nodes[1]));
        assert!(list.remove(&nodes[1]));
        assert!(!nodes[1].link.is_linked());
        assert_eq!(values(&list), [3, 2, 0]);

        let odd: Vec<_> = list.drain(|n| n.value % 2 == 1).map(|n| n.value).collect();
        assert_eq!(odd, [3]);
        assert_eq!(values(&list), [2, 0]);

        drop(list.drain(|_| true));
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
