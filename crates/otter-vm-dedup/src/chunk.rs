//! Fixed-capacity chunk of dedup candidates
//!
//! A chunk is the unit handed from a marking worker to the dedup consumer.
//! Chunks are always held through an owned `Box<Chunk<T>>`, and the `next`
//! link is owned by the chunk that carries it, so every chunk in a chain has
//! exactly one owner.

use std::ptr;

/// Number of candidates a chunk holds
pub const CHUNK_CAPACITY: usize = 64;

/// Fixed-capacity LIFO buffer of candidates with an owning `next` link
pub struct Chunk<T> {
    /// Candidate slots. `None` below `len` means the entry was unlinked.
    slots: [Option<T>; CHUNK_CAPACITY],
    /// Number of occupied slots
    len: usize,
    /// Next chunk in the chain (owned), or null
    pub(crate) next: *mut Chunk<T>,
}

// SAFETY: a chunk exclusively owns its slots and its `next` chain, so moving it
// to another thread moves the whole chain with it.
unsafe impl<T: Send> Send for Chunk<T> {}

impl<T> Chunk<T> {
    /// Create an empty, unlinked chunk
    pub fn new() -> Box<Self> {
        Box::new(Self {
            slots: [const { None }; CHUNK_CAPACITY],
            len: 0,
            next: ptr::null_mut(),
        })
    }

    /// Append a candidate.
    ///
    /// Panics if the chunk is full.
    #[inline]
    pub fn push(&mut self, value: T) {
        assert!(!self.is_full(), "push into a full dedup chunk");
        self.slots[self.len] = Some(value);
        self.len += 1;
    }

    /// Remove the most recently pushed entry.
    ///
    /// Returns `None` when that entry was unlinked at a safepoint.
    /// Panics if the chunk is empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        assert!(!self.is_empty(), "pop from an empty dedup chunk");
        self.len -= 1;
        self.slots[self.len].take()
    }

    /// Whether no more entries fit
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == CHUNK_CAPACITY
    }

    /// Whether there is nothing left to pop
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of occupied slots, unlinked entries included
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether another chunk is linked behind this one
    #[inline]
    pub fn has_next(&self) -> bool {
        !self.next.is_null()
    }

    /// Link `next` behind this chunk.
    ///
    /// Panics if a chunk is already linked.
    pub fn set_next(&mut self, next: Option<Box<Chunk<T>>>) {
        assert!(!self.has_next(), "dedup chunk is already linked");
        self.next = next.map_or(ptr::null_mut(), Box::into_raw);
    }

    /// Detach and return the rest of the chain
    pub fn take_next(&mut self) -> Option<Box<Chunk<T>>> {
        let next = std::mem::replace(&mut self.next, ptr::null_mut());
        if next.is_null() {
            None
        } else {
            // SAFETY: a non-null `next` was produced by `Box::into_raw` and is
            // owned by this chunk alone; swapping in null hands that ownership back.
            Some(unsafe { Box::from_raw(next) })
        }
    }

    /// Clear all entries and drop any linked chain
    pub fn reset(&mut self) {
        for slot in &mut self.slots[..self.len] {
            *slot = None;
        }
        self.len = 0;
        drop(self.take_next());
    }

    /// Call `visitor` on every live entry, in push order
    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut T)) {
        for value in self.slots[..self.len].iter_mut().flatten() {
            visitor(value);
        }
    }

    /// Call `visitor` on every live entry of this chunk and of every chunk
    /// linked behind it
    pub fn visit_chain(&mut self, visitor: &mut dyn FnMut(&mut T)) {
        let mut cursor: *mut Chunk<T> = self;
        // SAFETY: `&mut self` owns the whole chain, and each link points to a
        // live boxed chunk until it is taken out.
        while let Some(chunk) = unsafe { cursor.as_mut() } {
            chunk.visit(visitor);
            cursor = chunk.next;
        }
    }

    /// Visit live entries and clear the ones `is_alive` rejects.
    ///
    /// Returns the number of entries cleared.
    pub fn unlink_or_visit(&mut self, is_alive: &mut dyn FnMut(&mut T) -> bool) -> usize {
        let mut unlinked = 0;
        for slot in &mut self.slots[..self.len] {
            if slot.as_mut().is_some_and(|value| !is_alive(value)) {
                *slot = None;
                unlinked += 1;
            }
        }
        unlinked
    }

    /// Chain-wide [`Chunk::unlink_or_visit`]
    pub fn unlink_or_visit_chain(&mut self, is_alive: &mut dyn FnMut(&mut T) -> bool) -> usize {
        let mut unlinked = 0;
        let mut cursor: *mut Chunk<T> = self;
        // SAFETY: see `visit_chain`
        while let Some(chunk) = unsafe { cursor.as_mut() } {
            unlinked += chunk.unlink_or_visit(is_alive);
            cursor = chunk.next;
        }
        unlinked
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        // Unlink iteratively so long chains don't recurse
        let mut next = self.take_next();
        while let Some(mut chunk) = next {
            next = chunk.take_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(range: std::ops::Range<u32>) -> Box<Chunk<u32>> {
        let mut chunk = Chunk::new();
        for v in range {
            chunk.push(v);
        }
        chunk
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut chunk = filled(0..3);
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.pop(), Some(2));
        assert_eq!(chunk.pop(), Some(1));
        assert_eq!(chunk.pop(), Some(0));
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_full() {
        let chunk = filled(0..CHUNK_CAPACITY as u32);
        assert!(chunk.is_full());
        assert!(!chunk.is_empty());
    }

    #[test]
    #[should_panic(expected = "push into a full dedup chunk")]
    fn test_push_full_panics() {
        let mut chunk = filled(0..CHUNK_CAPACITY as u32);
        chunk.push(0);
    }

    #[test]
    #[should_panic(expected = "pop from an empty dedup chunk")]
    fn test_pop_empty_panics() {
        let mut chunk: Box<Chunk<u32>> = Chunk::new();
        chunk.pop();
    }

    #[test]
    fn test_visit_in_index_order() {
        let mut chunk = filled(10..14);
        let mut seen = Vec::new();
        chunk.visit(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_visit_can_rewrite() {
        let mut chunk = filled(0..4);
        chunk.visit(&mut |v| *v += 100);
        assert_eq!(chunk.pop(), Some(103));
        assert_eq!(chunk.pop(), Some(102));
    }

    #[test]
    fn test_chain_links_and_visit() {
        let mut head = filled(0..2);
        head.set_next(Some(filled(2..4)));
        assert!(head.has_next());

        let mut seen = Vec::new();
        head.visit_chain(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![0, 1, 2, 3]);

        let tail = head.take_next().unwrap();
        assert!(!head.has_next());
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn test_unlink_clears_dead_entries() {
        let mut chunk = filled(0..6);
        let unlinked = chunk.unlink_or_visit(&mut |v| *v % 2 == 0);
        assert_eq!(unlinked, 3);
        assert_eq!(chunk.len(), 6);

        let mut popped = Vec::new();
        while !chunk.is_empty() {
            popped.push(chunk.pop());
        }
        assert_eq!(
            popped,
            vec![None, Some(4), None, Some(2), None, Some(0)]
        );
    }

    #[test]
    fn test_reset_clears_entries_and_link() {
        let mut chunk = filled(0..5);
        chunk.set_next(Some(filled(5..6)));
        chunk.reset();
        assert!(chunk.is_empty());
        assert!(!chunk.has_next());
        chunk.push(7);
        assert_eq!(chunk.pop(), Some(7));
    }

    #[test]
    fn test_long_chain_drop() {
        let mut head: Box<Chunk<u32>> = Chunk::new();
        for _ in 0..100_000 {
            let mut next = Chunk::new();
            next.set_next(Some(head));
            head = next;
        }
        drop(head);
    }
}
