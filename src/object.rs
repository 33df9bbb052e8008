//! Intrusive singly-linked chains of free objects.
//!
//! A free object stores the address of the next free object in its first
//! word. Chains move between thread caches, transfer slots and spans without
//! copying.

use core::{mem, ptr::NonNull};

use crate::track;

const LINK_SIZE: usize = mem::size_of::<Option<NonNull<u8>>>();

/// Reads the link of a free object.
///
/// # Safety
///
/// `obj` must be a free object holding a valid link.
#[inline]
pub(crate) unsafe fn next(obj: NonNull<u8>) -> Option<NonNull<u8>> {
    track::defined(obj, LINK_SIZE);
    // SAFETY: Free objects are at least one word large and word-aligned.
    let next = unsafe { obj.cast::<Option<NonNull<u8>>>().read() };
    track::no_access(obj, LINK_SIZE);
    next
}

/// Writes the link of a free object.
///
/// # Safety
///
/// `obj` must be a free object owned by the caller.
#[inline]
pub(crate) unsafe fn set_next(obj: NonNull<u8>, next: Option<NonNull<u8>>) {
    track::undefined(obj, LINK_SIZE);
    // SAFETY: Free objects are at least one word large and word-aligned.
    unsafe { obj.cast::<Option<NonNull<u8>>>().write(next) };
    track::no_access(obj, LINK_SIZE);
}

/// A non-empty, nul-terminated chain of free objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chain {
    pub head: NonNull<u8>,
    pub tail: NonNull<u8>,
    pub len: usize,
}

// SAFETY: A chain owns its objects.
unsafe impl Send for Chain {}

impl Chain {
    /// Walks the chain, returning each object in order.
    ///
    /// # Safety
    ///
    /// The chain must be well-formed and owned by the caller, and the
    /// objects must not be reused while iterating.
    pub unsafe fn iter(self) -> impl Iterator<Item = NonNull<u8>> {
        let mut cur = Some(self.head);
        core::iter::from_fn(move || {
            let obj = cur?;
            // SAFETY: The chain is well-formed.
            cur = unsafe { next(obj) };
            Some(obj)
        })
    }
}

/// A LIFO list of free objects.
#[derive(Debug, Default)]
pub(crate) struct ObjectList {
    head: Option<NonNull<u8>>,
    len: usize,
}

// SAFETY: The list owns its objects.
unsafe impl Send for ObjectList {}

impl ObjectList {
    pub const fn new() -> Self {
        ObjectList { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `obj` must be a free object owned by the caller.
    pub unsafe fn push(&mut self, obj: NonNull<u8>) {
        // SAFETY: `obj` is owned.
        unsafe { set_next(obj, self.head) };
        self.head = Some(obj);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = self.head?;
        // SAFETY: Every object in the list holds a valid link.
        self.head = unsafe { next(obj) };
        self.len -= 1;
        Some(obj)
    }

    /// # Safety
    ///
    /// `chain` must be well-formed and owned by the caller.
    pub unsafe fn push_chain(&mut self, chain: Chain) {
        // SAFETY: `chain.tail` is owned.
        unsafe { set_next(chain.tail, self.head) };
        self.head = Some(chain.head);
        self.len += chain.len;
    }

    /// Detaches the first `n` objects, or all of them if fewer are present.
    pub fn pop_chain(&mut self, n: usize) -> Option<Chain> {
        let head = self.head?;
        let n = n.min(self.len);
        if n == 0 {
            return None;
        }
        let mut tail = head;
        for _ in 1..n {
            // SAFETY: The list holds at least `n` objects.
            tail = unsafe { next(tail) }?;
        }
        // SAFETY: Every object in the list holds a valid link.
        self.head = unsafe { next(tail) };
        // SAFETY: `tail` is detached and owned.
        unsafe { set_next(tail, None) };
        self.len -= n;
        Some(Chain { head, tail, len: n })
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    fn objects(storage: &mut [[usize; 2]]) -> Vec<NonNull<u8>> {
        storage.iter_mut().map(|slot| NonNull::from(slot).cast()).collect()
    }

    #[test]
    fn push_pop() {
        let mut storage = [[0usize; 2]; 4];
        let objs = objects(&mut storage);
        let mut list = ObjectList::new();
        for &obj in &objs {
            unsafe { list.push(obj) };
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.pop(), Some(objs[3]));
        assert_eq!(list.pop(), Some(objs[2]));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn chains() {
        let mut storage = [[0usize; 2]; 8];
        let objs = objects(&mut storage);
        let mut list = ObjectList::new();
        for &obj in objs.iter().rev() {
            unsafe { list.push(obj) };
        }

        let chain = list.pop_chain(3).unwrap();
        assert_eq!((chain.head, chain.tail, chain.len), (objs[0], objs[2], 3));
        assert_eq!(unsafe { chain.iter() }.collect::<Vec<_>>(), objs[..3]);
        assert_eq!(list.len(), 5);

        let rest = list.pop_chain(100).unwrap();
        assert_eq!(rest.len, 5);
        assert_eq!(list.len(), 0);
        assert!(list.pop_chain(1).is_none());

        unsafe { list.push_chain(rest) };
        unsafe { list.push_chain(chain) };
        let all = list.pop_chain(8).unwrap();
        assert_eq!(unsafe { all.iter() }.collect::<Vec<_>>(), objs);
    }
}
