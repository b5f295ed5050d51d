//! Bounded record pool and the ordered lists built on top of it.
//!
//! One top-level tree operation preallocates all carry records it is likely
//! to need, so rebalancing does not hit the allocator at unpredictable
//! moments. Records past the static reserve fall back to individually
//! tracked dynamic slots, which may be refused when a limit is configured.

use crate::types::{ArbolError, Result};

/// Handle to one pooled record. Only meaningful together with the pool that
/// produced it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PoolPtr(u32);

impl PoolPtr {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct Entry<T> {
    value: Option<T>,
    prev: Option<PoolPtr>,
    next: Option<PoolPtr>,
}

impl<T> Entry<T> {
    fn vacant() -> Self {
        Entry {
            value: None,
            prev: None,
            next: None,
        }
    }
}

/// Typed fixed-capacity pool with a freelist and a dynamic fallback.
///
/// Allocation from the static reserve cannot fail. Once the reserve is
/// spent, slots are appended dynamically; when a dynamic limit is set,
/// exceeding it yields [`ArbolError::Exhausted`].
pub struct Pool<T> {
    entries: Vec<Entry<T>>,
    free: Vec<PoolPtr>,
    static_cap: usize,
    dynamic_limit: Option<usize>,
    live: usize,
}

impl<T> Pool<T> {
    /// Pool with `static_cap` preallocated records and an unbounded dynamic
    /// fallback.
    pub fn with_capacity(static_cap: usize) -> Self {
        Self::with_limits(static_cap, None)
    }

    /// Pool with `static_cap` preallocated records and at most
    /// `dynamic_limit` additional dynamic ones.
    pub fn with_limits(static_cap: usize, dynamic_limit: Option<usize>) -> Self {
        let mut entries = Vec::with_capacity(static_cap);
        let mut free = Vec::with_capacity(static_cap);
        for i in 0..static_cap {
            entries.push(Entry::vacant());
            free.push(PoolPtr(i as u32));
        }
        Pool {
            entries,
            free,
            static_cap,
            dynamic_limit,
            live: 0,
        }
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocate a record, preferring the static freelist.
    pub fn alloc(&mut self, value: T) -> Result<PoolPtr> {
        let ptr = match self.free.pop() {
            Some(ptr) => ptr,
            None => {
                let dynamic_in_use = self.entries.len() - self.static_cap;
                if let Some(limit) = self.dynamic_limit {
                    if dynamic_in_use >= limit {
                        return Err(ArbolError::Exhausted("carry record pool"));
                    }
                }
                let ptr = PoolPtr(self.entries.len() as u32);
                self.entries.push(Entry::vacant());
                ptr
            }
        };
        let entry = &mut self.entries[ptr.index()];
        entry.value = Some(value);
        entry.prev = None;
        entry.next = None;
        self.live += 1;
        Ok(ptr)
    }

    /// Return a record to the pool. The record must already be unlinked from
    /// any list. Returns the stored value.
    pub fn free(&mut self, ptr: PoolPtr) -> Option<T> {
        let entry = &mut self.entries[ptr.index()];
        let value = entry.value.take()?;
        entry.prev = None;
        entry.next = None;
        self.live -= 1;
        // Static slots go back on the freelist; dynamic slots are released
        // right away and never reused.
        if ptr.index() < self.static_cap {
            self.free.push(ptr);
        }
        Some(value)
    }

    /// Shared access to a live record.
    pub fn get(&self, ptr: PoolPtr) -> &T {
        self.entries[ptr.index()]
            .value
            .as_ref()
            .expect("access to freed pool record")
    }

    /// Exclusive access to a live record.
    pub fn get_mut(&mut self, ptr: PoolPtr) -> &mut T {
        self.entries[ptr.index()]
            .value
            .as_mut()
            .expect("access to freed pool record")
    }

    /// Successor of `ptr` in the list it is linked into.
    pub fn next_of(&self, ptr: PoolPtr) -> Option<PoolPtr> {
        self.entries[ptr.index()].next
    }

    /// Predecessor of `ptr` in the list it is linked into.
    pub fn prev_of(&self, ptr: PoolPtr) -> Option<PoolPtr> {
        self.entries[ptr.index()].prev
    }
}

/// Where to link a freshly allocated record relative to its list.
#[derive(Copy, Clone, Debug)]
pub enum Place {
    /// New head of the list.
    Front,
    /// New tail of the list.
    Back,
    /// Immediately before the referenced record.
    Before(PoolPtr),
    /// Immediately after the referenced record.
    After(PoolPtr),
}

/// Intrusive doubly linked list threaded through pool entries.
///
/// Iteration is lookahead-safe: capture `pool.next_of(cur)` before acting on
/// `cur`, and the captured pointer stays valid even if `cur` is unlinked and
/// freed.
#[derive(Default)]
pub struct ListHead {
    head: Option<PoolPtr>,
    tail: Option<PoolPtr>,
    len: usize,
}

impl ListHead {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// First record, if any.
    pub fn first(&self) -> Option<PoolPtr> {
        self.head
    }

    /// Last record, if any.
    pub fn last(&self) -> Option<PoolPtr> {
        self.tail
    }

    /// Number of linked records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list has no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link `ptr` into the list at `place`.
    pub fn insert<T>(&mut self, pool: &mut Pool<T>, ptr: PoolPtr, place: Place) {
        let (prev, next) = match place {
            Place::Front => (None, self.head),
            Place::Back => (self.tail, None),
            Place::Before(r) => (pool.prev_of(r), Some(r)),
            Place::After(r) => (Some(r), pool.next_of(r)),
        };
        pool.entries[ptr.index()].prev = prev;
        pool.entries[ptr.index()].next = next;
        match prev {
            Some(p) => pool.entries[p.index()].next = Some(ptr),
            None => self.head = Some(ptr),
        }
        match next {
            Some(n) => pool.entries[n.index()].prev = Some(ptr),
            None => self.tail = Some(ptr),
        }
        self.len += 1;
    }

    /// Unlink `ptr` from the list without freeing it.
    pub fn remove<T>(&mut self, pool: &mut Pool<T>, ptr: PoolPtr) {
        let prev = pool.entries[ptr.index()].prev;
        let next = pool.entries[ptr.index()].next;
        match prev {
            Some(p) => pool.entries[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => pool.entries[n.index()].prev = prev,
            None => self.tail = prev,
        }
        pool.entries[ptr.index()].prev = None;
        pool.entries[ptr.index()].next = None;
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &ListHead, pool: &Pool<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.first();
        while let Some(p) = cur {
            out.push(*pool.get(p));
            cur = pool.next_of(p);
        }
        out
    }

    #[test]
    fn static_alloc_and_reuse() {
        let mut pool: Pool<u32> = Pool::with_capacity(2);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.free(a), Some(1));
        let c = pool.alloc(3).unwrap();
        assert_eq!(*pool.get(c), 3);
        assert_eq!(*pool.get(b), 2);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn dynamic_fallback_grows_past_static_reserve() {
        let mut pool: Pool<u32> = Pool::with_capacity(1);
        let _a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!(*pool.get(b), 2);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn dynamic_limit_is_enforced() {
        let mut pool: Pool<u32> = Pool::with_limits(1, Some(1));
        let _a = pool.alloc(1).unwrap();
        let _b = pool.alloc(2).unwrap();
        match pool.alloc(3) {
            Err(ArbolError::Exhausted(_)) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn ordered_insertion_at_all_places() {
        let mut pool: Pool<u32> = Pool::with_capacity(8);
        let mut list = ListHead::new();
        let b = pool.alloc(2).unwrap();
        list.insert(&mut pool, b, Place::Back);
        let a = pool.alloc(1).unwrap();
        list.insert(&mut pool, a, Place::Front);
        let d = pool.alloc(4).unwrap();
        list.insert(&mut pool, d, Place::Back);
        let c = pool.alloc(3).unwrap();
        list.insert(&mut pool, c, Place::Before(d));
        let e = pool.alloc(5).unwrap();
        list.insert(&mut pool, e, Place::After(d));
        assert_eq!(collect(&list, &pool), vec![1, 2, 3, 4, 5]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn lookahead_survives_removal_of_current() {
        let mut pool: Pool<u32> = Pool::with_capacity(4);
        let mut list = ListHead::new();
        for v in 1..=3 {
            let p = pool.alloc(v).unwrap();
            list.insert(&mut pool, p, Place::Back);
        }
        let mut seen = Vec::new();
        let mut cur = list.first();
        while let Some(p) = cur {
            let next = pool.next_of(p);
            let v = *pool.get(p);
            if v == 2 {
                list.remove(&mut pool, p);
                pool.free(p);
            }
            seen.push(v);
            cur = next;
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(collect(&list, &pool), vec![1, 3]);
    }
}
