//! Insertion-ordered intrusive hash list.
//!
//! A hash table keyed by state id whose elements additionally form one
//! singly-linked list in insertion order, so a frame's active set can be
//! walked sequentially (for cutoff computation and frame rollover) while
//! lookups stay O(1) expected. A bucket does not own its elements; it only
//! remembers the last element of its slice of the shared list and the
//! previously occupied bucket, which bounds the slice from the other side.
//!
//! Elements live in a slab grown in fixed-size blocks with an index free
//! list, so per-token allocation never touches the heap after warm-up.
//! `clear_and_take_list` detaches the whole chain and hands ownership to the
//! caller, who must eventually return every element with `delete`; this is
//! what lets the faster decoder keep the previous frame's tokens alive while
//! the table is already being filled with the next frame's.

use crate::fst::StateId;
use tracing::warn;

pub type ElemId = u32;

/// Slab growth quantum.
const ALLOCATE_BLOCK_SIZE: usize = 1024;

#[derive(Debug)]
pub struct Elem<T> {
    pub key: StateId,
    pub val: T,
    pub tail: Option<ElemId>,
}

#[derive(Debug, Clone, Copy)]
struct HashBucket {
    // None means "empty"; prev_bucket is only meaningful when occupied.
    last_elem: Option<ElemId>,
    prev_bucket: Option<u32>,
}

const EMPTY_BUCKET: HashBucket = HashBucket {
    last_elem: None,
    prev_bucket: None,
};

pub struct HashList<T> {
    buckets: Vec<HashBucket>,
    hash_size: usize,
    list_head: Option<ElemId>,
    bucket_list_tail: Option<u32>,
    elems: Vec<Elem<T>>,
    freed_head: Option<ElemId>,
}

impl<T> HashList<T> {
    pub fn new() -> Self {
        HashList {
            buckets: Vec::new(),
            hash_size: 0,
            list_head: None,
            bucket_list_tail: None,
            elems: Vec::new(),
            freed_head: None,
        }
    }

    /// Set the number of buckets. May only be called while the list is
    /// empty. Bucket storage never shrinks below its high water mark.
    pub fn set_size(&mut self, size: usize) {
        assert!(self.list_head.is_none() && self.bucket_list_tail.is_none());
        self.hash_size = size;
        if size > self.buckets.len() {
            self.buckets.resize(size, EMPTY_BUCKET);
        }
    }

    pub fn size(&self) -> usize {
        self.hash_size
    }

    /// Head of the insertion-ordered element list.
    pub fn head(&self) -> Option<ElemId> {
        self.list_head
    }

    #[inline]
    pub fn elem(&self, id: ElemId) -> &Elem<T> {
        &self.elems[id as usize]
    }

    #[inline]
    pub fn elem_mut(&mut self, id: ElemId) -> &mut Elem<T> {
        &mut self.elems[id as usize]
    }

    /// Start of this bucket's slice of the shared list.
    fn slice_head(&self, bucket: &HashBucket) -> Option<ElemId> {
        match bucket.prev_bucket {
            None => self.list_head,
            Some(b) => {
                let prev_last = self.buckets[b as usize].last_elem;
                self.elems[prev_last.expect("occupied bucket chain") as usize].tail
            }
        }
    }

    pub fn find(&self, key: StateId) -> Option<ElemId> {
        if self.hash_size == 0 {
            return None;
        }
        let index = key as usize % self.hash_size;
        let bucket = self.buckets[index];
        let last = bucket.last_elem?;
        let stop = self.elems[last as usize].tail;
        let mut e = self.slice_head(&bucket);
        while e != stop {
            let id = e.expect("bucket slice ends at its last element");
            if self.elems[id as usize].key == key {
                return Some(id);
            }
            e = self.elems[id as usize].tail;
        }
        None
    }

    /// Insert `(key, val)`, or return the existing element for `key`.
    /// Callers distinguish the two cases by inspecting the returned
    /// element's `val`.
    pub fn insert(&mut self, key: StateId, val: T) -> ElemId {
        let index = key as usize % self.hash_size;
        let bucket = self.buckets[index];

        if let Some(last) = bucket.last_elem {
            let stop = self.elems[last as usize].tail;
            let mut e = self.slice_head(&bucket);
            while e != stop {
                let id = e.expect("bucket slice ends at its last element");
                if self.elems[id as usize].key == key {
                    return id;
                }
                e = self.elems[id as usize].tail;
            }
        }

        // New element.
        let elem = self.new_elem(key, val);
        match bucket.last_elem {
            None => {
                // Unoccupied bucket: append at the tail of the whole list,
                // which is the head of the bucket chain (they run in
                // opposite directions).
                match self.bucket_list_tail {
                    None => {
                        debug_assert!(self.list_head.is_none());
                        self.list_head = Some(elem);
                    }
                    Some(tail_bucket) => {
                        let tail_elem = self.buckets[tail_bucket as usize]
                            .last_elem
                            .expect("occupied bucket chain");
                        self.elems[tail_elem as usize].tail = Some(elem);
                    }
                }
                self.elems[elem as usize].tail = None;
                self.buckets[index].last_elem = Some(elem);
                self.buckets[index].prev_bucket = self.bucket_list_tail;
                self.bucket_list_tail = Some(index as u32);
            }
            Some(last) => {
                // Occupied bucket: append at the tail of its slice.
                self.elems[elem as usize].tail = self.elems[last as usize].tail;
                self.elems[last as usize].tail = Some(elem);
                self.buckets[index].last_elem = Some(elem);
            }
        }
        elem
    }

    /// Detach the entire element chain and reset all buckets to empty. The
    /// caller now owns the chain and must return each element via
    /// `delete`; element ids stay valid until then.
    pub fn clear_and_take_list(&mut self) -> Option<ElemId> {
        let mut cur_bucket = self.bucket_list_tail;
        while let Some(b) = cur_bucket {
            cur_bucket = self.buckets[b as usize].prev_bucket;
            self.buckets[b as usize].last_elem = None;
        }
        self.bucket_list_tail = None;
        self.list_head.take()
    }

    /// Return an element to the free list.
    pub fn delete(&mut self, id: ElemId) {
        self.elems[id as usize].tail = self.freed_head;
        self.freed_head = Some(id);
    }

    fn new_elem(&mut self, key: StateId, val: T) -> ElemId {
        match self.freed_head {
            Some(id) => {
                self.freed_head = self.elems[id as usize].tail;
                let e = &mut self.elems[id as usize];
                e.key = key;
                e.val = val;
                e.tail = None;
                id
            }
            None => {
                if self.elems.len() == self.elems.capacity() {
                    self.elems.reserve(ALLOCATE_BLOCK_SIZE);
                }
                let id = self.elems.len() as ElemId;
                self.elems.push(Elem {
                    key,
                    val,
                    tail: None,
                });
                id
            }
        }
    }
}

impl<T> Drop for HashList<T> {
    fn drop(&mut self) {
        // Anything not returned through delete() is a caller-side leak.
        let mut num_freed = 0usize;
        let mut e = self.freed_head;
        while let Some(id) = e {
            num_freed += 1;
            e = self.elems[id as usize].tail;
        }
        if num_freed != self.elems.len() {
            warn!(
                "possible memory leak: {} freed != {} allocated; some elements were never deleted",
                num_freed,
                self.elems.len()
            );
        }
    }
}
