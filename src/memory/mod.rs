//! # Volatile Page Pool
//!
//! A fixed-capacity arena of 4096-byte, 4096-aligned frames backing every
//! volatile page. Frames are named by 1-based offsets carried inside
//! [`VolatilePointer`] words together with the pool's NUMA node and a
//! per-frame generation tag stamped at allocation.
//!
//! ## Lifecycle
//!
//! `allocate` pops a free frame and hands back a tagged pointer plus the
//! raw frame; the caller initializes the page privately and publishes it by
//! linking it into a parent under the parent's latch. Pages are never freed
//! while reachable: structural modifications surrender retired pages to a
//! [`ReleaseBatch`], and an external epoch reclaimer drains the batch back
//! into the pool (`reclaim`) once no reader can hold a reference. Reuse
//! bumps the frame's generation, so a stale pointer is distinguishable in a
//! debugger even though `resolve` does not police it.
//!
//! ## Snapshot Pages
//!
//! The immutable on-disk side of a dual pointer is resolved through the
//! [`SnapshotPageResolver`] collaborator. This crate operates on volatile
//! pages; [`NullSnapshotResolver`] is the default and resolves nothing.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{Result, TreeError};
use crate::page::{SnapshotPageId, VolatilePointer};

/// Fixed-capacity volatile page allocator.
pub struct PagePool {
    region: Region,
    generations: Box<[AtomicU8]>,
    free: Mutex<Vec<u32>>,
    capacity: usize,
    numa_node: u8,
}

struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

// the region is a plain byte arena; all concurrent page access goes through
// the page version and owner-id protocols
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl PagePool {
    /// Creates a pool of `capacity` zeroed frames on NUMA node 0.
    pub fn new(capacity: usize) -> Self {
        Self::with_node(capacity, 0)
    }

    /// Creates a pool of `capacity` zeroed frames tagged with `numa_node`.
    pub fn with_node(capacity: usize, numa_node: u8) -> Self {
        assert!(capacity > 0, "empty page pool");
        assert!(capacity < (1 << 31), "pool offset must fit the pointer word");
        let layout = Layout::from_size_align(capacity * PAGE_SIZE, PAGE_SIZE)
            .expect("page pool layout");
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        let generations = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        // hand out low offsets first
        let free = (0..capacity as u32).rev().collect();
        PagePool {
            region: Region { base, layout },
            generations,
            free: Mutex::new(free),
            capacity,
            numa_node,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn numa_node(&self) -> u8 {
        self.numa_node
    }

    /// Pops a frame and returns its tagged pointer and raw bytes. The frame
    /// content is whatever the previous user left; page initialization
    /// rewrites the common prefix and the version word.
    pub fn allocate(&self) -> Result<(VolatilePointer, *mut u8)> {
        let index = self.free.lock().pop().ok_or(TreeError::OutOfPages)?;
        let generation = self.generations[index as usize].load(Ordering::Relaxed);
        let pointer = VolatilePointer::new(self.numa_node, generation, index as u64 + 1);
        Ok((pointer, self.frame_ptr(index)))
    }

    /// Maps a tagged pointer back to its frame.
    pub fn resolve(&self, pointer: VolatilePointer) -> *mut u8 {
        debug_assert!(!pointer.is_null());
        debug_assert_eq!(pointer.numa_node(), self.numa_node);
        let index = (pointer.offset() - 1) as u32;
        debug_assert!((index as usize) < self.capacity);
        self.frame_ptr(index)
    }

    /// Returns a drained batch of pages to the free list, bumping each
    /// frame's generation. Only the external epoch reclaimer may call this,
    /// after the pages are unreachable.
    pub fn reclaim(&self, batch: &mut ReleaseBatch) {
        let mut free = self.free.lock();
        for pointer in batch.pages.drain(..) {
            let index = (pointer.offset() - 1) as u32;
            debug_assert!((index as usize) < self.capacity);
            self.generations[index as usize].fetch_add(1, Ordering::Relaxed);
            free.push(index);
        }
    }

    fn frame_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.capacity);
        unsafe { self.region.base.as_ptr().add(index as usize * PAGE_SIZE) }
    }
}

/// Pages surrendered by structural modifications, awaiting epoch
/// reclamation.
#[derive(Default)]
pub struct ReleaseBatch {
    pages: Vec<VolatilePointer>,
}

impl ReleaseBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pointer: VolatilePointer) {
        debug_assert!(!pointer.is_null());
        self.pages.push(pointer);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Resolver for the immutable snapshot side of a dual pointer.
pub trait SnapshotPageResolver: Send + Sync {
    /// Returns the read-only 4096-byte page image, or `None` when the id is
    /// null or unknown.
    fn resolve(&self, id: SnapshotPageId) -> Option<*const u8>;
}

/// Resolver for a store with no snapshots yet.
#[derive(Default)]
pub struct NullSnapshotResolver;

impl SnapshotPageResolver for NullSnapshotResolver {
    fn resolve(&self, _id: SnapshotPageId) -> Option<*const u8> {
        None
    }
}
