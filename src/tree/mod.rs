//! # Tree Storage Object
//!
//! [`SliceTree`] is the public face of the index: a trie of B+trees over a
//! volatile page pool. Layer 0 starts as a single empty border page; border
//! splits grow a layer into a B+tree, and slice collisions between suffixed
//! keys push records into deeper layers, each a tree of its own rooted in a
//! border slot's dual pointer.
//!
//! The tree object itself is tiny: the control-block dual pointer to the
//! layer-0 root, the pool, and the snapshot resolver. Everything mutable
//! lives inside pages and is governed by the page version and owner-id
//! protocols, so `SliceTree` is `Sync` and all operations take `&self`.
//!
//! ## Page Allocation Helpers
//!
//! New pages are always fully initialized while thread-private (fences,
//! layer, parent backlinks, version word) and only then published by writing a
//! pointer under the publisher's latch. The helpers here hand out typed
//! references with the prefix already written so the SMO code cannot
//! publish a half-initialized frame.

mod cursor;
mod ops;
mod split;
mod verify;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::key::{KeySlice, INFIMUM_SLICE, SUPREMUM_SLICE};
use crate::memory::{NullSnapshotResolver, PagePool, SnapshotPageResolver};
use crate::page::{
    page_ref, BorderPage, DualPointer, IntermediatePage, PageRef, PageType, SnapshotPageId,
    VolatilePointer,
};

pub use ops::Primitive;
pub use verify::VerifyStats;

static NEXT_STORAGE_ID: AtomicU32 = AtomicU32::new(1);

/// A Masstree-style ordered index over byte-string keys.
pub struct SliceTree {
    pool: Arc<PagePool>,
    snapshots: Arc<dyn SnapshotPageResolver>,
    storage_id: u32,
    root: DualPointer,
}

impl SliceTree {
    /// Creates an empty tree: one border page spanning the whole slice
    /// space at layer 0.
    pub fn create(pool: Arc<PagePool>) -> Result<Self> {
        Self::create_with_snapshots(pool, Arc::new(NullSnapshotResolver))
    }

    /// Creates an empty tree with a snapshot-page resolver for the
    /// immutable side of dual pointers.
    pub fn create_with_snapshots(
        pool: Arc<PagePool>,
        snapshots: Arc<dyn SnapshotPageResolver>,
    ) -> Result<Self> {
        let storage_id = NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed);
        let tree = SliceTree {
            pool,
            snapshots,
            storage_id,
            root: DualPointer::new_null(),
        };
        let (root_ptr, _) = tree.allocate_border(
            0,
            INFIMUM_SLICE,
            SUPREMUM_SLICE,
            VolatilePointer::NULL,
        )?;
        tree.root.init(SnapshotPageId::NULL, root_ptr);
        Ok(tree)
    }

    pub fn storage_id(&self) -> u32 {
        self.storage_id
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// The layer-0 root dual pointer.
    pub(crate) fn root(&self) -> &DualPointer {
        &self.root
    }

    /// Resolves a volatile pointer into a typed page view.
    pub(crate) fn page(&self, pointer: VolatilePointer) -> PageRef<'_> {
        debug_assert!(!pointer.is_null());
        unsafe { page_ref(self.pool.resolve(pointer)) }
    }

    pub(crate) fn border(&self, pointer: VolatilePointer) -> &BorderPage {
        match self.page(pointer) {
            PageRef::Border(b) => b,
            PageRef::Intermediate(_) => unreachable!("expected border page"),
        }
    }

    /// Follows a dual pointer, preferring the volatile side. Returns null
    /// only if both sides are absent.
    pub(crate) fn resolve_dual(&self, dual: &DualPointer) -> Option<*const u8> {
        let volatile = dual.volatile();
        if !volatile.is_null() {
            return Some(self.pool.resolve(volatile) as *const u8);
        }
        self.snapshots.resolve(dual.snapshot_id())
    }

    /// Allocates and prefix-initializes a border page; the frame stays
    /// thread-private until a pointer to it is published.
    pub(crate) fn allocate_border(
        &self,
        layer: u8,
        low_fence: KeySlice,
        high_fence: KeySlice,
        in_layer_parent: VolatilePointer,
    ) -> Result<(VolatilePointer, &BorderPage)> {
        let (pointer, raw) = self.pool.allocate()?;
        let page = unsafe { &mut *(raw as *mut BorderPage) };
        page.common_mut().initialize(
            pointer,
            self.storage_id,
            PageType::Border,
            layer,
            low_fence,
            high_fence,
            in_layer_parent,
        );
        Ok((pointer, page))
    }

    /// Allocates and prefix-initializes an intermediate page.
    pub(crate) fn allocate_intermediate(
        &self,
        layer: u8,
        low_fence: KeySlice,
        high_fence: KeySlice,
        in_layer_parent: VolatilePointer,
    ) -> Result<(VolatilePointer, &IntermediatePage)> {
        let (pointer, raw) = self.pool.allocate()?;
        let page = unsafe { &mut *(raw as *mut IntermediatePage) };
        page.common_mut().initialize(
            pointer,
            self.storage_id,
            PageType::Intermediate,
            layer,
            low_fence,
            high_fence,
            in_layer_parent,
        );
        Ok((pointer, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_an_empty_layer0_root() {
        let pool = Arc::new(PagePool::new(8));
        let tree = SliceTree::create(Arc::clone(&pool)).unwrap();
        assert_eq!(pool.free_count(), 7);

        let root = tree.root().volatile();
        assert!(!root.is_null());
        let page = tree.border(root);
        let c = page.common();
        assert_eq!(c.layer(), 0);
        assert_eq!(c.low_fence(), INFIMUM_SLICE);
        assert_eq!(c.high_fence(), SUPREMUM_SLICE);
        assert_eq!(c.version.stable().key_count(), 0);
        assert_eq!(c.header.storage_id(), tree.storage_id());
    }

    #[test]
    fn storage_ids_are_distinct() {
        let pool = Arc::new(PagePool::new(4));
        let a = SliceTree::create(Arc::clone(&pool)).unwrap();
        let b = SliceTree::create(pool).unwrap();
        assert_ne!(a.storage_id(), b.storage_id());
    }

    #[test]
    fn create_on_an_exhausted_pool_fails() {
        let pool = Arc::new(PagePool::new(1));
        let _a = SliceTree::create(Arc::clone(&pool)).unwrap();
        assert!(SliceTree::create(pool).is_err());
    }
}
