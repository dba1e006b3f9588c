//! # Page Pointers
//!
//! Pages are addressed two ways. A [`VolatilePointer`] is a tagged word
//! naming a frame in the in-memory page pool: NUMA node, a generation tag
//! stamped at allocation, and the frame offset. A [`SnapshotPageId`] names
//! an immutable page in the (external) snapshot store. A [`DualPointer`]
//! is the 16-byte pair of both, and is what actually sits in parent pages
//! and in next-layer record slots: either side may be null, and readers
//! prefer the volatile side when present.
//!
//! Pointer words are read and written atomically because readers chase them
//! with no latch while structural modifications swing them.

use std::sync::atomic::{AtomicU64, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const NODE_SHIFT: u32 = 48;
const GENERATION_SHIFT: u32 = 40;
const OFFSET_MASK: u64 = (1 << GENERATION_SHIFT) - 1;

/// Tagged pointer to a frame in the volatile page pool. Zero is null; the
/// pool never hands out frame offset zero.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct VolatilePointer(u64);

impl VolatilePointer {
    pub const NULL: VolatilePointer = VolatilePointer(0);

    pub fn new(numa_node: u8, generation: u8, offset: u64) -> Self {
        debug_assert!(offset != 0 && offset <= OFFSET_MASK);
        VolatilePointer(
            ((numa_node as u64) << NODE_SHIFT)
                | ((generation as u64) << GENERATION_SHIFT)
                | offset,
        )
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn numa_node(self) -> u8 {
        (self.0 >> NODE_SHIFT) as u8
    }

    #[inline]
    pub fn generation(self) -> u8 {
        (self.0 >> GENERATION_SHIFT) as u8
    }

    /// 1-based frame offset within the node's pool.
    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    #[inline]
    pub fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_word(word: u64) -> Self {
        VolatilePointer(word)
    }
}

/// Identifier of an immutable snapshot page. Zero is null.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct SnapshotPageId(pub u64);

impl SnapshotPageId {
    pub const NULL: SnapshotPageId = SnapshotPageId(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The 16-byte (snapshot id, volatile pointer) pair. This exact layout is
/// what a border record area holds once morphed into a next-layer pointer,
/// and what every mini-page pointer slot holds.
#[repr(C)]
pub struct DualPointer {
    snapshot_id: AtomicU64,
    volatile: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<DualPointer>() == 16);

impl DualPointer {
    /// A pointer with both sides null, for control blocks.
    pub const fn new_null() -> Self {
        DualPointer {
            snapshot_id: AtomicU64::new(0),
            volatile: AtomicU64::new(0),
        }
    }

    /// Initializes both sides; only valid while the containing page or
    /// record is thread-private.
    pub fn init(&self, snapshot_id: SnapshotPageId, volatile: VolatilePointer) {
        self.snapshot_id.store(snapshot_id.0, Ordering::Relaxed);
        self.volatile.store(volatile.word(), Ordering::Release);
    }

    #[inline]
    pub fn snapshot_id(&self) -> SnapshotPageId {
        SnapshotPageId(self.snapshot_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn volatile(&self) -> VolatilePointer {
        VolatilePointer(self.volatile.load(Ordering::Acquire))
    }

    /// Swings the volatile side. The new target must be fully initialized
    /// before this store makes it reachable.
    #[inline]
    pub fn set_volatile(&self, pointer: VolatilePointer) {
        self.volatile.store(pointer.word(), Ordering::Release);
    }

    /// One-shot swing used for root replacement: succeeds only if the
    /// volatile side still names `expected`.
    pub fn swing_volatile(&self, expected: VolatilePointer, new: VolatilePointer) -> bool {
        self.volatile
            .compare_exchange(
                expected.word(),
                new.word(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_both_null(&self) -> bool {
        self.snapshot_id().is_null() && self.volatile().is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_pointer_packs_fields() {
        let p = VolatilePointer::new(2, 7, 12345);
        assert_eq!(p.numa_node(), 2);
        assert_eq!(p.generation(), 7);
        assert_eq!(p.offset(), 12345);
        assert!(!p.is_null());
    }

    #[test]
    fn null_is_zero_word() {
        assert!(VolatilePointer::NULL.is_null());
        assert_eq!(VolatilePointer::from_word(0), VolatilePointer::NULL);
        assert!(SnapshotPageId::NULL.is_null());
    }

    #[test]
    fn dual_pointer_swing_is_conditional() {
        let dual = DualPointer {
            snapshot_id: AtomicU64::new(0),
            volatile: AtomicU64::new(0),
        };
        let a = VolatilePointer::new(0, 0, 1);
        let b = VolatilePointer::new(0, 0, 2);
        dual.init(SnapshotPageId::NULL, a);
        assert!(!dual.swing_volatile(b, a));
        assert!(dual.swing_volatile(a, b));
        assert_eq!(dual.volatile(), b);
    }
}
