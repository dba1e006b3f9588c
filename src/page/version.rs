//! # Page Version Protocol
//!
//! Every page (and every mini-page inside an intermediate page) carries one
//! 64-bit atomic word that writers latch and readers snapshot. Readers never
//! take the latch: they wait for a *stable* version (no writer mid-insert or
//! mid-split), do their reads, then re-read the word and retry if anything
//! committed underneath them.
//!
//! ## Word Layout
//!
//! ```text
//! bit 63           LOCKED      writer holds the page latch
//! bit 62           INSERTING   a slot is being populated under the latch
//! bit 61           SPLITTING   a structural modification is in progress
//! bit 60           RETIRED     page was replaced/emptied by an SMO
//! bits 48..56      key count   resident slots / separators
//! bits 40..48      layer       trie depth, fixed at initialization
//! bits 20..40      split counter
//! bits  0..20      insert counter
//! ```
//!
//! ## Counter Strides
//!
//! `unlock()` folds the in-progress bits into the two counters: an insert
//! commit bumps the low counter, a split commit bumps the high one. The
//! separation is what lets a reader pick its restart point: an insert only
//! ever adds slots to the page the reader was already on, so retrying the
//! same page suffices; a split may have moved the reader's range to a
//! sibling, so the reader must back out to the layer root.
//!
//! Both counters wrap inside their own field without carrying into the
//! neighbor. A wrap-around ABA would require a reader to stall across 2^20
//! commits on one page.
//!
//! ## Ordering
//!
//! `stable()` and `lock()` are Acquire: everything the previous writer
//! published happens-before the observer's reads. `unlock()` is Release:
//! all slot and data-region writes made under the latch are visible before
//! the new version is.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED: u64 = 1 << 63;
const INSERTING: u64 = 1 << 62;
const SPLITTING: u64 = 1 << 61;
const RETIRED: u64 = 1 << 60;

const KEY_COUNT_SHIFT: u32 = 48;
const KEY_COUNT_MASK: u64 = 0xFF << KEY_COUNT_SHIFT;
const LAYER_SHIFT: u32 = 40;
const LAYER_MASK: u64 = 0xFF << LAYER_SHIFT;

const SPLIT_SHIFT: u32 = 20;
const SPLIT_MASK: u64 = 0xF_FFFF << SPLIT_SHIFT;
const INSERT_MASK: u64 = 0xF_FFFF;

const IN_PROGRESS: u64 = LOCKED | INSERTING | SPLITTING;

/// A stable snapshot of a page version: no transient bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionSnapshot(u64);

impl VersionSnapshot {
    #[inline]
    pub fn key_count(self) -> usize {
        ((self.0 & KEY_COUNT_MASK) >> KEY_COUNT_SHIFT) as usize
    }

    #[inline]
    pub fn layer(self) -> u8 {
        ((self.0 & LAYER_MASK) >> LAYER_SHIFT) as u8
    }

    #[inline]
    pub fn is_retired(self) -> bool {
        self.0 & RETIRED != 0
    }

    /// Whether a split (or retirement) committed between the two snapshots.
    #[inline]
    pub fn split_differs(self, later: VersionSnapshot) -> bool {
        (self.0 ^ later.0) & (SPLIT_MASK | RETIRED) != 0
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(word: u64) -> Self {
        VersionSnapshot(word)
    }
}

/// The per-page (and per-mini-page) version word.
#[repr(transparent)]
pub struct PageVersion(AtomicU64);

impl PageVersion {
    /// Initializes the word for a freshly allocated page. Only valid before
    /// the page is published; the layer never changes afterwards.
    pub fn init(&self, layer: u8) {
        self.0.store((layer as u64) << LAYER_SHIFT, Ordering::Release);
    }

    /// Spins until no writer is mid-insert or mid-split and returns that
    /// snapshot. This is the reader's entry point.
    #[inline]
    pub fn stable(&self) -> VersionSnapshot {
        loop {
            let word = self.0.load(Ordering::Acquire);
            if word & IN_PROGRESS == 0 {
                return VersionSnapshot(word);
            }
            std::hint::spin_loop();
        }
    }

    /// Re-reads a stable version and reports whether anything committed
    /// since `snapshot` was taken.
    #[inline]
    pub fn changed_from(&self, snapshot: VersionSnapshot) -> bool {
        self.stable() != snapshot
    }

    /// Acquires the page latch, spinning on contention.
    #[inline]
    pub fn lock(&self) -> PageVersionGuard<'_> {
        loop {
            let word = self.0.load(Ordering::Relaxed);
            if word & LOCKED == 0 {
                if self
                    .0
                    .compare_exchange_weak(
                        word,
                        word | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return PageVersionGuard { version: self };
                }
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn layer(&self) -> u8 {
        ((self.0.load(Ordering::Relaxed) & LAYER_MASK) >> LAYER_SHIFT) as u8
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        ((self.0.load(Ordering::Acquire) & KEY_COUNT_MASK) >> KEY_COUNT_SHIFT) as usize
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.0.load(Ordering::Acquire) & RETIRED != 0
    }

    #[inline]
    fn load_owned(&self) -> u64 {
        // only the latch holder calls this; no other writer can race
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn store_owned(&self, word: u64) {
        self.0.store(word, Ordering::Release);
    }
}

/// Latch guard. Dropping it commits: the inserting bit becomes an insert
/// counter bump, the splitting bit a split counter bump, and the latch is
/// released with a Release store.
pub struct PageVersionGuard<'a> {
    version: &'a PageVersion,
}

impl PageVersionGuard<'_> {
    /// Announces an in-progress slot population and counts the new slot.
    /// Readers that snapshot after this spin until the unlock.
    pub fn set_inserting_and_increment_key_count(&self) {
        let word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        let count = (word & KEY_COUNT_MASK) >> KEY_COUNT_SHIFT;
        let word = (word & !KEY_COUNT_MASK) | ((count + 1) << KEY_COUNT_SHIFT);
        self.version.store_owned(word | INSERTING);
    }

    /// Announces an in-progress insert without a slot-count change (used by
    /// the next-layer morph, which reinterprets an existing slot).
    pub fn set_inserting(&self) {
        let word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        self.version.store_owned(word | INSERTING);
    }

    /// Announces an in-progress structural modification.
    pub fn set_splitting(&self) {
        let word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        self.version.store_owned(word | SPLITTING);
    }

    /// Rewrites the slot count wholesale; used when a split compacts the
    /// page.
    pub fn set_key_count(&self, count: usize) {
        debug_assert!(count <= 0xFF);
        let word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        let word = (word & !KEY_COUNT_MASK) | ((count as u64) << KEY_COUNT_SHIFT);
        self.version.store_owned(word);
    }

    /// Marks the page as replaced by an SMO; readers restart at the layer
    /// root.
    pub fn set_retired(&self) {
        let word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        self.version.store_owned(word | RETIRED);
    }

    pub fn key_count(&self) -> usize {
        ((self.version.load_owned() & KEY_COUNT_MASK) >> KEY_COUNT_SHIFT) as usize
    }
}

impl Drop for PageVersionGuard<'_> {
    fn drop(&mut self) {
        let mut word = self.version.load_owned();
        debug_assert!(word & LOCKED != 0);
        if word & INSERTING != 0 {
            let bumped = (word & INSERT_MASK).wrapping_add(1) & INSERT_MASK;
            word = (word & !(INSERT_MASK | INSERTING)) | bumped;
        }
        if word & SPLITTING != 0 {
            let bumped = (word & SPLIT_MASK).wrapping_add(1 << SPLIT_SHIFT) & SPLIT_MASK;
            word = (word & !(SPLIT_MASK | SPLITTING)) | bumped;
        }
        self.version.store_owned(word & !LOCKED);
    }
}
