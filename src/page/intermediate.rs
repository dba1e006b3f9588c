//! # Intermediate Page Engine
//!
//! Intermediate pages fan out in two levels: up to 9 page-level separators
//! route a slice to one of 10 *mini-pages*, and each mini-page's up to 15
//! separators route it to one of 16 child dual pointers, 160 children per
//! page in total. The two-level shape keeps the hot path (page separators plus one
//! mini-page) inside a few cache lines, and gives each mini-page its own
//! version word so a child adoption only disturbs readers of one mini.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size   Field        Description
//! ------  -----  -----------  -----------------------------------------
//! 0       64     common       header, fences, parent, version
//! 64      72     separators   9 page-level separators
//! 136     120    (reserved)
//! 256     3840   mini_pages   10 x 384 bytes
//!
//! MiniPage (384 bytes):
//! 0       8      version      mini version word (key count = separators)
//! 8       120    separators   15 mini separators
//! 128     256    pointers     16 dual pointers
//! ```
//!
//! Mini-page i covers slices s with `separators[i-1] <= s < separators[i]`;
//! within it, pointer j covers `mini_separators[j-1] <= s <
//! mini_separators[j]`. Both separator lists are strictly increasing.
//!
//! ## Mutation
//!
//! The fast path, adopting one more child into a mini-page with room,
//! shifts the mini's arrays up by one under the mini latch with the
//! inserting bit, while the page latch pins the page shape. When a
//! mini-page (or the page) is full, the mutator flattens all children,
//! redistributes them evenly, and rewrites the minis under the page latch
//! with the splitting bit; readers that raced the rewrite are caught by the
//! double-check descent (mini version, then page version) and retry.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::config::{
    MAX_INTERMEDIATE_POINTERS, MAX_MINI_SEPARATORS, MAX_SEPARATORS, MINI_PAGES, MINI_POINTERS,
};
use crate::key::KeySlice;
use crate::page::pointer::{DualPointer, SnapshotPageId, VolatilePointer};
use crate::page::version::{PageVersion, PageVersionGuard, VersionSnapshot};
use crate::page::PageCommon;

/// A flattened child list: each entry is (low slice bound, child pointer).
/// The first entry's bound is the page's low fence.
pub type ChildList = SmallVec<[(KeySlice, VolatilePointer); MAX_INTERMEDIATE_POINTERS]>;

#[repr(C)]
pub struct MiniPage {
    pub version: PageVersion,
    separators: [AtomicU64; MAX_MINI_SEPARATORS],
    pointers: [DualPointer; MINI_POINTERS],
}

impl MiniPage {
    /// Routes a slice to a pointer index in `[0, separator_count]`.
    pub fn find_pointer(&self, stable: VersionSnapshot, slice: KeySlice) -> usize {
        self.find_pointer_at(stable.key_count(), slice)
    }

    /// Same routing with an explicit separator count; used under the latch,
    /// where the count comes from the guard rather than a snapshot.
    pub fn find_pointer_at(&self, count: usize, slice: KeySlice) -> usize {
        debug_assert!(count <= MAX_MINI_SEPARATORS);
        for i in 0..count {
            if slice < self.separators[i].load(Ordering::Acquire) {
                return i;
            }
        }
        count
    }

    #[inline]
    pub fn pointer(&self, index: usize) -> &DualPointer {
        &self.pointers[index]
    }

    #[inline]
    pub fn separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(Ordering::Acquire)
    }

    /// Shifts separators/pointers up and installs (separator, child) so the
    /// new child covers `[separator, old coverage of position)` at
    /// `position + 1`. Caller holds this mini's latch (inserting set) and
    /// the page latch.
    pub(crate) fn insert_child(
        &self,
        guard: &PageVersionGuard<'_>,
        position: usize,
        separator: KeySlice,
        child: VolatilePointer,
    ) {
        let count = guard.key_count() - 1; // pre-increment separator count
        debug_assert!(count < MAX_MINI_SEPARATORS);
        debug_assert!(position <= count);
        let mut i = count;
        while i > position {
            self.separators[i].store(self.separators[i - 1].load(Ordering::Relaxed), Ordering::Relaxed);
            i -= 1;
        }
        let mut j = count + 1;
        while j > position + 1 {
            let src = &self.pointers[j - 1];
            self.pointers[j].init(src.snapshot_id(), src.volatile());
            j -= 1;
        }
        self.separators[position].store(separator, Ordering::Relaxed);
        self.pointers[position + 1].init(SnapshotPageId::NULL, child);
    }

    fn write_entries(&self, entries: &[(KeySlice, VolatilePointer)]) {
        debug_assert!(!entries.is_empty() && entries.len() <= MINI_POINTERS);
        for (j, &(bound, child)) in entries.iter().enumerate() {
            if j > 0 {
                self.separators[j - 1].store(bound, Ordering::Relaxed);
            }
            self.pointers[j].init(SnapshotPageId::NULL, child);
        }
    }
}

#[repr(C)]
pub struct IntermediatePage {
    common: PageCommon,
    separators: [AtomicU64; MAX_SEPARATORS],
    _reserved: [u8; 120],
    mini_pages: [MiniPage; MINI_PAGES],
}

impl IntermediatePage {
    #[inline]
    pub fn common(&self) -> &PageCommon {
        &self.common
    }

    #[inline]
    pub(crate) fn common_mut(&mut self) -> &mut PageCommon {
        &mut self.common
    }

    /// Routes a slice to a mini-page index in `[0, separator_count]`.
    pub fn find_minipage(&self, stable: VersionSnapshot, slice: KeySlice) -> usize {
        self.find_minipage_at(stable.key_count(), slice)
    }

    /// Same routing with an explicit separator count; used under the latch.
    pub fn find_minipage_at(&self, count: usize, slice: KeySlice) -> usize {
        debug_assert!(count <= MAX_SEPARATORS);
        for i in 0..count {
            if slice < self.separators[i].load(Ordering::Acquire) {
                return i;
            }
        }
        count
    }

    #[inline]
    pub fn mini(&self, index: usize) -> &MiniPage {
        &self.mini_pages[index]
    }

    #[inline]
    pub fn separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(Ordering::Acquire)
    }

    /// Total children currently addressed. Caller holds the page latch.
    pub fn child_count(&self) -> usize {
        let minis = self.common.version.key_count() + 1;
        (0..minis)
            .map(|i| self.mini_pages[i].version.key_count() + 1)
            .sum()
    }

    /// Collects every (low bound, child) pair in order. Caller holds the
    /// page latch.
    pub fn flatten(&self) -> ChildList {
        let mut out = ChildList::new();
        let minis = self.common.version.key_count() + 1;
        for i in 0..minis {
            let mini = &self.mini_pages[i];
            let mini_low = if i == 0 {
                self.common.low_fence()
            } else {
                self.separators[i - 1].load(Ordering::Acquire)
            };
            let pointers = mini.version.key_count() + 1;
            for j in 0..pointers {
                let bound = if j == 0 {
                    mini_low
                } else {
                    mini.separators[j - 1].load(Ordering::Acquire)
                };
                out.push((bound, mini.pointer(j).volatile()));
            }
        }
        out
    }

    /// Rewrites the whole two-level layout from a flattened child list,
    /// distributing children evenly across as few minis as possible. Caller
    /// holds the page latch with the splitting bit set; each touched mini is
    /// relatched while it is rewritten.
    pub fn rebuild(&self, guard: &PageVersionGuard<'_>, entries: &[(KeySlice, VolatilePointer)]) {
        debug_assert!(!entries.is_empty());
        debug_assert!(entries.len() <= MAX_INTERMEDIATE_POINTERS);

        let minis = entries.len().div_ceil(MINI_POINTERS);
        let base = entries.len() / minis;
        let extra = entries.len() % minis;

        let mut start = 0;
        for i in 0..minis {
            let take = base + usize::from(i < extra);
            let chunk = &entries[start..start + take];
            if i > 0 {
                self.separators[i - 1].store(chunk[0].0, Ordering::Relaxed);
            }
            let mini = &self.mini_pages[i];
            let mini_guard = mini.version.lock();
            mini_guard.set_splitting();
            mini.write_entries(chunk);
            mini_guard.set_key_count(take - 1);
            drop(mini_guard);
            start += take;
        }
        // minis beyond the new count keep stale contents; the page-level
        // separator count makes them unreachable
        guard.set_key_count(minis - 1);
    }

    /// Builds the layout of a brand-new root: two children split at
    /// `separator`. The page is still thread-private.
    pub(crate) fn initialize_two_children(
        &self,
        left: VolatilePointer,
        separator: KeySlice,
        right: VolatilePointer,
    ) {
        let mini = &self.mini_pages[0];
        mini.pointers[0].init(SnapshotPageId::NULL, left);
        mini.separators[0].store(separator, Ordering::Relaxed);
        mini.pointers[1].init(SnapshotPageId::NULL, right);
        let mini_guard = mini.version.lock();
        mini_guard.set_key_count(1);
        drop(mini_guard);
        let guard = self.common.version.lock();
        guard.set_key_count(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{INFIMUM_SLICE, SUPREMUM_SLICE};
    use crate::page::PageType;

    fn empty_intermediate() -> Box<IntermediatePage> {
        let mut page: Box<IntermediatePage> = unsafe { Box::new(std::mem::zeroed()) };
        page.common_mut().initialize(
            VolatilePointer::new(0, 0, 1),
            1,
            PageType::Intermediate,
            0,
            INFIMUM_SLICE,
            SUPREMUM_SLICE,
            VolatilePointer::NULL,
        );
        page
    }

    fn child(offset: u64) -> VolatilePointer {
        VolatilePointer::new(0, 0, offset)
    }

    #[test]
    fn two_children_route_around_the_separator() {
        let page = empty_intermediate();
        page.initialize_two_children(child(1), 100, child(2));

        let stable = page.common().version.stable();
        assert_eq!(page.find_minipage(stable, 0), 0);
        assert_eq!(page.find_minipage(stable, u64::MAX), 0);

        let mini = page.mini(0);
        let mini_stable = mini.version.stable();
        assert_eq!(mini.find_pointer(mini_stable, 99), 0);
        assert_eq!(mini.find_pointer(mini_stable, 100), 1);
        assert_eq!(mini.pointer(0).volatile(), child(1));
        assert_eq!(mini.pointer(1).volatile(), child(2));
    }

    #[test]
    fn insert_child_shifts_the_tail() {
        let page = empty_intermediate();
        page.initialize_two_children(child(1), 100, child(2));

        let mini = page.mini(0);
        let _page_guard = page.common().version.lock();
        let mini_guard = mini.version.lock();
        mini_guard.set_inserting_and_increment_key_count();
        // child(3) takes over [50, 100) after position 0
        mini.insert_child(&mini_guard, 0, 50, child(3));
        drop(mini_guard);

        let stable = mini.version.stable();
        assert_eq!(stable.key_count(), 2);
        assert_eq!(mini.find_pointer(stable, 10), 0);
        assert_eq!(mini.find_pointer(stable, 50), 1);
        assert_eq!(mini.find_pointer(stable, 77), 1);
        assert_eq!(mini.find_pointer(stable, 100), 2);
        assert_eq!(mini.pointer(1).volatile(), child(3));
        assert_eq!(mini.pointer(2).volatile(), child(2));
    }

    #[test]
    fn flatten_and_rebuild_round_trip() {
        let page = empty_intermediate();
        page.initialize_two_children(child(1), 100, child(2));
        {
            let guard = page.common().version.lock();
            let mut entries = page.flatten();
            assert_eq!(entries.as_slice(), &[(0, child(1)), (100, child(2))]);
            for i in 0..40 {
                entries.push((200 + i, child(10 + i)));
            }
            guard.set_splitting();
            page.rebuild(&guard, &entries);
        }

        let stable = page.common().version.stable();
        assert!(stable.key_count() >= 2);
        let flat = page.flatten();
        assert_eq!(flat.len(), 42);
        assert_eq!(flat[0], (0, child(1)));
        assert_eq!(flat[41], (239, child(49)));
        // separators stay strictly increasing at both levels
        for w in flat.windows(2).skip(1) {
            assert!(w[0].0 < w[1].0);
        }
    }

    #[test]
    fn child_count_tracks_rebuild() {
        let page = empty_intermediate();
        page.initialize_two_children(child(1), 100, child(2));
        let guard = page.common().version.lock();
        assert_eq!(page.child_count(), 2);
        let mut entries = page.flatten();
        for i in 0..158 {
            entries.push((1000 + i, child(100 + i)));
        }
        guard.set_splitting();
        page.rebuild(&guard, &entries);
        assert_eq!(page.child_count(), MAX_INTERMEDIATE_POINTERS);
    }
}
