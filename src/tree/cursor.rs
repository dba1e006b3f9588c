//! # Layered Descent
//!
//! Descent is a loop over an explicit cursor, never recursion: from a layer
//! root, hop intermediate pages down to the border page whose fences cover
//! the search slice. Readers hold nothing; every hop is the double-checked
//! dance the version protocol prescribes:
//!
//! 1. snapshot the page version (stable),
//! 2. pick the mini-page, snapshot its version,
//! 3. pick the pointer and load its volatile side,
//! 4. re-read the mini version and the page version; if either moved,
//!    retry this page, since the pointer may have routed into a stale range.
//!
//! A page that turns out retired, or whose fences no longer cover the
//! slice (a split won the race), sends the walk back to the layer root.
//! The writer variant locks the border page it lands on and re-validates
//! coverage under the latch before returning.

use crate::page::{
    BorderPage, DualPointer, PageRef, PageVersionGuard, VersionSnapshot,
};
use crate::key::KeySlice;
use crate::tree::SliceTree;

/// A border page reached by descent, with the stable version the walk
/// validated against.
pub(crate) struct BorderTarget<'a> {
    pub page: &'a BorderPage,
    pub stable: VersionSnapshot,
}

impl SliceTree {
    /// Walks from `root` (a layer root dual pointer) to the border page
    /// covering `slice`, latch-free.
    pub(crate) fn descend_to_border(&self, root: &DualPointer, slice: KeySlice) -> BorderTarget<'_> {
        'from_root: loop {
            let Some(mut cur) = self.resolve_dual(root) else {
                // the layer root is being swung; brief window
                std::hint::spin_loop();
                continue 'from_root;
            };
            // a dual pointer captured before a root growth may still name
            // the demoted root; the in-layer parent chain leads back up to
            // the page that now tops the layer
            loop {
                let parent = unsafe { crate::page::page_common(cur) }.in_layer_parent();
                if parent.is_null() {
                    break;
                }
                cur = self.pool().resolve(parent) as *const u8;
            }
            match self.walk_down(cur, slice) {
                Some(target) => return target,
                None => continue 'from_root,
            }
        }
    }

    /// One top-down pass from `start` to the border page covering `slice`.
    /// Returns `None` when a hop lands on a retired page or outside its
    /// claim (a split won the race); the caller decides where to restart.
    pub(crate) fn walk_down(&self, start: *const u8, slice: KeySlice) -> Option<BorderTarget<'_>> {
        let mut cur = start;
        loop {
            match unsafe { crate::page::page_ref(cur) } {
                PageRef::Border(page) => {
                    let stable = page.common().version.stable();
                    if stable.is_retired() || !page.common().within_fences(slice) {
                        return None;
                    }
                    return Some(BorderTarget { page, stable });
                }
                PageRef::Intermediate(page) => {
                    let stable = page.common().version.stable();
                    if stable.is_retired() || !page.common().within_fences(slice) {
                        return None;
                    }
                    let mini = page.mini(page.find_minipage(stable, slice));
                    let mini_stable = mini.version.stable();
                    let pointer = mini.pointer(mini.find_pointer(mini_stable, slice));
                    let child = pointer.volatile();
                    if mini.version.changed_from(mini_stable)
                        || page.common().version.changed_from(stable)
                    {
                        // the grid moved under us; retry this page
                        continue;
                    }
                    if child.is_null() {
                        return None;
                    }
                    cur = self.pool().resolve(child) as *const u8;
                }
            }
        }
    }

    /// Descends like [`descend_to_border`] and latches the page, giving up
    /// and re-walking whenever the latched page no longer covers the slice.
    pub(crate) fn descend_and_latch(
        &self,
        root: &DualPointer,
        slice: KeySlice,
    ) -> (&BorderPage, PageVersionGuard<'_>) {
        loop {
            let target = self.descend_to_border(root, slice);
            let page = target.page;
            let guard = page.common().version.lock();
            if page.common().version.is_retired() || !page.common().within_fences(slice) {
                drop(guard);
                continue;
            }
            return (page, guard);
        }
    }
}
