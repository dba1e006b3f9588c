//! # Single-Threaded Invariant Walker
//!
//! Walks every reachable page of a quiescent tree and checks the
//! structural invariants: fence containment, separator ordering, triple
//! uniqueness, layer tagging, and the layer-root contract. Violations are
//! reported as rich `eyre` errors naming the offending page; tests run the
//! walker after every scenario.
//!
//! The walker takes no latches and must not race writers.

use eyre::{ensure, Result};
use hashbrown::HashSet;

use crate::key::{KeySlice, INFIMUM_SLICE, SUPREMUM_SLICE};
use crate::page::{BorderPage, IntermediatePage, PageRef, VolatilePointer};
use crate::tree::SliceTree;

/// Tallies from a full verification walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerifyStats {
    pub pages: usize,
    /// Live records: not logically deleted, not relocated tombstones.
    pub records: usize,
    /// Logically deleted records still occupying slots.
    pub tombstones: usize,
    pub deepest_layer: u8,
}

impl SliceTree {
    /// Verifies every invariant the structure promises; see module docs.
    pub fn verify(&self) -> Result<VerifyStats> {
        let mut stats = VerifyStats::default();
        let root = self.root().volatile();
        ensure!(!root.is_null(), "layer-0 root pointer is null");
        self.verify_page(root, 0, INFIMUM_SLICE, SUPREMUM_SLICE, &mut stats)?;
        Ok(stats)
    }

    fn verify_page(
        &self,
        pointer: VolatilePointer,
        layer: u8,
        low: KeySlice,
        high: KeySlice,
        stats: &mut VerifyStats,
    ) -> Result<()> {
        stats.pages += 1;
        stats.deepest_layer = stats.deepest_layer.max(layer);
        match self.page(pointer) {
            PageRef::Border(page) => self.verify_border(page, pointer, layer, low, high, stats),
            PageRef::Intermediate(page) => {
                self.verify_intermediate(page, pointer, layer, low, high, stats)
            }
        }
    }

    fn verify_border(
        &self,
        page: &BorderPage,
        pointer: VolatilePointer,
        layer: u8,
        low: KeySlice,
        high: KeySlice,
        stats: &mut VerifyStats,
    ) -> Result<()> {
        let common = page.common();
        let stable = common.version.stable();
        ensure!(
            stable.layer() == layer,
            "border page {pointer:?}: layer {} != expected {layer}",
            stable.layer()
        );
        ensure!(
            common.low_fence() == low && common.high_fence() == high,
            "border page {pointer:?}: fences [{:#x}, {:#x}) != expected [{low:#x}, {high:#x})",
            common.low_fence(),
            common.high_fence()
        );

        let mut triples: HashSet<(KeySlice, u8, Vec<u8>)> = HashSet::new();
        let mut suffixed: HashSet<KeySlice> = HashSet::new();
        for i in 0..stable.key_count() {
            let slice = page.slice(i);
            let owner = page.owner_id(i).read();
            if page.does_point_to_layer(i) {
                if !common.within_fences(slice) {
                    // a relocated layer-pointer tombstone; the authoritative
                    // copy lives in the sibling that covers the slice
                    ensure!(
                        owner.is_moved(),
                        "border page {pointer:?}: live layer-pointer slice {slice:#x} outside fences"
                    );
                    continue;
                }
                ensure!(
                    suffixed.insert(slice),
                    "border page {pointer:?}: two suffixed/layer slots for slice {slice:#x}"
                );
                let child = page.next_layer(i).volatile();
                ensure!(
                    !child.is_null(),
                    "border page {pointer:?}: null next-layer pointer at slot {i}"
                );
                let child_common = match self.page(child) {
                    PageRef::Border(b) => b.common(),
                    PageRef::Intermediate(p) => p.common(),
                };
                ensure!(
                    child_common.low_fence() == INFIMUM_SLICE
                        && child_common.high_fence() == SUPREMUM_SLICE,
                    "layer root {child:?}: fences must span the whole slice space"
                );
                ensure!(
                    child_common.header.root_owner() == pointer,
                    "layer root {child:?}: owner backlink {:?} != owning page {pointer:?}",
                    child_common.header.root_owner()
                );
                self.verify_page(child, layer + 1, INFIMUM_SLICE, SUPREMUM_SLICE, stats)?;
                continue;
            }
            if owner.is_moved() {
                // relocated tombstone; its authoritative copy was verified
                // in the page that now covers its slice
                continue;
            }
            ensure!(
                common.within_fences(slice),
                "border page {pointer:?}: slot {i} slice {slice:#x} outside fences"
            );
            let remaining = page.remaining_length(i);
            let mut suffix = vec![0u8; page.suffix_len(i)];
            page.read_suffix(i, &mut suffix);
            if remaining > 8 {
                ensure!(
                    suffixed.insert(slice),
                    "border page {pointer:?}: second suffixed record for slice {slice:#x}"
                );
            }
            ensure!(
                triples.insert((slice, remaining, suffix)),
                "border page {pointer:?}: duplicate (slice, length, suffix) triple at slot {i}"
            );
            if owner.is_deleted() {
                stats.tombstones += 1;
            } else {
                stats.records += 1;
            }
        }
        Ok(())
    }

    fn verify_intermediate(
        &self,
        page: &IntermediatePage,
        pointer: VolatilePointer,
        layer: u8,
        low: KeySlice,
        high: KeySlice,
        stats: &mut VerifyStats,
    ) -> Result<()> {
        let common = page.common();
        let stable = common.version.stable();
        ensure!(
            stable.layer() == layer,
            "intermediate page {pointer:?}: layer {} != expected {layer}",
            stable.layer()
        );
        ensure!(
            common.low_fence() == low && common.high_fence() == high,
            "intermediate page {pointer:?}: fences [{:#x}, {:#x}) != expected [{low:#x}, {high:#x})",
            common.low_fence(),
            common.high_fence()
        );
        for i in 1..stable.key_count() {
            ensure!(
                page.separator(i - 1) < page.separator(i),
                "intermediate page {pointer:?}: separators not strictly increasing"
            );
        }
        for m in 0..=stable.key_count() {
            let mini = page.mini(m);
            let mini_stable = mini.version.stable();
            for j in 1..mini_stable.key_count() {
                ensure!(
                    mini.separator(j - 1) < mini.separator(j),
                    "intermediate page {pointer:?} mini {m}: separators not strictly increasing"
                );
            }
        }

        let entries = page.flatten();
        ensure!(
            !entries.is_empty(),
            "intermediate page {pointer:?}: no children"
        );
        ensure!(
            entries[0].0 == low,
            "intermediate page {pointer:?}: first child bound {:#x} != low fence {low:#x}",
            entries[0].0
        );
        for w in entries.windows(2) {
            ensure!(
                w[0].0 < w[1].0,
                "intermediate page {pointer:?}: child bounds not strictly increasing"
            );
        }
        for (idx, &(child_low, child)) in entries.iter().enumerate() {
            ensure!(
                !child.is_null(),
                "intermediate page {pointer:?}: null child pointer at {idx}"
            );
            let child_high = entries.get(idx + 1).map_or(high, |next| next.0);
            let child_common = match self.page(child) {
                PageRef::Border(b) => b.common(),
                PageRef::Intermediate(p) => p.common(),
            };
            ensure!(
                child_common.in_layer_parent() == pointer,
                "child {child:?}: in-layer parent {:?} != {pointer:?}",
                child_common.in_layer_parent()
            );
            self.verify_page(child, layer, child_low, child_high, stats)?;
        }
        Ok(())
    }
}
