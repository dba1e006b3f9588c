//! # Structural Modifications
//!
//! Splits, adoptions, root growth, next-layer creation, and the in-page
//! compaction that handles the one shape a split cannot: a page whose
//! records all share the trigger's slice.
//!
//! ## Ordering Discipline
//!
//! Latches are only ever taken upward: record → page → in-layer parent →
//! (for a layer root) the border page of the previous layer. Descent takes
//! none. That single direction is what makes the whole SMO family
//! deadlock-free.
//!
//! Every SMO builds its new page thread-private, publishes it with a single
//! pointer write under the publisher's latch, and only then shrinks the old
//! page's claim. Allocation failures therefore unwind cleanly: a sibling
//! that was never published is handed straight back to the pool, moved
//! bits are cleared, fences restored, and `OutOfPages` surfaces with the
//! structure exactly as it was.
//!
//! ## Transient Sharing
//!
//! Between publishing a sibling in the parent and shrinking the old page,
//! both pages claim the upper range. That is harmless: the old page still
//! routes the range correctly, the sibling routes it correctly, and every
//! reader re-validates versions after the hop. Mutators chasing a moved
//! record spin for the duration of the SMO, bounded by the latch hold.

use smallvec::SmallVec;

use crate::config::{
    BORDER_DATA_SIZE, BORDER_MAX_KEYS, MAX_INTERMEDIATE_POINTERS, MAX_MINI_SEPARATORS,
    RECORD_ALIGN,
};
use crate::error::{Result, TreeError};
use crate::key::{slice_of, KeySlice, INFIMUM_SLICE, SUPREMUM_SLICE};
use crate::memory::ReleaseBatch;
use crate::page::intermediate::ChildList;
use crate::page::{
    page_common, BorderPage, DualPointer, IntermediatePage, PageCommon, PageRef,
    PageVersionGuard, VolatilePointer,
};
use crate::tree::SliceTree;

impl SliceTree {
    /// Morphs the conflicting record at `index` into a next-layer pointer
    /// rooted at a fresh border page carrying the old record one layer
    /// deeper. The caller holds the page latch; the record's owner lock is
    /// taken across the morph and released with the moved bit.
    pub(crate) fn create_next_layer<'t>(
        &'t self,
        page: &'t BorderPage,
        guard: &PageVersionGuard<'_>,
        index: usize,
    ) -> Result<&'t DualPointer> {
        let layer = page.common().layer();
        let (child_ptr, child) =
            self.allocate_border(layer + 1, INFIMUM_SLICE, SUPREMUM_SLICE, VolatilePointer::NULL)?;
        child
            .common()
            .header
            .set_root_owner(page.common().header.self_ptr());

        let owner = page.owner_id(index);
        let value = owner.lock();
        // splits and morphs need the page latch we hold, so the record
        // cannot already be relocated
        debug_assert!(!value.is_moved());

        let old_remaining = page.remaining_length(index);
        debug_assert!(old_remaining > 8);
        let mut suffix_buf = [0u8; 256];
        let suffix_len = page.read_suffix(index, &mut suffix_buf[..page.suffix_len(index)]);
        let payload_len = page.payload_length(index);
        let mut payload_buf: SmallVec<[u8; 128]> = SmallVec::new();
        payload_buf.resize(payload_len, 0);
        page.read_payload(index, 0, &mut payload_buf);

        let new_remaining = old_remaining - 8;
        let new_slice = slice_of(&suffix_buf[..suffix_len]);
        let new_suffix: &[u8] = if suffix_len > 8 {
            &suffix_buf[8..suffix_len]
        } else {
            &[]
        };
        {
            let child_guard = child.common().version.lock();
            child_guard.set_inserting_and_increment_key_count();
            child.reserve_record_space(
                &child_guard,
                0,
                value,
                new_slice,
                new_suffix,
                new_remaining,
                payload_len,
            );
            child.write_payload(0, 0, &payload_buf);
        }

        guard.set_inserting();
        page.set_next_layer(index, child_ptr);
        owner.unlock_with(value.with_moved());
        Ok(page.next_layer(index))
    }

    /// Splits a border page that cannot accommodate the triggering insert.
    /// Consumes the page latch guard; on success the layer has room for the
    /// record somewhere and the caller re-descends.
    pub(crate) fn split_border(
        &self,
        page: &BorderPage,
        guard: PageVersionGuard<'_>,
        trigger_slice: KeySlice,
        trigger_remaining: u8,
        trigger_payload: usize,
    ) -> Result<()> {
        guard.set_splitting();
        let count = guard.key_count();
        debug_assert!(count > 0);

        // relocated tombstones carry slices outside the fences; they are
        // dead weight, not residents
        let mut resident: SmallVec<[KeySlice; BORDER_MAX_KEYS]> = SmallVec::new();
        for i in 0..count {
            let value = page.owner_id(i).read();
            if value.is_moved() && !page.does_point_to_layer(i) {
                continue;
            }
            resident.push(page.slice(i));
        }
        resident.sort_unstable();
        resident.dedup();
        if resident.is_empty() {
            return self.compact_border(page, guard, trigger_remaining, trigger_payload);
        }

        let split_slice = if resident.len() >= 2 {
            resident[resident.len() / 2]
        } else if trigger_slice > resident[0] {
            // sequential append shape: keep everything, open an empty
            // sibling on the right
            trigger_slice
        } else if trigger_slice < resident[0] {
            resident[0]
        } else {
            // every record shares the trigger's slice; no separator can
            // partition them, so reclaim dead space instead
            return self.compact_border(page, guard, trigger_remaining, trigger_payload);
        };

        let old_high = page.common().high_fence();
        let (sibling_ptr, sibling) = self.allocate_border(
            page.common().layer(),
            split_slice,
            old_high,
            page.common().in_layer_parent(),
        )?;

        // relocate the upper records; each is stabilized by its owner lock
        // and left behind as a moved tombstone
        let mut moved: SmallVec<[usize; BORDER_MAX_KEYS]> = SmallVec::new();
        for i in 0..count {
            if page.slice(i) < split_slice {
                continue;
            }
            let owner = page.owner_id(i);
            let value = owner.lock();
            if value.is_moved() && !page.does_point_to_layer(i) {
                // already a tombstone from an earlier split
                owner.unlock_with(value);
                continue;
            }
            sibling.copy_record_from(moved.len(), page, i, value.without_moved());
            if page.does_point_to_layer(i) {
                // the deeper root's owner is now the sibling
                let deeper = page.next_layer(i).volatile();
                if !deeper.is_null() {
                    let deeper_common =
                        unsafe { page_common(self.pool().resolve(deeper) as *const u8) };
                    deeper_common.header.set_root_owner(sibling_ptr);
                }
            }
            owner.unlock_with(value.with_moved());
            moved.push(i);
        }
        {
            let sibling_guard = sibling.common().version.lock();
            sibling_guard.set_key_count(moved.len());
        }
        page.common().set_high_fence(split_slice);

        match self.adopt_child(page.common(), split_slice, sibling_ptr) {
            Ok(()) => Ok(()),
            Err(err) => {
                // unwind: the sibling was never published
                page.common().set_high_fence(old_high);
                for &i in &moved {
                    let owner = page.owner_id(i);
                    let value = owner.lock();
                    if page.does_point_to_layer(i) {
                        let deeper = page.next_layer(i).volatile();
                        if !deeper.is_null() {
                            let deeper_common =
                                unsafe { page_common(self.pool().resolve(deeper) as *const u8) };
                            deeper_common
                                .header
                                .set_root_owner(page.common().header.self_ptr());
                        }
                    }
                    owner.unlock_with(value.without_moved());
                }
                let mut batch = ReleaseBatch::new();
                batch.add(sibling_ptr);
                self.pool().reclaim(&mut batch);
                Err(err)
            }
        }
    }

    /// In-page compaction for the all-one-slice shape: reclaims the data
    /// areas of relocated tombstones and the payloads of logically deleted
    /// records. All record locks are held across the move so no reader can
    /// copy a payload mid-motion.
    fn compact_border(
        &self,
        page: &BorderPage,
        guard: PageVersionGuard<'_>,
        trigger_remaining: u8,
        trigger_payload: usize,
    ) -> Result<()> {
        let count = guard.key_count();
        let mut owners: SmallVec<[crate::txn::OwnerIdValue; BORDER_MAX_KEYS]> = SmallVec::new();
        for i in 0..count {
            owners.push(page.owner_id(i).lock());
        }

        let mut kept_total = 0usize;
        for i in 0..count {
            kept_total += page.compacted_size(i, owners[i]);
        }
        let needed = BorderPage::record_size(trigger_remaining, trigger_payload);
        if kept_total + needed > BORDER_DATA_SIZE {
            for i in (0..count).rev() {
                page.owner_id(i).unlock_with(owners[i]);
            }
            return Err(TreeError::TooLongPayload {
                length: trigger_payload,
                max: (BORDER_DATA_SIZE - kept_total)
                    .saturating_sub(RECORD_ALIGN),
            });
        }

        page.compact_records(&guard, &owners);
        for i in (0..count).rev() {
            page.owner_id(i).unlock_with(owners[i]);
        }
        drop(guard);
        Ok(())
    }

    /// Publishes `sibling` (covering `[separator, child's old high)`) next
    /// to the latched `child` in the in-layer parent, growing the layer's
    /// root when the child is the root. Takes no latch below the parent.
    fn adopt_child(
        &self,
        child: &PageCommon,
        separator: KeySlice,
        sibling: VolatilePointer,
    ) -> Result<()> {
        loop {
            let parent_ptr = child.in_layer_parent();
            if parent_ptr.is_null() {
                return self.grow_root(child, separator, sibling);
            }
            let parent = match self.page(parent_ptr) {
                PageRef::Intermediate(p) => p,
                PageRef::Border(_) => unreachable!("in-layer parent must be intermediate"),
            };
            let parent_guard = parent.common().version.lock();
            if parent.common().version.is_retired()
                || !parent.common().within_fences(separator)
                || parent.common().layer() != child.layer()
            {
                // stale backlink; the relocating SMO refreshes it
                drop(parent_guard);
                std::hint::spin_loop();
                continue;
            }

            let child_ptr = child.header.self_ptr();
            let mini_index = parent.find_minipage_at(parent_guard.key_count(), separator);
            let mini = parent.mini(mini_index);
            let mini_count = mini.version.key_count();
            let position = mini.find_pointer_at(mini_count, separator);
            if mini.pointer(position).volatile() != child_ptr {
                drop(parent_guard);
                std::hint::spin_loop();
                continue;
            }

            if mini_count < MAX_MINI_SEPARATORS {
                let mini_guard = mini.version.lock();
                mini_guard.set_inserting_and_increment_key_count();
                mini.insert_child(&mini_guard, position, separator, sibling);
                return Ok(());
            }

            // the mini is full: flatten the page and redistribute, splitting
            // the page itself if even that cannot hold one more child
            let mut entries = parent.flatten();
            let at = entries
                .iter()
                .position(|&(_, p)| p == child_ptr)
                .expect("latched child must appear in its parent");
            entries.insert(at + 1, (separator, sibling));

            if entries.len() <= MAX_INTERMEDIATE_POINTERS {
                parent_guard.set_splitting();
                parent.rebuild(&parent_guard, &entries);
                return Ok(());
            }
            return self.split_intermediate(parent, &parent_guard, entries);
        }
    }

    /// Splits a full intermediate page around the median child; the upper
    /// half moves to a fresh sibling that is published in the grandparent
    /// before this page shrinks.
    fn split_intermediate(
        &self,
        parent: &IntermediatePage,
        parent_guard: &PageVersionGuard<'_>,
        entries: ChildList,
    ) -> Result<()> {
        parent_guard.set_splitting();
        let mid = entries.len() / 2;
        let split_separator = entries[mid].0;
        let old_high = parent.common().high_fence();

        let (sibling_ptr, sibling) = self.allocate_intermediate(
            parent.common().layer(),
            split_separator,
            old_high,
            parent.common().in_layer_parent(),
        )?;
        {
            let sibling_guard = sibling.common().version.lock();
            sibling_guard.set_splitting();
            sibling.rebuild(&sibling_guard, &entries[mid..]);
        }

        if let Err(err) = self.adopt_child(parent.common(), split_separator, sibling_ptr) {
            let mut batch = ReleaseBatch::new();
            batch.add(sibling_ptr);
            self.pool().reclaim(&mut batch);
            return Err(err);
        }

        // the sibling is reachable; move the upper children's backlinks and
        // shrink this page to the lower half
        for &(_, child_ptr) in &entries[mid..] {
            if !child_ptr.is_null() {
                let child_common = unsafe { page_common(self.pool().resolve(child_ptr) as *const u8) };
                child_common.set_in_layer_parent(sibling_ptr);
            }
        }
        parent.rebuild(parent_guard, &entries[..mid]);
        parent.common().set_high_fence(split_separator);
        Ok(())
    }

    /// Grows a layer whose root split: a fresh intermediate page over the
    /// two halves becomes the layer root, and the owning pointer (the
    /// tree's control block for layer 0, a border slot's dual pointer for
    /// deeper layers) is swung to it.
    fn grow_root(
        &self,
        child: &PageCommon,
        separator: KeySlice,
        sibling: VolatilePointer,
    ) -> Result<()> {
        let layer = child.layer();
        let child_ptr = child.header.self_ptr();
        let (root_ptr, new_root) =
            self.allocate_intermediate(layer, INFIMUM_SLICE, SUPREMUM_SLICE, VolatilePointer::NULL)?;
        new_root.initialize_two_children(child_ptr, separator, sibling);
        new_root
            .common()
            .header
            .set_root_owner(child.header.root_owner());
        child.set_in_layer_parent(root_ptr);
        unsafe { page_common(self.pool().resolve(sibling) as *const u8) }
            .set_in_layer_parent(root_ptr);

        let owner = child.header.root_owner();
        if owner.is_null() {
            // layer 0: the control block owns the root pointer, and only
            // the root's splitter (us, holding its latch) may swing it
            let swung = self.root().swing_volatile(child_ptr, root_ptr);
            debug_assert!(swung);
            return Ok(());
        }
        // deeper layer: swing the owning border slot, chasing relocations
        // of the slot through the child's refreshed backlink
        loop {
            let owner_ptr = child.header.root_owner();
            let owner_border = self.border(owner_ptr);
            let owner_guard = owner_border.common().version.lock();
            if let Some(slot) = owner_border.find_layer_slot(child_ptr) {
                owner_border.next_layer(slot).set_volatile(root_ptr);
                new_root
                    .common()
                    .header
                    .set_root_owner(owner_border.common().header.self_ptr());
                drop(owner_guard);
                return Ok(());
            }
            drop(owner_guard);
            std::hint::spin_loop();
        }
    }
}
