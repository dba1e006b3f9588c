//! # Operation State Machines
//!
//! The byte-string storage API: point lookup, insert, logical delete,
//! overwrite, increment, the `_normalized` family for keys that are exactly
//! one slice, and primitive-typed payload accessors.
//!
//! Every operation is optimistic and restartable: the probe walks layers
//! latch-free, and any version or owner-id disturbance sends it back
//! through the loop. Restarts are internal; what escapes is a semantic
//! outcome (`KeyNotFound` / `KeyAlreadyExists`, each with its read-set side
//! effect), a contract error (checked against a validated record state,
//! before any mutation), or `OutOfPages` from a structural modification.
//!
//! ## Insert = Reserve + Apply
//!
//! An insert reserves a slot under the page latch (the record is born with
//! the delete bit set), writes the payload, takes the record lock, and only
//! after releasing the latch clears the delete bit through that lock. A
//! racing reader sees the record either not yet counted, or counted but
//! record-locked/deleted until the commit lands; never a torn payload. A
//! racing split spins on the record lock before it may relocate the slot,
//! so the commit always writes the record's live home.
//!
//! ## Payload Snapshots
//!
//! Readers copy payload bytes bracketed by two owner-id reads; a change
//! (including the timestamp freshly stamped by every overwrite commit)
//! discards the copy. Contract violations (short buffers, out-of-bounds
//! part reads) are only reported when the bracketing validates, so they
//! are judged against a record state that really existed.

use crate::config::MAX_PAYLOAD_LENGTH;
use crate::error::{Result, TreeError};
use crate::key::{key_length_ok, slice_bytes, slice_of, suffix_of, KeySlice};
use crate::page::{page_common, BorderPage, DualPointer, MatchKind, VersionSnapshot};
use crate::tree::SliceTree;
use crate::txn::{OwnerIdValue, TxnContext};

/// Bound on how many relocation hops [`SliceTree::track_moved`] chases
/// before falling back to a full restart. Back-to-back splits of the same
/// range need one hop each; anything past a handful means the caller should
/// re-descend rather than keep chasing.
const TRACK_MOVED_HOP_LIMIT: usize = 16;

/// A record slot pinned by a consistent probe.
pub(crate) struct FoundSlot<'a> {
    pub page: &'a BorderPage,
    pub index: usize,
    pub observed: OwnerIdValue,
}

pub(crate) enum Probe<'a> {
    Hit(FoundSlot<'a>),
    Miss {
        page: &'a BorderPage,
        stable: VersionSnapshot,
        low_fence: KeySlice,
        high_fence: KeySlice,
    },
}

enum CopyOutcome {
    Done { len: usize, observed: OwnerIdValue },
    TooSmall { required: usize },
    TooShort { stored: usize },
    Retry,
}

impl SliceTree {
    // ------------------------------------------------------------------
    // get family
    // ------------------------------------------------------------------

    /// Copies the whole payload of `key` into `payload` and returns its
    /// length. Registers the record (or the covering range on a miss) in
    /// the read set.
    pub fn get_record(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        payload: &mut [u8],
    ) -> Result<usize> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        loop {
            let found = self.locate(ctx, key)?;
            match self.copy_payload(found.page, found.index, 0, None, payload) {
                CopyOutcome::Done { len, observed } => {
                    ctx.record_read(found.page.owner_id(found.index), observed);
                    return Ok(len);
                }
                CopyOutcome::TooSmall { required } => {
                    return Err(TreeError::TooSmallPayloadBuffer {
                        required,
                        capacity: payload.len(),
                    })
                }
                CopyOutcome::TooShort { .. } => unreachable!("whole-record copy"),
                CopyOutcome::Retry => {}
            }
        }
    }

    /// Copies `out.len()` payload bytes starting at `payload_offset`.
    pub fn get_record_part(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        out: &mut [u8],
        payload_offset: usize,
    ) -> Result<()> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        loop {
            let found = self.locate(ctx, key)?;
            let count = out.len();
            match self.copy_payload(found.page, found.index, payload_offset, Some(count), out) {
                CopyOutcome::Done { observed, .. } => {
                    ctx.record_read(found.page.owner_id(found.index), observed);
                    return Ok(());
                }
                CopyOutcome::TooShort { stored } => {
                    return Err(TreeError::TooShortPayload {
                        offset: payload_offset,
                        count,
                        stored,
                    })
                }
                CopyOutcome::TooSmall { .. } => unreachable!("part copy"),
                CopyOutcome::Retry => {}
            }
        }
    }

    /// Reads exactly `size_of::<P>()` payload bytes at `payload_offset` as
    /// a primitive.
    pub fn get_record_primitive<P: Primitive>(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        payload_offset: usize,
    ) -> Result<P> {
        let mut buf = [0u8; 8];
        self.get_record_part(ctx, key, &mut buf[..P::LEN], payload_offset)?;
        Ok(P::read_le(&buf[..P::LEN]))
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Inserts a new record. `KeyAlreadyExists` registers the existing
    /// record in the read set. An empty payload is a valid record.
    pub fn insert_record(&self, ctx: &mut TxnContext, key: &[u8], payload: &[u8]) -> Result<()> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(TreeError::TooLongPayload {
                length: payload.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }

        let mut root: &DualPointer = self.root();
        let mut remaining: &[u8] = key;
        loop {
            let slice = slice_of(remaining);
            let rem = remaining.len();
            let suffix = suffix_of(remaining);

            let (page, guard) = self.descend_and_latch(root, slice);
            let found = page.find_key_for_reserve(guard.key_count(), slice, suffix, rem);
            match found.kind {
                MatchKind::ExactLocal => {
                    let owner = page.owner_id(found.index);
                    let observed = owner.read();
                    if observed.is_moved() {
                        drop(guard);
                        continue;
                    }
                    if observed.is_deleted() {
                        return self.revive_record(ctx, page, &guard, found.index, payload);
                    }
                    ctx.record_read(owner, observed);
                    drop(guard);
                    return Err(TreeError::KeyAlreadyExists);
                }
                MatchKind::ExactLayer => {
                    let dual = page.next_layer(found.index);
                    drop(guard);
                    root = dual;
                    remaining = &remaining[8..];
                }
                MatchKind::ConflictLocal => {
                    let dual = self.create_next_layer(page, &guard, found.index)?;
                    drop(guard);
                    root = dual;
                    remaining = &remaining[8..];
                }
                MatchKind::NotFound => {
                    let remaining_length = rem as u8;
                    if page.can_accommodate(found.index, remaining_length, payload.len()) {
                        guard.set_inserting_and_increment_key_count();
                        page.reserve_record_space(
                            &guard,
                            found.index,
                            ctx.issue().with_deleted(true),
                            slice,
                            suffix,
                            remaining_length,
                            payload.len(),
                        );
                        page.write_payload(found.index, 0, payload);
                        // take the record lock before the latch drops
                        // publishes the slot, so no racing insert or split
                        // can slip between reserve and commit
                        let owner = page.owner_id(found.index);
                        let reserved = owner.lock();
                        drop(guard);
                        owner.unlock_with(reserved.with_deleted(false));
                        ctx.record_write(owner, payload.len());
                        return Ok(());
                    }
                    self.split_border(page, guard, slice, remaining_length, payload.len())?;
                    // the layer now has room somewhere; re-descend
                }
            }
        }
    }

    /// In-place revival of a logically deleted record by a new insert; the
    /// page latch is held. The new payload must fit the record's data area.
    fn revive_record(
        &self,
        ctx: &mut TxnContext,
        page: &BorderPage,
        _guard: &crate::page::PageVersionGuard<'_>,
        index: usize,
        payload: &[u8],
    ) -> Result<()> {
        let capacity = page.record_area(index) - page.suffix_len(index);
        if payload.len() > capacity {
            return Err(TreeError::TooLongPayload {
                length: payload.len(),
                max: capacity,
            });
        }
        let owner = page.owner_id(index);
        let value = owner.lock();
        // the page latch excludes splits and morphs, so not moved
        debug_assert!(!value.is_moved());
        if !value.is_deleted() {
            // someone revived it first
            owner.unlock_with(value);
            ctx.record_read(owner, value);
            return Err(TreeError::KeyAlreadyExists);
        }
        page.write_payload(index, 0, payload);
        page.set_payload_length(index, payload.len());
        owner.unlock_with(ctx.issue());
        ctx.record_write(owner, payload.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // delete / overwrite / increment
    // ------------------------------------------------------------------

    /// Logical delete: stamps the delete bit under the record lock.
    /// Physical reclamation belongs to external compaction.
    pub fn delete_record(&self, ctx: &mut TxnContext, key: &[u8]) -> Result<()> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        'restart: loop {
            let mut found = self.locate(ctx, key)?;
            loop {
                let owner = found.page.owner_id(found.index);
                let value = owner.lock();
                if value.is_moved() {
                    owner.unlock_with(value);
                    match self.track_moved(found.page, key) {
                        Some(next) => {
                            found = next;
                            continue;
                        }
                        None => continue 'restart,
                    }
                }
                if value.is_deleted() {
                    owner.unlock_with(value);
                    ctx.record_read(owner, value);
                    return Err(TreeError::KeyNotFound);
                }
                owner.unlock_with(ctx.issue().with_deleted(true));
                ctx.record_write(owner, 0);
                return Ok(());
            }
        }
    }

    /// Writes `payload` at `payload_offset` within the stored payload; the
    /// record length never changes.
    pub fn overwrite_record(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        payload: &[u8],
        payload_offset: usize,
    ) -> Result<()> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        'restart: loop {
            let mut found = self.locate(ctx, key)?;
            loop {
                let owner = found.page.owner_id(found.index);
                let value = owner.lock();
                if value.is_moved() {
                    owner.unlock_with(value);
                    match self.track_moved(found.page, key) {
                        Some(next) => {
                            found = next;
                            continue;
                        }
                        None => continue 'restart,
                    }
                }
                if value.is_deleted() {
                    owner.unlock_with(value);
                    continue 'restart;
                }
                let stored = found.page.payload_length(found.index);
                if payload_offset + payload.len() > stored {
                    owner.unlock_with(value);
                    return Err(TreeError::TooShortPayload {
                        offset: payload_offset,
                        count: payload.len(),
                        stored,
                    });
                }
                found.page.write_payload(found.index, payload_offset, payload);
                owner.unlock_with(ctx.issue());
                ctx.record_write(owner, payload.len());
                return Ok(());
            }
        }
    }

    /// Writes a primitive at `payload_offset`.
    pub fn overwrite_record_primitive<P: Primitive>(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        value: P,
        payload_offset: usize,
    ) -> Result<()> {
        let mut buf = [0u8; 8];
        value.write_le(&mut buf[..P::LEN]);
        self.overwrite_record(ctx, key, &buf[..P::LEN], payload_offset)
    }

    /// Adds `delta` to the primitive at `payload_offset` under the record
    /// lock and returns the post-image.
    pub fn increment_record<P: Primitive>(
        &self,
        ctx: &mut TxnContext,
        key: &[u8],
        delta: P,
        payload_offset: usize,
    ) -> Result<P> {
        assert!(key_length_ok(key), "key must be 1..=254 bytes");
        'restart: loop {
            let mut found = self.locate(ctx, key)?;
            loop {
                let owner = found.page.owner_id(found.index);
                let value = owner.lock();
                if value.is_moved() {
                    owner.unlock_with(value);
                    match self.track_moved(found.page, key) {
                        Some(next) => {
                            found = next;
                            continue;
                        }
                        None => continue 'restart,
                    }
                }
                if value.is_deleted() {
                    owner.unlock_with(value);
                    continue 'restart;
                }
                let stored = found.page.payload_length(found.index);
                if payload_offset + P::LEN > stored {
                    owner.unlock_with(value);
                    return Err(TreeError::TooShortPayload {
                        offset: payload_offset,
                        count: P::LEN,
                        stored,
                    });
                }
                let mut buf = [0u8; 8];
                found
                    .page
                    .read_payload(found.index, payload_offset, &mut buf[..P::LEN]);
                let next = P::read_le(&buf[..P::LEN]).add(delta);
                next.write_le(&mut buf[..P::LEN]);
                found.page.write_payload(found.index, payload_offset, &buf[..P::LEN]);
                owner.unlock_with(ctx.issue());
                ctx.record_write(owner, P::LEN);
                return Ok(next);
            }
        }
    }

    // ------------------------------------------------------------------
    // normalized family: keys of exactly one slice
    // ------------------------------------------------------------------

    /// Whole-payload read for a one-slice key.
    pub fn get_record_normalized(
        &self,
        ctx: &mut TxnContext,
        key: KeySlice,
        payload: &mut [u8],
    ) -> Result<usize> {
        loop {
            let found = self.locate_normalized(ctx, key)?;
            match self.copy_payload(found.page, found.index, 0, None, payload) {
                CopyOutcome::Done { len, observed } => {
                    ctx.record_read(found.page.owner_id(found.index), observed);
                    return Ok(len);
                }
                CopyOutcome::TooSmall { required } => {
                    return Err(TreeError::TooSmallPayloadBuffer {
                        required,
                        capacity: payload.len(),
                    })
                }
                CopyOutcome::TooShort { .. } => unreachable!("whole-record copy"),
                CopyOutcome::Retry => {}
            }
        }
    }

    /// Part read for a one-slice key.
    pub fn get_record_part_normalized(
        &self,
        ctx: &mut TxnContext,
        key: KeySlice,
        out: &mut [u8],
        payload_offset: usize,
    ) -> Result<()> {
        loop {
            let found = self.locate_normalized(ctx, key)?;
            let count = out.len();
            match self.copy_payload(found.page, found.index, payload_offset, Some(count), out) {
                CopyOutcome::Done { observed, .. } => {
                    ctx.record_read(found.page.owner_id(found.index), observed);
                    return Ok(());
                }
                CopyOutcome::TooShort { stored } => {
                    return Err(TreeError::TooShortPayload {
                        offset: payload_offset,
                        count,
                        stored,
                    })
                }
                CopyOutcome::TooSmall { .. } => unreachable!("part copy"),
                CopyOutcome::Retry => {}
            }
        }
    }

    pub fn insert_record_normalized(
        &self,
        ctx: &mut TxnContext,
        key: KeySlice,
        payload: &[u8],
    ) -> Result<()> {
        self.insert_record(ctx, &slice_bytes(key), payload)
    }

    pub fn delete_record_normalized(&self, ctx: &mut TxnContext, key: KeySlice) -> Result<()> {
        self.delete_record(ctx, &slice_bytes(key))
    }

    pub fn overwrite_record_normalized(
        &self,
        ctx: &mut TxnContext,
        key: KeySlice,
        payload: &[u8],
        payload_offset: usize,
    ) -> Result<()> {
        self.overwrite_record(ctx, &slice_bytes(key), payload, payload_offset)
    }

    pub fn increment_record_normalized<P: Primitive>(
        &self,
        ctx: &mut TxnContext,
        key: KeySlice,
        delta: P,
        payload_offset: usize,
    ) -> Result<P> {
        self.increment_record(ctx, &slice_bytes(key), delta, payload_offset)
    }

    // ------------------------------------------------------------------
    // probes
    // ------------------------------------------------------------------

    /// Layered latch-free walk to the slot for `key`, looping until a
    /// version-consistent answer. Hits include logically deleted records;
    /// relocated (moved) records are chased by re-descending.
    pub(crate) fn probe(&self, key: &[u8]) -> Probe<'_> {
        let mut root: &DualPointer = self.root();
        let mut remaining: &[u8] = key;
        'layer: loop {
            let slice = slice_of(remaining);
            let rem = remaining.len();
            let suffix = suffix_of(remaining);
            loop {
                let target = self.descend_to_border(root, slice);
                let page = target.page;
                let stable = target.stable;
                match page.find_key(stable, slice, suffix, rem) {
                    Some(index) if rem > 8 && page.does_point_to_layer(index) => {
                        let dual = page.next_layer(index);
                        if page.common().version.changed_from(stable) {
                            continue;
                        }
                        root = dual;
                        remaining = &remaining[8..];
                        continue 'layer;
                    }
                    Some(index) => {
                        let observed = page.owner_id(index).read();
                        if page.common().version.changed_from(stable) {
                            continue;
                        }
                        if observed.is_moved() {
                            // relocated by a split; the re-walk routes to
                            // the record's new page
                            continue;
                        }
                        return Probe::Hit(FoundSlot {
                            page,
                            index,
                            observed,
                        });
                    }
                    None => {
                        let low_fence = page.common().low_fence();
                        let high_fence = page.common().high_fence();
                        if page.common().version.changed_from(stable) {
                            continue;
                        }
                        return Probe::Miss {
                            page,
                            stable,
                            low_fence,
                            high_fence,
                        };
                    }
                }
            }
        }
    }

    /// One-slice probe: no suffixes, no layer descent.
    pub(crate) fn probe_normalized(&self, key: KeySlice) -> Probe<'_> {
        loop {
            let target = self.descend_to_border(self.root(), key);
            let page = target.page;
            let stable = target.stable;
            match page.find_key_normalized(stable, key) {
                Some(index) => {
                    let observed = page.owner_id(index).read();
                    if page.common().version.changed_from(stable) {
                        continue;
                    }
                    if observed.is_moved() {
                        continue;
                    }
                    return Probe::Hit(FoundSlot {
                        page,
                        index,
                        observed,
                    });
                }
                None => {
                    let low_fence = page.common().low_fence();
                    let high_fence = page.common().high_fence();
                    if page.common().version.changed_from(stable) {
                        continue;
                    }
                    return Probe::Miss {
                        page,
                        stable,
                        low_fence,
                        high_fence,
                    };
                }
            }
        }
    }

    /// Re-locates a record observed with the moved bit, without a full
    /// layered re-descent: climb from the record's old page back inside a
    /// claim that covers its slice, walk down to the border page that took
    /// the range over, and find the record there, chasing further hops if
    /// it moved again. Returns `None` when the slot was morphed into a
    /// next-layer pointer (its interpretation changed) or the structure is
    /// mid-modification; the caller then restarts from the layer roots.
    pub(crate) fn track_moved<'t>(
        &'t self,
        from: &'t BorderPage,
        key: &[u8],
    ) -> Option<FoundSlot<'t>> {
        let remaining = key.get(8 * from.common().layer() as usize..)?;
        let slice = slice_of(remaining);
        let suffix = suffix_of(remaining);
        let rem = remaining.len();

        let mut cur: *const u8 = (from as *const BorderPage).cast();
        for _ in 0..TRACK_MOVED_HOP_LIMIT {
            // climb until a claim covers the slice again
            let mut common = unsafe { page_common(cur) };
            while !common.within_fences(slice) {
                let parent = common.in_layer_parent();
                if parent.is_null() {
                    return None;
                }
                cur = self.pool().resolve(parent) as *const u8;
                common = unsafe { page_common(cur) };
            }
            let Some(target) = self.walk_down(cur, slice) else {
                // a racing split shifted the range mid-walk; climb again
                continue;
            };
            let page = target.page;
            let stable = target.stable;
            match page.find_key(stable, slice, suffix, rem) {
                Some(index) if rem > 8 && page.does_point_to_layer(index) => {
                    return None;
                }
                Some(index) => {
                    let observed = page.owner_id(index).read();
                    if page.common().version.changed_from(stable) || observed.is_moved() {
                        // relocated again; chase from the newer page
                        cur = (page as *const BorderPage).cast();
                        continue;
                    }
                    return Some(FoundSlot {
                        page,
                        index,
                        observed,
                    });
                }
                None => {
                    if page.common().version.changed_from(stable) {
                        cur = (page as *const BorderPage).cast();
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }

    /// Probe plus transactional bookkeeping: a miss registers a range read
    /// over the covering fences, a deleted hit registers the record read;
    /// both surface as `KeyNotFound`.
    fn locate(&self, ctx: &mut TxnContext, key: &[u8]) -> Result<FoundSlot<'_>> {
        match self.probe(key) {
            Probe::Hit(found) if found.observed.is_deleted() => {
                ctx.record_read(found.page.owner_id(found.index), found.observed);
                Err(TreeError::KeyNotFound)
            }
            Probe::Hit(found) => Ok(found),
            Probe::Miss {
                page,
                stable,
                low_fence,
                high_fence,
            } => {
                ctx.record_range(page.common().header.self_ptr(), low_fence, high_fence, stable);
                Err(TreeError::KeyNotFound)
            }
        }
    }

    fn locate_normalized(&self, ctx: &mut TxnContext, key: KeySlice) -> Result<FoundSlot<'_>> {
        match self.probe_normalized(key) {
            Probe::Hit(found) if found.observed.is_deleted() => {
                ctx.record_read(found.page.owner_id(found.index), found.observed);
                Err(TreeError::KeyNotFound)
            }
            Probe::Hit(found) => Ok(found),
            Probe::Miss {
                page,
                stable,
                low_fence,
                high_fence,
            } => {
                ctx.record_range(page.common().header.self_ptr(), low_fence, high_fence, stable);
                Err(TreeError::KeyNotFound)
            }
        }
    }

    /// Copies payload bytes bracketed by owner-id reads. `count` of `None`
    /// means the whole record. Contract outcomes are only reported when the
    /// bracketing validated.
    fn copy_payload(
        &self,
        page: &BorderPage,
        index: usize,
        offset: usize,
        count: Option<usize>,
        out: &mut [u8],
    ) -> CopyOutcome {
        loop {
            let before = page.owner_id(index).read();
            if before.is_moved() || before.is_deleted() {
                return CopyOutcome::Retry;
            }
            let stored = page.payload_length(index);
            let (copy_len, verdict) = match count {
                None if stored > out.len() => (0, Some(CopyOutcome::TooSmall { required: stored })),
                None => (stored, None),
                Some(c) if offset + c > stored => (0, Some(CopyOutcome::TooShort { stored })),
                Some(c) => (c, None),
            };
            if copy_len > 0 {
                page.read_payload(index, offset, &mut out[..copy_len]);
            }
            let after = page.owner_id(index).read();
            if before != after {
                continue;
            }
            return match verdict {
                Some(outcome) => outcome,
                None => CopyOutcome::Done {
                    len: copy_len,
                    observed: before,
                },
            };
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width payload primitives stored little-endian. The trait is sealed
/// over the built-in integers and floats.
pub trait Primitive: sealed::Sealed + Copy {
    const LEN: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
    fn add(self, other: Self) -> Self;
}

macro_rules! impl_primitive_int {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            const LEN: usize = std::mem::size_of::<$t>();
            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().expect("primitive length"))
            }
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
        }
    )*};
}

macro_rules! impl_primitive_float {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            const LEN: usize = std::mem::size_of::<$t>();
            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().expect("primitive length"))
            }
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
            fn add(self, other: Self) -> Self {
                self + other
            }
        }
    )*};
}

impl_primitive_int!(u8, u16, u32, u64, i8, i16, i32, i64);
impl_primitive_float!(f32, f64);
