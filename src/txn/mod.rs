//! # Record Ownership and Transaction Context
//!
//! Every border slot carries a 64-bit *owner id*: the record-granularity
//! concurrency word owned by the transaction layer. The tree core never
//! interprets the timestamp portion; it only manipulates the three control
//! bits and hands observations to the caller's read/write sets.
//!
//! ## Owner Id Layout
//!
//! ```text
//! bit 63   LOCK     a writer holds the record
//! bit 62   DELETE   the record is logically absent
//! bit 61   MOVED    a structural modification relocated the record;
//!                   observers must re-navigate from the layer root
//! bits 0..61        transaction timestamp (opaque to the core)
//! ```
//!
//! ## Lock Protocol
//!
//! Record mutators (delete, overwrite, increment, insert commit, next-layer
//! morph, split relocation) spin the LOCK bit with a CAS and release it with
//! a single Release store that may also flip DELETE or MOVED. Readers never
//! lock: they read the word, copy the payload, and read the word again; an
//! unchanged word proves the copy is a consistent snapshot.
//!
//! A record is *born deleted*: insert reserves the slot with DELETE set,
//! writes the payload, and only then clears DELETE. A concurrent reader sees
//! the in-progress insert either as "not yet counted" or as "counted but
//! deleted", never as a half-written payload.
//!
//! ## Transaction Context
//!
//! [`TxnContext`] is the per-worker face of the transaction layer: it
//! issues owner ids and accumulates point reads (owner-id observations),
//! range reads (fence spans with the page version that covered a miss),
//! and write reservations. Validation of those sets is the caller's
//! business.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::KeySlice;
use crate::page::{VersionSnapshot, VolatilePointer};

const LOCK: u64 = 1 << 63;
const DELETE: u64 = 1 << 62;
const MOVED: u64 = 1 << 61;
const TIMESTAMP_MASK: u64 = MOVED - 1;

/// A copied owner-id word with the lock bit stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIdValue(u64);

impl OwnerIdValue {
    pub fn new(timestamp: u64) -> Self {
        OwnerIdValue(timestamp & TIMESTAMP_MASK)
    }

    #[inline]
    pub fn is_deleted(self) -> bool {
        self.0 & DELETE != 0
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        self.0 & MOVED != 0
    }

    #[inline]
    pub fn timestamp(self) -> u64 {
        self.0 & TIMESTAMP_MASK
    }

    #[must_use]
    pub fn with_deleted(self, deleted: bool) -> Self {
        if deleted {
            OwnerIdValue(self.0 | DELETE)
        } else {
            OwnerIdValue(self.0 & !DELETE)
        }
    }

    #[must_use]
    pub fn with_moved(self) -> Self {
        OwnerIdValue(self.0 | MOVED)
    }

    #[must_use]
    pub fn without_moved(self) -> Self {
        OwnerIdValue(self.0 & !MOVED)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// The in-page atomic owner-id word.
#[repr(transparent)]
pub struct OwnerId(AtomicU64);

const _: () = assert!(std::mem::size_of::<OwnerId>() == 8);

impl OwnerId {
    /// Writes the word of a record still private to the installing thread.
    pub fn init(&self, value: OwnerIdValue) {
        self.0.store(value.0, Ordering::Release);
    }

    /// Reads the word, spinning past a held record lock so the returned
    /// value is always a committed state.
    #[inline]
    pub fn read(&self) -> OwnerIdValue {
        loop {
            let word = self.0.load(Ordering::Acquire);
            if word & LOCK == 0 {
                return OwnerIdValue(word);
            }
            std::hint::spin_loop();
        }
    }

    /// Acquires the record lock; returns the pre-lock value.
    pub fn lock(&self) -> OwnerIdValue {
        loop {
            let word = self.0.load(Ordering::Relaxed);
            if word & LOCK == 0
                && self
                    .0
                    .compare_exchange_weak(word, word | LOCK, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return OwnerIdValue(word);
            }
            std::hint::spin_loop();
        }
    }

    /// Releases the record lock, publishing `value` (lock bit cleared).
    pub fn unlock_with(&self, value: OwnerIdValue) {
        debug_assert!(self.0.load(Ordering::Relaxed) & LOCK != 0);
        self.0.store(value.0 & !LOCK, Ordering::Release);
    }

    /// Address used for read/write-set registration.
    #[inline]
    pub fn address(&self) -> usize {
        self as *const OwnerId as usize
    }
}

/// A point read: the owner id observed at an address.
#[derive(Debug, Clone, Copy)]
pub struct ReadAccess {
    pub owner_address: usize,
    pub observed: OwnerIdValue,
}

/// A range read: a key was not found under this fence span at this page
/// version; a later conflicting insert into the span invalidates it.
#[derive(Debug, Clone, Copy)]
pub struct RangeAccess {
    pub page: VolatilePointer,
    pub low_fence: KeySlice,
    pub high_fence: KeySlice,
    pub observed: VersionSnapshot,
}

/// A write reservation: the record this transaction intends to own.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    pub owner_address: usize,
    pub payload_length: usize,
}

/// Per-worker transaction context: owner-id supplier and read/write-set
/// sink.
pub struct TxnContext {
    timestamp: u64,
    reads: Vec<ReadAccess>,
    ranges: Vec<RangeAccess>,
    writes: Vec<WriteAccess>,
}

impl TxnContext {
    pub fn new(timestamp: u64) -> Self {
        TxnContext {
            timestamp: timestamp & TIMESTAMP_MASK,
            reads: Vec::new(),
            ranges: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Issues a fresh owner id for a record this transaction installs or
    /// commits. Each issue is distinct, so any committed mutation is
    /// observable through the owner word alone.
    pub fn issue(&mut self) -> OwnerIdValue {
        let value = OwnerIdValue::new(self.timestamp);
        self.timestamp = (self.timestamp + 1) & TIMESTAMP_MASK;
        value
    }

    pub fn record_read(&mut self, owner: &OwnerId, observed: OwnerIdValue) {
        self.reads.push(ReadAccess {
            owner_address: owner.address(),
            observed,
        });
    }

    pub fn record_range(
        &mut self,
        page: VolatilePointer,
        low_fence: KeySlice,
        high_fence: KeySlice,
        observed: VersionSnapshot,
    ) {
        self.ranges.push(RangeAccess {
            page,
            low_fence,
            high_fence,
            observed,
        });
    }

    pub fn record_write(&mut self, owner: &OwnerId, payload_length: usize) {
        self.writes.push(WriteAccess {
            owner_address: owner.address(),
            payload_length,
        });
    }

    pub fn read_set(&self) -> &[ReadAccess] {
        &self.reads
    }

    pub fn range_reads(&self) -> &[RangeAccess] {
        &self.ranges
    }

    pub fn write_set(&self) -> &[WriteAccess] {
        &self.writes
    }

    /// Forgets all accumulated accesses; the context can be reused for the
    /// next transaction.
    pub fn reset(&mut self, timestamp: u64) {
        self.timestamp = timestamp & TIMESTAMP_MASK;
        self.reads.clear();
        self.ranges.clear();
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(value: OwnerIdValue) -> OwnerId {
        let o = OwnerId(AtomicU64::new(0));
        o.init(value);
        o
    }

    #[test]
    fn born_deleted_then_committed() {
        let o = owner(OwnerIdValue::new(42).with_deleted(true));
        assert!(o.read().is_deleted());

        let v = o.lock();
        o.unlock_with(v.with_deleted(false));
        let v = o.read();
        assert!(!v.is_deleted());
        assert_eq!(v.timestamp(), 42);
    }

    #[test]
    fn moved_bit_survives_unlock() {
        let o = owner(OwnerIdValue::new(9));
        let v = o.lock();
        o.unlock_with(v.with_moved());
        assert!(o.read().is_moved());
    }

    #[test]
    fn lock_excludes_second_locker() {
        use std::sync::Arc;
        let o = Arc::new(owner(OwnerIdValue::new(1)));
        let v = o.lock();
        let o2 = Arc::clone(&o);
        let t = std::thread::spawn(move || {
            let v = o2.lock();
            o2.unlock_with(v.with_deleted(true));
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        o.unlock_with(v);
        t.join().unwrap();
        assert!(o.read().is_deleted());
    }

    #[test]
    fn context_accumulates_accesses() {
        let o = owner(OwnerIdValue::new(5));
        let mut ctx = TxnContext::new(77);
        ctx.record_read(&o, o.read());
        ctx.record_write(&o, 16);
        ctx.record_range(VolatilePointer::NULL, 0, u64::MAX, VersionSnapshot::from_raw(0));
        assert_eq!(ctx.read_set().len(), 1);
        assert_eq!(ctx.write_set().len(), 1);
        assert_eq!(ctx.range_reads().len(), 1);
        assert_eq!(ctx.read_set()[0].owner_address, o.address());

        ctx.reset(78);
        assert!(ctx.read_set().is_empty());
        assert_eq!(ctx.issue().timestamp(), 78);
        // issued ids are distinct
        assert_eq!(ctx.issue().timestamp(), 79);
    }

    #[test]
    fn timestamp_excludes_control_bits() {
        let v = OwnerIdValue::new(u64::MAX);
        assert!(!v.is_deleted());
        assert!(!v.is_moved());
        assert_eq!(v.timestamp(), TIMESTAMP_MASK);
    }
}
