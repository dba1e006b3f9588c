//! # slicetree: a concurrent trie of B+trees
//!
//! `slicetree` is a Masstree-style ordered index for arbitrary byte-string
//! keys: the in-memory, volatile layer of a transactional key-value store.
//! Keys are indexed eight bytes at a time; each 8-byte *slice* is ordered
//! in a B+tree of 4096-byte pages, and keys that collide on a whole slice
//! continue in a deeper *layer*: a B+tree of its own hanging off a leaf
//! slot. Readers never take a latch: they snapshot per-page version words,
//! read, re-validate, and retry. Writers latch exactly the pages they
//! change.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use slicetree::{PagePool, SliceTree, TxnContext};
//!
//! let pool = Arc::new(PagePool::new(1024));
//! let tree = SliceTree::create(pool).unwrap();
//! let mut ctx = TxnContext::new(1);
//!
//! tree.insert_record(&mut ctx, b"apple", b"A").unwrap();
//! let mut buf = [0u8; 16];
//! let len = tree.get_record(&mut ctx, b"apple", &mut buf).unwrap();
//! assert_eq!(&buf[..len], b"A");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   Storage API (get/insert/delete/...)     │  tree::ops
//! ├───────────────────────────────────────────┤
//! │   Descent cursor │ Structural mods (SMO)  │  tree::cursor, tree::split
//! ├──────────────────┼────────────────────────┤
//! │   Border engine  │  Intermediate engine   │  page::border, page::intermediate
//! ├───────────────────────────────────────────┤
//! │  Version protocol │ Owner ids │ Pointers  │  page::version, txn, page::pointer
//! ├───────────────────────────────────────────┤
//! │   Volatile page pool (4 KiB frames)       │  memory
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! - **Readers** are latch-free. Every page (and every mini-page of an
//!   inner page) has a 64-bit version word; readers wait for a stable
//!   snapshot, do their reads, and re-read the word. Distinct counter
//!   strides for insert commits and split commits tell a reader whether to
//!   retry the page or back out to the layer root.
//! - **Record state** lives in a per-slot 64-bit owner id with lock,
//!   delete, and moved bits. Payload copies are bracketed by owner-id
//!   reads; structural moves leave the moved bit behind so observers
//!   re-navigate.
//! - **Writers** latch one border page for a plain insert; structural
//!   modifications latch strictly upward (record, page, parent, owning
//!   page of the layer), which rules out deadlock.
//!
//! The transaction layer above supplies owner-id timestamps and consumes
//! read-set/range-read/write-set registrations through [`TxnContext`];
//! durability, snapshots, and epoch-based page reclamation are external
//! collaborators behind [`memory::SnapshotPageResolver`] and
//! [`memory::ReleaseBatch`].

pub mod config;
pub mod error;
pub mod key;
pub mod memory;
pub mod page;
pub mod tree;
pub mod txn;

pub use error::{Result, TreeError};
pub use key::KeySlice;
pub use memory::{NullSnapshotResolver, PagePool, ReleaseBatch, SnapshotPageResolver};
pub use tree::{Primitive, SliceTree, VerifyStats};
pub use txn::{OwnerIdValue, TxnContext};
