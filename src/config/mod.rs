//! # Layout and Fan-Out Constants
//!
//! This module centralizes the constants that define the page format and the
//! tree fan-out. Most of them are not independently tunable: the border page
//! slot arrays plus the data region must sum to exactly one page, and the
//! intermediate page's mini-page grid must tile the page body. Constants that
//! depend on each other are co-located and tied together with compile-time
//! assertions so a mismatch fails the build, not a test run.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed)
//!       │
//!       ├─> PAGE_COMMON_SIZE (64 bytes: header + fences + parent + version)
//!       │
//!       ├─> BORDER_HEADER_SIZE (1344 bytes: common + five slot arrays)
//!       │     │
//!       │     └─> BORDER_DATA_SIZE (derived: PAGE_SIZE - BORDER_HEADER_SIZE)
//!       │           Records are 16-byte aligned, so offsets fit in a u8
//!       │           (2752 / 16 = 172 < 256).
//!       │
//!       └─> MINI_PAGE_SIZE (384 bytes)
//!             10 mini-pages + separators + reserved fill the body exactly:
//!             64 + 72 + 120 + 10*384 = 4096.
//!
//! BORDER_MAX_KEYS (64)
//!       │
//!       └─> Sizes every parallel slot array in the border page.
//!
//! MAX_SEPARATORS (9) and MAX_MINI_SEPARATORS (15)
//!       │
//!       └─> MAX_INTERMEDIATE_POINTERS = (9+1) * (15+1) = 160:
//!           10 mini-pages of 16 pointers each.
//!
//! MAX_KEY_LENGTH (254) and NEXT_LAYER_SENTINEL (255)
//!       │
//!       └─> The remaining-length byte must encode 0..=254 plus the
//!           next-layer sentinel; 255 is reserved for it.
//! ```

/// Size of every page in bytes. The volatile page pool hands out frames of
/// exactly this size, 4096-aligned.
pub const PAGE_SIZE: usize = 4096;

/// Size of the common page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Size of the prefix shared by both page variants: header, low/high fence,
/// in-layer parent, version word.
pub const PAGE_COMMON_SIZE: usize = PAGE_HEADER_SIZE + 8 + 8 + 8 + 8;

/// Maximum number of record slots in a border page.
pub const BORDER_MAX_KEYS: usize = 64;

/// Byte size of the border page fixed area: the common prefix plus the five
/// parallel slot arrays (remaining length, slice, offset, payload length,
/// owner id).
pub const BORDER_HEADER_SIZE: usize =
    PAGE_COMMON_SIZE + BORDER_MAX_KEYS * (1 + 8 + 1 + 2 + 8);

/// Byte size of the border page tail data region, which grows downward and
/// holds (suffix, payload) pairs or 16-byte next-layer dual pointers.
pub const BORDER_DATA_SIZE: usize = PAGE_SIZE - BORDER_HEADER_SIZE;

/// Record alignment in the data region. Every record is padded to this so a
/// record can later be morphed into a 16-byte next-layer dual pointer in
/// place.
pub const RECORD_ALIGN: usize = 16;

/// Maximum number of separators in an intermediate page (one fewer than its
/// mini-page count).
pub const MAX_SEPARATORS: usize = 9;

/// Number of mini-pages in an intermediate page.
pub const MINI_PAGES: usize = MAX_SEPARATORS + 1;

/// Maximum number of separators in one mini-page (one fewer than its pointer
/// count).
pub const MAX_MINI_SEPARATORS: usize = 15;

/// Pointers per mini-page.
pub const MINI_POINTERS: usize = MAX_MINI_SEPARATORS + 1;

/// Byte size of one mini-page: version word + 15 separators + 16 dual
/// pointers (16 bytes each).
pub const MINI_PAGE_SIZE: usize = 8 + MAX_MINI_SEPARATORS * 8 + MINI_POINTERS * 16;

/// Total children an intermediate page can address.
pub const MAX_INTERMEDIATE_POINTERS: usize = MINI_PAGES * MINI_POINTERS;

/// Maximum key length in bytes at one layer, including the 8 slice bytes.
/// The remaining-length byte stores 0..=254; 255 is the next-layer sentinel.
pub const MAX_KEY_LENGTH: usize = 254;

/// Remaining-length value marking a slot as a next-layer pointer.
pub const NEXT_LAYER_SENTINEL: u8 = 255;

/// Maximum payload length accepted by insert. A record of a maximal key must
/// still fit the data region of an otherwise empty border page.
pub const MAX_PAYLOAD_LENGTH: usize = 2048;

const _: () = assert!(PAGE_COMMON_SIZE == 64, "common page prefix layout drifted");

const _: () = assert!(
    BORDER_HEADER_SIZE == 1344,
    "border slot arrays no longer match the fixed area"
);

const _: () = assert!(
    BORDER_DATA_SIZE == 2752 && BORDER_DATA_SIZE % RECORD_ALIGN == 0,
    "border data region must be a whole number of 16-byte units"
);

const _: () = assert!(
    BORDER_DATA_SIZE / RECORD_ALIGN <= u8::MAX as usize,
    "record offsets are stored in one byte as 16-byte units"
);

const _: () = assert!(MINI_PAGE_SIZE == 384, "mini-page layout drifted");

const _: () = assert!(
    PAGE_COMMON_SIZE + MAX_SEPARATORS * 8 + 120 + MINI_PAGES * MINI_PAGE_SIZE == PAGE_SIZE,
    "intermediate page body must tile the page exactly"
);

const _: () = assert!(MAX_INTERMEDIATE_POINTERS == 160, "fan-out is 160 children");

const _: () = assert!(
    MAX_KEY_LENGTH + MAX_PAYLOAD_LENGTH < u16::MAX as usize,
    "record sizes are computed in u16"
);

const _: () = assert!(
    (MAX_KEY_LENGTH - 8) + MAX_PAYLOAD_LENGTH + RECORD_ALIGN <= BORDER_DATA_SIZE,
    "a maximal record must fit an empty border page"
);
