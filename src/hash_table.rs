//! A Robin Hood hash table with bucket-offset metadata.
//!
//! Classic Robin Hood tables store, for every occupied slot, the distance of
//! that slot from the entry's home bucket, and insertion compares probe
//! distances step by step to decide who moves. This table inverts the
//! bookkeeping: the metadata array is indexed by *home bucket*, and each byte
//! stores the offset from the bucket to the first entry that bucket owns. All
//! entries with the same home bucket sit in one contiguous run, runs of
//! consecutive buckets are laid out back to back with no gaps, and the pair
//! of reads `info[b]` / `info[b + 1]` yields the exact half-open range
//! `[b + offset(b), b + 1 + offset(b + 1))` of bucket `b`'s entries. Lookup
//! is two metadata reads plus a linear key scan of the run; no probing, no
//! distance comparisons.
//!
//! Insertion exploits the fact that every run in a displacement cluster
//! shares monotone offsets: placing an entry shifts each covered bucket by
//! exactly one, so a single forward scan to the first physically empty slot
//! (incrementing the traversed offsets) followed by one `memmove` of the
//! covered entries completes the insert. Erase is the mirror image: one
//! backward shift and a range of decrements.
//!
//! ## Design
//!
//! The offset field is 7 bits wide, so an entry can sit at most 126 slots
//! past its home bucket. The forward scan checks offsets before writing
//! them; the first offset that would reach 127 aborts the insert with
//! [`BucketId::INSERT_FAILED`] and the caller resizes and retries. This caps
//! the worst-case scan at 127 metadata bytes (two cache lines, typically)
//! and keeps the whole metadata array at one byte per slot.
//!
//! Both arrays carry `PADDING = 128` slots past the last bucket. The padding
//! lets `info[B]` be read unconditionally in the hot loops, gives runs near
//! the end of the table room to spill without wrapping, and means the
//! forward scan always terminates at a physically empty slot before the
//! allocation ends. Padding metadata participates in the offset arithmetic
//! (an empty padding slot covered by a run carries the distance to the run's
//! end) and is maintained by insert, erase, and both resize paths.
//!
//! Sizes are always powers of two so home buckets come from masking the low
//! hash bits. The estimator in [`crate::cardinality`] consumes the *high*
//! bits, which keeps the two uncorrelated.
//!
//! All data lives in one contiguous type-erased allocation, `[ info |
//! entries ]`, described by a `DataLayout`. Keys and values are required to
//! be `Copy`: entry shifts are raw `memmove`s and nothing is ever dropped on
//! the hot path.
//!
//! Batch operations drive a software prefetch pipeline with a sliding
//! window of depth `LOOK_AHEAD`. At element `i` the driver prefetches the
//! hash and input two windows out, the home bucket's metadata two windows
//! out, and the bucket's entry range one window out, so by the time the
//! per-element operation runs its metadata and entries are already in
//! cache. Batch insertion additionally splits the stream at every
//! `max_load` boundary and rehashes between stretches, so the per-element
//! path never checks the load factor. Correctness never depends on
//! prefetching; on non-x86 targets the prefetch is a no-op.
//!
//! [`HashTable<K, V>`] is a low-level structure: every operation takes the
//! key's hash (and, where it may resize, a rehash function) plus an equality
//! predicate. Prefer [`HashMap<K, V>`] unless you are building your own
//! keyed wrapper.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following invariants, which hold after
//! every completed public operation:
//!
//! 1. **Geometry**: `buckets` is a power of two, `mask = buckets - 1`, and
//!    both arrays have `buckets + PADDING` slots.
//! 2. **Runs**: bucket `b` owns exactly the positions
//!    `[b + offset(info[b]), b + 1 + offset(info[b + 1]))`; an empty bucket
//!    owns zero positions but its range start is still defined.
//! 3. **Offsets**: `offset(info[b + 1]) >= offset(info[b]) - 1`, and no
//!    offset exceeds 126.
//! 4. **Physical occupancy**: a slot is initialized if and only if its info
//!    byte differs from `INFO_EMPTY` (`0x80` exactly). Covered slots of
//!    later buckets carry their owner's spill as an offset on an
//!    empty-flagged byte, which is why the equality test against
//!    `INFO_EMPTY` — not the empty bit alone — decides occupancy.
//! 5. **Size**: `lsize` equals the number of occupied buckets, which equals
//!    the number of initialized slots.
//!
//! [`HashMap<K, V>`]: crate::hash_map::HashMap

use alloc::alloc::handle_alloc_error;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::fmt::Debug;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use cfg_if::cfg_if;

use crate::reduce::Reducer;

cfg_if! {
    if #[cfg(feature = "lookahead-eight")] {
        const LOOK_AHEAD: usize = 8;
    } else {
        const LOOK_AHEAD: usize = 16;
    }
}

/// Info byte for an empty bucket with offset zero. The high bit is the
/// empty flag; a byte equal to this value exactly marks a physically empty
/// slot.
const INFO_EMPTY: u8 = 0x80;

/// Low seven bits of an info byte: the offset from a bucket to the start of
/// its run.
const OFFSET_MASK: u8 = 0x7F;

/// Largest representable offset. 127 is reserved as the overflow signal, so
/// any increment that would produce it aborts the insert instead.
const MAX_OFFSET: usize = 126;

/// Slots allocated past the last bucket. Must exceed `MAX_OFFSET + 1` so
/// that `info[buckets]` is always readable and a maximal run starting at the
/// last bucket fits without wrapping.
const PADDING: usize = 128;

const DEFAULT_CAPACITY: usize = 128;
const DEFAULT_MIN_LOAD_FACTOR: f64 = 0.4;
const DEFAULT_MAX_LOAD_FACTOR: f64 = 0.9;

#[inline(always)]
fn is_empty_info(m: u8) -> bool {
    m >= INFO_EMPTY
}

#[inline(always)]
fn is_occupied_info(m: u8) -> bool {
    m < INFO_EMPTY
}

#[inline(always)]
fn set_occupied(m: &mut u8) {
    *m &= OFFSET_MASK;
}

#[inline(always)]
fn set_empty(m: &mut u8) {
    *m |= INFO_EMPTY;
}

#[inline(always)]
fn get_offset(m: u8) -> usize {
    (m & OFFSET_MASK) as usize
}

/// Prefetches data into the cache.
///
/// # Safety
///
/// The caller must ensure that `ptr` points to a memory location that is
/// safe to read from. While `_mm_prefetch` might not fault on invalid
/// addresses, the behavior is undefined if the address is not valid for
/// reads.
#[inline(always)]
unsafe fn prefetch<T>(ptr: *const T) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    // SAFETY: The caller guarantees `ptr` is valid for reads.
    unsafe {
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = ptr;
}

/// A per-slot operation result packed into one machine word.
///
/// The low 63 bits hold a position in the slot array; bit 63 is set when
/// the key was found at that position. [`BucketId::INSERT_FAILED`] is the
/// reserved all-ones-position value signalling that an insert exhausted the
/// 7-bit offset and the table must be resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketId(u64);

const BID_POS_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;
const BID_EXISTS: u64 = 1 << 63;

impl BucketId {
    /// Sentinel returned by insertion when the 7-bit offset would overflow.
    pub const INSERT_FAILED: BucketId = BucketId(BID_POS_MASK);

    #[inline(always)]
    fn found(pos: usize) -> Self {
        debug_assert!((pos as u64) < BID_EXISTS);
        BucketId(pos as u64 | BID_EXISTS)
    }

    #[inline(always)]
    fn missing(pos: usize) -> Self {
        debug_assert!((pos as u64) < BID_POS_MASK);
        BucketId(pos as u64)
    }

    /// Returns `true` if the key was found.
    #[inline(always)]
    pub fn is_present(self) -> bool {
        self.0 >= BID_EXISTS
    }

    /// Returns `true` if the key was not found.
    #[inline(always)]
    pub fn is_missing(self) -> bool {
        self.0 < BID_EXISTS
    }

    /// Returns the packed slot position.
    #[inline(always)]
    pub fn pos(self) -> usize {
        (self.0 & BID_POS_MASK) as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    info_offset: usize,
    entries_offset: usize,
}

impl DataLayout {
    fn new<K, V>(slots: usize) -> Self {
        let info_layout = Layout::array::<u8>(slots).expect("allocation size overflow");
        let entries_layout =
            Layout::array::<MaybeUninit<(K, V)>>(slots).expect("allocation size overflow");

        // Base alignment of 16 regardless of the entry type; entries get
        // their own alignment from `extend`.
        let base = Layout::from_size_align(0, 16).expect("invalid base layout");
        let (layout, info_offset) = base.extend(info_layout).unwrap();
        let (layout, entries_offset) = layout.extend(entries_layout).unwrap();

        DataLayout {
            layout,
            info_offset,
            entries_offset,
        }
    }
}

/// Table statistics for analysis.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct TableStats {
    /// Number of elements currently in the table.
    pub populated: usize,
    /// Number of buckets.
    pub buckets: usize,
    /// Total slots allocated, including tail padding.
    pub total_slots: usize,
    /// Number of physically occupied slots (equals `populated`).
    pub occupied_slots: usize,
    /// Load factor (`populated / buckets`).
    pub load_factor: f64,
    /// Number of upsizing rehashes performed so far.
    pub upsizes: usize,
    /// Number of downsizing rehashes performed so far.
    pub downsizes: usize,
    /// Total memory in bytes used by the table arrays.
    pub total_bytes: usize,
}

/// A Robin Hood hash table with bucket-offset metadata.
///
/// `HashTable<K, V>` stores `Copy` key-value pairs and provides fast
/// single-element and batched insertion, lookup, and removal. Unlike
/// standard hash maps, this implementation requires you to provide hash
/// values and equality predicates for each operation; where an operation
/// may resize, it also takes a rehash function for the stored keys.
///
/// ## Performance Characteristics
///
/// - **Memory**: 1 byte per slot overhead, plus the size of `(K, V)`.
/// - **Lookup**: two metadata reads plus a scan of the home bucket's run.
/// - **Worst-case displacement**: 126 slots, enforced by resizing.
pub struct HashTable<K, V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    buckets: usize,
    mask: usize,
    lsize: usize,

    min_load: usize,
    max_load: usize,
    min_load_factor: f64,
    max_load_factor: f64,

    #[cfg_attr(not(any(test, feature = "stats")), allow(dead_code))]
    pub(crate) upsizes: usize,
    #[cfg_attr(not(any(test, feature = "stats")), allow(dead_code))]
    pub(crate) downsizes: usize,

    _phantom: core::marker::PhantomData<(K, V)>,
}

impl<K, V> Debug for HashTable<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.lsize)
            .field("buckets", &self.buckets)
            .field("min_load", &self.min_load)
            .field("max_load", &self.max_load)
            .finish()
    }
}

impl<K: Copy, V: Copy> Clone for HashTable<K, V> {
    fn clone(&self) -> Self {
        // SAFETY: The layout has non-zero size and allocation failure is
        // handled. The info array is fully initialized in the source, so
        // copying `entries_offset` bytes reproduces it (plus the base
        // padding, which is never read). Entries are then copied per slot,
        // guarded by the physical-occupancy invariant.
        let alloc = unsafe {
            let raw = alloc::alloc::alloc(self.layout.layout);
            if raw.is_null() {
                handle_alloc_error(self.layout.layout);
            }

            core::ptr::copy_nonoverlapping(self.alloc.as_ptr(), raw, self.layout.entries_offset);

            let src = self.entries().as_ptr();
            let dst = raw.add(self.layout.entries_offset) as *mut MaybeUninit<(K, V)>;
            for (pos, &m) in self.info().iter().enumerate() {
                if m != INFO_EMPTY {
                    core::ptr::copy_nonoverlapping(src.add(pos), dst.add(pos), 1);
                }
            }

            NonNull::new_unchecked(raw)
        };

        Self {
            layout: self.layout,
            alloc,
            buckets: self.buckets,
            mask: self.mask,
            lsize: self.lsize,
            min_load: self.min_load,
            max_load: self.max_load,
            min_load_factor: self.min_load_factor,
            max_load_factor: self.max_load_factor,
            upsizes: self.upsizes,
            downsizes: self.downsizes,
            _phantom: core::marker::PhantomData,
        }
    }
}

impl<K, V> Drop for HashTable<K, V> {
    fn drop(&mut self) {
        // Keys and values are Copy, so only the allocation itself needs to
        // be released.
        // SAFETY: `self.alloc` came from `alloc` with `self.layout.layout`.
        unsafe {
            alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
    }
}

impl<K: Copy, V: Copy> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy, V: Copy> HashTable<K, V> {
    const ENTRIES_PER_CACHELINE: usize = {
        let size = core::mem::size_of::<(K, V)>();
        if size == 0 || size >= 64 {
            1
        } else {
            64 / size
        }
    };

    /// Creates a new hash table with a default capacity of 128 entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a new hash table with at least the specified capacity and
    /// the default load factors (0.4 minimum, 0.9 maximum).
    ///
    /// The bucket count is the requested capacity rounded up to a power of
    /// two.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_load_factors(
            capacity,
            DEFAULT_MIN_LOAD_FACTOR,
            DEFAULT_MAX_LOAD_FACTOR,
        )
    }

    /// Creates a new hash table with the specified capacity and load
    /// factors.
    ///
    /// The table downsizes when its population falls below
    /// `min_load_factor * buckets` (via [`HashMap`] or an explicit
    /// [`rehash`]) and upsizes when it reaches `max_load_factor * buckets`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min_load_factor < max_load_factor < 1`.
    ///
    /// [`HashMap`]: crate::hash_map::HashMap
    /// [`rehash`]: HashTable::rehash
    pub fn with_capacity_and_load_factors(
        capacity: usize,
        min_load_factor: f64,
        max_load_factor: f64,
    ) -> Self {
        assert!(
            0.0 < min_load_factor && min_load_factor < max_load_factor && max_load_factor < 1.0,
            "load factors must satisfy 0 < min < max < 1"
        );

        let buckets = capacity.next_power_of_two();
        let slots = buckets + PADDING;
        let layout = DataLayout::new::<K, V>(slots);

        // SAFETY: The layout has non-zero size (the info array alone is at
        // least PADDING + 1 bytes). Allocation failure is diverted to
        // `handle_alloc_error`, and the info array is initialized to empty
        // before the pointer is stored.
        let alloc = unsafe {
            let raw = alloc::alloc::alloc(layout.layout);
            if raw.is_null() {
                handle_alloc_error(layout.layout);
            }

            core::ptr::write_bytes(raw.add(layout.info_offset), INFO_EMPTY, slots);

            NonNull::new_unchecked(raw)
        };

        Self {
            layout,
            alloc,
            buckets,
            mask: buckets - 1,
            lsize: 0,
            min_load: (buckets as f64 * min_load_factor) as usize,
            max_load: (buckets as f64 * max_load_factor) as usize,
            min_load_factor,
            max_load_factor,
            upsizes: 0,
            downsizes: 0,
            _phantom: core::marker::PhantomData,
        }
    }

    #[inline(always)]
    fn slots(&self) -> usize {
        self.buckets + PADDING
    }

    #[inline(always)]
    fn info(&self) -> &[u8] {
        // SAFETY: `self.alloc` points to a live allocation matching
        // `self.layout`; the info array starts at `info_offset`, holds
        // `slots()` bytes, and is fully initialized at construction and
        // kept initialized by every mutation.
        unsafe {
            core::slice::from_raw_parts(
                self.alloc.as_ptr().add(self.layout.info_offset),
                self.slots(),
            )
        }
    }

    #[inline(always)]
    fn info_mut(&mut self) -> &mut [u8] {
        // SAFETY: Same as `info`, and `&mut self` guarantees exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.alloc.as_ptr().add(self.layout.info_offset),
                self.slots(),
            )
        }
    }

    #[inline(always)]
    fn entries(&self) -> &[MaybeUninit<(K, V)>] {
        // SAFETY: `self.alloc` points to a live allocation matching
        // `self.layout`; the entries array starts at `entries_offset` and
        // holds `slots()` elements. `MaybeUninit` makes no initialization
        // claim.
        unsafe {
            core::slice::from_raw_parts(
                self.alloc.as_ptr().add(self.layout.entries_offset) as *const MaybeUninit<(K, V)>,
                self.slots(),
            )
        }
    }

    #[inline(always)]
    fn entries_mut(&mut self) -> &mut [MaybeUninit<(K, V)>] {
        // SAFETY: Same as `entries`, and `&mut self` guarantees exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.alloc.as_ptr().add(self.layout.entries_offset) as *mut MaybeUninit<(K, V)>,
                self.slots(),
            )
        }
    }

    #[inline(always)]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.lsize
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.lsize == 0
    }

    /// Returns the number of buckets.
    ///
    /// The table holds at most `max_load_factor * capacity()` elements
    /// before resizing.
    pub fn capacity(&self) -> usize {
        self.buckets
    }

    /// Returns the current load factor, `len() / capacity()`.
    pub fn load_factor(&self) -> f64 {
        self.lsize as f64 / self.buckets as f64
    }

    /// Returns the minimum load factor below which erasure requests a
    /// downsize.
    pub fn min_load_factor(&self) -> f64 {
        self.min_load_factor
    }

    /// Returns the maximum load factor at which insertion upsizes.
    pub fn max_load_factor(&self) -> f64 {
        self.max_load_factor
    }

    #[inline(always)]
    pub(crate) fn min_load(&self) -> usize {
        self.min_load
    }

    /// Removes all elements from the table, preserving its capacity.
    pub fn clear(&mut self) {
        self.info_mut().fill(INFO_EMPTY);
        self.lsize = 0;
    }

    /// Table statistics for analysis.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> TableStats {
        TableStats {
            populated: self.lsize,
            buckets: self.buckets,
            total_slots: self.slots(),
            occupied_slots: self.info().iter().filter(|&&m| m != INFO_EMPTY).count(),
            load_factor: self.load_factor(),
            upsizes: self.upsizes,
            downsizes: self.downsizes,
            total_bytes: self.layout.layout.size(),
        }
    }

    /// Finds the key's position within its home bucket's run.
    ///
    /// Returns a found id at the matching position, or a missing id whose
    /// position is where the run's scan ended.
    fn find_with_hint(&self, bid: usize, eq: &impl Fn(&K) -> bool) -> BucketId {
        debug_assert!(bid < self.buckets);

        let infos = self.info();
        let info = infos[bid];
        let start = bid + get_offset(info);

        if is_empty_info(info) {
            return BucketId::missing(start);
        }

        let end = bid + 1 + get_offset(infos[bid + 1]);
        let entries = self.entries();
        for pos in start..end {
            // SAFETY: Positions inside an occupied bucket's run are
            // physically occupied (invariant 4), so the slot is initialized,
            // and `end <= bid + 1 + MAX_OFFSET < slots()` keeps `pos` in
            // bounds.
            let entry = unsafe { entries.get_unchecked(pos).assume_init_ref() };
            if eq(&entry.0) {
                return BucketId::found(pos);
            }
        }

        BucketId::missing(end)
    }

    /// Inserts a key-value pair into the bucket `bid`, resolving duplicate
    /// keys through `reducer`.
    ///
    /// Returns a found id when the key was already present, a missing id at
    /// the placement position when it was not, or
    /// [`BucketId::INSERT_FAILED`] when placing it would push an offset past
    /// 126. The caller is responsible for counting successful insertions
    /// into `lsize`.
    fn insert_with_hint<R: Reducer<V>>(
        &mut self,
        bid: usize,
        key: K,
        value: V,
        eq: &impl Fn(&K) -> bool,
        reducer: &R,
    ) -> BucketId {
        debug_assert!(bid < self.buckets);

        let info = self.info()[bid];

        // Empty bucket with no spill over it: the home slot itself is free.
        if info == INFO_EMPTY {
            self.info_mut()[bid] = 0;
            self.entries_mut()[bid].write((key, value));
            return BucketId::missing(bid);
        }

        let start = bid + get_offset(info);
        let next = bid + 1 + get_offset(self.info()[bid + 1]);

        if is_occupied_info(info) {
            let found = {
                let entries = self.entries();
                let mut found = None;
                for pos in start..next {
                    // SAFETY: Run positions of an occupied bucket are
                    // initialized (invariant 4) and in bounds.
                    let entry = unsafe { entries.get_unchecked(pos).assume_init_ref() };
                    if eq(&entry.0) {
                        found = Some(pos);
                        break;
                    }
                }
                found
            };

            if let Some(pos) = found {
                if !R::IS_DISCARD {
                    // SAFETY: `pos` was just observed occupied.
                    let slot = unsafe { self.entries_mut().get_unchecked_mut(pos).assume_init_mut() };
                    slot.1 = reducer.reduce(slot.1, value);
                }
                return BucketId::found(pos);
            }
        }

        // The new entry must land at `next`. Scan forward for the first
        // physically empty slot; every traversed offset will be incremented
        // by one, so abort before any of them would reach 127.
        let mut end = bid + 1;
        {
            let infos = self.info();
            loop {
                let m = infos[end];
                if m == INFO_EMPTY {
                    break;
                }
                if get_offset(m) == MAX_OFFSET {
                    return BucketId::INSERT_FAILED;
                }
                end += 1;
            }
        }
        debug_assert!(next <= end);

        {
            let infos = self.info_mut();
            set_occupied(&mut infos[bid]);
            for m in &mut infos[bid + 1..=end] {
                *m += 1;
            }
        }

        // SAFETY: `next..end` are physically occupied slots inside the
        // allocation (`end < slots()` since the scan stopped at an
        // in-bounds empty slot); the one-slot overlapping shift is a
        // memmove.
        unsafe {
            let base = self.entries_mut().as_mut_ptr();
            core::ptr::copy(base.add(next), base.add(next + 1), end - next);
        }
        self.entries_mut()[next].write((key, value));

        BucketId::missing(next)
    }

    /// Removes the key from the bucket `bid` with a backward shift,
    /// returning the number of elements erased (0 or 1).
    fn erase_with_hint(&mut self, bid: usize, eq: &impl Fn(&K) -> bool) -> usize {
        let found = self.find_with_hint(bid, eq);
        if found.is_missing() {
            return 0;
        }

        self.lsize -= 1;

        let pos = found.pos();
        // The next zero-offset slot past `bid` marks the end of the
        // displacement cluster; everything in between shifts back by one.
        let end = self.find_next_zero_offset(bid + 1);
        debug_assert!(pos < end);

        // SAFETY: `pos + 1..end` are physically occupied slots inside the
        // allocation; the one-slot overlapping shift is a memmove.
        unsafe {
            let base = self.entries_mut().as_mut_ptr();
            core::ptr::copy(base.add(pos + 1), base.add(pos), end - 1 - pos);
        }

        let infos = self.info_mut();
        if get_offset(infos[bid]) == get_offset(infos[bid + 1]) {
            // The run held a single entry; the bucket is empty again.
            set_empty(&mut infos[bid]);
        }
        for m in &mut infos[bid + 1..end] {
            *m -= 1;
        }

        1
    }

    /// Returns the first position at or after `pos` whose offset is zero.
    ///
    /// Offsets let the scan jump: within a displacement cluster there are
    /// no gaps, so a slot with offset `d` implies the next possible
    /// zero-offset slot is `d` positions ahead.
    fn find_next_zero_offset(&self, mut pos: usize) -> usize {
        let infos = self.info();
        loop {
            let dist = get_offset(infos[pos]);
            if dist == 0 {
                return pos;
            }
            pos += dist;
        }
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// Returns a reference to the value if found, or `None` if no matching
    /// key exists.
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Option<&V> {
        if self.lsize == 0 {
            return None;
        }

        let id = self.find_with_hint(self.bucket_index(hash), &eq);
        if id.is_missing() {
            return None;
        }

        // SAFETY: Found positions hold initialized entries.
        Some(unsafe { &self.entries().get_unchecked(id.pos()).assume_init_ref().1 })
    }

    /// Inserts a key-value pair, resolving duplicate keys through
    /// `reducer`.
    ///
    /// Returns the entry's slot position and whether a new entry was
    /// created. When the key was already present, the resident value has
    /// been combined with `value` by the reducer and `false` is returned.
    ///
    /// The table resizes beforehand if it is at `max_load`, and resizes and
    /// retries if the insertion overflows the 7-bit offset; `rehash` must
    /// produce the same hash for a stored key as the `hash` passed here.
    #[inline]
    pub fn insert<R: Reducer<V>>(
        &mut self,
        hash: u64,
        key: K,
        value: V,
        eq: impl Fn(&K) -> bool,
        rehash: impl Fn(&K) -> u64,
        reducer: &R,
    ) -> (usize, bool) {
        if self.lsize >= self.max_load {
            self.do_rehash(self.buckets << 1, &rehash);
        }

        let mut id = self.insert_with_hint(self.bucket_index(hash), key, value, &eq, reducer);
        while id == BucketId::INSERT_FAILED {
            self.do_rehash(self.buckets << 1, &rehash);
            id = self.insert_with_hint(self.bucket_index(hash), key, value, &eq, reducer);
        }

        let inserted = id.is_missing();
        if inserted {
            self.lsize += 1;
        }
        (id.pos(), inserted)
    }

    /// Applies the reducer to an existing key's value, without inserting.
    ///
    /// Returns `true` if the key was present.
    #[inline]
    pub fn update<R: Reducer<V>>(
        &mut self,
        hash: u64,
        value: V,
        eq: impl Fn(&K) -> bool,
        reducer: &R,
    ) -> bool {
        let id = self.find_with_hint(self.bucket_index(hash), &eq);
        if id.is_missing() {
            return false;
        }

        // SAFETY: Found positions hold initialized entries.
        let slot = unsafe { self.entries_mut().get_unchecked_mut(id.pos()).assume_init_mut() };
        slot.1 = reducer.reduce(slot.1, value);
        true
    }

    /// Removes a key from the table.
    ///
    /// Returns the number of elements erased (0 or 1). The table never
    /// downsizes here; sizing policy belongs to the caller (see
    /// [`HashMap::erase`]).
    ///
    /// [`HashMap::erase`]: crate::hash_map::HashMap::erase
    #[inline]
    pub fn erase(&mut self, hash: u64, eq: impl Fn(&K) -> bool) -> usize {
        if self.lsize == 0 {
            return 0;
        }
        self.erase_with_hint(self.bucket_index(hash), &eq)
    }
}

impl<K: Copy, V: Copy> HashTable<K, V> {
    /// Reserves capacity for at least `total` elements.
    ///
    /// Rehashes to `ceil(total / max_load_factor)` buckets, rounded up to a
    /// power of two. A reserve followed by inserting `total` distinct keys
    /// performs no further internal resizes. Note that `total` is the
    /// target population, not a count of additional elements.
    pub fn reserve(&mut self, total: usize, rehash: impl Fn(&K) -> u64) {
        let needed = libm::ceil(total as f64 / self.max_load_factor) as usize;
        self.do_rehash(needed, &rehash);
    }

    /// Rebuilds the table with `bucket_count` buckets (rounded up to a
    /// power of two).
    ///
    /// Growing always succeeds. Shrinking first dry-runs the merge; if the
    /// collapsed table would need an offset past 126 at every feasible
    /// size, the request is silently abandoned and the table keeps its
    /// current geometry. A request that cannot hold the current population
    /// is ignored.
    pub fn rehash(&mut self, bucket_count: usize, rehash: impl Fn(&K) -> u64) {
        self.do_rehash(bucket_count, &rehash);
    }

    fn do_rehash(&mut self, bucket_count: usize, rehash: &dyn Fn(&K) -> u64) {
        let mut n = bucket_count.next_power_of_two();
        if n == self.buckets {
            return;
        }
        if self.lsize as f64 >= self.max_load_factor * n as f64 {
            return;
        }

        if self.lsize > 0 && n < self.buckets {
            // Downsize dry run: grow the target until the merged blocks fit
            // in 7-bit offsets. If only the current size fits, abandon the
            // resize.
            while self.downsize_max_offset(n) > MAX_OFFSET {
                n <<= 1;
            }
            if n == self.buckets {
                return;
            }
        }

        let slots = n + PADDING;
        let new_layout = DataLayout::new::<K, V>(slots);
        // SAFETY: The layout has non-zero size; allocation failure is
        // diverted to handle_alloc_error and the new info array is
        // initialized to empty before use.
        let new_alloc = unsafe {
            let raw = alloc::alloc::alloc(new_layout.layout);
            if raw.is_null() {
                handle_alloc_error(new_layout.layout);
            }
            core::ptr::write_bytes(raw.add(new_layout.info_offset), INFO_EMPTY, slots);
            NonNull::new_unchecked(raw)
        };

        // SAFETY: Freshly allocated and sized for `slots` of each array;
        // these borrows are independent of `self`.
        let (new_info, new_entries) = unsafe {
            (
                core::slice::from_raw_parts_mut(new_alloc.as_ptr().add(new_layout.info_offset), slots),
                core::slice::from_raw_parts_mut(
                    new_alloc.as_ptr().add(new_layout.entries_offset) as *mut MaybeUninit<(K, V)>,
                    slots,
                ),
            )
        };

        if self.lsize > 0 {
            if n > self.buckets {
                self.copy_upsize(new_info, new_entries, n, rehash);
                self.upsizes += 1;
            } else {
                self.copy_downsize(new_info, new_entries, n);
                self.downsizes += 1;
            }
        }

        let old_layout = core::mem::replace(&mut self.layout, new_layout);
        let old_alloc = core::mem::replace(&mut self.alloc, new_alloc);
        self.buckets = n;
        self.mask = n - 1;
        self.min_load = (n as f64 * self.min_load_factor) as usize;
        self.max_load = (n as f64 * self.max_load_factor) as usize;

        // SAFETY: The old allocation is live and matches `old_layout`. The
        // moved entries are Copy, so no destructors are owed.
        unsafe {
            alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
        }
    }

    /// Dry run for a downsize: the largest offset the collapsed table would
    /// require, without writing anything.
    fn downsize_max_offset(&self, target: usize) -> usize {
        debug_assert!(target.is_power_of_two());
        if target > self.buckets {
            return 0;
        }

        let infos = self.info();
        let blocks = self.buckets / target;

        let mut max_offset = 0usize;
        let mut new_end = 0usize;
        for bid in 0..target {
            // The merged run for `bid` starts at the later of its own slot
            // and the end of the previous merged run.
            let new_start = bid.max(new_end);
            new_end = new_start;

            for bl in 0..blocks {
                let id = bid + bl * target;
                if is_occupied_info(infos[id]) {
                    new_end += 1 + get_offset(infos[id + 1]) - get_offset(infos[id]);
                }
            }

            max_offset = max_offset.max(new_start - bid);
            if max_offset > MAX_OFFSET {
                return max_offset;
            }
        }

        // Offsets carried by the tail padding past the last bucket.
        max_offset.max(new_end.saturating_sub(target))
    }

    /// One-pass block-merging rebuild into a smaller table.
    ///
    /// With `blocks = buckets / target`, source buckets `bid + bl * target`
    /// for `bl` in `0..blocks` all collapse onto target bucket `bid`; their
    /// runs are appended in block order.
    fn copy_downsize(
        &self,
        new_info: &mut [u8],
        new_entries: &mut [MaybeUninit<(K, V)>],
        target: usize,
    ) {
        debug_assert!(target.is_power_of_two());

        let infos = self.info();
        let entries = self.entries();
        let blocks = self.buckets / target;

        let mut new_end = 0usize;
        for bid in 0..target {
            let new_start = bid.max(new_end);
            new_end = new_start;

            for bl in 0..blocks {
                let id = bid + bl * target;
                if is_occupied_info(infos[id]) {
                    let pos = id + get_offset(infos[id]);
                    let run_end = id + 1 + get_offset(infos[id + 1]);
                    let len = run_end - pos;

                    // SAFETY: The source run is initialized and in bounds;
                    // the target range was sized by the dry run and the
                    // allocations are disjoint.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            entries.as_ptr().add(pos),
                            new_entries.as_mut_ptr().add(new_end),
                            len,
                        );
                    }
                    new_end += len;
                }
            }

            let offset = new_start - bid;
            debug_assert!(offset <= MAX_OFFSET);
            new_info[bid] = if new_end == new_start {
                INFO_EMPTY | offset as u8
            } else {
                offset as u8
            };
        }

        // Tail padding covered by the final run carries the distance to the
        // run's end, so reading `info[b + 1]` keeps working at the border.
        for bid in target..new_end {
            new_info[bid] = INFO_EMPTY | (new_end - bid) as u8;
        }
    }

    /// Two-pass block rebuild into a larger table.
    ///
    /// Doubling `k` times splits the address space into `blocks = target /
    /// buckets` blocks of the current size, and every entry keeps its
    /// position-within-block. The first pass hashes each entry once,
    /// recording where each block's data region ends; the second pass
    /// places entries at their block cursors and reconstructs the info
    /// bytes per (source bucket, block) pair. The hashes are kept in a
    /// scratch vector so each key is hashed exactly once.
    fn copy_upsize(
        &self,
        new_info: &mut [u8],
        new_entries: &mut [MaybeUninit<(K, V)>],
        target: usize,
        rehash: &dyn Fn(&K) -> u64,
    ) {
        debug_assert!(target.is_power_of_two() && target > self.buckets);

        let infos = self.info();
        let entries = self.entries();
        let blocks = target / self.buckets;
        let target_mask = target - 1;

        let mut offsets = vec![0usize; blocks + 1];
        let mut len = vec![0usize; blocks];
        let mut hashes: Vec<u64> = Vec::with_capacity(self.lsize);

        // Pass 1: hash everything and find the end of each block's data
        // region. Entries arrive in source order, so target positions are
        // non-decreasing within a block and a running max doubles as a
        // placement cursor.
        for bid in 0..self.buckets {
            if is_occupied_info(infos[bid]) {
                let pos = bid + get_offset(infos[bid]);
                let run_end = bid + 1 + get_offset(infos[bid + 1]);
                for p in pos..run_end {
                    // SAFETY: Run positions are initialized and in bounds.
                    let entry = unsafe { entries.get_unchecked(p).assume_init_ref() };
                    let h = rehash(&entry.0);
                    hashes.push(h);

                    let id = (h as usize) & target_mask;
                    let bl = id / self.buckets;
                    offsets[bl + 1] = offsets[bl + 1].max(id) + 1;
                }
            }
        }

        // Pass 2: `offsets[bl]` now holds the end of block `bl - 1`'s data
        // region, which is exactly where block `bl` may first place an
        // entry when the previous block spills across the boundary.
        let mut j = 0usize;
        for bid in 0..self.buckets {
            if is_occupied_info(infos[bid]) {
                let pos = bid + get_offset(infos[bid]);
                let run_end = bid + 1 + get_offset(infos[bid + 1]);

                len.fill(0);
                for p in pos..run_end {
                    let id = (hashes[j] as usize) & target_mask;
                    j += 1;
                    let bl = id / self.buckets;

                    let pp = offsets[bl].max(id);
                    // SAFETY: Run positions are initialized and in bounds.
                    let entry = unsafe { entries.get_unchecked(p).assume_init_ref() };
                    new_entries[pp].write(*entry);

                    offsets[bl] = pp + 1;
                    len[bl] += 1;
                }

                // All entries of this source bucket that landed in block
                // `bl` share the target bucket `bid + bl * buckets`.
                for (bl, &placed) in len.iter().enumerate() {
                    let id = bid + bl * self.buckets;
                    let start = offsets[bl].max(id) - placed;
                    let offset = start - id;
                    debug_assert!(offset <= MAX_OFFSET);
                    new_info[id] = if placed == 0 {
                        INFO_EMPTY | offset as u8
                    } else {
                        offset as u8
                    };
                }
            } else {
                for bl in 0..blocks {
                    let id = bid + bl * self.buckets;
                    let offset = offsets[bl].max(id) - id;
                    debug_assert!(offset <= MAX_OFFSET);
                    new_info[id] = INFO_EMPTY | offset as u8;
                }
            }
        }

        // Tail padding after the last block's final run.
        let tail_end = offsets[blocks].max(offsets[blocks - 1]);
        for bid in target..tail_end {
            new_info[bid] = INFO_EMPTY | (tail_end - bid) as u8;
        }
    }
}

impl<K: Copy, V: Copy> HashTable<K, V> {
    /// Prefetches a bucket's metadata neighborhood and entry run.
    #[inline(always)]
    fn prefetch_bucket(&self, bid: usize) {
        let infos = self.info();
        let info = infos[bid];
        if is_occupied_info(info) {
            let start = bid + get_offset(info);
            let end = bid + 1 + get_offset(infos[bid + 1]);

            let entries = self.entries();
            let mut pos = start;
            while pos < end {
                // SAFETY: Run positions are inside the allocation.
                unsafe { prefetch(entries.as_ptr().add(pos)) };
                pos += Self::ENTRIES_PER_CACHELINE;
            }
        }
    }

    fn insert_one<R: Reducer<V>>(
        &mut self,
        entry: (K, V),
        hash: u64,
        eq: &impl Fn(&K, &K) -> bool,
        rehash: &dyn Fn(&K) -> u64,
        reducer: &R,
    ) {
        let key_eq = |candidate: &K| eq(&entry.0, candidate);
        let mut id = self.insert_with_hint(self.bucket_index(hash), entry.0, entry.1, &key_eq, reducer);
        while id == BucketId::INSERT_FAILED {
            self.do_rehash(self.buckets << 1, rehash);
            id = self.insert_with_hint(self.bucket_index(hash), entry.0, entry.1, &key_eq, reducer);
        }
        if id.is_missing() {
            self.lsize += 1;
        }
    }

    /// Inserts a batch of key-value pairs with precomputed hashes, driving
    /// the prefetch pipeline.
    ///
    /// `hashes[i]` must be the hash of `input[i].0`, and `rehash` must
    /// agree with it for stored keys. The driver works in stretches bounded
    /// by the `max_load` boundary, rehashing between stretches, so the
    /// per-element path never checks the load factor. Duplicate keys within
    /// the batch are combined through `reducer` in input order.
    ///
    /// Callers that do not have hashes at hand should prefer
    /// [`HashMap::insert_batch`], which also pre-sizes the table from a
    /// cardinality estimate of the input.
    ///
    /// # Panics
    ///
    /// Panics if `input` and `hashes` have different lengths.
    ///
    /// [`HashMap::insert_batch`]: crate::hash_map::HashMap::insert_batch
    pub fn insert_batch<R: Reducer<V>>(
        &mut self,
        input: &[(K, V)],
        hashes: &[u64],
        eq: impl Fn(&K, &K) -> bool,
        rehash: impl Fn(&K) -> u64,
        reducer: &R,
    ) {
        assert_eq!(input.len(), hashes.len(), "one hash per input entry");

        let total = input.len();
        let window = 2 * LOOK_AHEAD;

        // Warm the pipeline: the first two windows of hashes and inputs,
        // then the metadata and entry neighborhoods of their home buckets.
        let warm = total.min(window);
        for i in 0..warm {
            // SAFETY: `i < total` bounds both slices.
            unsafe {
                prefetch(hashes.as_ptr().add(i));
                prefetch(input.as_ptr().add(i));
            }
        }
        for &h in hashes.iter().take(warm) {
            let bid = (h as usize) & self.mask;
            // SAFETY: `bid < buckets` keeps both pointers in the allocation.
            unsafe {
                prefetch(self.info().as_ptr().add(bid));
                prefetch(self.entries().as_ptr().add(bid));
            }
        }

        let far_end = total.saturating_sub(window);
        let near_end = total.saturating_sub(LOOK_AHEAD);
        let mut i = 0;

        // Main stretch: run until the next max_load boundary, rehash, and
        // continue.
        while i < far_end {
            if self.lsize >= self.max_load {
                self.do_rehash(self.buckets << 1, &rehash);
            }

            let stop = i + (self.max_load - self.lsize).min(far_end - i);
            while i < stop {
                // SAFETY: `i + window < total` inside this stretch, and
                // masked bucket indices are in bounds.
                unsafe {
                    prefetch(hashes.as_ptr().add(i + window));
                    prefetch(input.as_ptr().add(i + window));
                }
                self.prefetch_bucket((hashes[i + LOOK_AHEAD] as usize) & self.mask);

                self.insert_one(input[i], hashes[i], &eq, &rehash, reducer);

                let ahead = (hashes[i + window] as usize) & self.mask;
                // SAFETY: `ahead < buckets`.
                unsafe { prefetch(self.info().as_ptr().add(ahead)) };
                i += 1;
            }
        }

        // Second-to-last window: the run prefetch still has a full window
        // of lead time.
        while i < near_end {
            self.prefetch_bucket((hashes[i + LOOK_AHEAD] as usize) & self.mask);
            self.insert_one(input[i], hashes[i], &eq, &rehash, reducer);
            i += 1;
        }

        // Last window: plain inserts.
        while i < total {
            self.insert_one(input[i], hashes[i], &eq, &rehash, reducer);
            i += 1;
        }
    }

    /// Shared read pipeline for the batched lookups: hashes are computed
    /// inline into a ring buffer two windows deep, and `visit` observes the
    /// per-key result in input order.
    fn probe_batch(
        &self,
        keys: &[K],
        hash: &impl Fn(&K) -> u64,
        eq: &impl Fn(&K, &K) -> bool,
        mut visit: impl FnMut(usize, BucketId),
    ) {
        let total = keys.len();
        let window = 2 * LOOK_AHEAD;
        let ring_mask = window - 1;
        let mut ring = [0u64; 2 * LOOK_AHEAD];

        let warm = total.min(window);
        for (i, key) in keys.iter().take(warm).enumerate() {
            let h = hash(key);
            ring[i] = h;
            let bid = (h as usize) & self.mask;
            // SAFETY: `bid < buckets` keeps both pointers in the allocation.
            unsafe {
                prefetch(self.info().as_ptr().add(bid));
                prefetch(self.entries().as_ptr().add(bid));
            }
        }

        let far_end = total.saturating_sub(window);
        let near_end = total.saturating_sub(LOOK_AHEAD);
        let mut i = 0;

        while i < far_end {
            let home = (ring[i & ring_mask] as usize) & self.mask;

            // Refill the slot just consumed with the hash two windows out.
            let refill = hash(&keys[i + window]);
            ring[i & ring_mask] = refill;
            // SAFETY: The masked bucket index is in bounds.
            unsafe { prefetch(self.info().as_ptr().add((refill as usize) & self.mask)) };

            self.prefetch_bucket((ring[(i + LOOK_AHEAD) & ring_mask] as usize) & self.mask);

            let key_eq = |candidate: &K| eq(&keys[i], candidate);
            visit(i, self.find_with_hint(home, &key_eq));
            i += 1;
        }

        while i < near_end {
            let home = (ring[i & ring_mask] as usize) & self.mask;
            self.prefetch_bucket((ring[(i + LOOK_AHEAD) & ring_mask] as usize) & self.mask);

            let key_eq = |candidate: &K| eq(&keys[i], candidate);
            visit(i, self.find_with_hint(home, &key_eq));
            i += 1;
        }

        while i < total {
            let home = (ring[i & ring_mask] as usize) & self.mask;
            let key_eq = |candidate: &K| eq(&keys[i], candidate);
            visit(i, self.find_with_hint(home, &key_eq));
            i += 1;
        }
    }

    /// Looks up a batch of keys, appending found `(key, value)` pairs to
    /// `out` in input order.
    ///
    /// Returns the number of keys found. Hashes are computed inline with a
    /// two-window lead and kept in a small ring buffer.
    pub fn find_batch(
        &self,
        keys: &[K],
        out: &mut Vec<(K, V)>,
        hash: impl Fn(&K) -> u64,
        eq: impl Fn(&K, &K) -> bool,
    ) -> usize {
        let entries = self.entries();
        let mut found = 0usize;
        self.probe_batch(keys, &hash, &eq, |_, id| {
            if id.is_present() {
                // SAFETY: Found positions hold initialized entries.
                out.push(unsafe { *entries.get_unchecked(id.pos()).assume_init_ref() });
                found += 1;
            }
        });
        found
    }

    /// Counts the presence of a batch of keys, appending 1 or 0 per key to
    /// `out` in input order.
    ///
    /// Returns the total number of keys found.
    pub fn count_batch(
        &self,
        keys: &[K],
        out: &mut Vec<u8>,
        hash: impl Fn(&K) -> u64,
        eq: impl Fn(&K, &K) -> bool,
    ) -> usize {
        let mut found = 0usize;
        self.probe_batch(keys, &hash, &eq, |_, id| {
            let hit = id.is_present() as u8;
            out.push(hit);
            found += hit as usize;
        });
        found
    }

    /// Erases a batch of keys, returning the number of elements removed.
    ///
    /// The table never downsizes here; sizing policy belongs to the caller
    /// (see [`HashMap::erase_batch`]).
    ///
    /// [`HashMap::erase_batch`]: crate::hash_map::HashMap::erase_batch
    pub fn erase_batch(
        &mut self,
        keys: &[K],
        hash: impl Fn(&K) -> u64,
        eq: impl Fn(&K, &K) -> bool,
    ) -> usize {
        let before = self.lsize;

        let total = keys.len();
        let window = 2 * LOOK_AHEAD;
        let ring_mask = window - 1;
        let mut ring = [0u64; 2 * LOOK_AHEAD];

        let warm = total.min(window);
        for (i, key) in keys.iter().take(warm).enumerate() {
            let h = hash(key);
            ring[i] = h;
            let bid = (h as usize) & self.mask;
            // SAFETY: `bid < buckets` keeps both pointers in the allocation.
            unsafe {
                prefetch(self.info().as_ptr().add(bid));
                prefetch(self.entries().as_ptr().add(bid));
            }
        }

        for i in 0..total {
            let home = (ring[i & ring_mask] as usize) & self.mask;

            if i + window < total {
                let refill = hash(&keys[i + window]);
                ring[i & ring_mask] = refill;
                // SAFETY: The masked bucket index is in bounds.
                unsafe { prefetch(self.info().as_ptr().add((refill as usize) & self.mask)) };
            }
            if i + LOOK_AHEAD < total {
                self.prefetch_bucket((ring[(i + LOOK_AHEAD) & ring_mask] as usize) & self.mask);
            }

            let key_eq = |candidate: &K| eq(&keys[i], candidate);
            self.erase_with_hint(home, &key_eq);
        }

        before - self.lsize
    }

    /// Returns an iterator over the entries in the table.
    ///
    /// The iterator yields `(&K, &V)` pairs in an arbitrary order. The
    /// order is not preserved across resizes.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            infos: self.info(),
            entries: self.entries(),
            pos: 0,
            remaining: self.lsize,
        }
    }
}

/// An iterator over the entries of a [`HashTable`].
///
/// This struct is created by the [`iter`] method on [`HashTable`].
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, K, V> {
    infos: &'a [u8],
    entries: &'a [MaybeUninit<(K, V)>],
    pos: usize,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 && self.pos < self.infos.len() {
            let pos = self.pos;
            self.pos += 1;

            if self.infos[pos] != INFO_EMPTY {
                self.remaining -= 1;
                // SAFETY: A slot whose info byte differs from INFO_EMPTY is
                // physically occupied and therefore initialized.
                let entry = unsafe { self.entries.get_unchecked(pos).assume_init_ref() };
                return Some((&entry.0, &entry.1));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use core::hash::Hasher;

    use rand::rngs::OsRng;
    use rand::TryRngCore;
    use siphasher::sip::SipHasher;

    use super::*;
    use crate::reduce::DiscardReducer;
    use crate::reduce::ReplaceReducer;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn hash(&self, key: u64) -> u64 {
            let mut h = SipHasher::new_with_keys(self.k0, self.k1);
            h.write_u64(key);
            h.finish()
        }
    }

    struct Add;

    impl Reducer<u64> for Add {
        fn reduce(&self, existing: u64, incoming: u64) -> u64 {
            existing + incoming
        }
    }

    /// Walks the whole table checking the structural invariants: offset
    /// monotonicity, the 126 cap, run/home consistency, and the population
    /// count.
    fn check_invariants(table: &HashTable<u64, u64>, hash: impl Fn(&u64) -> u64) {
        let infos = table.info();
        let entries = table.entries();

        assert!(table.buckets.is_power_of_two());
        assert_eq!(table.mask, table.buckets - 1);
        assert_eq!(infos.len(), table.buckets + PADDING);

        let mut occupied_buckets = 0;
        let mut covered_slots = 0;
        for pos in 0..infos.len() {
            if infos[pos] != INFO_EMPTY {
                covered_slots += 1;
            }
            if pos < infos.len() - 1 {
                let here = get_offset(infos[pos]);
                let next = get_offset(infos[pos + 1]);
                assert!(
                    next + 1 >= here,
                    "offset drop of more than one at {pos}: {here} -> {next}"
                );
            }
            assert!(get_offset(infos[pos]) <= MAX_OFFSET, "offset cap at {pos}");
        }

        for bid in 0..table.buckets {
            if is_occupied_info(infos[bid]) {
                occupied_buckets += 1;
                let start = bid + get_offset(infos[bid]);
                let end = bid + 1 + get_offset(infos[bid + 1]);
                assert!(start < end, "occupied bucket {bid} owns an empty range");
                for pos in start..end {
                    assert_ne!(infos[pos], INFO_EMPTY, "run slot {pos} marked empty");
                    let key = unsafe { entries[pos].assume_init_ref() }.0;
                    assert_eq!(
                        (hash(&key) as usize) & table.mask,
                        bid,
                        "entry at {pos} does not belong to bucket {bid}"
                    );
                }
            }
        }

        assert_eq!(occupied_buckets, table.len());
        assert_eq!(covered_slots, table.len());
        assert_eq!(table.iter().count(), table.len());
    }

    #[test]
    fn insert_into_empty_home_bucket() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        assert_eq!(table.capacity(), 8);

        let (pos, inserted) = table.insert(42, 42, 7, |k| *k == 42, |_| 42, &ReplaceReducer);
        assert!(inserted);
        assert_eq!(pos, 42 & 7);

        assert_eq!(table.len(), 1);
        assert_eq!(table.find(42, |k| *k == 42), Some(&7));
        assert!(is_occupied_info(table.info()[42 & 7]));
        assert_eq!(get_offset(table.info()[42 & 7]), 0);
        check_invariants(&table, |k| *k);
    }

    #[test]
    fn collision_chain_offsets() {
        // Six keys whose hashes all map to bucket 3 of an 8-bucket table:
        // the run is [3, 9) and the offsets walked forward from bucket 4
        // count down to the run's end.
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        let hash = |_: &u64| 3u64;
        for k in 1..=6u64 {
            let (_, inserted) = table.insert(3, k, k * 10, |s| *s == k, hash, &ReplaceReducer);
            assert!(inserted, "{table:?}");
        }

        assert_eq!(table.len(), 6);
        for k in 1..=6u64 {
            assert_eq!(table.find(3, |s| *s == k), Some(&(k * 10)));
        }

        let infos = table.info();
        assert_eq!(get_offset(infos[3]), 0);
        assert!(is_occupied_info(infos[3]));
        for (i, expected) in [5usize, 4, 3, 2, 1, 0].iter().enumerate() {
            assert_eq!(
                get_offset(infos[4 + i]),
                *expected,
                "offset at {}",
                4 + i
            );
        }
        check_invariants(&table, |k| hash(k));
    }

    #[test]
    fn duplicate_insert_applies_reducer() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        for _ in 0..3 {
            table.insert(5, 9, 1, |k| *k == 9, |_| 5, &Add);
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(5, |k| *k == 9), Some(&3));
    }

    #[test]
    fn duplicate_insert_discard_keeps_resident() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        let (_, first) = table.insert(5, 9, 1, |k| *k == 9, |_| 5, &DiscardReducer);
        let (_, second) = table.insert(5, 9, 2, |k| *k == 9, |_| 5, &DiscardReducer);
        assert!(first);
        assert!(!second);
        assert_eq!(table.find(5, |k| *k == 9), Some(&1));
    }

    #[test]
    fn duplicate_insert_replace_overwrites() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        table.insert(5, 9, 1, |k| *k == 9, |_| 5, &ReplaceReducer);
        let (_, inserted) = table.insert(5, 9, 2, |k| *k == 9, |_| 5, &ReplaceReducer);
        assert!(!inserted);
        assert_eq!(table.find(5, |k| *k == 9), Some(&2));
    }

    #[test]
    fn offset_126_is_reachable() {
        // 127 colliding keys fill one bucket completely: the last entry
        // sits 126 slots past its home and stays findable.
        let mut table: HashTable<u64, u64> =
            HashTable::with_capacity_and_load_factors(256, 0.2, 0.95);
        let hash = |_: &u64| 0u64;
        for k in 0..127u64 {
            let (_, inserted) = table.insert(0, k, k, |s| *s == k, hash, &ReplaceReducer);
            assert!(inserted);
        }

        assert_eq!(table.len(), 127);
        assert_eq!(get_offset(table.info()[1]), MAX_OFFSET);
        assert_eq!(table.upsizes, 0);
        for k in 0..127u64 {
            assert_eq!(table.find(0, |s| *s == k), Some(&k));
        }
        check_invariants(&table, hash);
    }

    #[test]
    fn offset_overflow_triggers_resize() {
        // 128 keys that collide into one bucket at 256 buckets but spread
        // at larger sizes: the insert that would need offset 127 resizes
        // instead, and afterwards every key is findable with offsets back
        // under the cap.
        let mut table: HashTable<u64, u64> =
            HashTable::with_capacity_and_load_factors(256, 0.2, 0.95);
        let hash = |k: &u64| k * 256;
        for k in 0..128u64 {
            let (_, inserted) =
                table.insert(hash(&k), k, k, |s| *s == k, hash, &ReplaceReducer);
            assert!(inserted);
        }

        assert_eq!(table.len(), 128);
        assert!(table.upsizes >= 1, "overflow should have forced an upsize");
        assert!(table.capacity() > 256);
        for k in 0..128u64 {
            assert_eq!(table.find(hash(&k), |s| *s == k), Some(&k));
        }
        check_invariants(&table, hash);
    }

    #[test]
    fn erase_compacts_the_run() {
        // Five keys collide into bucket 0; erasing the middle one shifts
        // the tail back and decrements the offsets of buckets 1..=4.
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        let hash = |_: &u64| 0u64;
        for k in 1..=5u64 {
            table.insert(0, k, k * 10, |s| *s == k, hash, &ReplaceReducer);
        }

        let before: Vec<usize> = (1..=5).map(|i| get_offset(table.info()[i])).collect();
        assert_eq!(before, vec![4, 3, 2, 1, 0]);

        assert_eq!(table.erase(0, |s| *s == 3), 1);
        assert_eq!(table.len(), 4);

        let after: Vec<usize> = (1..=5).map(|i| get_offset(table.info()[i])).collect();
        assert_eq!(after, vec![3, 2, 1, 0, 0]);

        for k in [1u64, 2, 4, 5] {
            assert_eq!(table.find(0, |s| *s == k), Some(&(k * 10)));
        }
        assert_eq!(table.find(0, |s| *s == 3), None);
        check_invariants(&table, hash);
    }

    #[test]
    fn erase_missing_is_a_no_op() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        assert_eq!(table.erase(3, |s| *s == 1), 0);

        table.insert(5, 9, 9, |s| *s == 9, |_| 5, &ReplaceReducer);
        // Occupied table, but the probed bucket is empty.
        assert_eq!(table.erase(2, |s| *s == 1), 0);
        // Right bucket, wrong key.
        assert_eq!(table.erase(5, |s| *s == 1), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_erase_round_trip() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(64);
        for k in 0..32u64 {
            table.insert(state.hash(k), k, k, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        let len_before = table.len();
        table.insert(state.hash(99), 99, 99, |s| *s == 99, |s| state.hash(*s), &ReplaceReducer);
        assert_eq!(table.erase(state.hash(99), |s| *s == 99), 1);
        assert_eq!(table.find(state.hash(99), |s| *s == 99), None);
        assert_eq!(table.len(), len_before);
        check_invariants(&table, |k| state.hash(*k));
    }

    #[test]
    fn clear_then_insert_lands_at_home() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);
        for k in 0..10u64 {
            table.insert(state.hash(k), k, k, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.iter().count(), 0);

        let (pos, inserted) = table.insert(
            state.hash(7),
            7,
            7,
            |s| *s == 7,
            |s| state.hash(*s),
            &ReplaceReducer,
        );
        assert!(inserted);
        assert_eq!(pos, (state.hash(7) as usize) & table.mask);
        assert_eq!(get_offset(table.info()[pos]), 0);
    }

    #[test]
    fn reserve_avoids_internal_resizes() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(1);

        table.reserve(1000, |s| state.hash(*s));
        let upsizes_after_reserve = table.upsizes;

        for k in 0..1000u64 {
            table.insert(state.hash(k), k, k, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        assert_eq!(table.len(), 1000);
        assert_eq!(table.upsizes, upsizes_after_reserve);
        check_invariants(&table, |k| state.hash(*k));
    }

    #[test]
    fn grow_keeps_everything_findable() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(1);
        for k in 0..10_000u64 {
            table.insert(state.hash(k), k, k * 3, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        assert_eq!(table.len(), 10_000);
        assert!(table.upsizes > 0);
        for k in 0..10_000u64 {
            assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&(k * 3)));
        }
        check_invariants(&table, |k| state.hash(*k));
    }

    #[test]
    fn downsize_rebuild_and_padding() {
        // Build at 64 buckets with four homes that all collapse onto the
        // last bucket of a 16-bucket table, so the merged run spills into
        // the padding. The padding bytes past the last bucket must carry
        // the distance to the end of the final run.
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(64);
        let hash = |k: &u64| 15 + 16 * (*k % 4); // homes 15/31/47/63, all 15 at B=16
        for k in 0..12u64 {
            table.insert(hash(&k), k, k, |s| *s == k, hash, &ReplaceReducer);
        }

        table.rehash(16, hash);
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.downsizes, 1);
        assert_eq!(table.len(), 12);

        for k in 0..12u64 {
            assert_eq!(table.find(hash(&k), |s| *s == k), Some(&k));
        }
        check_invariants(&table, hash);

        // Runs stay sorted by home bucket after the block merge, and any
        // padding slot covered by the last run points at the run's end.
        let infos = table.info();
        let mut new_end = 0;
        for bid in 0..table.buckets {
            if is_occupied_info(infos[bid]) {
                new_end = bid + 1 + get_offset(infos[bid + 1]);
            }
        }
        for bid in table.buckets..new_end {
            assert_eq!(get_offset(infos[bid]), new_end - bid, "padding at {bid}");
            assert!(is_empty_info(infos[bid]));
        }
    }

    #[test]
    fn infeasible_downsize_is_abandoned() {
        // A 127-entry run and a 100-entry run that would merge into one
        // 227-entry run at half the size: the population fits, but the dry
        // run must reject the downsize over its offsets and leave the
        // table untouched.
        let mut table: HashTable<u64, u64> =
            HashTable::with_capacity_and_load_factors(512, 0.001, 0.999);
        let hash = |k: &u64| if *k < 127 { 0 } else { 256 };
        for k in 0..227u64 {
            let (_, inserted) = table.insert(hash(&k), k, k, |s| *s == k, hash, &ReplaceReducer);
            assert!(inserted);
        }

        assert_eq!(table.capacity(), 512);
        table.rehash(256, hash);
        assert_eq!(table.capacity(), 512, "infeasible downsize must not run");
        assert_eq!(table.downsizes, 0);
        for k in 0..227u64 {
            assert_eq!(table.find(hash(&k), |s| *s == k), Some(&k));
        }
        check_invariants(&table, hash);
    }

    #[test]
    fn feasible_downsize_at_the_cap() {
        // One 127-entry run survives a downsize: the merged offset maxes
        // out at exactly 126, which is allowed.
        let mut table: HashTable<u64, u64> =
            HashTable::with_capacity_and_load_factors(256, 0.001, 0.999);
        let hash = |_: &u64| 0u64;
        for k in 0..127u64 {
            table.insert(0, k, k, |s| *s == k, hash, &ReplaceReducer);
        }

        table.rehash(128, hash);
        assert_eq!(table.capacity(), 128);
        assert_eq!(table.downsizes, 1);
        for k in 0..127u64 {
            assert_eq!(table.find(0, |s| *s == k), Some(&k));
        }
        check_invariants(&table, hash);
    }

    #[test]
    fn update_touches_existing_only() {
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
        table.insert(5, 9, 1, |s| *s == 9, |_| 5, &ReplaceReducer);

        assert!(table.update(5, 4, |s| *s == 9, &Add));
        assert_eq!(table.find(5, |s| *s == 9), Some(&5));

        assert!(!table.update(6, 4, |s| *s == 10, &Add));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(6, |s| *s == 10), None);
    }

    #[test]
    fn iter_yields_each_entry_once() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(32);
        for k in 10..30u64 {
            table.insert(state.hash(k), k, k + 1, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        let mut seen: Vec<u64> = table.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (10..30).collect();
        assert_eq!(seen, expected);
        assert_eq!(table.iter().len(), 20);
        for (k, v) in table.iter() {
            assert_eq!(*v, *k + 1);
        }
    }

    #[test]
    fn clone_is_independent() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);
        for k in 0..12u64 {
            table.insert(state.hash(k), k, k, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        let snapshot = table.clone();
        table.erase(state.hash(3), |s| *s == 3);

        assert_eq!(snapshot.len(), 12);
        assert_eq!(snapshot.find(state.hash(3), |s| *s == 3), Some(&3));
        assert_eq!(table.find(state.hash(3), |s| *s == 3), None);
    }

    #[test]
    fn insert_batch_all_phases() {
        // Large enough that the driver runs its far-prefetch stretch, the
        // near-window stretch, and the tail.
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);

        let input: Vec<(u64, u64)> = (0..5000u64).map(|k| (k, k * 2)).collect();
        let hashes: Vec<u64> = input.iter().map(|(k, _)| state.hash(*k)).collect();

        table.insert_batch(&input, &hashes, |a, b| a == b, |s| state.hash(*s), &ReplaceReducer);

        assert_eq!(table.len(), 5000);
        for k in (0..5000u64).step_by(97) {
            assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&(k * 2)));
        }
        check_invariants(&table, |k| state.hash(*k));
    }

    #[test]
    fn insert_batch_reduces_duplicates() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);

        // Every key appears five times with value 1; Add turns the table
        // into a counter.
        let input: Vec<(u64, u64)> = (0..500u64).map(|i| (i % 100, 1)).collect();
        let hashes: Vec<u64> = input.iter().map(|(k, _)| state.hash(*k)).collect();

        table.insert_batch(&input, &hashes, |a, b| a == b, |s| state.hash(*s), &Add);

        assert_eq!(table.len(), 100);
        for k in 0..100u64 {
            assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&5));
        }
    }

    #[test]
    fn insert_batch_small_inputs() {
        // Shorter than one window, shorter than two: only the tail loops
        // run.
        let state = HashState::default();
        for n in [0usize, 1, 7, LOOK_AHEAD, 2 * LOOK_AHEAD - 1] {
            let mut table: HashTable<u64, u64> = HashTable::with_capacity(8);
            let input: Vec<(u64, u64)> = (0..n as u64).map(|k| (k, k)).collect();
            let hashes: Vec<u64> = input.iter().map(|(k, _)| state.hash(*k)).collect();
            table.insert_batch(&input, &hashes, |a, b| a == b, |s| state.hash(*s), &ReplaceReducer);
            assert_eq!(table.len(), n);
            for k in 0..n as u64 {
                assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&k));
            }
        }
    }

    #[test]
    fn find_and_count_batches() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);
        let input: Vec<(u64, u64)> = (0..1000u64).map(|k| (k, k + 7)).collect();
        let hashes: Vec<u64> = input.iter().map(|(k, _)| state.hash(*k)).collect();
        table.insert_batch(&input, &hashes, |a, b| a == b, |s| state.hash(*s), &ReplaceReducer);

        // Every other probe misses.
        let probes: Vec<u64> = (0..2000u64).collect();
        let mut found = Vec::new();
        let hits = table.find_batch(&probes, &mut found, |k| state.hash(*k), |a, b| a == b);
        assert_eq!(hits, 1000);
        assert_eq!(found.len(), 1000);
        for (k, v) in found {
            assert_eq!(v, k + 7);
        }

        let mut counts = Vec::new();
        let total = table.count_batch(&probes, &mut counts, |k| state.hash(*k), |a, b| a == b);
        assert_eq!(total, 1000);
        assert_eq!(counts.len(), 2000);
        for (k, c) in probes.iter().zip(counts.iter()) {
            assert_eq!(*c, (*k < 1000) as u8, "count for key {k}");
        }
    }

    #[test]
    fn erase_batch_removes_and_reports() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(16);
        let input: Vec<(u64, u64)> = (0..1000u64).map(|k| (k, k)).collect();
        let hashes: Vec<u64> = input.iter().map(|(k, _)| state.hash(*k)).collect();
        table.insert_batch(&input, &hashes, |a, b| a == b, |s| state.hash(*s), &ReplaceReducer);

        // Half the probes hit, and hitting twice erases once.
        let victims: Vec<u64> = (500..1500u64).chain(500..600u64).collect();
        let erased = table.erase_batch(&victims, |k| state.hash(*k), |a, b| a == b);
        assert_eq!(erased, 500);
        assert_eq!(table.len(), 500);

        for k in 0..500u64 {
            assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&k));
        }
        for k in 500..1000u64 {
            assert_eq!(table.find(state.hash(k), |s| *s == k), None);
        }
        check_invariants(&table, |k| state.hash(*k));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many_random_hashes() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);
        for k in 0..100_000u64 {
            table.insert(state.hash(k), k, k, |s| *s == k, |s| state.hash(*s), &ReplaceReducer);
        }

        assert_eq!(table.len(), 100_000);
        for k in 0..100_000u64 {
            assert_eq!(table.find(state.hash(k), |s| *s == k), Some(&k), "{table:?}");
        }
        check_invariants(&table, |k| state.hash(*k));
    }
}
