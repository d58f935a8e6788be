//! A [quotient filter](https://en.wikipedia.org/wiki/Quotient_filter): a compact
//! probabilistic set that answers "have I seen this key?" with no false negatives
//! and a bounded false-positive rate.
//!
//! Compared to a bloom filter of equal false-positive rate a quotient filter uses
//! slightly more space but computes a single hash per operation, stores hashes in
//! cache-friendly contiguous slots, and supports deletion of previously added keys.
//!
//! ### Example
//!
//! ```rust
//! let mut f = quotient_filter::Filter::with_capacity_and_fp(1000, 0.01).unwrap();
//! for i in 0..1000u64 {
//!     f.add(i).unwrap();
//! }
//! for i in 0..1000u64 {
//!     assert!(f.contains(i));
//! }
//! ```
//!
//! ### Hasher
//!
//! Keys are hashed through a pluggable [`BuildHasher`]; the default is
//! [FNV-1a](https://crates.io/crates/fnv), which is stable across platforms and
//! fast for the short keys filters typically see. Only the low `q + r` bits of
//! the 64-bit hash are used, so two keys agreeing on those bits are
//! indistinguishable to the filter; that is the source of false positives.
//!
//! ### Layout
//!
//! The filter stores `2^q` slots of `r + 3` bits each, bit-packed into a flat
//! array of 64-bit words. Each slot holds an `r`-bit hash remainder plus the
//! three metadata bits (`occupied`, `continuation`, `shifted`) that make
//! collision resolution by linear probing reversible.

use std::{
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    num::NonZeroU8,
};

use fnv::FnvBuildHasher;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const META_BITS: u8 = 3;
const META_MASK: u64 = 0b111;
const OCCUPIED: u64 = 0b001;
const CONTINUATION: u64 = 0b010;
const SHIFTED: u64 = 0b100;

/// Error returned by the fallible filter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The filter is at capacity and cannot admit another fingerprint.
    Full,
    /// The quotient/remainder bit widths are zero, exceed 64 bits combined,
    /// or produce a slot wider than one word.
    BadParameters,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

/// One logical slot: an `r`-bit remainder over the low three metadata bits.
///
/// A slot is empty iff all three metadata bits are clear; the remainder is
/// meaningless in that case and kept zero by convention.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Slot(u64);

impl Slot {
    const EMPTY: Slot = Slot(0);

    #[inline]
    fn new(remainder: u64) -> Self {
        Slot(remainder << META_BITS)
    }

    #[inline]
    fn remainder(self) -> u64 {
        self.0 >> META_BITS
    }

    #[inline]
    fn is_empty(self) -> bool {
        self.0 & META_MASK == 0
    }

    #[inline]
    fn is_occupied(self) -> bool {
        self.0 & OCCUPIED != 0
    }

    #[inline]
    fn set_occupied(self) -> Self {
        Slot(self.0 | OCCUPIED)
    }

    #[inline]
    fn clear_occupied(self) -> Self {
        Slot(self.0 & !OCCUPIED)
    }

    #[inline]
    fn is_continuation(self) -> bool {
        self.0 & CONTINUATION != 0
    }

    #[inline]
    fn set_continuation(self) -> Self {
        Slot(self.0 | CONTINUATION)
    }

    #[inline]
    fn clear_continuation(self) -> Self {
        Slot(self.0 & !CONTINUATION)
    }

    #[inline]
    fn is_shifted(self) -> bool {
        self.0 & SHIFTED != 0
    }

    #[inline]
    fn set_shifted(self) -> Self {
        Slot(self.0 | SHIFTED)
    }

    #[inline]
    fn clear_shifted(self) -> Self {
        Slot(self.0 & !SHIFTED)
    }

    /// First slot of a cluster: in its canonical position and heading its own run.
    #[inline]
    fn is_cluster_start(self) -> bool {
        self.is_occupied() && !self.is_continuation() && !self.is_shifted()
    }

    /// First slot of a run, whether canonical or displaced.
    #[inline]
    fn is_run_start(self) -> bool {
        !self.is_continuation() && (self.is_occupied() || self.is_shifted())
    }
}

/// Mask selecting the low `bits` bits of a word.
#[inline]
fn mask_lower(bits: u8) -> u64 {
    !u64::MAX.checked_shl(u32::from(bits)).unwrap_or(0)
}

/// A quotient filter with `2^q` slots storing `r`-bit remainders.
///
/// The low `q + r` bits of a key's hash form its fingerprint; the filter
/// stores fingerprints exactly, so `contains` never reports a false negative
/// and reports a false positive only when two keys collide on their entire
/// fingerprint. The expected false-positive rate at fill rate `a` is
/// `1 - e^(-a / 2^r)`, bounded above by `2^-r`.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(bound(serialize = "", deserialize = "S: Default"))
)]
pub struct Filter<S = FnvBuildHasher> {
    #[cfg_attr(feature = "serde", serde(rename = "b"))]
    data: Box<[u64]>,
    #[cfg_attr(feature = "serde", serde(rename = "l"))]
    len: u64,
    #[cfg_attr(feature = "serde", serde(rename = "q"))]
    qbits: NonZeroU8,
    #[cfg_attr(feature = "serde", serde(rename = "r"))]
    rbits: NonZeroU8,
    #[cfg_attr(feature = "serde", serde(skip))]
    hash_builder: S,
}

impl Filter {
    /// Creates an empty filter with `2^q` slots of `r` remainder bits,
    /// hashing keys with FNV-1a.
    ///
    /// Errors with [`Error::BadParameters`] unless `1 <= q`, `1 <= r`,
    /// `q + r <= 64` and `r <= 61` (a slot must fit one 64-bit word).
    pub fn new(q: u8, r: u8) -> Result<Self, Error> {
        Self::with_hasher(FnvBuildHasher::default(), q, r)
    }

    /// Creates a filter able to hold `capacity` keys while keeping the
    /// false-positive rate at or below `fp_probability`.
    ///
    /// The slot count is doubled relative to `capacity` so the fill rate stays
    /// at or below 0.5 at the nominal load, which preserves the advertised rate.
    pub fn with_capacity_and_fp(capacity: u64, fp_probability: f64) -> Result<Self, Error> {
        if capacity == 0 || !(fp_probability > 0.0 && fp_probability < 1.0) {
            return Err(Error::BadParameters);
        }
        let q = (capacity as f64 * 2.0).log2().ceil() as u8;
        let r = (-fp_probability.log2()).ceil().max(1.0) as u8;
        Self::new(q, r)
    }
}

impl<S: BuildHasher> Filter<S> {
    /// Creates an empty filter like [`Filter::new`], hashing keys with
    /// `hash_builder` instead of the default FNV-1a.
    pub fn with_hasher(hash_builder: S, q: u8, r: u8) -> Result<Self, Error> {
        let qbits = NonZeroU8::new(q).ok_or(Error::BadParameters)?;
        let rbits = NonZeroU8::new(r).ok_or(Error::BadParameters)?;
        if u16::from(q) + u16::from(r) > 64 || r > 64 - META_BITS {
            return Err(Error::BadParameters);
        }
        let capacity = 1u64 << q;
        let bits = u128::from(capacity) * u128::from(u32::from(r) + u32::from(META_BITS));
        let words = usize::try_from(bits.div_ceil(64)).map_err(|_| Error::BadParameters)?;
        Ok(Self {
            data: vec![0u64; words].into_boxed_slice(),
            len: 0,
            qbits,
            rbits,
            hash_builder,
        })
    }

    /// Number of distinct fingerprints currently stored.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the filter holds no fingerprints.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot count, `2^q`. [`add`](Self::add) fails once `len == capacity`.
    #[inline]
    pub fn capacity(&self) -> u64 {
        1 << self.qbits.get()
    }

    /// Resets the filter to its freshly constructed state.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    /// Expected false-positive probability at the current fill rate:
    /// `1 - e^(-(len/capacity) / 2^r)`.
    ///
    /// Zero when empty, monotonically non-decreasing under `add`, and below
    /// `2^-r` whenever the filter is at most half full.
    pub fn fp_estimate(&self) -> f64 {
        let fill = self.len as f64 / self.capacity() as f64;
        1.0 - std::f64::consts::E.powf(-fill / 2f64.powi(i32::from(self.rbits.get())))
    }

    /// Returns whether `key` is present (probabilistically) in the filter.
    ///
    /// `false` is always exact; `true` may be a false positive with
    /// probability [`fp_estimate`](Self::fp_estimate).
    pub fn contains<T: Hash>(&self, key: T) -> bool {
        let (quotient, remainder) = self.quotient_and_remainder(self.hash(key));
        if !self.get_slot(quotient).is_occupied() {
            return false;
        }
        let mut index = self.find_run(quotient);
        let mut slot = self.get_slot(index);
        loop {
            if slot.remainder() == remainder {
                return true;
            }
            if slot.remainder() > remainder {
                // remainders are sorted within a run
                return false;
            }
            index = self.next_index(index);
            slot = self.get_slot(index);
            if !slot.is_continuation() {
                return false;
            }
        }
    }

    /// Adds `key` to the filter.
    ///
    /// Returns `Ok(true)` if a new fingerprint was admitted and `Ok(false)`
    /// if the fingerprint was already present. Errors with [`Error::Full`]
    /// when every slot is in use, including for keys already present.
    pub fn add<T: Hash>(&mut self, key: T) -> Result<bool, Error> {
        if self.len >= self.capacity() {
            return Err(Error::Full);
        }
        let (quotient, remainder) = self.quotient_and_remainder(self.hash(key));
        let canonical = self.get_slot(quotient);
        let mut new = Slot::new(remainder);

        if canonical.is_empty() {
            self.set_slot(quotient, new.set_occupied());
            self.len += 1;
            return Ok(true);
        }
        if !canonical.is_occupied() {
            // the run for this quotient does not exist yet; announce it
            self.set_slot(quotient, canonical.set_occupied());
        }

        let start = self.find_run(quotient);
        let mut index = start;
        if canonical.is_occupied() {
            // The run already exists: seek the sorted insertion point.
            let mut slot = self.get_slot(index);
            loop {
                if slot.remainder() == remainder {
                    return Ok(false);
                }
                if slot.remainder() > remainder {
                    break;
                }
                index = self.next_index(index);
                slot = self.get_slot(index);
                if !slot.is_continuation() {
                    break;
                }
            }
            if index == start {
                // new smallest remainder: the old head now continues the run
                let head = self.get_slot(start);
                self.set_slot(start, head.set_continuation());
            } else {
                new = new.set_continuation();
            }
        }
        if index != quotient {
            new = new.set_shifted();
        }
        self.insert_slot(index, new);
        self.len += 1;
        Ok(true)
    }

    /// Adds every key yielded by `keys`, stopping at the first error.
    ///
    /// Keys added before the failure remain in the filter.
    pub fn add_all<T, I>(&mut self, keys: I) -> Result<(), Error>
    where
        T: Hash,
        I: IntoIterator<Item = T>,
    {
        for key in keys {
            self.add(key)?;
        }
        Ok(())
    }

    /// Removes `key` from the filter. Returns whether a matching fingerprint
    /// was found and removed.
    ///
    /// Removal is exact only when the hasher's effective output is `q + r`
    /// bits: with a wider hash, two distinct keys can share a fingerprint,
    /// and removing one introduces a **false negative** for the other.
    pub fn remove<T: Hash>(&mut self, key: T) -> bool {
        let (quotient, remainder) = self.quotient_and_remainder(self.hash(key));
        if !self.get_slot(quotient).is_occupied() {
            return false;
        }
        let start = self.find_run(quotient);
        let mut index = start;
        let mut slot = self.get_slot(index);
        loop {
            if slot.remainder() == remainder {
                break;
            }
            if slot.remainder() > remainder {
                return false;
            }
            index = self.next_index(index);
            slot = self.get_slot(index);
            if !slot.is_continuation() {
                return false;
            }
        }

        let was_head = !slot.is_continuation();
        if was_head && !self.get_slot(self.next_index(index)).is_continuation() {
            // sole remainder of its run: the run dies with it
            let canonical = self.get_slot(quotient);
            self.set_slot(quotient, canonical.clear_occupied());
        }

        self.shift_cluster_left(index, quotient);

        if was_head {
            let moved = self.get_slot(index);
            let mut fixed = moved;
            if moved.is_continuation() {
                // the next remainder of the run is promoted to run head
                fixed = fixed.clear_continuation();
            }
            if index == quotient && fixed.is_run_start() {
                // the promoted head sits in its canonical slot
                fixed = fixed.clear_shifted();
            }
            if fixed != moved {
                self.set_slot(index, fixed);
            }
        }
        self.len -= 1;
        true
    }

    /// Returns an iterator over the `(quotient << r) | remainder` fingerprints
    /// stored in the filter, in slot order.
    pub fn fingerprints(&self) -> Fingerprints<'_, S> {
        Fingerprints::new(self)
    }

    #[inline]
    fn hash<T: Hash>(&self, key: T) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn quotient_and_remainder(&self, hash: u64) -> (u64, u64) {
        (
            (hash >> self.rbits.get()) & self.q_mask(),
            hash & self.r_mask(),
        )
    }

    #[inline]
    fn q_mask(&self) -> u64 {
        mask_lower(self.qbits.get())
    }

    #[inline]
    fn r_mask(&self) -> u64 {
        mask_lower(self.rbits.get())
    }

    #[inline]
    fn slot_mask(&self) -> u64 {
        mask_lower(self.rbits.get() + META_BITS)
    }

    #[inline]
    fn slot_bits(&self) -> u32 {
        u32::from(self.rbits.get()) + u32::from(META_BITS)
    }

    #[inline]
    fn next_index(&self, index: u64) -> u64 {
        (index + 1) & self.q_mask()
    }

    #[inline]
    fn prev_index(&self, index: u64) -> u64 {
        index.wrapping_sub(1) & self.q_mask()
    }

    /// Reads the slot at `index`, reassembling it if it straddles two words.
    #[inline]
    fn get_slot(&self, index: u64) -> Slot {
        let slot_bits = self.slot_bits();
        let bit_index = index * u64::from(slot_bits);
        let word = (bit_index / 64) as usize;
        let offset = (bit_index % 64) as u32;
        let mut raw = (self.data[word] >> offset) & self.slot_mask();
        let spill = (offset + slot_bits).saturating_sub(64);
        if spill > 0 {
            raw |= (self.data[word + 1] & mask_lower(spill as u8)) << (slot_bits - spill);
        }
        Slot(raw)
    }

    /// Writes the slot at `index` without touching any neighboring bits.
    #[inline]
    fn set_slot(&mut self, index: u64, slot: Slot) {
        let slot_bits = self.slot_bits();
        let raw = slot.0 & self.slot_mask();
        let bit_index = index * u64::from(slot_bits);
        let word = (bit_index / 64) as usize;
        let offset = (bit_index % 64) as u32;
        self.data[word] &= !(self.slot_mask() << offset);
        self.data[word] |= raw << offset;
        let spill = (offset + slot_bits).saturating_sub(64);
        if spill > 0 {
            self.data[word + 1] &= !mask_lower(spill as u8);
            self.data[word + 1] |= raw >> (slot_bits - spill);
        }
    }

    /// Finds the first slot of the run belonging to `quotient`.
    ///
    /// Requires `is_occupied` to hold for `quotient`'s canonical slot.
    fn find_run(&self, quotient: u64) -> u64 {
        let mut index = quotient;
        while self.get_slot(index).is_shifted() {
            index = self.prev_index(index);
        }
        // `index` is now the cluster start. Occupied markers and runs appear
        // in the same order within a cluster, so advancing one run per marker
        // lands on the run announced by `quotient`.
        let mut run = index;
        while index != quotient {
            loop {
                run = self.next_index(run);
                if !self.get_slot(run).is_continuation() {
                    break;
                }
            }
            loop {
                index = self.next_index(index);
                if self.get_slot(index).is_occupied() {
                    break;
                }
            }
        }
        run
    }

    /// Threads `new` into position `index`, shifting the residents of the
    /// cluster right until an empty slot absorbs the cascade.
    ///
    /// Requires at least one empty slot in the filter.
    fn insert_slot(&mut self, mut index: u64, new: Slot) {
        let mut current = new;
        loop {
            let mut previous = self.get_slot(index);
            let was_empty = previous.is_empty();
            if !was_empty {
                previous = previous.set_shifted();
                if previous.is_occupied() {
                    // the occupied marker belongs to the position, not the
                    // remainder passing through it
                    previous = previous.clear_occupied();
                    current = current.set_occupied();
                }
            }
            self.set_slot(index, current);
            if was_empty {
                return;
            }
            current = previous;
            index = self.next_index(index);
        }
    }

    /// Slides the cluster tail one slot left over the vacated `index`,
    /// stopping at an empty slot or the start of the next cluster.
    ///
    /// `quotient` is the canonical quotient of the run the victim belonged
    /// to; it seeds the marker pairing that detects run heads landing back
    /// in their canonical slots.
    fn shift_cluster_left(&mut self, mut index: u64, mut quotient: u64) {
        let vacated = index;
        let mut current = self.get_slot(index);
        let mut source = self.next_index(index);
        loop {
            let next = self.get_slot(source);
            if next.is_empty() || next.is_cluster_start() || source == vacated {
                self.set_slot(index, Slot::EMPTY);
                return;
            }
            let mut moved = next;
            if next.is_run_start() {
                // a run head is sliding; track which quotient owns it
                loop {
                    quotient = self.next_index(quotient);
                    if self.get_slot(quotient).is_occupied() {
                        break;
                    }
                }
                if current.is_occupied() && quotient == index {
                    moved = moved.clear_shifted();
                }
            }
            // the occupied marker is positional and stays behind
            moved = if current.is_occupied() {
                moved.set_occupied()
            } else {
                moved.clear_occupied()
            };
            self.set_slot(index, moved);
            current = next;
            index = source;
            source = self.next_index(source);
        }
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn raw_slot(&self, index: u64) -> u64 {
        self.get_slot(index).0
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn set_raw_slot(&mut self, index: u64, raw: u64) {
        self.set_slot(index, Slot(raw));
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn dump(&self) {
        eprintln!(
            "=== q {} r {} len {} cap {} ===",
            self.qbits,
            self.rbits,
            self.len,
            self.capacity()
        );
        for i in 0..self.capacity() {
            let s = self.get_slot(i);
            eprintln!(
                "{i:5}: occ={} cont={} shift={} rem={}",
                u8::from(s.is_occupied()),
                u8::from(s.is_continuation()),
                u8::from(s.is_shifted()),
                s.remainder(),
            );
        }
        eprintln!("===");
    }

    /// Walks the whole table and asserts the structural invariants: empty
    /// slots are all-zero, unshifted slots head their own runs, clusters
    /// start unshifted, occupied markers map to distinct sorted runs, and
    /// `len` matches the non-empty slot count.
    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn check_invariants(&self) {
        use std::collections::HashSet;

        let cap = self.capacity();
        let mut non_empty = 0u64;
        for i in 0..cap {
            let slot = self.get_slot(i);
            if slot.is_empty() {
                assert_eq!(slot.0, 0, "empty slot {i} holds a stale remainder");
                continue;
            }
            non_empty += 1;
            if !slot.is_shifted() {
                assert!(
                    slot.is_occupied() && !slot.is_continuation(),
                    "slot {i} is unshifted but does not head its canonical run"
                );
            }
            if self.get_slot(self.prev_index(i)).is_empty() {
                assert!(
                    slot.is_cluster_start(),
                    "slot {i} follows an empty slot but is not a cluster start"
                );
            }
        }
        assert_eq!(non_empty, self.len, "len does not match non-empty slots");

        let mut heads = HashSet::new();
        for q in 0..cap {
            if !self.get_slot(q).is_occupied() {
                continue;
            }
            let start = self.find_run(q);
            assert!(heads.insert(start), "quotient {q} shares a run start");
            let mut index = start;
            let mut slot = self.get_slot(index);
            assert!(!slot.is_continuation(), "run of {q} starts mid-run");
            loop {
                let next = self.next_index(index);
                let next_slot = self.get_slot(next);
                if !next_slot.is_continuation() {
                    break;
                }
                assert!(
                    next_slot.remainder() > slot.remainder(),
                    "run of quotient {q} is not strictly ascending"
                );
                assert!(next_slot.is_shifted(), "continuation slot {next} unshifted");
                index = next;
                slot = next_slot;
            }
        }
    }
}

impl<S> fmt::Debug for Filter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("data", &"[..]")
            .field("len", &self.len)
            .field("qbits", &self.qbits)
            .field("rbits", &self.rbits)
            .finish()
    }
}

/// An iterator over the fingerprints of a [`Filter`], created by
/// [`Filter::fingerprints`].
///
/// Yields exactly [`Filter::len`] fingerprints, one per stored remainder, in
/// slot order. A cluster that wraps past the last slot is reported from its
/// true start, so the sequence is a rotation of ascending fingerprint order.
pub struct Fingerprints<'a, S = FnvBuildHasher> {
    filter: &'a Filter<S>,
    index: u64,
    quotient: u64,
    remaining: u64,
}

impl<'a, S: BuildHasher> Fingerprints<'a, S> {
    fn new(filter: &'a Filter<S>) -> Self {
        // Enter the cluster containing slot 0 at its start, so the quotient
        // tracking below is seeded correctly even when the cluster wraps.
        let mut index = 0;
        while filter.get_slot(index).is_shifted() {
            index = filter.prev_index(index);
        }
        Fingerprints {
            filter,
            index,
            quotient: index,
            remaining: filter.len,
        }
    }
}

impl<S: BuildHasher> Iterator for Fingerprints<'_, S> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.remaining = self.remaining.checked_sub(1)?;
        loop {
            let slot = self.filter.get_slot(self.index);
            if slot.is_cluster_start() {
                self.quotient = self.index;
            } else if slot.is_run_start() {
                // a new run within the same cluster: it belongs to the next
                // occupied marker
                loop {
                    self.quotient = self.filter.next_index(self.quotient);
                    if self.filter.get_slot(self.quotient).is_occupied() {
                        break;
                    }
                }
            }
            self.index = self.filter.next_index(self.index);
            if !slot.is_empty() {
                return Some((self.quotient << self.filter.rbits.get()) | slot.remainder());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::hash::{BuildHasherDefault, Hasher};

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Hashes a `u64` key to itself, so tests can place fingerprints exactly.
    #[derive(Clone, Default)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    type Identity = BuildHasherDefault<IdentityHasher>;

    fn identity_filter(q: u8, r: u8) -> Filter<Identity> {
        Filter::with_hasher(Identity::default(), q, r).unwrap()
    }

    #[test]
    fn bad_parameters() {
        assert_eq!(Filter::new(0, 8).unwrap_err(), Error::BadParameters);
        assert_eq!(Filter::new(8, 0).unwrap_err(), Error::BadParameters);
        assert_eq!(Filter::new(33, 32).unwrap_err(), Error::BadParameters);
        // a remainder plus its three metadata bits must fit one word
        assert_eq!(Filter::new(2, 62).unwrap_err(), Error::BadParameters);
        assert!(Filter::new(1, 61).is_ok());
        assert!(Filter::new(8, 3).is_ok());

        assert_eq!(
            Filter::with_capacity_and_fp(0, 0.01).unwrap_err(),
            Error::BadParameters
        );
        assert_eq!(
            Filter::with_capacity_and_fp(100, 0.0).unwrap_err(),
            Error::BadParameters
        );
        assert_eq!(
            Filter::with_capacity_and_fp(100, 1.0).unwrap_err(),
            Error::BadParameters
        );
    }

    #[test]
    fn index_arithmetic_wraps() {
        let f = Filter::new(4, 4).unwrap();
        assert_eq!(f.prev_index(0), 15);
        assert_eq!(f.next_index(15), 0);
    }

    #[test]
    fn add_and_contains_strings() {
        let mut f = Filter::new(8, 8).unwrap();
        for key in ["brown", "fox", "jump"] {
            assert!(f.add(key).unwrap());
        }
        assert_eq!(f.len(), 3);
        for key in ["brown", "fox", "jump"] {
            assert!(f.contains(key));
        }
        let misses = ["turbo", "negro", "quick", "lazy", "dog", "jumps", "over"];
        let false_positives = misses.iter().filter(|k| f.contains(k)).count();
        assert!(false_positives <= 1, "{false_positives} false positives");
        f.check_invariants();
    }

    #[test]
    fn small_remainder_still_has_no_false_negatives() {
        let mut f = Filter::new(8, 3).unwrap();
        f.add_all(["brown", "fox", "jump"]).unwrap();
        for key in ["brown", "fox", "jump"] {
            assert!(f.contains(key));
        }
        f.check_invariants();
    }

    #[test]
    fn duplicate_adds_are_suppressed() {
        let mut f = Filter::new(8, 3).unwrap();
        assert!(f.add("same-key").unwrap());
        for _ in 0..99 {
            assert!(!f.add("same-key").unwrap());
        }
        assert_eq!(f.len(), 1);
        assert!(f.contains("same-key"));
        f.check_invariants();
    }

    #[test]
    fn fills_to_capacity() {
        let mut f = identity_filter(4, 4);
        // one key per canonical slot
        for i in 0..16u64 {
            assert!(f.add((i << 4) | i).unwrap());
        }
        assert_eq!(f.len(), 16);
        assert_eq!(f.capacity(), 16);
        assert_eq!(f.add(255u64).unwrap_err(), Error::Full);
        // even a key already present is rejected once full
        assert_eq!(f.add((3u64 << 4) | 3).unwrap_err(), Error::Full);
        for i in 0..16u64 {
            assert!(f.contains((i << 4) | i));
        }
        f.check_invariants();
    }

    #[test]
    fn single_run_can_span_the_whole_table() {
        let mut f = identity_filter(4, 4);
        // sixteen remainders, all with quotient zero
        for i in 0..16u64 {
            assert!(f.add(i).unwrap());
        }
        assert_eq!(f.len(), 16);
        assert_eq!(f.add(16u64).unwrap_err(), Error::Full);
        for i in 0..16u64 {
            assert!(f.contains(i));
        }
        f.check_invariants();
    }

    #[test]
    fn colliding_quotients_keep_runs_sorted() {
        let mut f = identity_filter(8, 8);
        let quotient = 5u64;
        let remainders = [200u64, 9, 77, 3, 150];
        for &r in &remainders {
            assert!(f.add((quotient << 8) | r).unwrap());
        }
        assert_eq!(f.len(), 5);
        for &r in &remainders {
            assert!(f.contains((quotient << 8) | r));
            assert!(!f.contains((quotient << 8) | (r + 1)));
        }
        let mut expected: Vec<u64> = remainders.iter().map(|&r| (quotient << 8) | r).collect();
        expected.sort_unstable();
        let got: Vec<u64> = f.fingerprints().collect();
        assert_eq!(got, expected);
        f.check_invariants();
    }

    #[test]
    fn runs_share_a_cluster() {
        let mut f = identity_filter(8, 8);
        // three quotients landing back to back pile their runs into one cluster
        let keys = [
            (20u64 << 8) | 3,
            (20 << 8) | 7,
            (21 << 8) | 1,
            (22 << 8) | 2,
            (22 << 8) | 4,
            (22 << 8) | 9,
        ];
        for &k in &keys {
            assert!(f.add(k).unwrap());
        }
        for &k in &keys {
            assert!(f.contains(k));
        }
        assert!(!f.contains((21u64 << 8) | 2));
        assert!(!f.contains((23u64 << 8) | 1));
        let mut expected = keys.to_vec();
        expected.sort_unstable();
        let got: Vec<u64> = f.fingerprints().collect();
        assert_eq!(got, expected);
        f.check_invariants();
    }

    #[test]
    fn cluster_wraps_around_the_table() {
        let mut f = identity_filter(4, 4);
        // quotient 14's run spills past the last slot; 15 and 0 get pushed
        // around the wrap
        let keys = [
            (14u64 << 4) | 1,
            (14 << 4) | 2,
            (14 << 4) | 3,
            (15 << 4) | 5,
            8u64, // quotient 0
        ];
        for &k in &keys {
            assert!(f.add(k).unwrap());
        }
        for &k in &keys {
            assert!(f.contains(k));
        }
        assert!(!f.contains((15u64 << 4) | 6));
        let mut expected = keys.to_vec();
        expected.sort_unstable();
        let mut got: Vec<u64> = f.fingerprints().collect();
        got.sort_unstable();
        assert_eq!(got, expected);
        f.check_invariants();
    }

    #[test]
    fn fingerprints_roundtrip() {
        let mut f = Filter::new(10, 7).unwrap();
        let keys: Vec<String> = (0..400).map(|i| format!("item:s:{i}")).collect();
        for key in &keys {
            f.add(key).unwrap();
        }
        let prints: HashSet<u64> = f.fingerprints().collect();
        assert_eq!(prints.len() as u64, f.len());
        for key in &keys {
            let (q, r) = f.quotient_and_remainder(f.hash(key));
            assert!(prints.contains(&((q << 7) | r)));
        }
        f.check_invariants();
    }

    #[test]
    fn advertised_false_positive_rate_holds() {
        let mut f = Filter::with_capacity_and_fp(10_000, 0.01).unwrap();
        assert!(f.capacity() >= 20_000);
        for i in 0..5_000 {
            f.add(format!("item:s:{i}")).unwrap();
        }
        for i in 0..5_000 {
            assert!(f.contains(format!("item:s:{i}")));
        }
        let false_positives = (0..5_000)
            .filter(|i| f.contains(format!("item:t:{i}")))
            .count();
        assert!(false_positives <= 100, "{false_positives} false positives");
    }

    #[test]
    fn fp_estimate_tracks_fill_rate() {
        let mut f = Filter::new(8, 6).unwrap();
        assert_eq!(f.fp_estimate(), 0.0);
        let mut last = 0.0;
        for i in 0..128u64 {
            f.add(i).unwrap();
            let est = f.fp_estimate();
            assert!(est >= last);
            last = est;
        }
        assert!(last > 0.0);
        // at most half full, so the estimate stays under 2^-r
        assert!(f.len() <= f.capacity() / 2);
        assert!(last < 2f64.powi(-6));
    }

    #[test]
    fn add_all_applies_prefix_before_failing() {
        let mut f = identity_filter(3, 4);
        // twelve distinct fingerprints into eight slots
        assert_eq!(f.add_all(0..12u64).unwrap_err(), Error::Full);
        assert_eq!(f.len(), 8);
        for i in 0..8u64 {
            assert!(f.contains(i));
        }
        f.check_invariants();
    }

    #[test]
    fn clear_resets_the_filter() {
        let mut f = Filter::new(8, 4).unwrap();
        for i in 0..50u64 {
            f.add(i).unwrap();
        }
        f.clear();
        assert!(f.is_empty());
        assert_eq!(f.fp_estimate(), 0.0);
        assert!(!f.contains(0u64));
        f.add(1u64).unwrap();
        assert!(f.contains(1u64));
        f.check_invariants();
    }

    #[test]
    fn remove_head_promotes_next_in_run() {
        let mut f = identity_filter(8, 8);
        let keys = [(9u64 << 8) | 4, (9 << 8) | 8, (9 << 8) | 12];
        for &k in &keys {
            f.add(k).unwrap();
        }
        assert!(f.remove((9u64 << 8) | 4));
        f.check_invariants();
        assert!(!f.contains((9u64 << 8) | 4));
        assert!(f.contains((9u64 << 8) | 8));
        assert!(f.contains((9u64 << 8) | 12));
        assert_eq!(f.len(), 2);
        assert!(!f.remove((9u64 << 8) | 4));
    }

    #[test]
    fn remove_sole_element_clears_run() {
        let mut f = identity_filter(8, 8);
        f.add((9u64 << 8) | 4).unwrap();
        assert!(f.remove((9u64 << 8) | 4));
        assert!(f.is_empty());
        assert!(!f.contains((9u64 << 8) | 4));
        assert_eq!(f.raw_slot(9), 0);
        f.check_invariants();
    }

    #[test]
    fn remove_collapses_cluster() {
        let mut f = identity_filter(8, 8);
        // one cluster: run 30 = {1, 2}, run 31 = {7}, run 32 = {5}
        let keys = [
            (30u64 << 8) | 1,
            (30 << 8) | 2,
            (31 << 8) | 7,
            (32 << 8) | 5,
        ];
        for &k in &keys {
            f.add(k).unwrap();
        }
        // removing from the first run slides the later runs home
        assert!(f.remove((30u64 << 8) | 1));
        f.check_invariants();
        assert!(f.contains((30u64 << 8) | 2));
        assert!(f.contains((31u64 << 8) | 7));
        assert!(f.contains((32u64 << 8) | 5));

        assert!(f.remove((30u64 << 8) | 2));
        f.check_invariants();
        assert!(f.contains((31u64 << 8) | 7));
        assert!(f.contains((32u64 << 8) | 5));
        assert_eq!(f.len(), 2);
        assert_eq!(f.raw_slot(30), 0);
    }

    #[test]
    fn remove_across_the_wrap() {
        let mut f = identity_filter(4, 4);
        let keys = [(14u64 << 4) | 1, (14 << 4) | 2, (15 << 4) | 5, 8u64];
        for &k in &keys {
            f.add(k).unwrap();
        }
        // run 14 sits at 14..=15; run 15 wraps to slot 0; run 0 is pushed to 1
        assert!(f.remove((14u64 << 4) | 1));
        f.check_invariants();
        assert!(f.contains((14u64 << 4) | 2));
        assert!(f.contains((15u64 << 4) | 5));
        assert!(f.contains(8u64));

        assert!(f.remove((15u64 << 4) | 5));
        f.check_invariants();
        assert!(f.contains((14u64 << 4) | 2));
        assert!(f.contains(8u64));
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn randomized_adds_and_removes_match_exact_set() {
        // 16-bit keys against 16-bit fingerprints: membership is exact and
        // the model predicts every answer
        let mut rng = StdRng::seed_from_u64(0x51CE95);
        let mut f = identity_filter(10, 6);
        let mut model: HashSet<u64> = HashSet::new();
        for i in 0..6_000u32 {
            let key = u64::from(rng.random::<u16>());
            if rng.random::<bool>() && model.len() < 512 {
                let added = f.add(key).unwrap();
                assert_eq!(added, model.insert(key));
            } else {
                let removed = f.remove(key);
                assert_eq!(removed, model.remove(&key));
            }
            assert_eq!(f.len() as usize, model.len());
            if i % 256 == 0 {
                f.check_invariants();
                for &k in &model {
                    assert!(f.contains(k));
                }
            }
        }
        f.check_invariants();
    }

    #[test]
    fn no_false_negatives_random_keys() {
        let mut rng = StdRng::seed_from_u64(0xDECAF);
        let mut f = Filter::with_capacity_and_fp(2_000, 0.01).unwrap();
        let keys: Vec<u64> = (0..1_000).map(|_| rng.random()).collect();
        for &k in &keys {
            f.add(k).unwrap();
        }
        for &k in &keys {
            assert!(f.contains(k));
        }
        f.check_invariants();
    }

    #[test]
    fn slot_packing_matches_reference() {
        let mut rng = StdRng::seed_from_u64(7);
        for rbits in [1u8, 2, 3, 5, 8, 13, 21, 29, 37, 45, 53, 58] {
            let mut f = Filter::new(6, rbits).unwrap();
            let cap = f.capacity();
            let slot_mask = mask_lower(rbits + META_BITS);
            let mut reference = vec![0u64; cap as usize];
            for _ in 0..512 {
                let index = rng.random_range(0..cap);
                let value = rng.random::<u64>() & slot_mask;
                f.set_raw_slot(index, value);
                reference[index as usize] = value;
                let probe = rng.random_range(0..cap);
                assert_eq!(
                    f.raw_slot(probe),
                    reference[probe as usize],
                    "rbits={rbits} probe={probe}"
                );
            }
            for i in 0..cap {
                assert_eq!(f.raw_slot(i), reference[i as usize], "rbits={rbits} slot={i}");
            }
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_roundtrip() {
        let mut f = Filter::new(10, 7).unwrap();
        for i in 0..300u64 {
            f.add(i).unwrap();
        }
        let encoded = serde_json::to_string(&f).unwrap();
        let decoded: Filter = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.len(), f.len());
        for i in 0..300u64 {
            assert!(decoded.contains(i));
        }
        decoded.check_invariants();
    }
}
