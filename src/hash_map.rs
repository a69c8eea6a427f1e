use alloc::vec::Vec;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;

use crate::cardinality::CardinalityEstimator;
use crate::hash_table::HashTable;
use crate::reduce::Reducer;
use crate::reduce::ReplaceReducer;
use crate::DefaultHashBuilder;

/// A keyed map over the bucket-offset [`HashTable`].
///
/// `HashMap<K, V, S, R>` stores `Copy` key-value pairs, hashing keys with a
/// configurable hasher builder `S` and resolving duplicate insertions of a
/// key through the reducer `R`. By default keys are hashed with
/// [`foldhash`]'s fixed-seed fast hasher and duplicates replace the
/// resident value.
///
/// The map owns a resident [`CardinalityEstimator`]. Every insertion feeds
/// it, and [`insert_batch`] sketches the incoming batch, merges the two,
/// and reserves capacity for the estimated union once up front — for large
/// batches with a known-ish repeat rate the hot loop then never rehashes.
///
/// # Examples
///
/// ```rust
/// use offset_hash::HashMap;
///
/// let mut map: HashMap<u64, u32> = HashMap::new();
/// map.insert(17, 1);
/// map.insert(17, 2);
///
/// // The default reducer replaces the resident value.
/// assert_eq!(map.find(&17), Some(&2));
/// assert_eq!(map.len(), 1);
/// ```
///
/// [`insert_batch`]: HashMap::insert_batch
pub struct HashMap<K, V, S = DefaultHashBuilder, R = ReplaceReducer> {
    table: HashTable<K, V>,
    hash_builder: S,
    reducer: R,
    estimator: CardinalityEstimator,
}

impl<K, V, S, R> Clone for HashMap<K, V, S, R>
where
    K: Copy,
    V: Copy,
    S: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            hash_builder: self.hash_builder.clone(),
            reducer: self.reducer.clone(),
            estimator: self.estimator.clone(),
        }
    }
}

impl<K, V, S, R> Debug for HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq + Debug,
    V: Copy + Debug,
    S: BuildHasher,
    R: Reducer<V>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}

impl<K, V, S, R> HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher + Default,
    R: Reducer<V> + Default,
{
    /// Creates an empty map with a default capacity of 128 entries.
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    /// Creates an empty map with at least the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_parts(
            capacity,
            0.4,
            0.9,
            S::default(),
            R::default(),
        )
    }

    /// Creates an empty map with the specified capacity and load factors.
    ///
    /// The map downsizes on erase when its population falls below
    /// `min_load_factor * capacity()` and upsizes when insertion reaches
    /// `max_load_factor * capacity()`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min_load_factor < max_load_factor < 1`.
    pub fn with_capacity_and_load_factors(
        capacity: usize,
        min_load_factor: f64,
        max_load_factor: f64,
    ) -> Self {
        Self::with_parts(
            capacity,
            min_load_factor,
            max_load_factor,
            S::default(),
            R::default(),
        )
    }
}

impl<K, V, S, R> HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher + Default,
    R: Reducer<V>,
{
    /// Creates an empty map with the given reducer and a default hasher.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use offset_hash::DefaultHashBuilder;
    /// use offset_hash::HashMap;
    /// use offset_hash::Reducer;
    ///
    /// #[derive(Clone, Copy, Default)]
    /// struct Max;
    ///
    /// impl Reducer<u32> for Max {
    ///     fn reduce(&self, existing: u32, incoming: u32) -> u32 {
    ///         existing.max(incoming)
    ///     }
    /// }
    ///
    /// let mut map: HashMap<u64, u32, DefaultHashBuilder, Max> = HashMap::with_reducer(Max);
    /// map.insert(1, 5);
    /// map.insert(1, 3);
    /// assert_eq!(map.find(&1), Some(&5));
    /// ```
    pub fn with_reducer(reducer: R) -> Self {
        Self::with_parts(128, 0.4, 0.9, S::default(), reducer)
    }
}

impl<K, V, S, R> HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher,
    R: Reducer<V> + Default,
{
    /// Creates an empty map with the given hasher builder.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_parts(128, 0.4, 0.9, hash_builder, R::default())
    }

    /// Creates an empty map with the specified capacity and hasher builder.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::with_parts(capacity, 0.4, 0.9, hash_builder, R::default())
    }
}

impl<K, V, S, R> HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher,
    R: Reducer<V>,
{
    /// Creates an empty map from all of its parts.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min_load_factor < max_load_factor < 1`.
    pub fn with_parts(
        capacity: usize,
        min_load_factor: f64,
        max_load_factor: f64,
        hash_builder: S,
        reducer: R,
    ) -> Self {
        Self {
            table: HashTable::with_capacity_and_load_factors(
                capacity,
                min_load_factor,
                max_load_factor,
            ),
            hash_builder,
            reducer,
            estimator: CardinalityEstimator::new(),
        }
    }

    #[inline(always)]
    fn hash_key(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of buckets.
    ///
    /// The map holds at most `max_load_factor * capacity()` entries before
    /// resizing.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the current load factor, `len() / capacity()`.
    pub fn load_factor(&self) -> f64 {
        self.table.load_factor()
    }

    /// Removes all entries, preserving the allocated capacity.
    ///
    /// The resident cardinality estimator is reset along with the table so
    /// later batch insertions are not pre-sized for keys that are gone.
    pub fn clear(&mut self) {
        self.table.clear();
        self.estimator.clear();
    }

    /// Returns the resident estimate of the number of distinct keys ever
    /// fed to the map since the last [`clear`].
    ///
    /// This tracks insertions, not erasures: erased keys still count.
    ///
    /// [`clear`]: HashMap::clear
    pub fn cardinality_estimate(&self) -> f64 {
        self.estimator.estimate()
    }

    /// Inserts a key-value pair, resolving a duplicate key through the
    /// reducer.
    ///
    /// Returns the entry's slot position and whether a new entry was
    /// created. When the key was already present the resident value has
    /// been combined with `value` and `false` is returned.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use offset_hash::HashMap;
    ///
    /// let mut map: HashMap<u64, &str> = HashMap::new();
    /// let (_, inserted) = map.insert(1, "a");
    /// assert!(inserted);
    /// let (_, inserted) = map.insert(1, "b");
    /// assert!(!inserted);
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> (usize, bool) {
        let hash = self.hash_key(&key);
        self.estimator.update(hash);

        let hash_builder = &self.hash_builder;
        self.table.insert(
            hash,
            key,
            value,
            |stored| *stored == key,
            |stored| hash_builder.hash_one(stored),
            &self.reducer,
        )
    }

    /// Inserts a batch of key-value pairs, pre-sizing the table from a
    /// cardinality estimate of the input.
    ///
    /// The input is hashed once up front; the hashes feed a local sketch
    /// that is merged with the resident one, and the table reserves
    /// capacity for the estimated number of distinct keys before the
    /// prefetch-pipelined insert loop runs. Duplicate keys are combined
    /// through the reducer in input order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use offset_hash::HashMap;
    ///
    /// let mut map: HashMap<u64, u32> = HashMap::new();
    /// let pairs: Vec<(u64, u32)> = (0..1000).map(|k| (k % 250, 1)).collect();
    /// map.insert_batch(&pairs);
    /// assert_eq!(map.len(), 250);
    /// ```
    pub fn insert_batch(&mut self, input: &[(K, V)]) {
        let mut hashes = Vec::with_capacity(input.len());
        let mut local = CardinalityEstimator::new();
        for (key, _) in input {
            let hash = self.hash_key(key);
            local.update(hash);
            hashes.push(hash);
        }

        // Estimate the distinct count of table plus input and reserve once,
        // so the insert loop below almost never rehashes.
        local.merge(&self.estimator);
        let distinct_total = local.estimate();

        let hash_builder = &self.hash_builder;
        self.table
            .reserve(libm::round(distinct_total) as usize, |stored| {
                hash_builder.hash_one(stored)
            });
        self.table.insert_batch(
            input,
            &hashes,
            |a, b| a == b,
            |stored| hash_builder.hash_one(stored),
            &self.reducer,
        );

        self.estimator = local;
    }

    /// Returns a reference to the value stored for `key`, if any.
    pub fn find(&self, key: &K) -> Option<&V> {
        let hash = self.hash_key(key);
        self.table.find(hash, |stored| stored == key)
    }

    /// Returns `true` if the map contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Looks up a batch of keys, appending found `(key, value)` pairs to
    /// `out` in input order.
    ///
    /// Returns the number of keys found.
    pub fn find_batch(&self, keys: &[K], out: &mut Vec<(K, V)>) -> usize {
        let hash_builder = &self.hash_builder;
        self.table.find_batch(
            keys,
            out,
            |key| hash_builder.hash_one(key),
            |a, b| a == b,
        )
    }

    /// Counts the presence of a batch of keys, appending 1 or 0 per key to
    /// `out` in input order.
    ///
    /// Returns the total number of keys found.
    pub fn count_batch(&self, keys: &[K], out: &mut Vec<u8>) -> usize {
        let hash_builder = &self.hash_builder;
        self.table.count_batch(
            keys,
            out,
            |key| hash_builder.hash_one(key),
            |a, b| a == b,
        )
    }

    /// Applies the reducer to an existing key's value without inserting.
    ///
    /// A missing key is left missing; use [`insert`] to create entries.
    ///
    /// [`insert`]: HashMap::insert
    pub fn update(&mut self, key: K, value: V) {
        let hash = self.hash_key(&key);
        self.table
            .update(hash, value, |stored| *stored == key, &self.reducer);
    }

    /// Removes a key from the map, returning the number of entries erased
    /// (0 or 1).
    ///
    /// When the population falls below the minimum load the map rebuilds
    /// itself at half the bucket count (skipped automatically if the
    /// merged layout cannot honor the 7-bit offsets).
    pub fn erase(&mut self, key: &K) -> usize {
        let hash = self.hash_key(key);
        let erased = self.table.erase(hash, |stored| stored == key);

        if self.table.len() < self.table.min_load() {
            let hash_builder = &self.hash_builder;
            let half = self.table.capacity() >> 1;
            self.table
                .rehash(half, |stored| hash_builder.hash_one(stored));
        }

        erased
    }

    /// Erases a batch of keys, returning the number of entries removed.
    ///
    /// A single downsize to fit the surviving population runs at the end
    /// if the map dropped below its minimum load.
    pub fn erase_batch(&mut self, keys: &[K]) -> usize {
        let hash_builder = &self.hash_builder;
        let erased = self.table.erase_batch(
            keys,
            |key| hash_builder.hash_one(key),
            |a, b| a == b,
        );

        if self.table.len() < self.table.min_load() {
            let survivors = self.table.len();
            let hash_builder = &self.hash_builder;
            self.table
                .reserve(survivors, |stored| hash_builder.hash_one(stored));
        }

        erased
    }

    /// Reserves capacity for at least `total` entries, so that inserting up
    /// to `total` distinct keys performs no internal resizes.
    ///
    /// Note that `total` is the target population, not a count of
    /// additional entries.
    pub fn reserve(&mut self, total: usize) {
        let hash_builder = &self.hash_builder;
        self.table
            .reserve(total, |stored| hash_builder.hash_one(stored));
    }

    /// Returns an iterator over the entries of the map in arbitrary order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.table.iter(),
        }
    }
}

impl<K, V, S, R> Default for HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher + Default,
    R: Reducer<V> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, R> Extend<(K, V)> for HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher,
    R: Reducer<V>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let input: Vec<(K, V)> = iter.into_iter().collect();
        self.insert_batch(&input);
    }
}

impl<K, V, S, R> FromIterator<(K, V)> for HashMap<K, V, S, R>
where
    K: Copy + Hash + Eq,
    V: Copy,
    S: BuildHasher + Default,
    R: Reducer<V> + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let input: Vec<(K, V)> = iter.into_iter().collect();
        let mut map = Self::with_capacity(input.len() / 4);
        map.insert_batch(&input);
        map
    }
}

/// An iterator over the entries of a [`HashMap`].
///
/// This struct is created by the [`iter`] method on [`HashMap`].
///
/// [`iter`]: HashMap::iter
pub struct Iter<'a, K, V> {
    inner: crate::hash_table::Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}
