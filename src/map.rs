//! The [`TrieMap`] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::raw::{self, Cond, Raw};

/// An entry stored inside the [`TrieMap`].
///
/// Or, more precisely, the [`Arc`] handles to these are stored in there, and
/// the same handles are returned from lookups and removals. An entry is
/// immutable; replacing a value under a key publishes a whole new entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Entry<K, V> {
    key: K,
    value: V,
}

impl<K, V> Entry<K, V> {
    /// Creates a new entry with the given key and value.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Provides access to the key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Provides access to the value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

/// A concurrent lock-free map with constant-time snapshots.
///
/// The map is a hash array mapped trie. All operations are lock-free;
/// mutations linearize at a single compare-and-swap and retry from the root
/// when they lose a race. On top of the usual map interface it offers
/// [`snapshot`][TrieMap::snapshot] and
/// [`read_only_snapshot`][TrieMap::read_only_snapshot], which fork the whole
/// map in O(1): the two maps share all their branches and copy them lazily as
/// either side writes.
///
/// Entries are stored as [`Arc<Entry<K, V>>`][Entry], so looking up or
/// removing hands back a cheap handle even if the data is large or impossible
/// to clone, and entries can be shared between multiple maps.
///
/// Iteration over a live map sees some arbitrary, but valid, interleaving of
/// concurrent updates; iterate a snapshot to get a stable view.
///
/// # Read-only snapshots
///
/// A map obtained from [`read_only_snapshot`][TrieMap::read_only_snapshot] is
/// frozen: every mutating method on it **panics**. This mirrors dynamically
/// checked misuse elsewhere in Rust (for example `RefCell` borrows); it is a
/// caller bug, not a recoverable condition.
///
/// # Examples
///
/// ```rust
/// use snaptrie::TrieMap;
/// use crossbeam_utils::thread;
///
/// let map = TrieMap::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(1, *map.get("hello").unwrap().value());
/// assert_eq!(2, *map.get("world").unwrap().value());
/// ```
///
/// ```rust
/// use snaptrie::TrieMap;
///
/// let map = TrieMap::new();
/// map.insert("a", 1);
///
/// let snap = map.snapshot();
/// map.insert("a", 2);
/// map.insert("b", 3);
///
/// // The snapshot still sees the world as it was.
/// assert_eq!(1, *snap.get("a").unwrap().value());
/// assert!(snap.get("b").is_none());
/// assert_eq!(2, *map.get("a").unwrap().value());
/// ```
pub struct TrieMap<K, V, S = RandomState> {
    raw: Raw<K, V, S>,
}

impl<K, V> TrieMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Creates a new empty map, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    fn from_raw(raw: Raw<K, V, S>) -> Self {
        Self { raw }
    }

    /// Whether this map is a frozen snapshot that rejects mutation.
    pub fn is_read_only(&self) -> bool {
        self.raw.is_read_only()
    }

    fn expect_mutable(&self) {
        assert!(
            !self.raw.is_read_only(),
            "attempt to modify a read-only snapshot"
        );
    }

    /// Looks up an entry.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.lookup(key, &pin)
    }

    /// Checks whether the map holds an entry for the key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        self.get(key).is_some()
    }

    /// Inserts a new entry, replacing and returning any previous entry under
    /// the same key.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.insert_entry(Arc::new(Entry::new(key, value)))
    }

    /// Inserts an already created entry.
    ///
    /// This acts the same as [`insert`][TrieMap::insert], but takes the entry
    /// handle directly, which can be used to insert the same entry into
    /// multiple maps without cloning the data.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn insert_entry(&self, entry: Arc<Entry<K, V>>) -> Option<Arc<Entry<K, V>>> {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        self.raw.insert(entry, Cond::Any, &pin)
    }

    /// Inserts the entry only if the key is not present yet.
    ///
    /// Returns the already present entry if there was one; `None` means the
    /// new entry went in.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        self.raw
            .insert(Arc::new(Entry::new(key, value)), Cond::IfAbsent, &pin)
    }

    /// Replaces the entry under the key only if one is already present,
    /// returning it.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn replace(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        self.raw
            .insert(Arc::new(Entry::new(key, value)), Cond::IfPresent, &pin)
    }

    /// Replaces the entry under the key only if its value currently equals
    /// `expected`. Returns whether the swap happened.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn compare_and_replace(&self, key: K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        let eq: fn(&V, &V) -> bool = |a, b| a == b;
        self.raw
            .insert(
                Arc::new(Entry::new(key, value)),
                Cond::IfEqual(expected, eq),
                &pin,
            )
            .is_some()
    }

    /// Removes the entry under the key, returning it.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        self.raw.remove(key, Cond::Any, &pin)
    }

    /// Removes the entry under the key only if its value currently equals
    /// `expected`. Returns whether the removal happened.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn compare_and_remove<Q>(&self, key: &Q, expected: &V) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        let eq: fn(&V, &V) -> bool = |a, b| a == b;
        self.raw.remove(key, Cond::IfEqual(expected, eq), &pin).is_some()
    }

    /// Removes all entries.
    ///
    /// Concurrent readers keep traversing whichever root they already hold;
    /// snapshots are unaffected.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot.
    pub fn clear(&self) {
        self.expect_mutable();
        let pin = crossbeam_epoch::pin();
        self.raw.clear(&pin);
    }

    /// Checks if the map is currently empty.
    ///
    /// Note that due to the nature of a concurrent map, this is inherently
    /// racy; another thread may add or remove entries between this call and
    /// acting on the result.
    pub fn is_empty(&self) -> bool {
        let pin = crossbeam_epoch::pin();
        self.raw.is_empty(&pin)
    }

    /// Returns an iterator through the entries of the map.
    ///
    /// Iterating a live map yields an arbitrary consistent interleaving with
    /// concurrent updates; iterate a [snapshot][TrieMap::read_only_snapshot]
    /// for a stable view.
    pub fn iter(&self) -> Iter<K, V, S> {
        Iter {
            map: self,
            inner: raw::iterator::Iter::new(&self.raw),
            last: None,
        }
    }
}

impl<K, V, S> TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    /// Takes an O(1) snapshot: a new mutable map holding exactly the entries
    /// this one holds at the linearization instant.
    ///
    /// Both maps stay fully usable and writable; they share all branches and
    /// fork them lazily, so the work of separating them is spread across
    /// subsequent updates on either side.
    pub fn snapshot(&self) -> Self {
        Self::from_raw(self.raw.snapshot(false))
    }

    /// Takes an O(1) read-only snapshot.
    ///
    /// Cheaper than [`snapshot`][TrieMap::snapshot] if the copy is only read:
    /// the frozen side is never rewritten. Mutating the returned map panics.
    pub fn read_only_snapshot(&self) -> Self {
        Self::from_raw(self.raw.snapshot(true))
    }

    /// Counts the entries.
    ///
    /// This iterates an implicit read-only snapshot, so it is O(n) and
    /// reflects one consistent instant.
    pub fn len(&self) -> usize {
        let frozen;
        let view = if self.is_read_only() {
            self
        } else {
            frozen = self.read_only_snapshot();
            &frozen
        };
        let mut entries = raw::iterator::Iter::new(&view.raw);
        let mut count = 0;
        while entries.next().is_some() {
            count += 1;
        }
        count
    }

    /// Checks whether any entry holds the given value.
    ///
    /// A linear scan over an implicit read-only snapshot.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let frozen;
        let view = if self.is_read_only() {
            self
        } else {
            frozen = self.read_only_snapshot();
            &frozen
        };
        let mut entries = raw::iterator::Iter::new(&view.raw);
        while let Some(entry) = entries.next() {
            if entry.value() == value {
                return true;
            }
        }
        false
    }
}

impl<K, V> Default for TrieMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for TrieMap<K, V, S>
where
    K: Debug + Eq + Hash,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut d = fmt.debug_map();
        for entry in self {
            d.entry(entry.key() as &dyn Debug, entry.value() as &dyn Debug);
        }
        d.finish()
    }
}

/// Cloning is an O(1) [`snapshot`][TrieMap::snapshot]; a read-only map clones
/// into another read-only view of the same instant.
impl<K, V, S> Clone for TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        if self.is_read_only() {
            self.read_only_snapshot()
        } else {
            self.snapshot()
        }
    }
}

/// The iterator of the [`TrieMap`].
///
/// See the [`iter`][TrieMap::iter] method for details.
pub struct Iter<'a, K, V, S> {
    map: &'a TrieMap<K, V, S>,
    inner: raw::iterator::Iter<'a, K, V, S>,
    last: Option<Arc<Entry<K, V>>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Removes the entry most recently returned by `next` from the underlying
    /// map, returning it.
    ///
    /// Returns `None` if somebody else removed it in the meantime.
    ///
    /// # Panics
    ///
    /// If the map is a read-only snapshot, or if `next` has not returned an
    /// entry yet.
    pub fn remove_current(&mut self) -> Option<Arc<Entry<K, V>>> {
        assert!(
            !self.map.is_read_only(),
            "attempt to modify a read-only snapshot"
        );
        let last = self
            .last
            .take()
            .expect("no entry returned by this iterator yet");
        self.map.remove(last.key())
    }
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    type Item = Arc<Entry<K, V>>;
    fn next(&mut self) -> Option<Arc<Entry<K, V>>> {
        let entry = self.inner.next().map(Arc::clone);
        self.last.clone_from(&entry);
        entry
    }
}

impl<'a, K, V, S> IntoIterator for &'a TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    type Item = Arc<Entry<K, V>>;
    type IntoIter = Iter<'a, K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<Arc<Entry<K, V>>> for &'a TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        for entry in iter {
            self.insert_entry(entry);
        }
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        self.extend(iter.into_iter().map(|(k, v)| Arc::new(Entry::new(k, v))));
    }
}

impl<K, V, S> Extend<Arc<Entry<K, V>>> for TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me: &TrieMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V, S> Extend<(K, V)> for TrieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &TrieMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<Arc<Entry<K, V>>> for TrieMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me = TrieMap::new();
        me.extend(iter);
        me
    }
}

impl<K, V> FromIterator<(K, V)> for TrieMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = TrieMap::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<'a, K, V, S> ParallelExtend<Arc<Entry<K, V>>> for &'a TrieMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        par_iter.into_par_iter().for_each(|entry| {
            self.insert_entry(entry);
        });
    }
}

#[cfg(feature = "rayon")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a TrieMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        self.par_extend(
            par_iter
                .into_par_iter()
                .map(|(k, v)| Arc::new(Entry::new(k, v))),
        );
    }
}

#[cfg(feature = "rayon")]
impl<K, V, S> ParallelExtend<Arc<Entry<K, V>>> for TrieMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me: &TrieMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<K, V, S> ParallelExtend<(K, V)> for TrieMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &TrieMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<K, V> FromParallelIterator<Arc<Entry<K, V>>> for TrieMap<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = Arc<Entry<K, V>>>,
    {
        let mut me = TrieMap::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<K, V> FromParallelIterator<(K, V)> for TrieMap<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = TrieMap::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(feature = "serde")]
pub mod serde {
    //! Serialization support.
    //!
    //! A map serializes as its read-only flag followed by the entry sequence
    //! of an implicit snapshot, so serializing a live map under concurrent
    //! writes still captures one consistent instant. Deserialization rebuilds
    //! a fresh map by reinserting every entry, frozen again if the flag was
    //! set.

    use std::fmt;
    use std::marker::PhantomData;

    use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
    use serde::ser::{Serialize, SerializeSeq, SerializeStruct, Serializer};

    use super::*;

    const FIELDS: &[&str] = &["read_only", "entries"];

    impl<K, V, S> Serialize for TrieMap<K, V, S>
    where
        K: Eq + Hash + Serialize,
        V: Serialize,
        S: BuildHasher + Clone,
    {
        fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
            let frozen;
            let view = if self.is_read_only() {
                self
            } else {
                frozen = self.read_only_snapshot();
                &frozen
            };
            let mut state = serializer.serialize_struct("TrieMap", 2)?;
            state.serialize_field("read_only", &self.is_read_only())?;
            state.serialize_field("entries", &Entries(view))?;
            state.end()
        }
    }

    struct Entries<'a, K, V, S>(&'a TrieMap<K, V, S>);

    impl<K, V, S> Serialize for Entries<'_, K, V, S>
    where
        K: Eq + Hash + Serialize,
        V: Serialize,
        S: BuildHasher,
    {
        fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
            let mut seq = serializer.serialize_seq(None)?;
            for entry in self.0.iter() {
                seq.serialize_element(&(entry.key(), entry.value()))?;
            }
            seq.end()
        }
    }

    impl<'de, K, V, S> Deserialize<'de> for TrieMap<K, V, S>
    where
        K: Eq + Hash + Deserialize<'de>,
        V: Deserialize<'de>,
        S: BuildHasher + Default,
    {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_struct(
                "TrieMap",
                FIELDS,
                TrieMapVisitor {
                    phantom: PhantomData,
                },
            )
        }
    }

    enum Field {
        ReadOnly,
        Entries,
    }

    impl<'de> Deserialize<'de> for Field {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct FieldVisitor;

            impl<'de> Visitor<'de> for FieldVisitor {
                type Value = Field;

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("`read_only` or `entries`")
                }

                fn visit_str<E: de::Error>(self, value: &str) -> Result<Field, E> {
                    match value {
                        "read_only" => Ok(Field::ReadOnly),
                        "entries" => Ok(Field::Entries),
                        _ => Err(de::Error::unknown_field(value, FIELDS)),
                    }
                }
            }

            deserializer.deserialize_identifier(FieldVisitor)
        }
    }

    struct TrieMapVisitor<K, V, S> {
        phantom: PhantomData<(K, V, S)>,
    }

    impl<'de, K, V, S> Visitor<'de> for TrieMapVisitor<K, V, S>
    where
        K: Eq + Hash + Deserialize<'de>,
        V: Deserialize<'de>,
        S: BuildHasher + Default,
    {
        type Value = TrieMap<K, V, S>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a read-only flag and a sequence of entries")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let read_only = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(0, &self))?;
            let entries: Vec<(K, V)> = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(1, &self))?;
            Ok(rebuild(read_only, entries))
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut read_only: Option<bool> = None;
            let mut entries: Option<Vec<(K, V)>> = None;
            while let Some(field) = map.next_key()? {
                match field {
                    Field::ReadOnly => {
                        if read_only.is_some() {
                            return Err(de::Error::duplicate_field("read_only"));
                        }
                        read_only = Some(map.next_value()?);
                    }
                    Field::Entries => {
                        if entries.is_some() {
                            return Err(de::Error::duplicate_field("entries"));
                        }
                        entries = Some(map.next_value()?);
                    }
                }
            }
            let read_only = read_only.ok_or_else(|| de::Error::missing_field("read_only"))?;
            let entries = entries.ok_or_else(|| de::Error::missing_field("entries"))?;
            Ok(rebuild(read_only, entries))
        }
    }

    fn rebuild<K, V, S>(read_only: bool, entries: Vec<(K, V)>) -> TrieMap<K, V, S>
    where
        K: Eq + Hash,
        S: BuildHasher + Default,
    {
        let mut map = TrieMap::with_hasher(S::default());
        for (key, value) in entries {
            map.insert(key, value);
        }
        if read_only {
            map.raw.freeze();
        }
        map
    }

}
