//! A concurrent lock-free hash map with constant-time snapshots.
//!
//! The crate provides [`TrieMap`], a concurrent hash array mapped trie. All
//! operations are lock-free: readers never wait, writers retry a
//! compare-and-swap when they lose a race, and no operation blocks the
//! progress of any other. What sets it apart from other concurrent maps is
//! [`TrieMap::snapshot`]: forking the whole map is O(1) and linearizable,
//! with the real copying spread lazily over subsequent writes on either side.
//! That makes consistent iteration, sizing and serialization of a map under
//! heavy concurrent mutation cheap and simple.
//!
//! The design follows the concurrent trie of Prokopec et al. ("Concurrent
//! Tries with Efficient Non-Blocking Snapshots", PPoPP 2012): updates go
//! through a generation-validated double-phase CAS on indirection cells, and
//! snapshots swap the root through a restricted double-compare-single-swap.
//!
//! # When to use
//!
//! * You want a concurrent map with cheap point-in-time views: consistent
//!   iteration, `len`, backups or serialization while writers keep going.
//! * You want lock-free progress guarantees instead of sharded locking.
//!
//! # When not to use
//!
//! * Single-threaded code: `std`'s `HashMap` will be much faster.
//! * If you never need snapshots or iteration consistency, a simpler
//!   concurrent map may have less per-entry overhead.
//!
//! # Examples
//!
//! ```rust
//! use snaptrie::TrieMap;
//! use crossbeam_utils::thread;
//!
//! let map = TrieMap::new();
//!
//! thread::scope(|s| {
//!     // Writers keep inserting…
//!     s.spawn(|_| {
//!         for i in 0..1000 {
//!             map.insert(i, i * 2);
//!         }
//!     });
//!     // …while another thread takes consistent snapshots.
//!     s.spawn(|_| {
//!         let snap = map.read_only_snapshot();
//!         for entry in snap.iter() {
//!             assert_eq!(*entry.value(), entry.key() * 2);
//!         }
//!     });
//! }).unwrap();
//! ```
//!
//! # Features
//!
//! * `rayon`: parallel construction through `ParallelExtend` and
//!   `FromParallelIterator`.
//! * `serde`: (de)serialization of maps as a read-only flag plus the entries
//!   of an implicit snapshot.

pub mod map;
pub mod raw;

pub use crate::map::{Entry, Iter, TrieMap};
