//! The core implementation of the concurrent snapshot trie.
//!
//! This module contains the [`Raw`] type, the engine behind [`TrieMap`][crate::TrieMap].
//! It is exposed to allow wrapping into further APIs, but is probably not the best
//! thing for general use.
//!
//! The trie is a hash array mapped trie in which every interior node is reached
//! through an indirection cell (`INode`). The indirection's payload is replaced
//! with a two-phase generation-compare-and-swap (GCAS), and the root indirection
//! is replaced with a restricted double-compare-single-swap (RDCSS). Together
//! these give lock-free updates and a constant-time, linearizable `snapshot`:
//! the snapshot merely installs a root with a fresh generation token, and
//! branches are forked lazily the first time either side writes into them.
//!
//! For the correctness arguments behind the individual compare-and-swaps, see
//! the comments in the source (they probably don't belong into API
//! documentation).

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use smallvec::SmallVec;

pub mod debug;
pub mod iterator;

use crate::map::Entry;

/// Bits of hash consumed per trie level.
pub(crate) const LEVEL_BITS: u32 = 5;
pub(crate) const LEVEL_MASK: u32 = 0b1_1111;
/// Width of the hash the trie indexes with.
pub(crate) const HASH_BITS: u32 = 32;
/// First shift at which the hash is exhausted; keys still colliding there go
/// into a collision bucket instead of a deeper branch.
pub(crate) const MAX_SHIFT: u32 = (HASH_BITS / LEVEL_BITS) * LEVEL_BITS + LEVEL_BITS;
/// Deepest possible stack of bitmap nodes: shifts 0 through 30. A collision
/// bucket below them needs no stack slot.
pub(crate) const MAX_DEPTH: usize = (HASH_BITS / LEVEL_BITS) as usize + 1;

/// A generation token.
///
/// Every indirection is stamped with the generation of the root it was created
/// under. A write that crosses a node of an older generation forks that node
/// into its own generation before touching it, which is what makes snapshots
/// O(1): the snapshot only installs a new token and the copying happens lazily.
///
/// Tokens are only ever compared for equality. A monotonic 64-bit counter
/// cannot realistically wrap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Gen(u64);

impl Gen {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Gen(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A single key/value leaf, together with the key's hash.
pub(crate) struct Leaf<K, V> {
    pub(crate) hash: u32,
    pub(crate) entry: Arc<Entry<K, V>>,
}

// Implemented manually, a derive would ask for K, V: Clone.
impl<K, V> Clone for Leaf<K, V> {
    fn clone(&self) -> Self {
        Leaf {
            hash: self.hash,
            entry: Arc::clone(&self.entry),
        }
    }
}

/// One slot of a bitmap node: either a leaf or a deeper indirection.
pub(crate) enum Branch<K, V> {
    Leaf(Leaf<K, V>),
    Indirect(Arc<INode<K, V>>),
}

impl<K, V> Clone for Branch<K, V> {
    fn clone(&self) -> Self {
        match self {
            Branch::Leaf(leaf) => Branch::Leaf(leaf.clone()),
            Branch::Indirect(inode) => Branch::Indirect(Arc::clone(inode)),
        }
    }
}

/// A bitmap-indexed interior node.
///
/// The 32-bit bitmap records which hash slots are occupied; the branch array
/// is compacted to `popcount(bitmap)` entries. Immutable after publication;
/// updates produce a fresh copy sharing the untouched branches.
pub(crate) struct CNode<K, V> {
    pub(crate) bitmap: u32,
    pub(crate) branches: Box<[Branch<K, V>]>,
    pub(crate) gen: Gen,
}

impl<K, V> Clone for CNode<K, V> {
    fn clone(&self) -> Self {
        CNode {
            bitmap: self.bitmap,
            branches: self.branches.iter().cloned().collect(),
            gen: self.gen,
        }
    }
}

/// A bucket of entries whose keys collide on the full 32-bit hash.
pub(crate) struct LNode<K, V> {
    pub(crate) hash: u32,
    pub(crate) entries: SmallVec<[Arc<Entry<K, V>>; 2]>,
}

impl<K, V> Clone for LNode<K, V> {
    fn clone(&self) -> Self {
        LNode {
            hash: self.hash,
            entries: self.entries.iter().cloned().collect(),
        }
    }
}

/// The payload of an indirection.
pub(crate) enum Main<K, V> {
    /// Interior bitmap node.
    CNode(CNode<K, V>),
    /// Full-hash collision bucket; holds at least two entries.
    LNode(LNode<K, V>),
    /// Tombed leaf. The indirection holding it has a single live entry left
    /// and should be folded back into its parent.
    Tomb(Leaf<K, V>),
    /// Marker wrapping a speculative update that has to be rolled back. Never
    /// observable through [`Raw::gcas_read`].
    Failed,
}

/// An epoch-managed payload allocation together with its GCAS bookkeeping.
pub(crate) struct MainNode<K, V> {
    /// The displaced payload while a GCAS is in flight. A successful commit
    /// swings this back to null; an overtaken update replaces it with a
    /// [`Main::Failed`] marker whose own `prev` wraps the payload to restore.
    prev: Atomic<MainNode<K, V>>,
    pub(crate) node: Main<K, V>,
}

impl<K, V> MainNode<K, V> {
    fn new(node: Main<K, V>) -> Self {
        MainNode {
            prev: Atomic::null(),
            node,
        }
    }

    fn failed(wrapping: Shared<'_, MainNode<K, V>>) -> Self {
        MainNode {
            prev: Atomic::from(wrapping),
            node: Main::Failed,
        }
    }

    /// A fresh allocation with the same payload, sharing all branches.
    ///
    /// Indirections never share a payload allocation (unlike the managed-heap
    /// formulation of this structure), so a payload unlinked by a CAS has
    /// exactly one owner to retire it. Duplication is shallow: at most 32
    /// `Arc` clones.
    fn duplicate(&self) -> Self {
        let node = match &self.node {
            Main::CNode(cn) => Main::CNode(cn.clone()),
            Main::LNode(ln) => Main::LNode(ln.clone()),
            Main::Tomb(leaf) => Main::Tomb(leaf.clone()),
            Main::Failed => unreachable!("Duplicated a failed payload"),
        };
        MainNode::new(node)
    }
}

/// An indirection cell: the only CAS-mutable point of the trie structure.
pub(crate) struct INode<K, V> {
    pub(crate) gen: Gen,
    pub(crate) main: Atomic<MainNode<K, V>>,
}

impl<K, V> INode<K, V> {
    fn new(main: MainNode<K, V>, gen: Gen) -> Self {
        INode {
            gen,
            main: Atomic::new(main),
        }
    }
}

impl<K, V> Drop for INode<K, V> {
    fn drop(&mut self) {
        // This was the last reference: nobody can race us, and the Arc
        // decrement that made us last already synchronized everything into
        // this thread, so unprotected access with Relaxed is fine.
        unsafe {
            let guard = epoch::unprotected();
            let main = self.main.load(Ordering::Relaxed, guard);
            debug_assert!(
                main.deref().prev.load(Ordering::Relaxed, guard).is_null(),
                "Dropped an indirection with an update still in flight"
            );
            // Dropping the payload cascades through the branch Arcs, which
            // drop any child indirection losing its last reference.
            drop(main.into_owned());
        }
    }
}

/// A pending root swap.
///
/// Temporarily installed into the root cell while an RDCSS is in flight. Any
/// reader that encounters it first helps (or aborts) the swap, so the root
/// observed by operations is always a settled indirection.
struct Descriptor<K, V> {
    old: Arc<INode<K, V>>,
    /// Identity of the payload the swap is conditioned on. Only compared
    /// against freshly read payload pointers, never dereferenced.
    expected: usize,
    next: Arc<INode<K, V>>,
    committed: AtomicBool,
}

/// The root cell: a settled indirection or a pending swap descriptor.
pub(crate) enum RootCell<K, V> {
    Node(Arc<INode<K, V>>),
    Desc(Descriptor<K, V>),
}

/// Internal signal that an operation lost a race and must restart from the
/// (re-read) root. Never surfaced through the public API.
pub(crate) struct Restart;

/// Which update semantics [`Raw::insert`] applies, and which removals
/// [`Raw::remove`] honours.
pub(crate) enum Cond<'a, V> {
    /// Unconditional upsert (or unconditional removal).
    Any,
    /// Insert only if the key is absent.
    IfAbsent,
    /// Replace only if the key is present.
    IfPresent,
    /// Replace/remove only if the current value matches. The comparison is
    /// injected at the call site so the engine itself needs no `PartialEq`
    /// bound.
    IfEqual(&'a V, fn(&V, &V) -> bool),
}

impl<'a, V> Clone for Cond<'a, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, V> Copy for Cond<'a, V> {}

impl<'a, V> Cond<'a, V> {
    fn admits(&self, current: &V) -> bool {
        match self {
            Cond::Any | Cond::IfPresent => true,
            Cond::IfAbsent => false,
            Cond::IfEqual(expected, eq) => eq(current, expected),
        }
    }

    fn inserts_when_absent(&self) -> bool {
        matches!(self, Cond::Any | Cond::IfAbsent)
    }
}

/// The raw snapshot trie.
///
/// This provides the low level data structure: lock-free lookup, conditional
/// update and removal, and constant-time snapshotting. It does not provide a
/// user friendly interface; [`TrieMap`][crate::TrieMap] wraps it into one.
///
/// As a general rule, operations take a [`crossbeam_epoch`] [`Guard`] so that
/// several of them can share a single pin. Entries are handed out as cheap
/// [`Arc`] clones, never borrowed out of the structure.
pub struct Raw<K, V, S> {
    hash_builder: S,
    read_only: bool,
    root: Atomic<RootCell<K, V>>,
}

impl<K, V, S> Raw<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Constructs an empty trie from the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        let gen = Gen::new();
        let root = INode::new(MainNode::new(Main::CNode(CNode::empty(gen))), gen);
        Raw {
            hash_builder,
            read_only: false,
            root: Atomic::new(RootCell::Node(Arc::new(root))),
        }
    }

    fn with_root(hash_builder: S, root: Arc<INode<K, V>>, read_only: bool) -> Self {
        Raw {
            hash_builder,
            read_only,
            root: Atomic::new(RootCell::Node(root)),
        }
    }

    /// Provides access to the hasher.
    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    /// Whether this trie is a frozen snapshot.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Marks a freshly built, exclusively owned trie as read-only.
    pub(crate) fn freeze(&mut self) {
        self.read_only = true;
    }

    /// Computes the 32-bit hash (using the stored hasher) of a key.
    pub(crate) fn hash_of<Q>(&self, key: &Q) -> u32
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    // ---- RDCSS on the root cell ----

    /// Reads the settled root indirection, helping along any pending swap
    /// found in the cell on the way.
    ///
    /// With `abort` set a pending swap is rolled back instead of helped; GCAS
    /// completion uses that so its generation check never works on behalf of
    /// an unfinished snapshot.
    pub(crate) fn read_root<'g>(
        &self,
        abort: bool,
        guard: &'g Guard,
    ) -> (Shared<'g, RootCell<K, V>>, &'g Arc<INode<K, V>>) {
        loop {
            let cell = self.root.load(Ordering::Acquire, guard);
            // The root cell is never null.
            let desc = match unsafe { cell.deref() } {
                RootCell::Node(inode) => return (cell, inode),
                RootCell::Desc(desc) => desc,
            };

            let commit = !abort && {
                let current = self.gcas_read(&desc.old, guard);
                current.as_raw() as usize == desc.expected
            };
            let settled = if commit {
                Arc::clone(&desc.next)
            } else {
                Arc::clone(&desc.old)
            };
            let result = self.root.compare_exchange(
                cell,
                Owned::new(RootCell::Node(settled)),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            );
            if result.is_ok() {
                // Only the thread that settles the swap reports it committed,
                // so a half-done swap can never be taken for a successful one.
                if commit {
                    desc.committed.store(true, Ordering::Release);
                }
                // We unlinked the descriptor cell; nobody else will.
                unsafe { guard.defer_destroy(cell) };
            }
            // Either way the cell has settled (or moved on); reload it.
        }
    }

    /// Atomically replaces the root indirection `old` with `next`, provided
    /// `old`'s payload is still the expected one.
    fn rdcss_root<'g>(
        &self,
        cell: Shared<'g, RootCell<K, V>>,
        old: &Arc<INode<K, V>>,
        expected: Shared<'g, MainNode<K, V>>,
        next: Arc<INode<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        let desc = Owned::new(RootCell::Desc(Descriptor {
            old: Arc::clone(old),
            expected: expected.as_raw() as usize,
            next,
            committed: AtomicBool::new(false),
        }));
        match self
            .root
            .compare_exchange(cell, desc, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                self.read_root(false, guard);
                // We won the install, so the replaced cell is ours to retire.
                unsafe { guard.defer_destroy(cell) };
                // The descriptor may already be retired by whoever settled it,
                // but it cannot be reclaimed while we hold the guard.
                match unsafe { installed.deref() } {
                    RootCell::Desc(desc) => desc.committed.load(Ordering::Acquire),
                    RootCell::Node(_) => unreachable!("Installed a descriptor, found a node"),
                }
            }
            // Losing the install drops the descriptor together with its Arcs.
            Err(_) => false,
        }
    }

    // ---- GCAS on an indirection ----

    /// Reads an indirection's payload, finishing any in-flight update first.
    ///
    /// Never returns a payload with a pending `prev`, and never a failed
    /// marker.
    pub(crate) fn gcas_read<'g>(
        &self,
        inode: &INode<K, V>,
        guard: &'g Guard,
    ) -> Shared<'g, MainNode<K, V>> {
        let main = inode.main.load(Ordering::Acquire, guard);
        let prev = unsafe { main.deref() }.prev.load(Ordering::Acquire, guard);
        if prev.is_null() {
            main
        } else {
            self.gcas_complete(inode, main, guard)
        }
    }

    /// Replaces `inode`'s payload `old` with `node`, unless a snapshot
    /// overtook the operation, in which case the update is rolled back and the
    /// caller has to restart from the root.
    #[must_use]
    pub(crate) fn gcas<'g>(
        &self,
        inode: &INode<K, V>,
        old: Shared<'g, MainNode<K, V>>,
        node: Main<K, V>,
        guard: &'g Guard,
    ) -> bool {
        let next = Owned::new(MainNode {
            prev: Atomic::from(old),
            node,
        });
        match inode
            .main
            .compare_exchange(old, next, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                self.gcas_complete(inode, installed, guard);
                // Committed iff completion nulled our prev; otherwise the
                // update was rolled back and is already being retired.
                unsafe { installed.deref() }
                    .prev
                    .load(Ordering::Acquire, guard)
                    .is_null()
            }
            // The failed Owned drops here, releasing its branch Arcs.
            Err(_) => false,
        }
    }

    /// Drives a payload with a pending `prev` to a settled state: either the
    /// update commits (prev becomes null) or it is rolled back and the
    /// displaced payload reinstated.
    fn gcas_complete<'g>(
        &self,
        inode: &INode<K, V>,
        mut main: Shared<'g, MainNode<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, MainNode<K, V>> {
        loop {
            let main_ref = unsafe { main.deref() };
            let prev = main_ref.prev.load(Ordering::Acquire, guard);
            // Reading the root also settles any pending root swap, by aborting
            // it rather than helping; committing a snapshot from in here would
            // invert the ordering the two protocols rely on.
            let (_, root) = self.read_root(true, guard);
            if prev.is_null() {
                return main;
            }

            let prev_ref = unsafe { prev.deref() };
            if let Main::Failed = prev_ref.node {
                // A failed speculation; swing the indirection back to the
                // payload the marker wraps.
                let orig = prev_ref.prev.load(Ordering::Acquire, guard);
                match inode
                    .main
                    .compare_exchange(main, orig, Ordering::AcqRel, Ordering::Acquire, guard)
                {
                    Ok(_) => {
                        // The speculative payload and its marker are garbage;
                        // the wrapped payload lives on in the indirection.
                        unsafe {
                            guard.defer_destroy(main);
                            guard.defer_destroy(prev);
                        }
                        return orig;
                    }
                    Err(_) => {
                        main = inode.main.load(Ordering::Acquire, guard);
                        continue;
                    }
                }
            }

            // A proper in-flight update. It may only become visible if no
            // snapshot has replaced our lineage's root in the meantime.
            if root.gen == inode.gen && !self.read_only {
                // Commit. The single thread whose CAS nulls prev retires the
                // displaced payload.
                if main_ref
                    .prev
                    .compare_exchange(
                        prev,
                        Shared::null(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    unsafe { guard.defer_destroy(prev) };
                    return main;
                }
            } else {
                // Overtaken by a snapshot: poison the update with a failed
                // marker and let the rollback above take it from there.
                let _ = main_ref.prev.compare_exchange(
                    prev,
                    Owned::new(MainNode::failed(prev)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                );
                main = inode.main.load(Ordering::Acquire, guard);
            }
        }
    }

    // ---- lookup ----

    /// Looks up an entry by key.
    pub fn lookup<Q>(&self, key: &Q, guard: &Guard) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let hash = self.hash_of(key);
        loop {
            let (_, root) = self.read_root(false, guard);
            match self.rec_lookup(root, None, key, hash, 0, root.gen, guard) {
                Ok(found) => return found,
                Err(Restart) => (),
            }
        }
    }

    fn rec_lookup<Q>(
        &self,
        inode: &INode<K, V>,
        parent: Option<&INode<K, V>>,
        key: &Q,
        hash: u32,
        lev: u32,
        start_gen: Gen,
        guard: &Guard,
    ) -> Result<Option<Arc<Entry<K, V>>>, Restart>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.node {
            Main::CNode(cn) => {
                let flag = 1u32 << ((hash >> lev) & LEVEL_MASK);
                if cn.bitmap & flag == 0 {
                    return Ok(None);
                }
                let pos = (cn.bitmap & (flag - 1)).count_ones() as usize;
                match &cn.branches[pos] {
                    Branch::Indirect(sub) => {
                        if self.read_only || sub.gen == start_gen {
                            return self.rec_lookup(
                                sub,
                                Some(inode),
                                key,
                                hash,
                                lev + LEVEL_BITS,
                                start_gen,
                                guard,
                            );
                        }
                        // A stale branch on a live trie: fork it into our
                        // generation first, then retry this level.
                        let renewed = Main::CNode(self.renewed(cn, start_gen, guard));
                        if self.gcas(inode, main, renewed, guard) {
                            self.rec_lookup(inode, parent, key, hash, lev, start_gen, guard)
                        } else {
                            Err(Restart)
                        }
                    }
                    Branch::Leaf(leaf) => {
                        if leaf.hash == hash && leaf.entry.key().borrow() == key {
                            Ok(Some(Arc::clone(&leaf.entry)))
                        } else {
                            Ok(None)
                        }
                    }
                }
            }
            Main::Tomb(leaf) => {
                if self.read_only {
                    // A frozen trie answers straight from the tomb; there is
                    // nobody left to fold it away for.
                    if leaf.hash == hash && leaf.entry.key().borrow() == key {
                        Ok(Some(Arc::clone(&leaf.entry)))
                    } else {
                        Ok(None)
                    }
                } else {
                    let parent = parent.expect("Tombed payload at the root");
                    self.clean(parent, lev - LEVEL_BITS, inode.gen, guard);
                    Err(Restart)
                }
            }
            Main::LNode(ln) => Ok(ln.get(key).cloned()),
            Main::Failed => unreachable!("Failed payload escaped a GCAS read"),
        }
    }

    // ---- insert / conditional update ----

    /// Inserts or replaces an entry according to `cond`.
    ///
    /// Returns the entry previously held under the key, if any. For
    /// [`Cond::IfAbsent`] a `Some` return means the trie was left untouched;
    /// for [`Cond::IfEqual`] a `None` return means nothing matched.
    pub(crate) fn insert(
        &self,
        entry: Arc<Entry<K, V>>,
        cond: Cond<'_, V>,
        guard: &Guard,
    ) -> Option<Arc<Entry<K, V>>> {
        let leaf = Leaf {
            hash: self.hash_of(entry.key()),
            entry,
        };
        loop {
            let (_, root) = self.read_root(false, guard);
            match self.rec_insert(root, None, &leaf, cond, 0, root.gen, guard) {
                Ok(previous) => return previous,
                Err(Restart) => (),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rec_insert(
        &self,
        inode: &INode<K, V>,
        parent: Option<&INode<K, V>>,
        leaf: &Leaf<K, V>,
        cond: Cond<'_, V>,
        lev: u32,
        start_gen: Gen,
        guard: &Guard,
    ) -> Result<Option<Arc<Entry<K, V>>>, Restart> {
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.node {
            Main::CNode(cn) => {
                let flag = 1u32 << ((leaf.hash >> lev) & LEVEL_MASK);
                let pos = (cn.bitmap & (flag - 1)).count_ones() as usize;
                if cn.bitmap & flag == 0 {
                    // An empty slot.
                    if !cond.inserts_when_absent() {
                        return Ok(None);
                    }
                    let renewed;
                    let cn = if cn.gen == inode.gen {
                        cn
                    } else {
                        renewed = self.renewed(cn, inode.gen, guard);
                        &renewed
                    };
                    let inserted = cn.inserted_at(pos, flag, Branch::Leaf(leaf.clone()), inode.gen);
                    return if self.gcas(inode, main, Main::CNode(inserted), guard) {
                        Ok(None)
                    } else {
                        Err(Restart)
                    };
                }

                match &cn.branches[pos] {
                    Branch::Indirect(sub) => {
                        if sub.gen == start_gen {
                            return self.rec_insert(
                                sub,
                                Some(inode),
                                leaf,
                                cond,
                                lev + LEVEL_BITS,
                                start_gen,
                                guard,
                            );
                        }
                        let renewed = Main::CNode(self.renewed(cn, start_gen, guard));
                        if self.gcas(inode, main, renewed, guard) {
                            self.rec_insert(inode, parent, leaf, cond, lev, start_gen, guard)
                        } else {
                            Err(Restart)
                        }
                    }
                    Branch::Leaf(found)
                        if found.hash == leaf.hash && found.entry.key() == leaf.entry.key() =>
                    {
                        // Same key: decide against the current value.
                        if let Cond::IfAbsent = cond {
                            return Ok(Some(Arc::clone(&found.entry)));
                        }
                        if !cond.admits(found.entry.value()) {
                            return Ok(None);
                        }
                        let updated = cn.updated_at(pos, Branch::Leaf(leaf.clone()), inode.gen);
                        if self.gcas(inode, main, Main::CNode(updated), guard) {
                            Ok(Some(Arc::clone(&found.entry)))
                        } else {
                            Err(Restart)
                        }
                    }
                    Branch::Leaf(found) => {
                        // A different key occupies the slot; push both leaves
                        // one level deeper under a fresh indirection.
                        if !cond.inserts_when_absent() {
                            return Ok(None);
                        }
                        let renewed;
                        let cn = if cn.gen == inode.gen {
                            cn
                        } else {
                            renewed = self.renewed(cn, inode.gen, guard);
                            &renewed
                        };
                        let split = INode::new(
                            MainNode::new(dual(
                                found.clone(),
                                leaf.clone(),
                                lev + LEVEL_BITS,
                                inode.gen,
                            )),
                            inode.gen,
                        );
                        let updated =
                            cn.updated_at(pos, Branch::Indirect(Arc::new(split)), inode.gen);
                        if self.gcas(inode, main, Main::CNode(updated), guard) {
                            Ok(None)
                        } else {
                            Err(Restart)
                        }
                    }
                }
            }
            Main::Tomb(_) => {
                let parent = parent.expect("Tombed payload at the root");
                self.clean(parent, lev - LEVEL_BITS, inode.gen, guard);
                Err(Restart)
            }
            Main::LNode(ln) => {
                let found = ln.get(leaf.entry.key());
                match (found, &cond) {
                    (Some(current), Cond::IfAbsent) => Ok(Some(Arc::clone(current))),
                    (Some(current), _) if !cond.admits(current.value()) => Ok(None),
                    (None, _) if !cond.inserts_when_absent() => Ok(None),
                    _ => {
                        let previous = found.cloned();
                        let inserted = Main::LNode(ln.inserted(Arc::clone(&leaf.entry)));
                        if self.gcas(inode, main, inserted, guard) {
                            Ok(previous)
                        } else {
                            Err(Restart)
                        }
                    }
                }
            }
            Main::Failed => unreachable!("Failed payload escaped a GCAS read"),
        }
    }

    // ---- remove ----

    /// Removes an entry by key; `cond` is expected to be [`Cond::Any`] or
    /// [`Cond::IfEqual`]. Returns the removed entry.
    pub(crate) fn remove<Q>(&self, key: &Q, cond: Cond<'_, V>, guard: &Guard) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let hash = self.hash_of(key);
        loop {
            let (_, root) = self.read_root(false, guard);
            match self.rec_remove(root, None, key, cond, hash, 0, root.gen, guard) {
                Ok(removed) => return removed,
                Err(Restart) => (),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rec_remove<Q>(
        &self,
        inode: &INode<K, V>,
        parent: Option<&INode<K, V>>,
        key: &Q,
        cond: Cond<'_, V>,
        hash: u32,
        lev: u32,
        start_gen: Gen,
        guard: &Guard,
    ) -> Result<Option<Arc<Entry<K, V>>>, Restart>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.node {
            Main::CNode(cn) => {
                let flag = 1u32 << ((hash >> lev) & LEVEL_MASK);
                if cn.bitmap & flag == 0 {
                    return Ok(None);
                }
                let pos = (cn.bitmap & (flag - 1)).count_ones() as usize;
                let removed = match &cn.branches[pos] {
                    Branch::Indirect(sub) => {
                        if sub.gen == start_gen {
                            self.rec_remove(
                                sub,
                                Some(inode),
                                key,
                                cond,
                                hash,
                                lev + LEVEL_BITS,
                                start_gen,
                                guard,
                            )?
                        } else {
                            let renewed = Main::CNode(self.renewed(cn, start_gen, guard));
                            if self.gcas(inode, main, renewed, guard) {
                                return self.rec_remove(
                                    inode, parent, key, cond, hash, lev, start_gen, guard,
                                );
                            }
                            return Err(Restart);
                        }
                    }
                    Branch::Leaf(leaf) => {
                        if leaf.hash != hash
                            || leaf.entry.key().borrow() != key
                            || !cond.admits(leaf.entry.value())
                        {
                            return Ok(None);
                        }
                        let shrunk = cn.removed_at(pos, flag, inode.gen).contracted(lev);
                        if self.gcas(inode, main, shrunk, guard) {
                            Some(Arc::clone(&leaf.entry))
                        } else {
                            return Err(Restart);
                        }
                    }
                };

                if removed.is_some() {
                    // The removal may have left this indirection tombed; if
                    // so, have the parent fold us away before reporting back.
                    if let Some(parent) = parent {
                        let now = self.gcas_read(inode, guard);
                        if let Main::Tomb(_) = unsafe { now.deref() }.node {
                            self.clean_parent(inode, parent, hash, lev, start_gen, guard);
                        }
                    }
                }
                Ok(removed)
            }
            Main::Tomb(_) => {
                let parent = parent.expect("Tombed payload at the root");
                self.clean(parent, lev - LEVEL_BITS, inode.gen, guard);
                Err(Restart)
            }
            Main::LNode(ln) => {
                let found = match ln.get(key) {
                    Some(found) if cond.admits(found.value()) => Arc::clone(found),
                    _ => return Ok(None),
                };
                let shrunk = ln.removed(key);
                let next = if shrunk.entries.len() == 1 {
                    // A lone survivor turns the bucket into a tomb, which the
                    // next modifying pass folds into the parent.
                    Main::Tomb(Leaf {
                        hash: ln.hash,
                        entry: Arc::clone(&shrunk.entries[0]),
                    })
                } else {
                    Main::LNode(shrunk)
                };
                if self.gcas(inode, main, next, guard) {
                    Ok(Some(found))
                } else {
                    Err(Restart)
                }
            }
            Main::Failed => unreachable!("Failed payload escaped a GCAS read"),
        }
    }

    // ---- contraction ----

    /// Replaces an indirection's payload with a compressed copy, folding away
    /// any tombed children. Invoked when an operation runs into a tomb below
    /// `inode`.
    fn clean(&self, inode: &INode<K, V>, lev: u32, gen: Gen, guard: &Guard) {
        let main = self.gcas_read(inode, guard);
        if let Main::CNode(cn) = &unsafe { main.deref() }.node {
            // Failure is fine: whoever beat us has cleaned, or will.
            let _ = self.gcas(inode, main, self.compressed(cn, lev, gen, guard), guard);
        }
    }

    /// Folds a tombed `inode` back into `parent` as a plain leaf.
    fn clean_parent(
        &self,
        inode: &INode<K, V>,
        parent: &INode<K, V>,
        hash: u32,
        lev: u32,
        start_gen: Gen,
        guard: &Guard,
    ) {
        loop {
            let pmain = self.gcas_read(parent, guard);
            let cn = match &unsafe { pmain.deref() }.node {
                Main::CNode(cn) => cn,
                // The parent moved on from being a bitmap node; done.
                _ => return,
            };
            let flag = 1u32 << ((hash >> (lev - LEVEL_BITS)) & LEVEL_MASK);
            if cn.bitmap & flag == 0 {
                return;
            }
            let pos = (cn.bitmap & (flag - 1)).count_ones() as usize;
            match &cn.branches[pos] {
                Branch::Indirect(sub) if std::ptr::eq(sub.as_ref(), inode) => (),
                // Somebody already replaced our slot; done.
                _ => return,
            }

            let tombed = self.gcas_read(inode, guard);
            let leaf = match &unsafe { tombed.deref() }.node {
                Main::Tomb(leaf) => leaf.clone(),
                // Resurrected by a concurrent compression; done.
                _ => return,
            };
            let folded = cn
                .updated_at(pos, Branch::Leaf(leaf), parent.gen)
                .contracted(lev - LEVEL_BITS);
            if self.gcas(parent, pmain, folded, guard) {
                return;
            }
            // Only worth retrying while our generation is still the live one;
            // a newer lineage will fold the tomb on its own first touch.
            let (_, root) = self.read_root(false, guard);
            if root.gen != start_gen {
                return;
            }
        }
    }

    /// A copy of `cn` with every tombed child indirection resurrected into a
    /// plain leaf, itself contracted to a tomb if only one leaf remains.
    fn compressed(&self, cn: &CNode<K, V>, lev: u32, gen: Gen, guard: &Guard) -> Main<K, V> {
        let branches = cn
            .branches
            .iter()
            .map(|branch| match branch {
                Branch::Indirect(sub) => {
                    let main = self.gcas_read(sub, guard);
                    match &unsafe { main.deref() }.node {
                        Main::Tomb(leaf) => Branch::Leaf(leaf.clone()),
                        _ => branch.clone(),
                    }
                }
                Branch::Leaf(_) => branch.clone(),
            })
            .collect();
        CNode {
            bitmap: cn.bitmap,
            branches,
            gen,
        }
        .contracted(lev)
    }

    /// A copy of `cn` stamped with `gen`, with every child indirection forked
    /// into that generation. The children's payloads are duplicated shallowly;
    /// anything deeper keeps being shared and forks when first written to.
    fn renewed(&self, cn: &CNode<K, V>, gen: Gen, guard: &Guard) -> CNode<K, V> {
        let branches = cn
            .branches
            .iter()
            .map(|branch| match branch {
                Branch::Indirect(sub) => {
                    let main = self.gcas_read(sub, guard);
                    let copied = unsafe { main.deref() }.duplicate();
                    Branch::Indirect(Arc::new(INode::new(copied, gen)))
                }
                Branch::Leaf(_) => branch.clone(),
            })
            .collect();
        CNode {
            bitmap: cn.bitmap,
            branches,
            gen,
        }
    }

    // ---- snapshots ----

    /// Takes an O(1) snapshot: installs a fresh generation into this trie and
    /// returns an independent trie sharing all branches with it.
    pub fn snapshot(&self, read_only: bool) -> Self
    where
        S: Clone,
    {
        let guard = epoch::pin();
        if self.read_only {
            // A frozen root never moves; forking it needs no swap.
            let (_, root) = self.read_root(false, &guard);
            let root = if read_only {
                Arc::clone(root)
            } else {
                let main = self.gcas_read(root, &guard);
                Arc::new(INode::new(unsafe { main.deref() }.duplicate(), Gen::new()))
            };
            return Raw::with_root(self.hash_builder.clone(), root, read_only);
        }
        loop {
            let (cell, root) = self.read_root(false, &guard);
            let expected = self.gcas_read(root, &guard);
            let forked = Arc::new(INode::new(
                unsafe { expected.deref() }.duplicate(),
                Gen::new(),
            ));
            if self.rdcss_root(cell, root, expected, forked, &guard) {
                let snap = if read_only {
                    // The displaced root is frozen exactly as observed.
                    Arc::clone(root)
                } else {
                    Arc::new(INode::new(
                        unsafe { expected.deref() }.duplicate(),
                        Gen::new(),
                    ))
                };
                return Raw::with_root(self.hash_builder.clone(), snap, read_only);
            }
        }
    }

    /// Removes all entries by swapping in a fresh, empty root.
    pub fn clear(&self, guard: &Guard) {
        loop {
            let (cell, root) = self.read_root(false, guard);
            let expected = self.gcas_read(root, guard);
            let gen = Gen::new();
            let empty = Arc::new(INode::new(
                MainNode::new(Main::CNode(CNode::empty(gen))),
                gen,
            ));
            if self.rdcss_root(cell, root, expected, empty, guard) {
                return;
            }
        }
    }

    /// Checks for emptiness.
    ///
    /// On a live trie this is inherently racy, like any other point-in-time
    /// observation of a concurrent structure.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        let (_, root) = self.read_root(false, guard);
        let main = self.gcas_read(root, guard);
        match &unsafe { main.deref() }.node {
            Main::CNode(cn) => cn.bitmap == 0,
            _ => false,
        }
    }
}

impl<K, V, S> Drop for Raw<K, V, S> {
    fn drop(&mut self) {
        // We are in a destructor with &mut self: there are no concurrent
        // accesses any more and all of them have been synchronized into this
        // thread, so unprotected access with Relaxed is fine. Dropping the
        // root cell releases the root Arc, which cascades through the
        // branches; anything shared with a snapshot stays alive through that
        // snapshot's own references.
        unsafe {
            let cell = self.root.load(Ordering::Relaxed, epoch::unprotected());
            drop(cell.into_owned());
        }
    }
}

/// The smallest subtree distinguishing two colliding leaves, deepening one
/// level at a time until their hashes diverge or are exhausted.
fn dual<K, V>(x: Leaf<K, V>, y: Leaf<K, V>, lev: u32, gen: Gen) -> Main<K, V> {
    if lev >= MAX_SHIFT {
        return Main::LNode(LNode {
            hash: x.hash,
            entries: SmallVec::from_vec(vec![x.entry, y.entry]),
        });
    }
    let xidx = (x.hash >> lev) & LEVEL_MASK;
    let yidx = (y.hash >> lev) & LEVEL_MASK;
    let bitmap = (1u32 << xidx) | (1u32 << yidx);
    if xidx == yidx {
        let sub = INode::new(MainNode::new(dual(x, y, lev + LEVEL_BITS, gen)), gen);
        Main::CNode(CNode {
            bitmap,
            branches: Box::new([Branch::Indirect(Arc::new(sub))]),
            gen,
        })
    } else {
        let (first, second) = if xidx < yidx { (x, y) } else { (y, x) };
        Main::CNode(CNode {
            bitmap,
            branches: Box::new([Branch::Leaf(first), Branch::Leaf(second)]),
            gen,
        })
    }
}

impl<K, V> CNode<K, V> {
    fn empty(gen: Gen) -> Self {
        CNode {
            bitmap: 0,
            branches: Box::new([]),
            gen,
        }
    }

    /// A copy with the branch at `pos` replaced.
    fn updated_at(&self, pos: usize, branch: Branch<K, V>, gen: Gen) -> Self {
        let mut branches: Vec<_> = self.branches.to_vec();
        branches[pos] = branch;
        CNode {
            bitmap: self.bitmap,
            branches: branches.into_boxed_slice(),
            gen,
        }
    }

    /// A copy with `branch` spliced in at `pos` and `flag` set in the bitmap.
    fn inserted_at(&self, pos: usize, flag: u32, branch: Branch<K, V>, gen: Gen) -> Self {
        let mut branches = Vec::with_capacity(self.branches.len() + 1);
        branches.extend(self.branches[..pos].iter().cloned());
        branches.push(branch);
        branches.extend(self.branches[pos..].iter().cloned());
        CNode {
            bitmap: self.bitmap | flag,
            branches: branches.into_boxed_slice(),
            gen,
        }
    }

    /// A copy with the branch at `pos` removed and `flag` cleared.
    fn removed_at(&self, pos: usize, flag: u32, gen: Gen) -> Self {
        let mut branches = Vec::with_capacity(self.branches.len() - 1);
        branches.extend(self.branches[..pos].iter().cloned());
        branches.extend(self.branches[pos + 1..].iter().cloned());
        CNode {
            bitmap: self.bitmap & !flag,
            branches: branches.into_boxed_slice(),
            gen,
        }
    }

    /// Collapses a single-leaf node below the root into a tomb, signalling the
    /// parent to absorb the leaf directly.
    fn contracted(self, lev: u32) -> Main<K, V> {
        if lev > 0 && self.branches.len() == 1 {
            if let Branch::Leaf(leaf) = &self.branches[0] {
                return Main::Tomb(leaf.clone());
            }
        }
        Main::CNode(self)
    }
}

impl<K, V> LNode<K, V>
where
    K: Eq,
{
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq,
        K: Borrow<Q>,
    {
        self.entries.iter().find(|e| e.key().borrow() == key)
    }

    /// A copy with `entry` added, displacing any entry under the same key.
    fn inserted(&self, entry: Arc<Entry<K, V>>) -> Self {
        let mut entries: SmallVec<_> = self
            .entries
            .iter()
            .filter(|e| e.key() != entry.key())
            .cloned()
            .collect();
        entries.push(entry);
        LNode {
            hash: self.hash,
            entries,
        }
    }

    /// A copy without the entry under `key`.
    fn removed<Q>(&self, key: &Q) -> Self
    where
        Q: ?Sized + Eq,
        K: Borrow<Q>,
    {
        LNode {
            hash: self.hash,
            entries: self
                .entries
                .iter()
                .filter(|e| e.key().borrow() != key)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::hash_map::RandomState;
    use std::mem;

    use super::*;

    // A hasher to create collisions on purpose. Turns the trie into a
    // glorified collision bucket. Tests in higher-level modules reuse it.
    #[derive(Clone)]
    pub(crate) struct NoHasher;

    impl Hasher for NoHasher {
        fn finish(&self) -> u64 {
            0
        }

        fn write(&mut self, _: &[u8]) {}
    }

    impl BuildHasher for NoHasher {
        type Hasher = NoHasher;

        fn build_hasher(&self) -> NoHasher {
            NoHasher
        }
    }

    // Splats every input byte across the whole hash. Identical low bytes
    // collide deep down while still branching near the top.
    #[derive(Clone, Copy, Debug, Default)]
    pub(crate) struct SplatHasher(u64);

    impl Hasher for SplatHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, value: &[u8]) {
            for val in value {
                for idx in 0..mem::size_of::<u64>() {
                    self.0 ^= (*val as u64) << (8 * idx);
                }
            }
        }
    }

    pub(crate) struct MakeSplatHasher;

    impl BuildHasher for MakeSplatHasher {
        type Hasher = SplatHasher;

        fn build_hasher(&self) -> SplatHasher {
            SplatHasher::default()
        }
    }

    fn entry<K, V>(key: K, value: V) -> Arc<Entry<K, V>> {
        Arc::new(Entry::new(key, value))
    }

    #[test]
    fn consts_consistent() {
        assert_eq!(LEVEL_BITS, LEVEL_MASK.count_ones());
        assert_eq!(LEVEL_BITS, (!LEVEL_MASK).trailing_zeros());
        assert_eq!(35, MAX_SHIFT);
        assert_eq!(7, MAX_DEPTH);
    }

    #[test]
    fn insert_lookup_remove() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        assert!(trie.lookup(&1, &guard).is_none());
        assert!(trie.insert(entry(1, 10), Cond::Any, &guard).is_none());
        assert_eq!(10, *trie.lookup(&1, &guard).unwrap().value());
        let prev = trie.remove(&1, Cond::Any, &guard).unwrap();
        assert_eq!(10, *prev.value());
        assert!(trie.lookup(&1, &guard).is_none());
        assert!(trie.is_empty(&guard));
    }

    #[test]
    fn full_collisions_form_a_bucket() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(NoHasher);
        let guard = epoch::pin();
        for i in 0..4 {
            assert!(trie.insert(entry(i, i), Cond::Any, &guard).is_none());
        }
        let census = trie.census();
        assert_eq!(4, census.entries);
        assert_eq!(1, census.buckets);
        // Six bitmap levels hang above the bucket.
        assert_eq!((MAX_SHIFT / LEVEL_BITS) as usize, census.max_depth);
        for i in 0..4 {
            assert_eq!(i, *trie.lookup(&i, &guard).unwrap().value());
        }
        trie.assert_consistent();
    }

    #[test]
    fn bucket_contracts_to_leaf() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(NoHasher);
        let guard = epoch::pin();
        trie.insert(entry(1, 1), Cond::Any, &guard);
        trie.insert(entry(2, 2), Cond::Any, &guard);
        assert_eq!(1, trie.census().buckets);

        assert!(trie.remove(&1, Cond::Any, &guard).is_some());
        // The survivor is tombed and the next pass through the branch folds it
        // into the parent.
        assert_eq!(2, *trie.lookup(&2, &guard).unwrap().value());
        let census = trie.census();
        assert_eq!(0, census.buckets);
        assert_eq!(0, census.tombs);
        assert_eq!(1, census.entries);
    }

    #[test]
    fn removal_prunes_single_leaf_chains() {
        let trie: Raw<u64, u64, _> = Raw::with_hasher(MakeSplatHasher);
        let guard = epoch::pin();
        // All these share the lowest five hash bits, so they hang off a single
        // root slot and only split one level deeper.
        let keys = [0x01u64, 0x21, 0x41, 0x61];
        for &k in &keys {
            trie.insert(entry(k, k), Cond::Any, &guard);
        }
        assert!(trie.census().max_depth >= 2);
        for &k in &keys {
            assert_eq!(k, *trie.remove(&k, Cond::Any, &guard).unwrap().value());
            trie.assert_consistent();
        }
        assert!(trie.is_empty(&guard));
    }

    #[test]
    fn conditional_insert_semantics() {
        let trie: Raw<&str, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        assert!(trie.insert(entry("k", 1), Cond::IfAbsent, &guard).is_none());
        let kept = trie.insert(entry("k", 2), Cond::IfAbsent, &guard).unwrap();
        assert_eq!(1, *kept.value());
        assert_eq!(1, *trie.lookup("k", &guard).unwrap().value());

        // Plain replace only fires on present keys.
        assert!(trie.insert(entry("m", 9), Cond::IfPresent, &guard).is_none());
        assert!(trie.lookup("m", &guard).is_none());
        let prev = trie.insert(entry("k", 3), Cond::IfPresent, &guard).unwrap();
        assert_eq!(1, *prev.value());

        // Value-conditional replace.
        let eq: fn(&u32, &u32) -> bool = |a, b| a == b;
        assert!(trie
            .insert(entry("k", 4), Cond::IfEqual(&9, eq), &guard)
            .is_none());
        assert_eq!(3, *trie.lookup("k", &guard).unwrap().value());
        assert!(trie
            .insert(entry("k", 4), Cond::IfEqual(&3, eq), &guard)
            .is_some());
        assert_eq!(4, *trie.lookup("k", &guard).unwrap().value());
    }

    #[test]
    fn conditional_remove_semantics() {
        let trie: Raw<&str, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        trie.insert(entry("k", 1), Cond::Any, &guard);
        let eq: fn(&u32, &u32) -> bool = |a, b| a == b;
        assert!(trie.remove("k", Cond::IfEqual(&2, eq), &guard).is_none());
        assert_eq!(1, *trie.lookup("k", &guard).unwrap().value());
        assert!(trie.remove("k", Cond::IfEqual(&1, eq), &guard).is_some());
        assert!(trie.lookup("k", &guard).is_none());
    }

    #[test]
    fn snapshot_is_isolated() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        trie.insert(entry(1, 1), Cond::Any, &guard);

        let snap = trie.snapshot(false);
        trie.insert(entry(1, 100), Cond::Any, &guard);
        trie.insert(entry(2, 2), Cond::Any, &guard);

        assert_eq!(1, *snap.lookup(&1, &guard).unwrap().value());
        assert!(snap.lookup(&2, &guard).is_none());
        assert_eq!(100, *trie.lookup(&1, &guard).unwrap().value());

        // And the snapshot can diverge on its own.
        snap.insert(entry(3, 3), Cond::Any, &guard);
        assert!(trie.lookup(&3, &guard).is_none());
        assert_eq!(3, *snap.lookup(&3, &guard).unwrap().value());
    }

    #[test]
    fn read_only_snapshot_answers_from_tombs() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(NoHasher);
        let guard = epoch::pin();
        trie.insert(entry(1, 1), Cond::Any, &guard);
        trie.insert(entry(2, 2), Cond::Any, &guard);
        // Leave a tomb behind, then freeze before anything folds it.
        trie.remove(&1, Cond::Any, &guard);
        let frozen = trie.snapshot(true);
        assert!(frozen.is_read_only());
        assert_eq!(2, *frozen.lookup(&2, &guard).unwrap().value());
        assert!(frozen.lookup(&1, &guard).is_none());
    }

    #[test]
    fn clear_detaches_old_root() {
        let trie: Raw<u32, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        for i in 0..100 {
            trie.insert(entry(i, i), Cond::Any, &guard);
        }
        let snap = trie.snapshot(true);
        trie.clear(&guard);
        assert!(trie.is_empty(&guard));
        assert!(!snap.is_empty(&guard));
        assert_eq!(7, *snap.lookup(&7, &guard).unwrap().value());
    }

    #[test]
    fn deep_split_stops_where_hashes_diverge() {
        // Hand-picked hashes: equal in every window up to shift 25, diverging
        // only in the last usable one at shift 30.
        #[derive(Clone, Copy, Default)]
        struct FixedHasher(u64);

        impl Hasher for FixedHasher {
            fn finish(&self) -> u64 {
                self.0
            }
            fn write(&mut self, _: &[u8]) {}
            fn write_u32(&mut self, v: u32) {
                self.0 = match v {
                    1 => 0x0000_0001,
                    _ => 0x4000_0001,
                };
            }
        }

        struct MakeFixedHasher;
        impl BuildHasher for MakeFixedHasher {
            type Hasher = FixedHasher;
            fn build_hasher(&self) -> FixedHasher {
                FixedHasher::default()
            }
        }

        let trie: Raw<u32, u32, _> = Raw::with_hasher(MakeFixedHasher);
        let guard = epoch::pin();
        trie.insert(entry(1, 1), Cond::Any, &guard);
        trie.insert(entry(2, 2), Cond::Any, &guard);
        let census = trie.census();
        assert_eq!(2, census.entries);
        assert_eq!(0, census.buckets);
        // The chain deepens through every bitmap level and stops short of a
        // collision bucket.
        assert_eq!(MAX_DEPTH, census.max_depth);
        assert_eq!(1, *trie.lookup(&1, &guard).unwrap().value());
        assert_eq!(2, *trie.lookup(&2, &guard).unwrap().value());
        trie.assert_consistent();
    }
}
