//! Traversal over a raw trie.

use std::mem;
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam_epoch::{self as epoch, Guard};

use super::{Branch, CNode, LNode, Main, Raw, MAX_DEPTH};
use crate::map::Entry;

unsafe fn extend_lifetime<'a, 'b, T>(r: &'a T) -> &'b T {
    mem::transmute(r)
}

struct Frame<'a, K, V> {
    node: &'a CNode<K, V>,
    pos: usize,
}

// Notes about the lifetimes:
// The 'a here is actually a lie. We need two things from lifetimes:
// * We must not outlive the trie we are iterating through.
// * The node references must not outlive the pin we hold: every payload we
//   walk through was read under it, and retirement is deferred past it.
// * We do not mind us (or the pin) moving around in memory; the references
//   don't point inside the pin itself.
//
// The lifetime of the pin is the same as of the references we store inside of
// us. We check the lifetime relation of the trie and us in the constructor, so
// we won't outlive the trie. But technically, the lifetime should be something
// like `'self`, and it's not possible to describe that.
//
// Therefore we have to make very sure to never return a reference with the 'a
// lifetime.
//
// For the same technical reasons, we do the extend_lifetime thing.
pub struct Iter<'a, K, V, S> {
    raw: &'a Raw<K, V, S>,
    guard: Guard,
    stack: ArrayVec<Frame<'a, K, V>, MAX_DEPTH>,
    bucket: Option<(&'a LNode<K, V>, usize)>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Eq + std::hash::Hash,
    S: std::hash::BuildHasher,
{
    pub fn new<'m: 'a>(raw: &'m Raw<K, V, S>) -> Self {
        let guard = epoch::pin();
        let mut stack = ArrayVec::new();
        {
            let (_, root) = raw.read_root(false, &guard);
            let main = raw.gcas_read(root, &guard);
            // The root payload is always a bitmap node (possibly empty).
            if let Main::CNode(cn) = &unsafe { main.deref() }.node {
                let cn = unsafe { extend_lifetime(cn) };
                stack.push(Frame { node: cn, pos: 0 });
            }
        }
        Iter {
            raw,
            guard,
            stack,
            bucket: None,
        }
    }

    // Not an iterator because this borrows out of the iterator itself (and
    // effectively its pin); the map-level wrapper clones the Arcs out.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&Arc<Entry<K, V>>> {
        if let Some((bucket, pos)) = &mut self.bucket {
            if *pos < bucket.entries.len() {
                let result = &bucket.entries[*pos];
                *pos += 1;
                return Some(result);
            }
            self.bucket = None;
        }
        loop {
            let (node, pos) = match self.stack.last_mut() {
                Some(frame) if frame.pos < frame.node.branches.len() => {
                    let current = (frame.node, frame.pos);
                    frame.pos += 1;
                    current
                }
                Some(_) => {
                    self.stack.pop();
                    continue;
                }
                None => return None,
            };
            match &node.branches[pos] {
                Branch::Leaf(leaf) => return Some(&leaf.entry),
                Branch::Indirect(sub) => {
                    let main = self.raw.gcas_read(sub, &self.guard);
                    match &unsafe { main.deref() }.node {
                        Main::CNode(cn) => {
                            let cn = unsafe { extend_lifetime(cn) };
                            self.stack.push(Frame { node: cn, pos: 0 });
                        }
                        // A tombed leaf is still a live entry.
                        Main::Tomb(leaf) => {
                            return Some(unsafe { extend_lifetime(&leaf.entry) })
                        }
                        Main::LNode(bucket) => {
                            let bucket = unsafe { extend_lifetime(bucket) };
                            self.bucket = Some((bucket, 1));
                            return Some(&bucket.entries[0]);
                        }
                        Main::Failed => unreachable!("Failed payload escaped a GCAS read"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::RandomState;
    use std::collections::HashSet;

    use super::super::tests::NoHasher;
    use super::super::{Cond, Raw};
    use super::*;

    fn collect_values<S>(raw: &Raw<u32, u32, S>) -> Vec<u32>
    where
        S: std::hash::BuildHasher,
    {
        let mut iter = Iter::new(raw);
        let mut values = Vec::new();
        while let Some(entry) = iter.next() {
            values.push(*entry.value());
        }
        values.sort_unstable();
        values
    }

    #[test]
    fn empty() {
        let raw: Raw<u32, u32, _> = Raw::with_hasher(RandomState::new());
        assert!(collect_values(&raw).is_empty());
    }

    #[test]
    fn yields_each_entry_once() {
        let raw: Raw<u32, u32, _> = Raw::with_hasher(RandomState::new());
        let guard = epoch::pin();
        for i in 0..1_000 {
            raw.insert(Arc::new(Entry::new(i, i)), Cond::Any, &guard);
        }
        let values = collect_values(&raw);
        assert_eq!((0..1_000).collect::<Vec<_>>(), values);
    }

    #[test]
    fn walks_collision_buckets() {
        let raw: Raw<u32, u32, _> = Raw::with_hasher(NoHasher);
        let guard = epoch::pin();
        for i in 0..100 {
            raw.insert(Arc::new(Entry::new(i, i)), Cond::Any, &guard);
        }
        let unique: HashSet<_> = collect_values(&raw).into_iter().collect();
        assert_eq!(100, unique.len());
    }
}
