//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *trie itself*, but the
//! pretty-printer is exposed as potentially useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};

use crossbeam_epoch::{self as epoch, Guard};

use super::{Branch, INode, Main, Raw};

impl<K, V, S> Raw<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn print_shape_inode(&self, inode: &INode<K, V>, fmt: &mut Formatter, guard: &Guard) -> FmtResult
    where
        K: Debug,
        V: Debug,
    {
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.node {
            Main::CNode(cn) => {
                write!(fmt, "({:08x}", cn.bitmap)?;
                for branch in cn.branches.iter() {
                    match branch {
                        Branch::Leaf(leaf) => {
                            write!(fmt, " {:?}={:?}", leaf.entry.key(), leaf.entry.value())?
                        }
                        Branch::Indirect(sub) => {
                            write!(fmt, " ")?;
                            self.print_shape_inode(sub, fmt, guard)?;
                        }
                    }
                }
                write!(fmt, " )")
            }
            Main::Tomb(leaf) => write!(fmt, "†{:?}={:?}", leaf.entry.key(), leaf.entry.value()),
            Main::LNode(ln) => {
                write!(fmt, "[")?;
                for entry in &ln.entries {
                    write!(fmt, " {:?}={:?}", entry.key(), entry.value())?;
                }
                write!(fmt, " ]")
            }
            Main::Failed => unreachable!("Failed payload escaped a GCAS read"),
        }
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        K: Debug,
        V: Debug,
    {
        let guard = epoch::pin();
        let (_, root) = self.read_root(false, &guard);
        self.print_shape_inode(root, fmt, &guard)
    }
}

/// A pretty-printing wrapper around the raw trie.
///
/// The structure, including bitmaps, tombs and collision buckets, is printed
/// if this is used to wrap the raw trie.
pub struct PrintShape<'a, K, V, S>(pub &'a Raw<K, V, S>);

impl<K, V, S> Display for PrintShape<'_, K, V, S>
where
    K: Eq + Hash + Debug,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}
