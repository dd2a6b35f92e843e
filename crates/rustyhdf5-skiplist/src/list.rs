//! Deterministic 1-2-3 skip list.
//!
//! Every node has a height `h` and is linked on levels `0..=h`. The head
//! sentinel is linked on every level up to the list's current level. For
//! each level `l > 0`, between two consecutive nodes of height `>= l` (the
//! head counts as one, the end of the list closes the last gap) there are
//! one, two or three nodes of height exactly `l - 1`. No randomness is
//! involved, so the shape of a list depends only on its operation history.
//!
//! Insertion splits full gaps on the way down, so the new height-0 node
//! never overfills its gap. Removal always unlinks a height-0 node (an
//! internal node first trades its entry with its predecessor) and then
//! walks back up, lowering a separator wherever a gap emptied and raising a
//! replacement wherever lowering one would overfill the merged gap.
//!
//! Nodes live in a slot table and are addressed by [`NodeId`]. Forward
//! arrays have power-of-two lengths and come from the shared
//! [`pool`](crate::pool).

use core::cmp::Ordering;
use core::fmt;
use core::mem;

use crate::error::{Result, SkipListError};
use crate::key::{KeyKind, ListKey};
use crate::pool;

/// Handle to a node of a [`SkipList`].
///
/// A handle stays valid until its node is removed. Removing a node may
/// also move its predecessor's entry into it, so handles to the removed
/// node and to its predecessor should be refreshed after any removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

pub(crate) type Link = Option<NodeId>;

/// A position during a walk. `None` is the head sentinel.
type Pos = Option<NodeId>;

/// What [`SkipList::iterate`] does after visiting an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<R> {
    /// Go on to the next entry.
    Next,
    /// Remove the entry just visited, then go on.
    Remove,
    /// Stop and return the value from `iterate`.
    Stop(R),
}

struct Node<K, V> {
    key: K,
    value: V,
    hash: u32,
    height: usize,
    forward: Box<[Link]>,
    backward: Link,
}

enum Comparator<K> {
    Native(fn(&K, &K) -> Ordering),
    Custom(Box<dyn Fn(&K, &K) -> Ordering + Send + Sync>),
}

fn no_hash<K>(_: &K) -> u32 {
    0
}

/// Ordered map with logarithmic insert, search and remove and O(1)
/// stepping between neighbours.
pub struct SkipList<K, V> {
    kind: KeyKind,
    cmp: Comparator<K>,
    hasher: fn(&K) -> u32,
    head: Box<[Link]>,
    level: usize,
    nodes: Vec<Option<Node<K, V>>>,
    vacant: Vec<usize>,
    len: usize,
    last: Link,
    path: Vec<Pos>,
}

impl<K: ListKey, V> SkipList<K, V> {
    /// Create an empty list ordered by the key type's built-in order.
    pub fn new() -> Self {
        Self::build(K::KIND, Comparator::Native(K::compare), K::hash32)
    }
}

impl<K: ListKey, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SkipList<K, V> {
    /// Create an empty list ordered by `cmp`, which must be a total order.
    pub fn with_comparator<F>(cmp: F) -> Self
    where
        F: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        Self::build(KeyKind::Generic, Comparator::Custom(Box::new(cmp)), no_hash::<K>)
    }

    fn build(kind: KeyKind, cmp: Comparator<K>, hasher: fn(&K) -> u32) -> Self {
        Self {
            kind,
            cmp,
            hasher,
            head: pool::acquire(0),
            level: 0,
            nodes: Vec::new(),
            vacant: Vec::new(),
            len: 0,
            last: None,
            path: Vec::new(),
        }
    }

    /// The kind of key this list was created for.
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Highest level currently in use (0 for lists of up to three entries).
    pub fn current_level(&self) -> usize {
        self.level
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// The node holding `key`.
    pub fn find(&self, key: &K) -> Option<NodeId> {
        let hash = (self.hasher)(key);
        let candidate = self.fwd(self.predecessor(key, hash), 0)?;
        self.matches(candidate, key, hash).then_some(candidate)
    }

    /// The value stored under `key`.
    pub fn search(&self, key: &K) -> Option<&V> {
        self.find(key).map(|id| &self.node(id).value)
    }

    /// Mutable access to the value stored under `key`.
    pub fn search_mut(&mut self, key: &K) -> Option<&mut V> {
        let id = self.find(key)?;
        Some(&mut self.node_mut(id).value)
    }

    /// The node holding `key`, or else the node with the greatest key below
    /// it.
    pub fn below(&self, key: &K) -> Option<NodeId> {
        let hash = (self.hasher)(key);
        let pred = self.predecessor(key, hash);
        match self.fwd(pred, 0) {
            Some(candidate) if self.matches(candidate, key, hash) => Some(candidate),
            _ => pred,
        }
    }

    /// Value for [`below`](Self::below).
    pub fn less(&self, key: &K) -> Option<&V> {
        self.below(key).map(|id| &self.node(id).value)
    }

    /// The node holding `key`, or else the node with the least key above it.
    pub fn above(&self, key: &K) -> Option<NodeId> {
        self.fwd(self.predecessor(key, (self.hasher)(key)), 0)
    }

    /// Value for [`above`](Self::above).
    pub fn greater(&self, key: &K) -> Option<&V> {
        self.above(key).map(|id| &self.node(id).value)
    }

    /// Node with the smallest key.
    pub fn first(&self) -> Option<NodeId> {
        self.head[0]
    }

    /// Node with the largest key.
    pub fn last(&self) -> Option<NodeId> {
        self.last
    }

    /// Successor of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).forward[0]
    }

    /// Predecessor of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).backward
    }

    /// Key of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn key(&self, id: NodeId) -> &K {
        &self.node(id).key
    }

    /// Value of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn value(&self, id: NodeId) -> &V {
        &self.node(id).value
    }

    /// Mutable value of `id`. The key cannot be changed in place.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id).value
    }

    /// In-order iterator over `(key, value)` pairs.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            front: self.head[0],
            back: self.last,
            remaining: self.len,
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Insert `value` under `key`.
    ///
    /// Fails with [`SkipListError::DuplicateKey`] if an equal key is present;
    /// the list is left valid (gaps split on the way down stay split).
    pub fn insert(&mut self, key: K, value: V) -> Result<NodeId> {
        let hash = (self.hasher)(&key);
        if self.vacant.is_empty() {
            self.nodes
                .try_reserve(1)
                .map_err(|_| SkipListError::OutOfMemory)?;
        }

        let mut at: Pos = None;
        let mut gap_end: Link = None;
        let mut lvl = self.level;
        loop {
            let mut count = 0;
            let mut middle = None;
            let mut x = self.fwd(at, lvl);
            while let Some(id) = x {
                if x == gap_end {
                    break;
                }
                count += 1;
                if count == 2 {
                    middle = Some(id);
                }
                x = self.node(id).forward[lvl];
            }
            debug_assert!(count <= 3, "gap at level {lvl} holds {count} nodes");
            if count == 3 {
                if let Some(mid) = middle {
                    self.promote(at, mid, lvl);
                }
            }

            let mut drop = at;
            let mut x = self.fwd(at, lvl);
            while let Some(id) = x {
                if x == gap_end {
                    break;
                }
                match self.order(id, &key, hash) {
                    Ordering::Less => drop = Some(id),
                    Ordering::Equal => return Err(SkipListError::DuplicateKey),
                    Ordering::Greater => break,
                }
                x = self.node(id).forward[lvl];
            }

            if lvl == 0 {
                return Ok(self.link_new(drop, key, value, hash));
            }
            gap_end = self.fwd(drop, lvl);
            at = drop;
            lvl -= 1;
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_entry(key).map(|(_, value)| value)
    }

    /// Remove `key`, returning the stored key and value.
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        let hash = (self.hasher)(key);
        let mut path = mem::take(&mut self.path);
        let pred = self.predecessor_path(key, hash, &mut path);
        let found = match self.fwd(pred, 0) {
            Some(target) if self.matches(target, key, hash) => Some(self.unlink(target, &mut path)),
            _ => None,
        };
        self.path = path;
        found
    }

    /// Remove the entry with the smallest key.
    pub fn remove_first(&mut self) -> Option<V> {
        let target = self.head[0]?;
        let mut path = mem::take(&mut self.path);
        path.clear();
        path.resize(self.level + 2, None);
        let (_, value) = self.unlink(target, &mut path);
        self.path = path;
        Some(value)
    }

    /// Remove the entry held by `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live node.
    pub fn remove_at(&mut self, id: NodeId) -> (K, V) {
        let mut path = mem::take(&mut self.path);
        let node = self.node(id);
        self.predecessor_path(&node.key, node.hash, &mut path);
        let entry = self.unlink(id, &mut path);
        self.path = path;
        entry
    }

    /// Visit entries in order. `f` may ask for the entry it was just given
    /// to be removed; removing anything else during the walk is not
    /// possible. Returns the first [`Step::Stop`] value.
    pub fn iterate<R, F>(&mut self, mut f: F) -> Option<R>
    where
        F: FnMut(&K, &mut V) -> Step<R>,
    {
        let mut cur = self.head[0];
        while let Some(id) = cur {
            let next = self.node(id).forward[0];
            let node = self.node_mut(id);
            match f(&node.key, &mut node.value) {
                Step::Next => {}
                Step::Remove => {
                    self.remove_at(id);
                }
                Step::Stop(r) => return Some(r),
            }
            cur = next;
        }
        None
    }

    /// Drop every entry. The list stays usable.
    pub fn clear(&mut self) {
        self.clear_with(|_, _| {});
    }

    /// Hand every entry to `f` in key order, leaving the list empty.
    pub fn clear_with<F: FnMut(K, V)>(&mut self, mut f: F) {
        let mut cur = self.head[0];
        while let Some(id) = cur {
            let Node {
                key,
                value,
                forward,
                ..
            } = self.take_node(id);
            cur = forward[0];
            pool::release(forward);
            f(key, value);
        }
        self.nodes.clear();
        self.vacant.clear();
        self.head.iter_mut().for_each(|link| *link = None);
        self.level = 0;
        self.len = 0;
        self.last = None;
    }

    /// Consume the list, handing every entry to `f` in key order.
    pub fn destroy_with<F: FnMut(K, V)>(mut self, f: F) {
        self.clear_with(f);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn node(&self, id: NodeId) -> &Node<K, V> {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("skip list node {} is not live", id.0),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("skip list node {} is not live", id.0),
        }
    }

    fn take_node(&mut self, id: NodeId) -> Node<K, V> {
        match self.nodes.get_mut(id.0).and_then(Option::take) {
            Some(node) => {
                self.vacant.push(id.0);
                node
            }
            None => panic!("skip list node {} is not live", id.0),
        }
    }

    fn fwd(&self, at: Pos, lvl: usize) -> Link {
        match at {
            None => self.head[lvl],
            Some(id) => self.node(id).forward[lvl],
        }
    }

    fn set_fwd(&mut self, at: Pos, lvl: usize, to: Link) {
        match at {
            None => self.head[lvl] = to,
            Some(id) => self.node_mut(id).forward[lvl] = to,
        }
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        match &self.cmp {
            Comparator::Native(f) => f(a, b),
            Comparator::Custom(f) => f(a, b),
        }
    }

    /// Order of the entry at `id` against `key`. Byte strings order by
    /// cached hash first; bytes are compared only when the hashes agree.
    fn order(&self, id: NodeId, key: &K, hash: u32) -> Ordering {
        let node = self.node(id);
        if self.kind == KeyKind::ByteString {
            match node.hash.cmp(&hash) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        self.compare(&node.key, key)
    }

    fn matches(&self, id: NodeId, key: &K, hash: u32) -> bool {
        self.order(id, key, hash) == Ordering::Equal
    }

    /// Last position whose key is below `key`.
    fn predecessor(&self, key: &K, hash: u32) -> Pos {
        let mut at = None;
        for lvl in (0..=self.level).rev() {
            at = self.advance(at, lvl, key, hash);
        }
        at
    }

    /// Like [`predecessor`](Self::predecessor), recording in `path[l]` the
    /// last position on level `l` whose key is below `key`. `path` gets one
    /// extra slot above the current level, holding the head.
    fn predecessor_path(&self, key: &K, hash: u32, path: &mut Vec<Pos>) -> Pos {
        path.clear();
        path.resize(self.level + 2, None);
        let mut at = None;
        for lvl in (0..=self.level).rev() {
            at = self.advance(at, lvl, key, hash);
            path[lvl] = at;
        }
        at
    }

    fn advance(&self, mut at: Pos, lvl: usize, key: &K, hash: u32) -> Pos {
        while let Some(next) = self.fwd(at, lvl) {
            if self.order(next, key, hash) != Ordering::Less {
                break;
            }
            at = Some(next);
        }
        at
    }

    /// Number of nodes on `lvl` strictly between `from` and `to`.
    fn count_between(&self, from: Pos, to: Link, lvl: usize) -> usize {
        let mut count = 0;
        let mut x = self.fwd(from, lvl);
        while let Some(id) = x {
            if x == to {
                break;
            }
            count += 1;
            x = self.node(id).forward[lvl];
        }
        count
    }

    /// Make sure the forward array at `at` can hold a link on `lvl`.
    fn reserve_level(&mut self, at: Pos, lvl: usize) {
        let len = match at {
            None => self.head.len(),
            Some(id) => self.node(id).forward.len(),
        };
        if lvl < len {
            return;
        }
        let log = (lvl + 1).next_power_of_two().trailing_zeros();
        let mut grown = pool::acquire(log);
        let slot = match at {
            None => &mut self.head,
            Some(id) => &mut self.node_mut(id).forward,
        };
        grown[..slot.len()].copy_from_slice(slot);
        pool::release(mem::replace(slot, grown));
    }

    /// Raise `id` from height `lvl` to `lvl + 1`, linking it right after
    /// `at` on the new level. `at` must be linked on `lvl + 1`.
    fn promote(&mut self, at: Pos, id: NodeId, lvl: usize) {
        let up = lvl + 1;
        if up > self.level {
            self.reserve_level(None, up);
            self.head[up] = None;
            self.level = up;
        }
        self.reserve_level(Some(id), up);
        let next = self.fwd(at, up);
        let node = self.node_mut(id);
        node.forward[up] = next;
        node.height = up;
        self.set_fwd(at, up, Some(id));
    }

    /// Lower `id` from height `lvl + 1` to `lvl`. The caller has already
    /// unlinked it on `lvl + 1`.
    fn demote(&mut self, id: NodeId, lvl: usize) {
        let node = self.node_mut(id);
        node.forward[lvl + 1] = None;
        node.height = lvl;
    }

    fn link_new(&mut self, after: Pos, key: K, value: V, hash: u32) -> NodeId {
        let next = self.fwd(after, 0);
        let mut forward = pool::acquire(0);
        forward[0] = next;
        let node = Node {
            key,
            value,
            hash,
            height: 0,
            forward,
            backward: after,
        };
        let id = match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        self.set_fwd(after, 0, Some(id));
        match next {
            Some(n) => self.node_mut(n).backward = Some(id),
            None => self.last = Some(id),
        }
        self.len += 1;
        id
    }

    fn swap_entries(&mut self, a: NodeId, b: NodeId) {
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (left, right) = self.nodes.split_at_mut(hi);
        if let (Some(x), Some(y)) = (left[lo].as_mut(), right[0].as_mut()) {
            mem::swap(&mut x.key, &mut y.key);
            mem::swap(&mut x.value, &mut y.value);
            mem::swap(&mut x.hash, &mut y.hash);
        }
    }

    /// Remove `target`'s entry. `path` must come from a descent towards
    /// `target`'s key (or be all-head when `target` is the first node).
    fn unlink(&mut self, target: NodeId, path: &mut [Pos]) -> (K, V) {
        let victim = if self.node(target).height > 0 {
            // The gap in front of an internal node is never empty, so its
            // level-0 predecessor has height 0.
            let pred = match self.node(target).backward {
                Some(pred) => pred,
                None => unreachable!("internal skip list node without predecessor"),
            };
            self.swap_entries(target, pred);
            pred
        } else {
            target
        };

        let Node {
            key,
            value,
            forward,
            backward,
            ..
        } = self.take_node(victim);
        let next = forward[0];
        self.set_fwd(backward, 0, next);
        match next {
            Some(n) => self.node_mut(n).backward = backward,
            None => self.last = backward,
        }
        pool::release(forward);
        self.len -= 1;

        self.refill(path);
        (key, value)
    }

    /// Restore the gap bounds after a height-0 node was unlinked at the
    /// position described by `path`.
    fn refill(&mut self, path: &mut [Pos]) {
        let mut lvl = 0;
        while lvl < self.level {
            let left = path[lvl + 1];
            let right = self.fwd(left, lvl + 1);
            if self.fwd(left, lvl) != right {
                return;
            }

            match right {
                Some(r) if self.node(r).height == lvl + 1 => {
                    let after = self.node(r).forward[lvl + 1];
                    self.set_fwd(left, lvl + 1, after);
                    self.demote(r, lvl);
                    if self.count_between(left, after, lvl) > 3 {
                        if let Some(second) = self.node(r).forward[lvl] {
                            self.promote(left, second, lvl);
                        }
                        return;
                    }
                }
                _ => {
                    let l = match left {
                        Some(l) => l,
                        None => unreachable!("empty skip list gap with no separator"),
                    };
                    let mut ll = path[lvl + 2];
                    loop {
                        match self.fwd(ll, lvl + 1) {
                            Some(n) if n == l => break,
                            Some(n) => ll = Some(n),
                            None => unreachable!("separator missing from its level"),
                        }
                    }
                    self.set_fwd(ll, lvl + 1, right);
                    self.demote(l, lvl);
                    if self.count_between(ll, right, lvl) > 3 {
                        if let Some(second) = self.fwd(ll, lvl).and_then(|first| self.node(first).forward[lvl]) {
                            self.promote(ll, second, lvl);
                        }
                        return;
                    }
                    path[lvl + 1] = ll;
                }
            }
            lvl += 1;
        }

        if self.level > 0 && self.head[self.level].is_none() {
            self.level -= 1;
        }
    }
}

impl<K, V> Drop for SkipList<K, V> {
    fn drop(&mut self) {
        for node in self.nodes.drain(..).flatten() {
            pool::release(node.forward);
        }
        pool::release(mem::take(&mut self.head));
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SkipList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Double-ended in-order iterator returned by [`SkipList::iter`].
pub struct Iter<'a, K, V> {
    list: &'a SkipList<K, V>,
    front: Link,
    back: Link,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.list.node(self.front?);
        self.front = node.forward[0];
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for Iter<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.list.node(self.back?);
        self.back = node.backward;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

impl<'a, K, V> IntoIterator for &'a SkipList<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{hash_bytes, ObjectId};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Check ordering, back links and the 1-2-3 gap bounds on every level.
    fn assert_well_formed<K, V>(list: &SkipList<K, V>) {
        let mut count = 0;
        let mut prev: Pos = None;
        let mut x = list.head[0];
        while let Some(id) = x {
            let node = list.node(id);
            assert_eq!(node.backward, prev, "back link of node {}", id.0);
            assert!(node.height <= list.level);
            if let Some(p) = prev {
                assert_eq!(
                    list.order(p, &node.key, node.hash),
                    Ordering::Less,
                    "level-0 order broken"
                );
            }
            prev = Some(id);
            x = node.forward[0];
            count += 1;
        }
        assert_eq!(count, list.len);
        assert_eq!(list.last, prev);

        for lvl in 1..=list.level {
            let mut a: Pos = None;
            loop {
                let b = list.fwd(a, lvl);
                let gap = list.count_between(a, b, lvl - 1);
                assert!(
                    (1..=3).contains(&gap),
                    "gap of {gap} nodes below level {lvl}"
                );
                match b {
                    Some(b) => a = Some(b),
                    None => break,
                }
            }
        }
        let top = list.count_between(None, None, list.level);
        if list.level > 0 {
            assert!((1..=3).contains(&top), "top level holds {top} nodes");
        } else {
            assert!(top <= 3);
        }
    }

    fn keys<V>(list: &SkipList<i32, V>) -> Vec<i32> {
        list.iter().map(|(k, _)| *k).collect()
    }

    /// A fixed permutation of `0..n` for prime `n`.
    fn scrambled(n: i32) -> Vec<i32> {
        (0..n).map(|i| (i * 7919) % n).collect()
    }

    #[test]
    fn empty_list_lookups() {
        let mut list: SkipList<i32, &str> = SkipList::new();
        assert!(list.is_empty());
        assert_eq!(list.search(&1), None);
        assert_eq!(list.below(&1), None);
        assert_eq!(list.above(&1), None);
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
        assert_eq!(list.remove(&1), None);
        assert_eq!(list.remove_first(), None);
        assert_well_formed(&list);
    }

    #[test]
    fn predecessor_and_successor_queries() {
        let mut list = SkipList::new();
        for k in [3, 1, 4] {
            list.insert(k, k * 10).unwrap();
        }
        assert_eq!(list.insert(1, 99), Err(SkipListError::DuplicateKey));
        for k in [5, 9, 2, 6] {
            list.insert(k, k * 10).unwrap();
        }

        assert_eq!(list.less(&4), Some(&40));
        assert_eq!(list.less(&7), Some(&60));
        assert_eq!(list.greater(&7), Some(&90));
        assert_eq!(list.greater(&10), None);
        assert_eq!(list.less(&0), None);
        assert_eq!(list.search(&1), Some(&10));
        assert_eq!(keys(&list), vec![1, 2, 3, 4, 5, 6, 9]);
        assert_well_formed(&list);
    }

    #[test]
    fn find_supports_neighbour_stepping() {
        let mut list = SkipList::new();
        for k in 0..20 {
            list.insert(k * 2, ()).unwrap();
        }
        let id = list.find(&10).unwrap();
        assert_eq!(*list.key(list.next(id).unwrap()), 12);
        assert_eq!(*list.key(list.prev(id).unwrap()), 8);
        assert_eq!(list.prev(list.first().unwrap()), None);
        assert_eq!(list.next(list.last().unwrap()), None);
        assert_eq!(list.find(&11), None);
    }

    #[test]
    fn ascending_descending_and_scrambled_inserts_stay_balanced() {
        for order in [
            (0..500).collect::<Vec<_>>(),
            (0..500).rev().collect(),
            scrambled(499),
        ] {
            let mut list = SkipList::new();
            for &k in &order {
                list.insert(k, k).unwrap();
                assert_well_formed(&list);
            }
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(keys(&list), sorted);
            assert!(list.current_level() > 2);
        }
    }

    #[test]
    fn failed_insert_leaves_list_intact() {
        let mut list = SkipList::new();
        for k in 0..64 {
            list.insert(k, k).unwrap();
        }
        for k in 0..64 {
            assert_eq!(list.insert(k, -1), Err(SkipListError::DuplicateKey));
            assert_well_formed(&list);
        }
        assert_eq!(list.len(), 64);
        assert!(list.iter().all(|(k, v)| k == v));
    }

    #[test]
    fn removing_internal_nodes_keeps_structure() {
        let mut list = SkipList::new();
        for k in 0..200 {
            list.insert(k, k).unwrap();
        }
        // Remove the tallest nodes first.
        loop {
            let tallest = (0..list.nodes.len())
                .filter_map(|i| list.nodes[i].as_ref().map(|n| (n.height, n.key)))
                .max();
            match tallest {
                Some((h, k)) if h > 0 => {
                    assert_eq!(list.remove(&k), Some(k));
                    assert_eq!(list.search(&k), None);
                    assert_well_formed(&list);
                }
                _ => break,
            }
        }
        assert!(list.len() <= 3);
    }

    #[test]
    fn remove_in_scrambled_order_until_empty() {
        let mut list = SkipList::new();
        for k in scrambled(251) {
            list.insert(k, k).unwrap();
        }
        for k in scrambled(251).into_iter().rev() {
            assert_eq!(list.remove(&k), Some(k));
            assert_well_formed(&list);
        }
        assert!(list.is_empty());
        assert_eq!(list.current_level(), 0);
    }

    #[test]
    fn remove_first_drains_in_order() {
        let mut list = SkipList::new();
        for k in scrambled(101) {
            list.insert(k, k).unwrap();
        }
        for expected in 0..101 {
            assert_eq!(list.remove_first(), Some(expected));
            assert_well_formed(&list);
        }
        assert_eq!(list.remove_first(), None);
    }

    #[test]
    fn iterate_can_remove_current_entry() {
        let mut list = SkipList::new();
        for k in 0..100 {
            list.insert(k, k).unwrap();
        }
        let mut seen = Vec::new();
        let stopped: Option<()> = list.iterate(|k, _| {
            seen.push(*k);
            if k % 2 == 0 {
                Step::Remove
            } else {
                Step::Next
            }
        });
        assert_eq!(stopped, None);
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(keys(&list), (0..100).filter(|k| k % 2 == 1).collect::<Vec<_>>());
        assert_well_formed(&list);
    }

    #[test]
    fn iterate_stops_with_value() {
        let mut list = SkipList::new();
        for k in 0..10 {
            list.insert(k, k * k).unwrap();
        }
        let found = list.iterate(|k, v| {
            *v += 1;
            if *k == 4 {
                Step::Stop(*v)
            } else {
                Step::Next
            }
        });
        assert_eq!(found, Some(17));
        assert_eq!(list.search(&5), Some(&25));
    }

    #[test]
    fn byte_string_keys() {
        let mut list: SkipList<String, usize> = SkipList::new();
        assert_eq!(list.kind(), KeyKind::ByteString);
        for (i, name) in ["temperature", "pressure", "humidity", "wind", "rain"]
            .iter()
            .enumerate()
        {
            list.insert(name.to_string(), i).unwrap();
        }
        assert_eq!(list.search(&"wind".to_string()), Some(&3));
        assert_eq!(list.search(&"snow".to_string()), None);
        let names: Vec<_> = list.iter().map(|(k, _)| k.as_str()).collect();
        let mut by_hash = names.clone();
        by_hash.sort_by_key(|name| (hash_bytes(name.as_bytes()), name.to_string()));
        assert_eq!(names, by_hash);
        assert_well_formed(&list);
        assert_eq!(
            list.insert("rain".to_string(), 9),
            Err(SkipListError::DuplicateKey)
        );
    }

    #[test]
    fn byte_strings_order_by_hash_before_bytes() {
        // djb2("b") = 177671 < djb2("ab") = 5863208, so "b" sorts first.
        let mut list: SkipList<&[u8], u8> = SkipList::new();
        list.insert(b"ab", 1).unwrap();
        list.insert(b"b", 2).unwrap();
        list.insert(b"a", 3).unwrap();
        let keys: Vec<&[u8]> = list.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, [&b"a"[..], &b"b"[..], &b"ab"[..]]);
        assert_eq!(list.greater(&&b"aa"[..]), Some(&1));
        assert_eq!(list.less(&&b"aa"[..]), Some(&2));
        assert_eq!(list.remove(&&b"b"[..]), Some(2));
        assert_well_formed(&list);
    }

    #[test]
    fn custom_comparator_orders_entries() {
        let mut list = SkipList::with_comparator(|a: &i32, b: &i32| b.cmp(a));
        assert_eq!(list.kind(), KeyKind::Generic);
        for k in scrambled(53) {
            list.insert(k, ()).unwrap();
        }
        let got: Vec<_> = list.iter().map(|(k, _)| *k).collect();
        assert_eq!(got, (0..53).rev().collect::<Vec<_>>());
        assert_well_formed(&list);
    }

    #[test]
    fn object_id_keys() {
        let mut list = SkipList::new();
        list.insert(ObjectId::new(2, 0), "b").unwrap();
        list.insert(ObjectId::new(1, 4096), "a2").unwrap();
        list.insert(ObjectId::new(1, 96), "a1").unwrap();
        let order: Vec<_> = list.iter().map(|(_, v)| *v).collect();
        assert_eq!(order, ["a1", "a2", "b"]);
        assert_eq!(list.search(&ObjectId::new(1, 4096)), Some(&"a2"));
    }

    #[test]
    fn clear_with_hands_back_entries_in_order() {
        let mut list = SkipList::new();
        for k in scrambled(31) {
            list.insert(k, k * 2).unwrap();
        }
        let mut drained = Vec::new();
        list.clear_with(|k, v| drained.push((k, v)));
        assert_eq!(drained, (0..31).map(|k| (k, k * 2)).collect::<Vec<_>>());
        assert!(list.is_empty());
        assert_well_formed(&list);

        list.insert(7, 7).unwrap();
        assert_eq!(list.search(&7), Some(&7));
    }

    #[test]
    fn iterator_runs_both_ways() {
        let mut list = SkipList::new();
        for k in 0..10 {
            list.insert(k, ()).unwrap();
        }
        let back: Vec<_> = list.iter().rev().map(|(k, _)| *k).collect();
        assert_eq!(back, (0..10).rev().collect::<Vec<_>>());
        let mut it = list.iter();
        assert_eq!(it.next().map(|(k, _)| *k), Some(0));
        assert_eq!(it.next_back().map(|(k, _)| *k), Some(9));
        assert_eq!(it.len(), 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16),
        Remove(u16),
        RemoveFirst,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<u16>().prop_map(|k| Op::Insert(k % 512)),
            2 => any::<u16>().prop_map(|k| Op::Remove(k % 512)),
            1 => Just(Op::RemoveFirst),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn matches_btreemap_model(ops in proptest::collection::vec(op(), 1..300)) {
            let mut list: SkipList<u16, u32> = SkipList::new();
            let mut model = BTreeMap::new();
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Insert(k) => {
                        let fresh = !model.contains_key(&k);
                        prop_assert_eq!(list.insert(k, i as u32).is_ok(), fresh);
                        if fresh {
                            model.insert(k, i as u32);
                        }
                    }
                    Op::Remove(k) => prop_assert_eq!(list.remove(&k), model.remove(&k)),
                    Op::RemoveFirst => {
                        let first = model.keys().next().copied();
                        let expected = first.and_then(|k| model.remove(&k));
                        prop_assert_eq!(list.remove_first(), expected);
                    }
                }
                assert_well_formed(&list);
            }
            let got: Vec<_> = list.iter().map(|(k, v)| (*k, *v)).collect();
            let want: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(got, want);
        }

        #[test]
        fn below_and_above_agree_with_model(
            keys in proptest::collection::btree_set(0u32..10_000, 0..200),
            query in 0u32..10_000,
        ) {
            let mut list = SkipList::new();
            for &k in &keys {
                list.insert(k, k).unwrap();
            }
            prop_assert_eq!(list.less(&query), keys.range(..=query).next_back());
            prop_assert_eq!(list.greater(&query), keys.range(query..).next());
        }
    }
}
