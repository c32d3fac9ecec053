//! # Concurrent Ordered Map (Skip List)
//!
//! A probabilistic level-linked skip list parameterized by an ordered key
//! type and an arbitrary value type. This is the keyed storage underneath
//! every tier of the resource tree: databases under the root, documents
//! under a collection, collections under a document.
//!
//! ## Concurrency model
//!
//! Writers coordinate through per-node mutexes with optimistic validation:
//! locate the affected nodes without locks, lock the distinct predecessors,
//! re-validate that nothing moved, and restart from scratch if it did.
//! Readers never take node mutexes; they follow the forward pointers and
//! filter on each node's visibility flags:
//!
//! - `fully_linked` — set once all of a node's forward pointers are
//!   installed; a node is invisible to readers until then.
//! - `marked` — set when a node is logically deleted; the node may still be
//!   reachable from some predecessors but readers skip it.
//!
//! Value slots and forward pointers are swappable `Arc` pointers guarded by
//! lightweight `RwLock`s, so a reader's pointer load is a brief shared
//! acquisition and a writer's swap is atomic with respect to readers.
//!
//! ## Range scans
//!
//! Scans must be serializable against point writes without a global lock.
//! Every successful upsert or delete bumps an operation counter; a scan
//! collects the range twice and succeeds only if the counter did not move
//! and both passes saw the same value pointers. Otherwise it restarts. The
//! result therefore reflects an instant between the scan's start and return
//! with no interleaved writes.
//!
//! ## Upsert with check
//!
//! [`SkipList::upsert`] takes a caller-supplied check function that is run
//! while the relevant locks are held. The check inspects
//! `(key, current value, present)` and decides the outcome: return a
//! replacement value (spliced in for a new key, pointer-swapped for an
//! existing one), return `None` to leave the stored value untouched, or
//! return an error to abort. This is how the resource tree enforces
//! no-overwrite PUT, overwrite PUT, and atomic PATCH without the map
//! knowing anything about documents.
//!
//! ## Sentinels
//!
//! Construction supplies a minimum and maximum sentinel key, strictly below
//! and above every legal key. Keys at or beyond the sentinels cannot be
//! stored; string-keyed maps use `""` and `"\u{10FFFF}"`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::error::{Error, Result};

/// Default maximum level for skip lists in the resource tree.
pub const DEFAULT_MAX_LEVEL: usize = 10;

/// The maximum string sentinel: the highest Unicode scalar value, strictly
/// greater than every legal name.
pub const MAX_STRING_KEY: &str = "\u{10FFFF}";

// =============================================================================
// Node
// =============================================================================

/// One skip-list node. The key is immutable for the node's lifetime; the
/// value slot and the forward pointers are swappable behind their locks.
struct Node<K, V> {
    key: K,

    /// Swappable value pointer. `None` only on the head and tail sentinels.
    value: RwLock<Option<Arc<V>>>,

    /// Highest level index at which this node is linked.
    top_level: usize,

    /// Logical deletion flag; readers skip marked nodes.
    marked: AtomicBool,

    /// Visibility barrier; readers ignore nodes until all forward pointers
    /// are installed.
    fully_linked: AtomicBool,

    /// Per-node writer lock.
    lock: Mutex<()>,

    /// Forward pointers, one per level in `0..=top_level`. Empty on the tail
    /// sentinel, which is never traversed past.
    next: Vec<RwLock<Arc<Node<K, V>>>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: Arc<V>, top_level: usize, succs: &[Arc<Node<K, V>>]) -> Self {
        Node {
            key,
            value: RwLock::new(Some(value)),
            top_level,
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            lock: Mutex::new(()),
            next: (0..=top_level)
                .map(|level| RwLock::new(Arc::clone(&succs[level])))
                .collect(),
        }
    }

    fn sentinel(key: K, top_level: usize, next: Vec<RwLock<Arc<Node<K, V>>>>) -> Self {
        Node {
            key,
            value: RwLock::new(None),
            top_level,
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            lock: Mutex::new(()),
            next,
        }
    }

    /// Loads the forward pointer at `level`.
    fn next_at(&self, level: usize) -> Arc<Node<K, V>> {
        Arc::clone(&self.next[level].read())
    }
}

// =============================================================================
// SkipList
// =============================================================================

/// The concurrent ordered map. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct SkipList<K, V> {
    max_level: usize,
    head: Arc<Node<K, V>>,
    op_count: AtomicU64,
    min_key: K,
    max_key: K,
}

impl<K, V> SkipList<K, V>
where
    K: Ord + Clone,
{
    /// Creates an empty skip list with the given maximum level and sentinel
    /// keys. Every legal key must satisfy `min_key < key < max_key`.
    pub fn new(max_level: usize, min_key: K, max_key: K) -> Self {
        let tail = Arc::new(Node::sentinel(max_key.clone(), max_level, Vec::new()));
        let head = Arc::new(Node::sentinel(
            min_key.clone(),
            max_level,
            (0..=max_level)
                .map(|_| RwLock::new(Arc::clone(&tail)))
                .collect(),
        ));
        SkipList {
            max_level,
            head,
            op_count: AtomicU64::new(0),
            min_key,
            max_key,
        }
    }

    /// Draws a geometric level in `0..max_level` for a new node.
    fn random_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 0;
        while level < self.max_level - 1 && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Locates `key`: returns the highest level at which a node with the key
    /// was found (if any) plus the predecessor and successor at every level.
    #[allow(clippy::type_complexity)]
    fn find(&self, key: &K) -> (Option<usize>, Vec<Arc<Node<K, V>>>, Vec<Arc<Node<K, V>>>) {
        let mut preds = vec![Arc::clone(&self.head); self.max_level + 1];
        let mut succs = preds.clone();
        let mut level_found = None;

        let mut pred = Arc::clone(&self.head);
        for level in (0..=self.max_level).rev() {
            let mut curr = pred.next_at(level);
            while *key > curr.key {
                pred = curr;
                curr = pred.next_at(level);
            }
            if level_found.is_none() && *key == curr.key {
                level_found = Some(level);
            }
            preds[level] = Arc::clone(&pred);
            succs[level] = curr;
        }
        (level_found, preds, succs)
    }

    /// Point lookup. Returns the current value pointer iff a node with the
    /// key is fully linked, unmarked, and still at the level it was first
    /// located at.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        if *key <= self.min_key || *key >= self.max_key {
            return None;
        }
        let (level_found, _, succs) = self.find(key);
        let level = level_found?;
        let node = &succs[level];
        if node.fully_linked.load(Ordering::SeqCst)
            && !node.marked.load(Ordering::SeqCst)
            && node.top_level == level
        {
            node.value.read().clone()
        } else {
            None
        }
    }

    /// Inserts or updates the value for `key`, mediated by `check`.
    ///
    /// The check runs with the affected node locks held and receives
    /// `(key, current value, present)`. Its return decides the outcome:
    ///
    /// - `Ok(Some(v))` with the key absent splices a new node holding `v`;
    /// - `Ok(Some(v))` with the key present swaps the node's value pointer
    ///   to `v`;
    /// - `Ok(None)` leaves the stored value untouched;
    /// - `Err(e)` aborts the operation and is propagated verbatim.
    ///
    /// Returns `updated = true` iff the key was already present. The check
    /// may run more than once if optimistic validation forces a restart, so
    /// it must not assume a single invocation.
    pub fn upsert<F>(&self, key: K, mut check: F) -> Result<bool>
    where
        F: FnMut(&K, Option<&V>, bool) -> Result<Option<Arc<V>>>,
    {
        if key <= self.min_key || key >= self.max_key {
            return Err(Error::InvalidKey);
        }
        loop {
            let (level_found, preds, succs) = self.find(&key);
            let exists = level_found.is_some();

            // Lock the existing node first and confirm it is still the live
            // node for this key; restart otherwise.
            let existing = level_found.map(|level| Arc::clone(&succs[level]));
            let mut existing_guard = None;
            if let (Some(node), Some(level)) = (&existing, level_found) {
                let guard = node.lock.lock();
                if node.marked.load(Ordering::SeqCst)
                    || !node.fully_linked.load(Ordering::SeqCst)
                    || node.top_level != level
                {
                    continue;
                }
                existing_guard = Some(guard);
            }
            let _existing_guard = existing_guard;

            let top_level = match &existing {
                Some(node) => node.top_level,
                None => self.random_level(),
            };

            // Lock the distinct predecessors for every level up to
            // `top_level`, bottom-up, each exactly once.
            let mut distinct: Vec<Arc<Node<K, V>>> = Vec::new();
            for level in 0..=top_level {
                let pred = &preds[level];
                if !distinct.iter().any(|locked| Arc::ptr_eq(locked, pred)) {
                    distinct.push(Arc::clone(pred));
                }
            }
            let _pred_guards: Vec<_> = distinct.iter().map(|pred| pred.lock.lock()).collect();

            // Validate under the locks: predecessor and successor unmarked
            // and still adjacent at every level. Restart on any mismatch.
            let valid = (0..=top_level).all(|level| {
                let pred = &preds[level];
                let succ = &succs[level];
                let unmarked = !pred.marked.load(Ordering::SeqCst)
                    && !succ.marked.load(Ordering::SeqCst);
                let connected = Arc::ptr_eq(&pred.next_at(level), succ);
                unmarked && connected
            });
            if !valid {
                continue;
            }

            let current = existing.as_ref().and_then(|node| node.value.read().clone());
            let replacement = check(&key, current.as_deref(), exists)?;

            let updated = match replacement {
                Some(value) => {
                    if let Some(node) = &existing {
                        *node.value.write() = Some(value);
                        true
                    } else {
                        // Splice: install the new node's forward pointers,
                        // then link each predecessor bottom-up, then raise
                        // the visibility barrier.
                        let node =
                            Arc::new(Node::new(key.clone(), value, top_level, &succs));
                        for level in 0..=top_level {
                            *preds[level].next[level].write() = Arc::clone(&node);
                        }
                        node.fully_linked.store(true, Ordering::SeqCst);
                        false
                    }
                }
                None => exists,
            };

            self.op_count.fetch_add(1, Ordering::SeqCst);
            return Ok(updated);
        }
    }

    /// Removes the node with `key`. Returns `Ok(false)` if no live node with
    /// the key exists.
    pub fn remove(&self, key: &K) -> Result<bool> {
        if *key <= self.min_key || *key >= self.max_key {
            return Ok(false);
        }
        loop {
            let (level_found, preds, succs) = self.find(key);
            let Some(level) = level_found else {
                return Ok(false);
            };

            let target = Arc::clone(&succs[level]);
            let _target_guard = target.lock.lock();
            if target.marked.load(Ordering::SeqCst)
                || !target.fully_linked.load(Ordering::SeqCst)
                || target.top_level != level
            {
                // Another writer is already removing it, or the node we saw
                // is no longer the live one.
                return Ok(false);
            }

            let mut distinct: Vec<Arc<Node<K, V>>> = Vec::new();
            for level in 0..=target.top_level {
                let pred = &preds[level];
                if !distinct.iter().any(|locked| Arc::ptr_eq(locked, pred)) {
                    distinct.push(Arc::clone(pred));
                }
            }
            let _pred_guards: Vec<_> = distinct.iter().map(|pred| pred.lock.lock()).collect();

            let valid = (0..=target.top_level).all(|level| {
                let pred = &preds[level];
                let succ = &succs[level];
                let unmarked = !pred.marked.load(Ordering::SeqCst)
                    && !succ.marked.load(Ordering::SeqCst);
                let connected = Arc::ptr_eq(&pred.next_at(level), succ);
                unmarked && connected
            });
            if !valid {
                continue;
            }

            // Logical delete, then physical unlink from the top level down.
            target.marked.store(true, Ordering::SeqCst);
            for level in (0..=target.top_level).rev() {
                let next = target.next_at(level);
                *preds[level].next[level].write() = next;
            }

            self.op_count.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
    }

    /// Deep-copy point read: clones the value for `key` with `copy` while
    /// holding the node lock, retrying until a stable node is observed.
    pub fn get_copy<F>(&self, key: &K, copy: F) -> Result<V>
    where
        F: Fn(&V) -> Result<V>,
    {
        if *key <= self.min_key || *key >= self.max_key {
            return Err(Error::InvalidKey);
        }
        loop {
            let (level_found, _, succs) = self.find(key);
            let Some(level) = level_found else {
                return Err(Error::NotFound("key does not exist".to_string()));
            };

            let node = Arc::clone(&succs[level]);
            let _guard = node.lock.lock();
            if node.marked.load(Ordering::SeqCst)
                || !node.fully_linked.load(Ordering::SeqCst)
                || node.top_level != level
            {
                continue;
            }

            let Some(value) = node.value.read().clone() else {
                return Err(Error::NotFound("key does not exist".to_string()));
            };
            return copy(&value);
        }
    }

    /// Range scan over `[lo, hi)`, validated against concurrent writes.
    ///
    /// Returned keys are strictly ascending; every returned value was
    /// present at one instant during the scan with no interleaved writes.
    pub fn range(&self, lo: &K, hi: &K) -> Vec<Arc<V>> {
        if *lo >= self.max_key {
            return Vec::new();
        }
        let hi = if *hi > self.max_key { &self.max_key } else { hi };
        loop {
            let first = self.collect(lo, hi);
            let count_before = self.op_count.load(Ordering::SeqCst);
            let second = self.collect(lo, hi);
            let count_after = self.op_count.load(Ordering::SeqCst);

            if count_before == count_after && pointer_equal(&first, &second) {
                return first;
            }
        }
    }

    /// Like [`SkipList::range`], but returns deep copies made with `copy`
    /// during the first pass. Copies are discarded when validation forces a
    /// restart.
    pub fn range_copies<F>(&self, lo: &K, hi: &K, copy: F) -> Result<Vec<V>>
    where
        F: Fn(&V) -> Result<V>,
    {
        if *lo >= self.max_key {
            return Ok(Vec::new());
        }
        let hi = if *hi > self.max_key { &self.max_key } else { hi };
        loop {
            let first = self.collect(lo, hi);
            let mut copies = Vec::with_capacity(first.len());
            for value in &first {
                copies.push(copy(value)?);
            }
            let count_before = self.op_count.load(Ordering::SeqCst);
            let second = self.collect(lo, hi);
            let count_after = self.op_count.load(Ordering::SeqCst);

            if count_before == count_after && pointer_equal(&first, &second) {
                return Ok(copies);
            }
        }
    }

    /// Single level-0 pass: descend to `lo`, then gather the value pointers
    /// of every visible node with key in `[lo, hi)`.
    fn collect(&self, lo: &K, hi: &K) -> Vec<Arc<V>> {
        let mut pred = Arc::clone(&self.head);
        for level in (0..=self.max_level).rev() {
            let mut curr = pred.next_at(level);
            while *lo > curr.key {
                pred = curr;
                curr = pred.next_at(level);
            }
        }

        let mut results = Vec::new();
        let mut curr = pred.next_at(0);
        while curr.key < *hi {
            if curr.fully_linked.load(Ordering::SeqCst) && !curr.marked.load(Ordering::SeqCst) {
                if let Some(value) = curr.value.read().clone() {
                    results.push(value);
                }
            }
            curr = curr.next_at(0);
        }
        results
    }
}

impl<V> SkipList<String, V> {
    /// A string-keyed skip list with the default level count and the
    /// standard Unicode sentinels.
    pub fn with_string_keys() -> Self {
        SkipList::new(
            DEFAULT_MAX_LEVEL,
            String::new(),
            MAX_STRING_KEY.to_string(),
        )
    }
}

/// Element-wise `Arc` pointer identity between two scan passes. Document
/// updates always swap the value pointer, so pointer identity detects every
/// committed change.
fn pointer_equal<V>(first: &[Arc<V>], second: &[Arc<V>]) -> bool {
    first.len() == second.len()
        && first
            .iter()
            .zip(second.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b))
}

// =============================================================================
// Tests
// =============================================================================
