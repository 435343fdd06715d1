//! # bytetrie
//!
//! A concurrent ordered map keyed by byte strings, built as a 256-way
//! path-compressed radix trie with popcount-indexed child arrays.
//!
//! Readers are lock-free: they traverse the tree under an epoch guard with
//! acquire loads and never block, spin or retry. Writers serialize on a
//! single mutex and publish copy-on-write node replacements, each visible
//! through one release store; displaced nodes are reclaimed only after every
//! reader that could still see them has left its epoch.
//!
//! The intended workload is point lookups vastly outnumbering mutations,
//! especially with keys that share long prefixes (URL paths, lexical tokens,
//! big-endian integers — see [`OrderedKey`]).
//!
//! ## Example
//!
//! ```rust
//! use bytetrie::ByteTrie;
//!
//! let trie: ByteTrie<u64> = ByteTrie::new();
//! trie.insert(b"hello", 1);
//! trie.insert(b"help", 2);
//!
//! assert_eq!(trie.get(b"hello"), Some(1));
//! assert!(!trie.contains(b"hel"));
//! assert_eq!(
//!     trie.prefix(b"hel"),
//!     vec![(b"hello".to_vec(), 1), (b"help".to_vec(), 2)],
//! );
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

pub use crossbeam_epoch::pin;

// =============================================================================
// 256-bit popcount bitmap
// =============================================================================

/// Membership bitmap over the 256 possible edge bytes of a trie node.
///
/// The i-th set bit, counted in ascending byte order, corresponds to the i-th
/// entry of a node's dense child array, so [`Bitmap256::index_of`] doubles as
/// the child slot index. All index math is hardware popcount.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitmap256 {
    words: [u64; 4],
}

impl Bitmap256 {
    /// An empty bitmap.
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    #[inline]
    fn split(byte: u8) -> (usize, u64) {
        ((byte >> 6) as usize, 1u64 << (byte & 63))
    }

    /// Whether `byte` is a member.
    #[inline]
    pub fn has(&self, byte: u8) -> bool {
        let (word, mask) = Self::split(byte);
        self.words[word] & mask != 0
    }

    /// Number of members strictly smaller than `byte`, i.e. the ordinal
    /// position `byte` occupies (or would occupy) among the set bits.
    #[inline]
    pub fn index_of(&self, byte: u8) -> usize {
        let (word, mask) = Self::split(byte);
        let mut idx = (self.words[word] & (mask - 1)).count_ones() as usize;
        for w in 0..word {
            idx += self.words[w].count_ones() as usize;
        }
        idx
    }

    /// Combined membership test and ordinal index.
    #[inline]
    pub fn find(&self, byte: u8) -> (bool, usize) {
        (self.has(byte), self.index_of(byte))
    }

    /// Sets `byte`, returning the ordinal position it now occupies.
    pub fn set(&mut self, byte: u8) -> usize {
        let (word, mask) = Self::split(byte);
        self.words[word] |= mask;
        self.index_of(byte)
    }

    /// Clears `byte`, returning the ordinal position it occupied before the
    /// clear (the child slot the caller has to remove).
    pub fn clear(&mut self, byte: u8) -> usize {
        let idx = self.index_of(byte);
        let (word, mask) = Self::split(byte);
        self.words[word] &= !mask;
        idx
    }

    /// Lowest member, or `None` when empty.
    pub fn first(&self) -> Option<u8> {
        for (w, &bits) in self.words.iter().enumerate() {
            if bits != 0 {
                return Some((w * 64 + bits.trailing_zeros() as usize) as u8);
            }
        }
        None
    }

    /// Lowest member strictly greater than `byte`, or `None`.
    pub fn next(&self, byte: u8) -> Option<u8> {
        if byte == u8::MAX {
            return None;
        }
        let from = byte as usize + 1;
        let (word, bit) = (from >> 6, from & 63);
        let masked = self.words[word] & (!0u64 << bit);
        if masked != 0 {
            return Some((word * 64 + masked.trailing_zeros() as usize) as u8);
        }
        for w in word + 1..4 {
            if self.words[w] != 0 {
                return Some((w * 64 + self.words[w].trailing_zeros() as usize) as u8);
            }
        }
        None
    }

    /// Total membership count.
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no byte is a member.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words == [0; 4]
    }

    /// Iterates the members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        let mut cur = self.first();
        std::iter::from_fn(move || {
            let b = cur?;
            cur = self.next(b);
            Some(b)
        })
    }
}

impl fmt::Debug for Bitmap256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Trie node
// =============================================================================

/// One trie node.
///
/// The effective key of a node is `parent's effective key ∥ parent_edge ∥
/// skip`; path compression keeps any run of single-child nodes collapsed
/// into the `skip` of its endpoint.
///
/// Everything except `parent` and `version` is immutable once the node has
/// been published. Structural and value changes build a replacement node and
/// install it with a single release store into the slot that owns the
/// pre-image; readers loading the slot with acquire ordering observe one
/// image or the other, never a torn pointer. Pre-images are retired through
/// the epoch collector, so a reader that loaded one before the swap can keep
/// dereferencing it until it unpins.
struct Node<V> {
    /// Compressed edge label from the parent edge byte down to this node.
    skip: Box<[u8]>,
    /// Stored value; `None` means the node is purely structural.
    value: Option<V>,
    /// Membership bitmap over the child edge bytes.
    popmap: Bitmap256,
    /// Dense child array; entry i belongs to the i-th set bit of `popmap`.
    children: Box<[Atomic<Node<V>>]>,
    /// Back-pointer to the current parent; null for the root. Rewritten by
    /// writers after each copy-on-write replacement. Only meaningful to
    /// collaborators walking upward while no writer is active.
    parent: Atomic<Node<V>>,
    /// Edge byte selecting this node in the parent; `None` for the root.
    parent_edge: Option<u8>,
    /// Bumped (release) whenever this node is superseded; collaborators read
    /// it with acquire to detect that a handle has gone stale.
    version: AtomicU64,
}

impl<V> Node<V> {
    fn empty_root() -> Self {
        Self {
            skip: Box::default(),
            value: None,
            popmap: Bitmap256::new(),
            children: Box::default(),
            parent: Atomic::null(),
            parent_edge: None,
            version: AtomicU64::new(0),
        }
    }

    fn leaf(skip: &[u8], edge: u8, value: V) -> Self {
        Self {
            skip: skip.into(),
            value: Some(value),
            popmap: Bitmap256::new(),
            children: Box::default(),
            parent: Atomic::null(),
            parent_edge: Some(edge),
            version: AtomicU64::new(0),
        }
    }

    /// Child pointer for `byte`, or null. Callable from unlocked readers as
    /// long as this node's storage has not been reclaimed.
    fn child<'g>(&self, byte: u8, guard: &'g Guard) -> Shared<'g, Node<V>> {
        let (hit, idx) = self.popmap.find(byte);
        if hit {
            self.children[idx].load(Ordering::Acquire, guard)
        } else {
            Shared::null()
        }
    }

    /// Child for `byte` under exclusive access. The byte must be a member of
    /// `popmap`.
    fn child_ref(&self, byte: u8) -> &Node<V> {
        let idx = self.popmap.index_of(byte);
        // SAFETY: child slots are never null, and exclusive access means no
        // reclamation can race this read.
        unsafe {
            self.children[idx]
                .load(Ordering::Acquire, epoch::unprotected())
                .deref()
        }
    }

    /// Snapshot of the child slots for a replacement node. The writer lock
    /// must be held so the slots cannot move underneath the copy.
    fn clone_slots(&self, guard: &Guard) -> Box<[Atomic<Node<V>>]> {
        self.children
            .iter()
            .map(|slot| Atomic::from(slot.load(Ordering::Acquire, guard)))
            .collect()
    }

    fn read_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Repoints the children reachable from `parent` at `parent_ptr`. Runs under
/// the writer lock, after a replacement node has adopted its children.
fn adopt_children<V>(parent: &Node<V>, parent_ptr: Shared<'_, Node<V>>, guard: &Guard) {
    for slot in parent.children.iter() {
        let child = slot.load(Ordering::Acquire, guard);
        // SAFETY: children of a node on the live path stay allocated while
        // the writer lock is held.
        unsafe { child.deref() }.parent.store(parent_ptr, Ordering::Release);
    }
}

/// Builds the merge of a value-less `upper` node with its only child: one
/// node carrying `upper.skip ∥ edge ∥ child.skip` together with the child's
/// value and children.
fn merge_nodes<V: Clone>(upper: &Node<V>, edge: u8, child: &Node<V>, guard: &Guard) -> Node<V> {
    let mut skip = Vec::with_capacity(upper.skip.len() + 1 + child.skip.len());
    skip.extend_from_slice(&upper.skip);
    skip.push(edge);
    skip.extend_from_slice(&child.skip);
    Node {
        skip: skip.into_boxed_slice(),
        value: child.value.clone(),
        popmap: child.popmap,
        children: child.clone_slots(guard),
        parent: Atomic::from(upper.parent.load(Ordering::Acquire, guard)),
        parent_edge: upper.parent_edge,
        version: AtomicU64::new(upper.read_version() + 1),
    }
}

#[inline]
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// =============================================================================
// Collaborator handle
// =============================================================================

/// A borrowed handle to a live trie node, valid for the lifetime of the
/// epoch guard it was obtained under.
///
/// This is the hook surface for ordered-cursor and prefix-range
/// collaborators: child selection, sibling stepping, the skip and value
/// fields, the version counter and the parent back-link. Downward navigation
/// is safe at any time; `parent` is only meaningful while no writer is
/// active.
pub struct NodeRef<'g, V> {
    node: &'g Node<V>,
    guard: &'g Guard,
}

impl<'g, V> Clone for NodeRef<'g, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, V> Copy for NodeRef<'g, V> {}

impl<'g, V> NodeRef<'g, V> {
    /// Compressed edge label of this node.
    pub fn skip(&self) -> &'g [u8] {
        &self.node.skip
    }

    /// Whether a value is stored at this node.
    pub fn is_present(&self) -> bool {
        self.node.value.is_some()
    }

    /// The stored value, if any.
    pub fn value(&self) -> Option<&'g V> {
        self.node.value.as_ref()
    }

    /// Edge byte selecting this node in its parent; `None` for the root.
    pub fn parent_edge(&self) -> Option<u8> {
        self.node.parent_edge
    }

    /// Version counter of this node; bumped whenever it is superseded by a
    /// replacement.
    pub fn version(&self) -> u64 {
        self.node.read_version()
    }

    /// Parent node, or `None` for the root.
    pub fn parent(&self) -> Option<NodeRef<'g, V>> {
        let p = self.node.parent.load(Ordering::Acquire, self.guard);
        // SAFETY: a non-null parent is live or epoch-protected while the
        // guard is held.
        unsafe { p.as_ref() }.map(|node| NodeRef {
            node,
            guard: self.guard,
        })
    }

    /// Child reached through `byte`, or `None`.
    pub fn child(&self, byte: u8) -> Option<NodeRef<'g, V>> {
        let c = self.node.child(byte, self.guard);
        // SAFETY: loaded under the guard; see `parent`.
        unsafe { c.as_ref() }.map(|node| NodeRef {
            node,
            guard: self.guard,
        })
    }

    /// Smallest child edge byte, or `None` for a childless node.
    pub fn first_child_byte(&self) -> Option<u8> {
        self.node.popmap.first()
    }

    /// Smallest child edge byte strictly greater than `byte`.
    pub fn next_child_byte(&self, byte: u8) -> Option<u8> {
        self.node.popmap.next(byte)
    }
}

impl<'g, V: fmt::Debug> fmt::Debug for NodeRef<'g, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("skip", &self.node.skip)
            .field("value", &self.node.value)
            .field("children", &self.node.popmap)
            .finish()
    }
}

// =============================================================================
// Trie
// =============================================================================

/// Concurrent ordered map from byte strings to values.
///
/// Any number of threads may call the read-side operations ([`get`],
/// [`contains`], [`find`], [`prefix`]) and the write-side operations
/// ([`insert`], [`remove`], [`clear`]) on a shared reference concurrently.
/// Reads never take a lock; writes serialize on one internal mutex and
/// publish every change as a copy-on-write node replacement, so each
/// operation takes effect atomically between its invocation and return.
///
/// Mutating operations bound `V: Clone`, because values carried by displaced
/// nodes stay readable until the reclamation grace period ends and therefore
/// cannot be moved out of them. Wrap expensive-to-clone payloads in
/// [`std::sync::Arc`].
///
/// [`get`]: ByteTrie::get
/// [`contains`]: ByteTrie::contains
/// [`find`]: ByteTrie::find
/// [`prefix`]: ByteTrie::prefix
/// [`insert`]: ByteTrie::insert
/// [`remove`]: ByteTrie::remove
/// [`clear`]: ByteTrie::clear
pub struct ByteTrie<V> {
    /// Root slot. The pointee always exists, carries an empty skip and no
    /// parent; copy-on-write may swap the object behind this slot.
    root: Atomic<Node<V>>,
    /// Number of stored values.
    count: AtomicUsize,
    /// Serializes writers. Readers never touch it.
    write_lock: Mutex<()>,
}

impl<V> ByteTrie<V> {
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self {
            root: Atomic::new(Node::empty_root()),
            count: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Number of stored key/value pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether no value is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle to the root node, the entry point for cursor collaborators.
    pub fn root<'g>(&'g self, guard: &'g Guard) -> NodeRef<'g, V> {
        let root = self.root.load(Ordering::Acquire, guard);
        // SAFETY: the root slot is never null.
        NodeRef {
            node: unsafe { root.deref() },
            guard,
        }
    }

    /// Descends to the node whose effective key equals `key`, whether or not
    /// it stores a value. Allocation-free; the shared traversal procedure
    /// behind every operation.
    fn locate<'g>(&self, key: &[u8], guard: &'g Guard) -> Option<&'g Node<V>> {
        // SAFETY: the root slot is never null.
        let mut node = unsafe { self.root.load(Ordering::Acquire, guard).deref() };
        let mut pos = 0usize;
        loop {
            let skip = &node.skip[..];
            if key.len() - pos < skip.len() || &key[pos..pos + skip.len()] != skip {
                return None;
            }
            pos += skip.len();
            if pos == key.len() {
                return Some(node);
            }
            let byte = key[pos];
            pos += 1;
            let child = node.child(byte, guard);
            // SAFETY: loaded under `guard`; retired pre-images stay
            // allocated until every pinned reader departs.
            match unsafe { child.as_ref() } {
                Some(c) => node = c,
                None => return None,
            }
        }
    }

    /// Looks up `key`, returning a handle to its node when a value is
    /// stored there.
    pub fn find<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<NodeRef<'g, V>> {
        self.locate(key, guard)
            .filter(|n| n.value.is_some())
            .map(|node| NodeRef { node, guard })
    }

    /// Whether `key` currently maps to a value.
    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        let guard = epoch::pin();
        self.locate(key.as_ref(), &guard)
            .map_or(false, |n| n.value.is_some())
    }

    /// Installs `new` in `slot`, repoints the adopted children at it, then
    /// bumps and retires the displaced pre-image.
    fn publish<'g>(
        &self,
        slot: &Atomic<Node<V>>,
        old: Shared<'g, Node<V>>,
        new: Node<V>,
        guard: &'g Guard,
    ) {
        let new = Owned::new(new).into_shared(guard);
        // SAFETY: just allocated, not yet visible to readers.
        adopt_children(unsafe { new.deref() }, new, guard);
        slot.store(new, Ordering::Release);
        // SAFETY: `old` is now unreachable from the live tree; readers that
        // already hold it are protected by their epoch guards.
        unsafe {
            old.deref().bump_version();
            guard.defer_destroy(old);
        }
    }

    /// Retires a node that left the live tree without being replaced in its
    /// own slot (absorbed or unlinked through a parent rewrite).
    fn retire<'g>(&self, node: Shared<'g, Node<V>>, guard: &'g Guard) {
        // SAFETY: caller guarantees `node` is no longer reachable from the
        // live tree.
        unsafe {
            node.deref().bump_version();
            guard.defer_destroy(node);
        }
    }

    /// Empties the trie, leaving it as freshly constructed. Every previously
    /// stored node is retired.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let _writer = self.write_lock.lock();
        let old = self
            .root
            .swap(Owned::new(Node::empty_root()), Ordering::AcqRel, &guard);
        self.count.store(0, Ordering::Relaxed);

        let mut stack = vec![old];
        while let Some(sh) = stack.pop() {
            // SAFETY: detached from the live tree but epoch-protected.
            let node = unsafe { sh.deref() };
            for slot in node.children.iter() {
                stack.push(slot.load(Ordering::Acquire, &guard));
            }
            // SAFETY: detached; pinned readers may still be inside it.
            unsafe { guard.defer_destroy(sh) };
        }
    }

    /// Number of live nodes, root included. Exclusive access; a debugging
    /// and test aid for observing splits and compaction.
    pub fn node_count(&mut self) -> usize {
        // SAFETY: `&mut self` rules out concurrent writers and reclamation.
        let guard = unsafe { epoch::unprotected() };
        let mut stack = vec![self.root.load(Ordering::Relaxed, guard)];
        let mut n = 0usize;
        while let Some(sh) = stack.pop() {
            n += 1;
            // SAFETY: every reachable slot points at a live node.
            let node = unsafe { sh.deref() };
            for slot in node.children.iter() {
                stack.push(slot.load(Ordering::Relaxed, guard));
            }
        }
        n
    }

    /// Ordered iterator over all key/value pairs.
    ///
    /// Iteration is snapshot-free and must not run concurrently with
    /// writers; the exclusive borrow enforces exactly that.
    pub fn iter(&mut self) -> Iter<'_, V> {
        // SAFETY: `&mut self` rules out concurrent writers and reclamation.
        let guard = unsafe { epoch::unprotected() };
        // SAFETY: the root slot is never null.
        let root = unsafe { self.root.load(Ordering::Acquire, guard).deref() };
        Iter {
            stack: vec![IterFrame {
                node: root,
                next: root.popmap.first(),
            }],
            key: root.skip.to_vec(),
            pending: root.value.as_ref(),
        }
    }
}

impl<V: Clone> ByteTrie<V> {
    /// Clone-out lookup.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<V> {
        let guard = epoch::pin();
        self.locate(key.as_ref(), &guard)
            .and_then(|n| n.value.clone())
    }

    /// Inserts `key → value` if the key is absent. Returns `true` when the
    /// value was inserted and `false` when the key was already present; an
    /// existing value is never overwritten.
    pub fn insert(&self, key: impl AsRef<[u8]>, value: V) -> bool {
        let key = key.as_ref();
        let guard = epoch::pin();
        let _writer = self.write_lock.lock();

        let mut slot: &Atomic<Node<V>> = &self.root;
        let mut pos = 0usize;
        loop {
            let shared = slot.load(Ordering::Acquire, &guard);
            // SAFETY: every slot on the descent path points at a live node
            // while the writer lock is held.
            let node = unsafe { shared.deref() };
            let m = common_prefix_len(&node.skip, &key[pos..]);

            if m == node.skip.len() {
                if pos + m == key.len() {
                    // Exact match.
                    if node.value.is_some() {
                        return false;
                    }
                    let replacement = Node {
                        skip: node.skip.clone(),
                        value: Some(value),
                        popmap: node.popmap,
                        children: node.clone_slots(&guard),
                        parent: Atomic::from(node.parent.load(Ordering::Acquire, &guard)),
                        parent_edge: node.parent_edge,
                        version: AtomicU64::new(node.read_version() + 1),
                    };
                    self.publish(slot, shared, replacement, &guard);
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return true;
                }

                let byte = key[pos + m];
                let (hit, idx) = node.popmap.find(byte);
                if hit {
                    // Skip consumed, child exists: descend.
                    pos += m + 1;
                    slot = &node.children[idx];
                    continue;
                }

                // Skip consumed, no child for the next byte: attach a leaf.
                let leaf = Node::leaf(&key[pos + m + 1..], byte, value);
                let leaf = Owned::new(leaf).into_shared(&guard);
                let mut popmap = node.popmap;
                let at = popmap.set(byte);
                let mut children: Vec<Atomic<Node<V>>> =
                    Vec::with_capacity(node.children.len() + 1);
                children.extend(
                    node.children
                        .iter()
                        .map(|s| Atomic::from(s.load(Ordering::Acquire, &guard))),
                );
                children.insert(at, Atomic::from(leaf));
                let replacement = Node {
                    skip: node.skip.clone(),
                    value: node.value.clone(),
                    popmap,
                    children: children.into_boxed_slice(),
                    parent: Atomic::from(node.parent.load(Ordering::Acquire, &guard)),
                    parent_edge: node.parent_edge,
                    version: AtomicU64::new(node.read_version() + 1),
                };
                self.publish(slot, shared, replacement, &guard);
                self.count.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            // The key diverges from the skip at offset m. Split: a fresh
            // tail node keeps the lower part of the skip together with the
            // pre-image's value and children.
            let edge_down = node.skip[m];
            let tail = Node {
                skip: node.skip[m + 1..].into(),
                value: node.value.clone(),
                popmap: node.popmap,
                children: node.clone_slots(&guard),
                parent: Atomic::null(),
                parent_edge: Some(edge_down),
                version: AtomicU64::new(0),
            };
            let tail = Owned::new(tail).into_shared(&guard);
            // SAFETY: just allocated, not yet visible to readers.
            adopt_children(unsafe { tail.deref() }, tail, &guard);

            let replacement = if pos + m == key.len() {
                // The key ends inside the skip: the upper part carries the
                // new value and the tail hangs beneath it.
                let mut popmap = Bitmap256::new();
                popmap.set(edge_down);
                Node {
                    skip: node.skip[..m].into(),
                    value: Some(value),
                    popmap,
                    children: vec![Atomic::from(tail)].into_boxed_slice(),
                    parent: Atomic::from(node.parent.load(Ordering::Acquire, &guard)),
                    parent_edge: node.parent_edge,
                    version: AtomicU64::new(node.read_version() + 1),
                }
            } else {
                // Key and skip part ways inside the skip: the upper part
                // becomes a bare branch point over the tail and a new leaf.
                let edge_new = key[pos + m];
                let leaf = Node::leaf(&key[pos + m + 1..], edge_new, value);
                let leaf = Owned::new(leaf).into_shared(&guard);
                let mut popmap = Bitmap256::new();
                popmap.set(edge_down);
                popmap.set(edge_new);
                let pair = if edge_down < edge_new {
                    vec![Atomic::from(tail), Atomic::from(leaf)]
                } else {
                    vec![Atomic::from(leaf), Atomic::from(tail)]
                };
                Node {
                    skip: node.skip[..m].into(),
                    value: None,
                    popmap,
                    children: pair.into_boxed_slice(),
                    parent: Atomic::from(node.parent.load(Ordering::Acquire, &guard)),
                    parent_edge: node.parent_edge,
                    version: AtomicU64::new(node.read_version() + 1),
                }
            };
            self.publish(slot, shared, replacement, &guard);
            self.count.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    /// Removes `key`, returning its value. Compacts eagerly: a node left
    /// value-less with no children is unlinked from its parent, one left
    /// value-less with a single child is merged with it.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Option<V> {
        let key = key.as_ref();
        let guard = epoch::pin();
        let _writer = self.write_lock.lock();

        let mut slot: &Atomic<Node<V>> = &self.root;
        let mut above = None;
        let mut pos = 0usize;
        let (shared, node) = loop {
            let shared = slot.load(Ordering::Acquire, &guard);
            // SAFETY: live while the writer lock is held.
            let node = unsafe { shared.deref() };
            let skip = &node.skip[..];
            if key.len() - pos < skip.len() || &key[pos..pos + skip.len()] != skip {
                return None;
            }
            pos += skip.len();
            if pos == key.len() {
                break (shared, node);
            }
            let byte = key[pos];
            pos += 1;
            let (hit, idx) = node.popmap.find(byte);
            if !hit {
                return None;
            }
            above = Some((slot, shared));
            slot = &node.children[idx];
        };

        let old_value = node.value.clone()?;

        let child_count = node.popmap.count();
        if above.is_none() || child_count >= 2 {
            // The node stays as a branch point (the root always stays).
            let replacement = Node {
                skip: node.skip.clone(),
                value: None,
                popmap: node.popmap,
                children: node.clone_slots(&guard),
                parent: Atomic::from(node.parent.load(Ordering::Acquire, &guard)),
                parent_edge: node.parent_edge,
                version: AtomicU64::new(node.read_version() + 1),
            };
            self.publish(slot, shared, replacement, &guard);
        } else if child_count == 1 {
            // Merge with the lone child across the connecting edge.
            let edge = node.popmap.first().expect("one child");
            let child_sh = node.children[0].load(Ordering::Acquire, &guard);
            // SAFETY: live while the writer lock is held.
            let child = unsafe { child_sh.deref() };
            let merged = merge_nodes(node, edge, child, &guard);
            self.publish(slot, shared, merged, &guard);
            self.retire(child_sh, &guard);
        } else {
            // Childless: unlink from the parent.
            let (parent_slot, parent_sh) = above.expect("non-root");
            // SAFETY: live while the writer lock is held.
            let parent = unsafe { parent_sh.deref() };
            let edge = node.parent_edge.expect("non-root");
            let mut popmap = parent.popmap;
            let idx = popmap.clear(edge);

            if parent.value.is_none() && popmap.count() == 1 && parent.parent_edge.is_some() {
                // The parent became a value-less pass-through: merge it with
                // the surviving child.
                let sib_edge = popmap.first().expect("one sibling");
                let sib_sh = parent.children[1 - idx].load(Ordering::Acquire, &guard);
                debug_assert_eq!(parent.popmap.index_of(sib_edge), 1 - idx);
                // SAFETY: live while the writer lock is held.
                let sib = unsafe { sib_sh.deref() };
                let merged = merge_nodes(parent, sib_edge, sib, &guard);
                self.publish(parent_slot, parent_sh, merged, &guard);
                self.retire(sib_sh, &guard);
            } else {
                let remaining: Vec<Atomic<Node<V>>> = parent
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, s)| Atomic::from(s.load(Ordering::Acquire, &guard)))
                    .collect();
                let replacement = Node {
                    skip: parent.skip.clone(),
                    value: parent.value.clone(),
                    popmap,
                    children: remaining.into_boxed_slice(),
                    parent: Atomic::from(parent.parent.load(Ordering::Acquire, &guard)),
                    parent_edge: parent.parent_edge,
                    version: AtomicU64::new(parent.read_version() + 1),
                };
                self.publish(parent_slot, parent_sh, replacement, &guard);
            }
            self.retire(shared, &guard);
        }

        self.count.fetch_sub(1, Ordering::Relaxed);
        Some(old_value)
    }

    /// Collects every `(key, value)` whose key starts with `prefix`, in
    /// lexicographic order. Materializes copies under shared ownership, so
    /// it may run while writers are active; the result then mixes pre- and
    /// post-images of concurrent mutations.
    pub fn prefix(&self, prefix: impl AsRef<[u8]>) -> Vec<(Vec<u8>, V)> {
        let prefix = prefix.as_ref();
        let guard = epoch::pin();
        let mut out = Vec::new();

        // Descend to the shallowest node whose subtree holds exactly the
        // keys extending `prefix`.
        // SAFETY: the root slot is never null.
        let mut node = unsafe { self.root.load(Ordering::Acquire, &guard).deref() };
        let mut acc: Vec<u8> = Vec::new();
        let mut pos = 0usize;
        loop {
            let skip = &node.skip[..];
            let take = skip.len().min(prefix.len() - pos);
            if skip[..take] != prefix[pos..pos + take] {
                return out;
            }
            pos += take;
            acc.extend_from_slice(skip);
            if pos == prefix.len() {
                break;
            }
            let byte = prefix[pos];
            pos += 1;
            let child = node.child(byte, &guard);
            // SAFETY: loaded under the guard.
            match unsafe { child.as_ref() } {
                Some(c) => {
                    acc.push(byte);
                    node = c;
                }
                None => return out,
            }
        }

        // In-order walk of the subtree, keys reassembled in `acc`.
        if let Some(v) = &node.value {
            out.push((acc.clone(), v.clone()));
        }
        let mut stack = vec![(node, node.popmap.first())];
        while let Some((top, next)) = stack.last_mut() {
            match *next {
                Some(b) => {
                    *next = top.popmap.next(b);
                    let child_sh = top.child(b, &guard);
                    // SAFETY: child slots are never null.
                    let child = unsafe { child_sh.deref() };
                    acc.push(b);
                    acc.extend_from_slice(&child.skip);
                    if let Some(v) = &child.value {
                        out.push((acc.clone(), v.clone()));
                    }
                    stack.push((child, child.popmap.first()));
                }
                None => {
                    let (done, _) = stack.pop().expect("non-empty stack");
                    if stack.is_empty() {
                        break;
                    }
                    acc.truncate(acc.len() - done.skip.len() - 1);
                }
            }
        }
        out
    }
}

impl<V> Default for ByteTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for ByteTrie<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteTrie").field("len", &self.len()).finish()
    }
}

impl<V> Drop for ByteTrie<V> {
    fn drop(&mut self) {
        // Exclusive access: no reader can exist any more, free immediately.
        // SAFETY: the unprotected guard is sound under `&mut self`.
        let guard = unsafe { epoch::unprotected() };
        let mut stack = vec![self.root.load(Ordering::Relaxed, guard)];
        while let Some(sh) = stack.pop() {
            // SAFETY: each node is owned by exactly one slot, so every
            // pointer on this stack is freed exactly once.
            let node = unsafe { sh.into_owned() };
            for slot in node.children.iter() {
                stack.push(slot.load(Ordering::Relaxed, guard));
            }
            drop(node);
        }
    }
}

// =============================================================================
// Ordered iteration
// =============================================================================

struct IterFrame<'a, V> {
    node: &'a Node<V>,
    next: Option<u8>,
}

/// Ordered iterator over a trie, created by [`ByteTrie::iter`].
///
/// Yields `(key, &value)` pairs in lexicographic key order. Holding this
/// iterator exclusively borrows the trie, which is what makes the
/// snapshot-free traversal sound.
pub struct Iter<'a, V> {
    stack: Vec<IterFrame<'a, V>>,
    key: Vec<u8>,
    pending: Option<&'a V>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Vec<u8>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(v) = self.pending.take() {
            return Some((self.key.clone(), v));
        }
        loop {
            let frame = self.stack.last_mut()?;
            match frame.next {
                Some(b) => {
                    frame.next = frame.node.popmap.next(b);
                    let node: &'a Node<V> = frame.node;
                    let child = node.child_ref(b);
                    self.key.push(b);
                    self.key.extend_from_slice(&child.skip);
                    self.stack.push(IterFrame {
                        node: child,
                        next: child.popmap.first(),
                    });
                    if let Some(v) = &child.value {
                        return Some((self.key.clone(), v));
                    }
                }
                None => {
                    let done = self.stack.pop().expect("non-empty stack");
                    if self.stack.is_empty() {
                        return None;
                    }
                    self.key.truncate(self.key.len() - done.node.skip.len() - 1);
                }
            }
        }
    }
}

// =============================================================================
// Order-preserving integer keys
// =============================================================================

/// Fixed-width integers encoded so that lexicographic byte order matches
/// numeric order: big-endian for unsigned types, big-endian with the sign
/// bit flipped (bias by 2^(n−1)) for signed types.
///
/// ```rust
/// use bytetrie::{ByteTrie, OrderedKey};
///
/// let trie: ByteTrie<&str> = ByteTrie::new();
/// trie.insert((-3i64).to_key_bytes(), "minus three");
/// trie.insert(7i64.to_key_bytes(), "seven");
/// assert!((-3i64).to_key_bytes() < 7i64.to_key_bytes());
/// ```
pub trait OrderedKey {
    /// The fixed-width encoded form.
    type Bytes: AsRef<[u8]>;

    /// Big-endian, order-preserving encoding of `self`.
    fn to_key_bytes(self) -> Self::Bytes;
}

macro_rules! ordered_unsigned {
    ($($t:ty => $n:expr),* $(,)?) => {$(
        impl OrderedKey for $t {
            type Bytes = [u8; $n];

            #[inline]
            fn to_key_bytes(self) -> [u8; $n] {
                self.to_be_bytes()
            }
        }
    )*};
}

macro_rules! ordered_signed {
    ($($t:ty as $u:ty => $n:expr),* $(,)?) => {$(
        impl OrderedKey for $t {
            type Bytes = [u8; $n];

            #[inline]
            fn to_key_bytes(self) -> [u8; $n] {
                // Flipping the sign bit biases to unsigned, putting negative
                // values below non-negative ones.
                ((self as $u) ^ (1 << (<$u>::BITS - 1))).to_be_bytes()
            }
        }
    )*};
}

ordered_unsigned!(u8 => 1, u16 => 2, u32 => 4, u64 => 8, u128 => 16);
ordered_signed!(i8 as u8 => 1, i16 as u16 => 2, i32 as u32 => 4, i64 as u64 => 8, i128 as u128 => 16);

// =============================================================================
// Tests
// =============================================================================



#[cfg(test)]
mod proptests;
