//! `Patricia` - the concurrent Patricia trie.
//!
//! This module owns the trie object: factory, lookup, the dispatch point
//! for the level-specialized insert paths (in [`insert`](self::insert)),
//! statistics, the read-only switch, and destruction. The byte-level node
//! work lives in [`crate::node`], reclamation in [`crate::token`].

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaBacking, DeferredFree, MemStat, NIL};
use crate::level::{ConcurrentLevel, DispatchTag, FullCas, NoSync, Ordered, SyncPolicy};
use crate::log::log_event;
use crate::node::{build_node_with, NodeRef, Plan};
use crate::ordering::RELAXED;
use crate::token::{ReaderToken, TokenRegistry, ValueHooks, WriterToken};

mod insert;

// ============================================================================
//  Statistics
// ============================================================================

/// Counts of the four elementary structural mutations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrieStat {
    pub n_fork: u64,
    pub n_split: u64,
    pub n_mark_final: u64,
    pub n_add_state_move: u64,
}

impl TrieStat {
    /// Total structural mutations.
    #[must_use]
    pub const fn sum(&self) -> u64 {
        self.n_fork + self.n_split + self.n_mark_final + self.n_add_state_move
    }
}

/// Internal atomic counters behind [`TrieStat`].
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    fork: AtomicU64,
    split: AtomicU64,
    mark_final: AtomicU64,
    add_state_move: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn count_fork(&self) {
        self.fork.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn count_split(&self) {
        self.split.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn count_mark_final(&self) {
        self.mark_final.fetch_add(1, RELAXED);
    }

    #[inline]
    pub(crate) fn count_add_state_move(&self) {
        self.add_state_move.fetch_add(1, RELAXED);
    }

    fn snapshot(&self) -> TrieStat {
        TrieStat {
            n_fork: self.fork.load(RELAXED),
            n_split: self.split.load(RELAXED),
            n_mark_final: self.mark_final.load(RELAXED),
            n_add_state_move: self.add_state_move.load(RELAXED),
        }
    }
}

// ============================================================================
//  Errors
// ============================================================================

/// Errors surfaced by [`Patricia::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    /// The backing region could not be allocated.
    Region,
    /// The root node did not fit in the configured memory budget.
    RootAllocation,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region => write!(f, "arena region allocation failed"),

            Self::RootAllocation => write!(f, "max_memory too small for the root node"),
        }
    }
}

impl std::error::Error for CreateError {}

// ============================================================================
//  Config
// ============================================================================

/// Creation parameters beyond the common three.
#[derive(Clone, Debug)]
pub struct PatriciaConfig {
    /// Fixed value width in bytes (0 is legal: set membership).
    pub value_size: usize,
    /// Upper bound on arena memory.
    pub max_memory: usize,
    /// Operating mode, fixed for the trie's lifetime.
    pub level: ConcurrentLevel,
    /// Reserve-lazily vs pre-commit the region.
    pub backing: ArenaBacking,
}

impl Default for PatriciaConfig {
    fn default() -> Self {
        Self {
            value_size: 0,
            max_memory: 512 << 10,
            level: ConcurrentLevel::OneWriteMultiRead,
            backing: ArenaBacking::Reserved,
        }
    }
}

// ============================================================================
//  Patricia
// ============================================================================

/// A concurrent in-memory Patricia trie mapping byte keys to fixed-size
/// values, with token-gated deferred reclamation.
///
/// # Example
///
/// ```rust
/// use patrie::{ConcurrentLevel, Patricia, ReaderToken, WriterToken};
///
/// let trie = Patricia::create(4, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
///
/// let mut w = WriterToken::new();
/// w.acquire(&trie);
/// assert!(trie.insert(b"abc", &7u32.to_le_bytes(), &mut w));
/// w.release();
///
/// let mut r = ReaderToken::new();
/// r.acquire(&trie);
/// assert!(trie.lookup(b"abc", &mut r));
/// assert_eq!(r.value_of::<u32>(), 7);
/// r.release();
/// ```
pub struct Patricia {
    arena: Arena,
    root: AtomicU32,
    valsize: u32,
    level: ConcurrentLevel,
    /// Insert-path selector; swapped once by `set_readonly`.
    dispatch: AtomicU8,
    registry: TokenRegistry,
    stat: StatCounters,
    n_words: AtomicU64,
    /// Deferred frees handed over by departing tokens.
    pending: Mutex<Vec<DeferredFree>>,
    lazy_sum: AtomicU64,
    lazy_cnt: AtomicU64,
    /// Hooks of the most recent writer, for slot teardown at drop.
    value_hooks: Mutex<Option<Arc<dyn ValueHooks>>>,
    backing: ArenaBacking,
}

impl Patricia {
    /// Create a trie with the given value width, memory budget and level.
    pub fn create(
        value_size: usize,
        max_memory: usize,
        level: ConcurrentLevel,
    ) -> Result<Arc<Self>, CreateError> {
        Self::create_with(PatriciaConfig {
            value_size,
            max_memory,
            level,
            backing: ArenaBacking::Reserved,
        })
    }

    /// Create a trie from a full config.
    pub fn create_with(config: PatriciaConfig) -> Result<Arc<Self>, CreateError> {
        // Cells and value slots share one alignment; 8 when every value
        // is 8-byte sized, 4 otherwise.
        let align: usize = if config.value_size != 0 && config.value_size % 8 == 0 {
            8
        } else {
            4
        };
        let arena: Arena =
            Arena::new(config.max_memory, align, config.backing).ok_or(CreateError::Region)?;

        // Seed the root with linear capacity so early inserts append
        // in place instead of forking immediately.
        let root: u32 = build_node_with(&arena, b"", &[], NIL, false, Plan::Linear(1))
            .ok_or(CreateError::RootAllocation)?;

        log_event!(
            debug,
            value_size = config.value_size,
            capacity = arena.capacity(),
            level = %config.level,
            "patricia created"
        );

        Ok(Arc::new(Self {
            arena,
            root: AtomicU32::new(root),
            valsize: config.value_size as u32,
            level: config.level,
            dispatch: AtomicU8::new(config.level.initial_dispatch() as u8),
            registry: TokenRegistry::new(),
            stat: StatCounters::default(),
            n_words: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            lazy_sum: AtomicU64::new(0),
            lazy_cnt: AtomicU64::new(0),
            value_hooks: Mutex::new(None),
            backing: config.backing,
        }))
    }

    // ========================================================================
    //  Operations
    // ========================================================================

    /// Insert `key` with `value` (exactly `value_size` bytes).
    ///
    /// Returns `true` when the key did not exist:
    /// - `token.value()` non-null: inserted, value copied into the slot.
    /// - `token.value()` null: out of memory, nothing was inserted.
    ///
    /// Returns `false` when the key already existed (`token.value()`
    /// points at the existing slot) or after [`Patricia::set_readonly`].
    pub fn insert(&self, key: &[u8], value: &[u8], token: &mut WriterToken) -> bool {
        assert_eq!(
            value.len(),
            self.valsize as usize,
            "value width differs from the trie's value_size"
        );
        debug_assert!(self.token_is_mine(token.core.trie()), "foreign token");

        match DispatchTag::from_u8(self.dispatch.load(RELAXED)) {
            DispatchTag::ReadOnly => {
                token.core.set_value_ptr(std::ptr::null_mut());
                false
            }
            DispatchTag::NoSync => insert::insert_impl::<NoSync>(self, key, value, token),
            DispatchTag::Ordered => insert::insert_impl::<Ordered>(self, key, value, token),
            DispatchTag::FullCas => insert::insert_impl::<FullCas>(self, key, value, token),
        }
    }

    /// Point lookup. On a hit, `token.value()` addresses the slot and the
    /// call returns `true`; on a miss the value is null and the call
    /// returns `false`.
    pub fn lookup(&self, key: &[u8], token: &mut ReaderToken) -> bool {
        debug_assert!(self.token_is_mine(token.core.trie()), "foreign token");
        if self.level.concurrent_readers() {
            self.lookup_impl::<Ordered>(key, &token.core)
        } else {
            self.lookup_impl::<NoSync>(key, &token.core)
        }
    }

    fn lookup_impl<P: SyncPolicy>(&self, key: &[u8], core: &crate::token::TokenCore) -> bool {
        let mut idx: u32 = self.root.load(P::LOAD);
        let mut pos: usize = 0;
        loop {
            let node: NodeRef = NodeRef::at(&self.arena, idx);
            let meta = node.meta(P::LOAD);
            let label: &[u8] = node.label(meta);
            if !key[pos..].starts_with(label) {
                core.set_value_ptr(std::ptr::null_mut());
                return false;
            }
            pos += label.len();
            if pos == key.len() {
                if !meta.is_final() {
                    core.set_value_ptr(std::ptr::null_mut());
                    return false;
                }
                let vi: u32 = node.value_idx().load(P::LOAD);
                debug_assert_ne!(vi, NIL, "terminal node without a value slot");
                core.set_value_ptr(self.arena.ptr(vi));
                return true;
            }
            match node.find_child(meta, key[pos], P::LOAD) {
                Some(child) => {
                    idx = child;
                    pos += 1;
                }
                None => {
                    core.set_value_ptr(std::ptr::null_mut());
                    return false;
                }
            }
        }
    }

    /// Freeze the trie: every later insert fails with the read-only
    /// surface. Monotonic; cannot be undone.
    pub fn set_readonly(&self) {
        self.dispatch
            .store(DispatchTag::ReadOnly as u8, Ordering::Release);
    }

    /// Whether `set_readonly` has been called (or level 0 was configured).
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        DispatchTag::from_u8(self.dispatch.load(Ordering::Acquire)) == DispatchTag::ReadOnly
    }

    /// Count of distinct keys successfully inserted.
    #[must_use]
    pub fn num_words(&self) -> u64 {
        self.n_words.load(RELAXED)
    }

    /// Structural-mutation counters.
    #[must_use]
    pub fn trie_stat(&self) -> TrieStat {
        self.stat.snapshot()
    }

    /// Allocator occupancy plus lazy-free totals.
    #[must_use]
    pub fn mem_get_stat(&self) -> MemStat {
        let mut stat: MemStat = self.arena.mem_stat();
        stat.lazy_free_sum = self.lazy_sum.load(RELAXED) as usize;
        stat.lazy_free_cnt = self.lazy_cnt.load(RELAXED) as usize;
        stat
    }

    /// Bytes sitting in free lists.
    #[must_use]
    pub fn mem_frag_size(&self) -> usize {
        self.arena.frag_size()
    }

    /// Cell and value-slot alignment.
    #[must_use]
    pub fn mem_align_size(&self) -> usize {
        self.arena.align()
    }

    /// The fixed value width.
    #[must_use]
    pub fn get_valsize(&self) -> usize {
        self.valsize as usize
    }

    /// The configured operating mode.
    #[must_use]
    pub fn level(&self) -> ConcurrentLevel {
        self.level
    }

    /// Whether the region was pre-committed or reserved lazily.
    #[must_use]
    pub fn is_virtual_alloc(&self) -> bool {
        self.backing == ArenaBacking::Reserved
    }

    /// Lexicographic cursor over the whole trie, carrying its own reader
    /// token. Call [`crate::PatriciaIter::detach`] before expecting the
    /// trie's deferred memory to drain.
    #[must_use]
    pub fn new_iter(trie: &Arc<Self>) -> crate::iter::PatriciaIter {
        crate::iter::PatriciaIter::new(trie)
    }

    // ========================================================================
    //  Crate-internal plumbing
    // ========================================================================

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub(crate) fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    #[inline]
    pub(crate) fn root_slot(&self) -> &AtomicU32 {
        &self.root
    }

    #[inline]
    pub(crate) fn stats(&self) -> &StatCounters {
        &self.stat
    }

    #[inline]
    pub(crate) fn count_word(&self) {
        self.n_words.fetch_add(1, RELAXED);
    }

    fn token_is_mine(&self, attached: Option<&Arc<Self>>) -> bool {
        attached.is_some_and(|t| std::ptr::eq(Arc::as_ptr(t), self))
    }

    /// Record a deferred free (for the lazy totals in `mem_get_stat`).
    pub(crate) fn note_deferred(&self, len: usize) {
        self.lazy_sum.fetch_add(len as u64, RELAXED);
        self.lazy_cnt.fetch_add(1, RELAXED);
    }

    pub(crate) fn note_reclaimed(&self, len: usize) {
        self.lazy_sum.fetch_sub(len as u64, RELAXED);
        self.lazy_cnt.fetch_sub(1, RELAXED);
    }

    /// Take over a departing token's unproven frees.
    pub(crate) fn queue_pending(&self, mut entries: Vec<DeferredFree>) {
        if entries.is_empty() {
            return;
        }
        self.pending.lock().append(&mut entries);
    }

    /// Return every pending free older than `horizon` to the allocator.
    pub(crate) fn drain_pending(&self, horizon: u64) {
        let drained: Vec<DeferredFree> = {
            let mut pending = self.pending.lock();
            let mut taken: Vec<DeferredFree> = Vec::new();
            pending.retain(|e: &DeferredFree| {
                if e.verseq < horizon {
                    taken.push(*e);
                    false
                } else {
                    true
                }
            });
            taken
        };
        for e in drained {
            self.arena.free_now(e.idx, e.len as usize);
            self.note_reclaimed(e.len as usize);
        }
    }

    /// Remember the writer's hooks so `drop` can tear down value slots.
    pub(crate) fn adopt_value_hooks(&self, hooks: &Arc<dyn ValueHooks>) {
        *self.value_hooks.lock() = Some(Arc::clone(hooks));
    }
}

impl Drop for Patricia {
    fn drop(&mut self) {
        // Live tokens hold an Arc, so this runs with exclusive access.
        let hooks: Option<Arc<dyn ValueHooks>> = self.value_hooks.lock().take();
        let Some(hooks) = hooks else {
            return;
        };
        let valsize: usize = self.valsize as usize;
        if valsize == 0 {
            return;
        }

        // Tear down every live value slot, depth-first.
        let mut stack: Vec<u32> = vec![*self.root.get_mut()];
        while let Some(idx) = stack.pop() {
            let node: NodeRef = NodeRef::at(&self.arena, idx);
            let meta = node.meta(RELAXED);
            if meta.is_final() {
                let vi: u32 = node.value_idx().load(RELAXED);
                if vi != NIL {
                    // SAFETY: exclusive access; the slot is valsize bytes.
                    let slot: &mut [u8] =
                        unsafe { std::slice::from_raw_parts_mut(self.arena.ptr(vi), valsize) };
                    hooks.destroy_value(slot);
                }
            }
            node.for_each_child(meta, RELAXED, |_, child| stack.push(child));
        }
    }
}

impl fmt::Debug for Patricia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patricia")
            .field("level", &self.level)
            .field("value_size", &self.valsize)
            .field("num_words", &self.num_words())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(level: ConcurrentLevel) -> Arc<Patricia> {
        Patricia::create(4, 1 << 20, level).expect("trie")
    }

    fn writer(t: &Arc<Patricia>) -> WriterToken {
        let mut w = WriterToken::new();
        w.acquire(t);
        w
    }

    fn reader(t: &Arc<Patricia>) -> ReaderToken {
        let mut r = ReaderToken::new();
        r.acquire(t);
        r
    }

    fn put(t: &Arc<Patricia>, w: &mut WriterToken, key: &[u8], v: u32) -> bool {
        t.insert(key, &v.to_le_bytes(), w)
    }

    fn get(t: &Arc<Patricia>, r: &mut ReaderToken, key: &[u8]) -> Option<u32> {
        if t.lookup(key, r) {
            Some(r.value_of::<u32>())
        } else {
            None
        }
    }

    #[test]
    fn test_insert_then_lookup_roundtrip() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"abc", 1));
        assert!(!w.value().is_null());
        assert_eq!(w.value_of::<u32>(), 1);

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"abc"), Some(1));
        assert_eq!(get(&t, &mut r, b"abd"), None);
        assert_eq!(get(&t, &mut r, b"ab"), None);
        assert_eq!(get(&t, &mut r, b"abcd"), None);
    }

    #[test]
    fn test_duplicate_insert_reports_existing() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"abc", 1));
        assert!(!put(&t, &mut w, b"abc", 2));
        // The losing insert surfaces the existing slot, not the new bytes.
        assert_eq!(w.value_of::<u32>(), 1);
        assert_eq!(t.num_words(), 1);
    }

    #[test]
    fn test_split_on_shared_prefix() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"abc", 1));
        assert!(put(&t, &mut w, b"abd", 2));
        assert!(t.trie_stat().n_split >= 1);

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"abc"), Some(1));
        assert_eq!(get(&t, &mut r, b"abd"), Some(2));
        assert_eq!(get(&t, &mut r, b"abe"), None);
    }

    #[test]
    fn test_prefix_chain_all_terminal() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"a", 1));
        assert!(put(&t, &mut w, b"ab", 2));
        assert!(put(&t, &mut w, b"abc", 3));
        assert_eq!(t.num_words(), 3);

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"a"), Some(1));
        assert_eq!(get(&t, &mut r, b"ab"), Some(2));
        assert_eq!(get(&t, &mut r, b"abc"), Some(3));
    }

    #[test]
    fn test_prefix_inserted_after_extension() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"station", 1));
        assert!(put(&t, &mut w, b"stat", 2));
        assert!(t.trie_stat().n_split >= 1);

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"station"), Some(1));
        assert_eq!(get(&t, &mut r, b"stat"), Some(2));
        assert_eq!(get(&t, &mut r, b"statio"), None);
    }

    #[test]
    fn test_empty_key_on_root() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"", 42));
        assert!(!put(&t, &mut w, b"", 43));
        assert_eq!(t.num_words(), 1);

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b""), Some(42));
    }

    #[test]
    fn test_divergence_in_last_byte_and_every_byte() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        // Diverge only in the last byte.
        assert!(put(&t, &mut w, b"prefix_a", 1));
        assert!(put(&t, &mut w, b"prefix_b", 2));
        // Diverge at every byte.
        assert!(put(&t, &mut w, b"xyz", 3));

        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"prefix_a"), Some(1));
        assert_eq!(get(&t, &mut r, b"prefix_b"), Some(2));
        assert_eq!(get(&t, &mut r, b"xyz"), Some(3));
        assert_eq!(t.num_words(), 3);
    }

    #[test]
    fn test_unsigned_byte_order_keys() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, &[0x7F], 1));
        assert!(put(&t, &mut w, &[0x80], 2));
        assert!(put(&t, &mut w, &[0xFF], 3));
        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, &[0x80]), Some(2));
        assert_eq!(get(&t, &mut r, &[0xFF]), Some(3));
    }

    #[test]
    fn test_long_key_spine() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        let long: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert!(t.insert(&long, &9u32.to_le_bytes(), &mut w));

        let mut r = reader(&t);
        assert!(t.lookup(&long, &mut r));
        assert_eq!(r.value_of::<u32>(), 9);
        assert!(!t.lookup(&long[..1999], &mut r));
    }

    #[test]
    fn test_readonly_refuses_inserts() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        assert!(put(&t, &mut w, b"k", 1));
        assert!(!t.is_readonly());

        t.set_readonly();
        assert!(t.is_readonly());
        assert!(!put(&t, &mut w, b"other", 2));
        assert!(w.value().is_null());
        assert_eq!(t.num_words(), 1);

        // Reads still work.
        let mut r = reader(&t);
        assert_eq!(get(&t, &mut r, b"k"), Some(1));
    }

    #[test]
    fn test_level0_starts_readonly() {
        let t = trie(ConcurrentLevel::NoWriteReadOnly);
        assert!(t.is_readonly());
        let mut w = writer(&t);
        assert!(!put(&t, &mut w, b"k", 1));
        assert_eq!(t.num_words(), 0);
    }

    #[test]
    fn test_stat_sum_monotonic() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        let mut last: u64 = 0;
        for i in 0..200u32 {
            let key = format!("key-{i:05}");
            assert!(put(&t, &mut w, key.as_bytes(), i));
            let sum: u64 = t.trie_stat().sum();
            assert!(sum >= last);
            last = sum;
        }
        assert_eq!(t.num_words(), 200);
    }

    #[test]
    fn test_oom_surface_and_consistency() {
        // Small arena: inserts eventually fail with (true, null value).
        let t = Patricia::create(4, 8 << 10, ConcurrentLevel::OneWriteMultiRead).unwrap();
        let mut w = WriterToken::new();
        w.acquire(&t);

        let mut inserted: Vec<String> = Vec::new();
        let mut hit_oom: bool = false;
        for i in 0..10_000u32 {
            let key = format!("key-{i:06}");
            let ok: bool = t.insert(key.as_bytes(), &i.to_le_bytes(), &mut w);
            assert!(ok, "no duplicates in this workload");
            if w.value().is_null() {
                hit_oom = true;
                break;
            }
            inserted.push(key);
        }
        assert!(hit_oom, "arena should exhaust");
        assert_eq!(t.num_words(), inserted.len() as u64);

        // Everything inserted before the OOM is still intact.
        let mut r = ReaderToken::new();
        r.acquire(&t);
        for (i, key) in inserted.iter().enumerate() {
            assert!(t.lookup(key.as_bytes(), &mut r), "lost {key}");
            assert_eq!(r.value_of::<u32>(), i as u32);
        }
        let stat: MemStat = t.mem_get_stat();
        assert!(stat.used_size <= stat.capacity);
        w.release();
        r.release();
    }

    #[test]
    fn test_mem_stat_bounds() {
        let t = trie(ConcurrentLevel::OneWriteMultiRead);
        let mut w = writer(&t);
        for i in 0..100u32 {
            put(&t, &mut w, format!("k{i}").as_bytes(), i);
        }
        let stat: MemStat = t.mem_get_stat();
        assert!(stat.used_size <= stat.capacity);
        assert!(stat.capacity <= 1 << 20);
        assert_eq!(t.mem_align_size(), 4);
        assert_eq!(t.get_valsize(), 4);
    }

    #[test]
    fn test_value_align_eight_for_u64() {
        let t = Patricia::create(8, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
        assert_eq!(t.mem_align_size(), 8);
        let mut w = WriterToken::new();
        w.acquire(&t);
        assert!(t.insert(b"wide", &0xDEAD_BEEF_u64.to_le_bytes(), &mut w));
        assert_eq!(w.value() as usize % 8, 0);
        assert_eq!(w.value_of::<u64>(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_zero_valsize_set_semantics() {
        let t = Patricia::create(0, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
        let mut w = WriterToken::new();
        w.acquire(&t);
        assert!(t.insert(b"member", b"", &mut w));
        assert!(!w.value().is_null());
        assert!(!t.insert(b"member", b"", &mut w));

        let mut r = ReaderToken::new();
        r.acquire(&t);
        assert!(t.lookup(b"member", &mut r));
        assert!(!t.lookup(b"absent", &mut r));
    }

    #[test]
    fn test_single_thread_strict_level() {
        let t = trie(ConcurrentLevel::SingleThreadStrict);
        let mut w = writer(&t);
        for i in 0..500u32 {
            assert!(put(&t, &mut w, format!("st-{i}").as_bytes(), i));
        }
        let mut r = reader(&t);
        for i in 0..500u32 {
            assert_eq!(get(&t, &mut r, format!("st-{i}").as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_lazy_free_drains_after_release() {
        let t = trie(ConcurrentLevel::MultiWriteMultiRead);
        let mut w = writer(&t);
        // Enough inserts to force forks/splits, which retire cells.
        for i in 0..300u32 {
            assert!(put(&t, &mut w, format!("lf-{i:04}").as_bytes(), i));
        }
        w.release();
        drop(w);

        let stat: MemStat = t.mem_get_stat();
        assert_eq!(stat.lazy_free_cnt, 0, "all deferred frees reclaimed");
        assert_eq!(stat.lazy_free_sum, 0);
    }

    #[test]
    fn test_destroy_value_hook_runs_per_slot() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct CountingHooks {
            destroyed: AtomicUsize,
        }
        impl ValueHooks for CountingHooks {
            fn destroy_value(&self, _slot: &mut [u8]) {
                self.destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hooks = Arc::new(CountingHooks::default());
        let t = Patricia::create(4, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
        {
            let mut w = WriterToken::with_hooks(Arc::clone(&hooks) as Arc<dyn ValueHooks>);
            w.acquire(&t);
            for i in 0..50u32 {
                assert!(t.insert(format!("h{i}").as_bytes(), &i.to_le_bytes(), &mut w));
            }
            w.release();
        }
        drop(t);
        assert_eq!(hooks.destroyed.load(Ordering::Relaxed), 50);
    }
}
