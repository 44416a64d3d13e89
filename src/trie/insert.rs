//! The insert walker and the four structural mutations.
//!
//! One generic walker serves all writable levels, monomorphized over a
//! [`SyncPolicy`]: plain stores for level 1, release stores for the
//! single-writer levels 2-3, and the full lock/CAS protocol for level 4.
//!
//! Mutation discipline at level 4:
//!
//! - **add-state-move** holds only the edited node's lock (linear append)
//!   or no lock at all (dense-table CAS).
//! - **fork** and **split** replace a node: they lock the parent first
//!   (tree order, so no lock cycles), verify the child slot still points
//!   at the victim, lock the victim, build the replacement, swing the
//!   slot, and retire the victim. A retired cell goes to the writer
//!   token's lazy-free list; readers still inside it finish safely
//!   because reclamation is version-gated.
//! - **mark-final** holds the node's lock so a concurrent fork/split of
//!   the same node cannot lose the freshly installed value slot.
//!
//! Every allocation made before the publishing store is tracked by an
//! [`AllocGuard`]; on any abort path the guard returns the unpublished
//! cells straight to the allocator (they were never visible to anyone).

use std::sync::atomic::AtomicU32;

use crate::arena::{Arena, NIL};
use crate::level::SyncPolicy;
use crate::log::log_event;
use crate::node::{
    build_node, build_node_with, build_suffix_chain, grown_plan, node_size, node_size_of,
    Layout, Meta, NodeRef,
};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED};
use crate::token::WriterToken;
use crate::trie::Patricia;

/// Result of one structural attempt.
enum Outcome {
    /// The insert finished with this return value.
    Done(bool),
    /// The shape moved under us; restart from the root.
    Restart,
}

/// Length of the shared prefix of two byte strings.
#[inline]
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n: usize = a.len().min(b.len());
    let mut i: usize = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

// ============================================================================
//  AllocGuard
// ============================================================================

/// Scope guard over unpublished allocations.
///
/// Everything pushed here is invisible to other threads until the
/// publishing store; if the attempt aborts (lost race, OOM), dropping the
/// guard returns the cells immediately. `disarm()` on success.
struct AllocGuard<'a> {
    arena: &'a Arena,
    cells: Vec<(u32, usize)>,
    chains: Vec<u32>,
    armed: bool,
}

impl<'a> AllocGuard<'a> {
    fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            cells: Vec::new(),
            chains: Vec::new(),
            armed: true,
        }
    }

    fn push_cell(&mut self, idx: u32, len: usize) {
        self.cells.push((idx, len));
    }

    fn push_chain(&mut self, top: u32) {
        self.chains.push(top);
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AllocGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for &(idx, len) in &self.cells {
            self.arena.free_now(idx, len);
        }
        for &top in &self.chains {
            free_unpublished_chain(self.arena, top);
        }
    }
}

/// Free a never-published suffix chain built by [`build_suffix_chain`].
fn free_unpublished_chain(arena: &Arena, mut idx: u32) {
    loop {
        let node: NodeRef = NodeRef::at(arena, idx);
        let meta: Meta = node.meta(RELAXED);
        let size: usize = node_size_of(meta);
        if meta.is_final() {
            arena.free_now(idx, size);
            return;
        }
        let mut next: Option<u32> = None;
        node.for_each_child(meta, RELAXED, |_, c| next = Some(c));
        arena.free_now(idx, size);
        match next {
            Some(c) => idx = c,
            None => return,
        }
    }
}

// ============================================================================
//  Walker
// ============================================================================

pub(super) fn insert_impl<P: SyncPolicy>(
    trie: &Patricia,
    key: &[u8],
    value: &[u8],
    token: &mut WriterToken,
) -> bool {
    token.core.sort_cpu(trie);
    let arena: &Arena = trie.arena();

    'restart: loop {
        let mut parent: Option<NodeRef> = None;
        let mut parent_slot: &AtomicU32 = trie.root_slot();
        let mut idx: u32 = parent_slot.load(P::LOAD);
        let mut pos: usize = 0;

        loop {
            let node: NodeRef = NodeRef::at(arena, idx);
            let meta: Meta = node.meta(P::LOAD);
            if P::MULTI_WRITER && meta.is_retired() {
                continue 'restart;
            }

            let label: &[u8] = node.label(meta);
            let d: usize = common_prefix_len(label, &key[pos..]);
            if d < label.len() {
                match split_node::<P>(trie, token, parent, parent_slot, idx, node, key, pos, d, value)
                {
                    Outcome::Done(r) => return r,
                    Outcome::Restart => continue 'restart,
                }
            }
            pos += label.len();

            if pos == key.len() {
                match mark_final::<P>(trie, token, node, value) {
                    Outcome::Done(r) => return r,
                    Outcome::Restart => continue 'restart,
                }
            }

            let b: u8 = key[pos];
            if let Some(slot) = node.child_slot(meta, b, P::LOAD) {
                parent = Some(node);
                parent_slot = slot;
                idx = slot.load(P::LOAD);
                pos += 1;
                continue;
            }

            match add_child::<P>(trie, token, parent, parent_slot, idx, node, meta, b, key, pos, value)
            {
                Outcome::Done(r) => return r,
                Outcome::Restart => continue 'restart,
            }
        }
    }
}

/// Allocate and initialize a value slot through the writer's hooks.
fn alloc_value(trie: &Patricia, token: &WriterToken, input: &[u8]) -> Option<(u32, *mut u8)> {
    let len: usize = trie.get_valsize();
    let idx: u32 = trie.arena().alloc(len)?;
    let ptr: *mut u8 = trie.arena().ptr(idx);
    // SAFETY: freshly allocated, exclusively ours, `len` bytes.
    let slot: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
    token.hooks().init_value(slot, input);
    Some((idx, ptr))
}

/// Report out-of-memory through the token: `insert -> true, value null`.
fn oom(token: &WriterToken) -> Outcome {
    token.core.set_value_ptr(std::ptr::null_mut());
    Outcome::Done(true)
}

fn succeed(trie: &Patricia, token: &WriterToken, vptr: *mut u8) -> Outcome {
    trie.count_word();
    token.core.set_value_ptr(vptr);
    Outcome::Done(true)
}

// ============================================================================
//  mark-final
// ============================================================================

/// The key ends exactly on `node`: publish the terminal flag, installing
/// a value slot first.
fn mark_final<P: SyncPolicy>(
    trie: &Patricia,
    token: &WriterToken,
    node: NodeRef,
    value: &[u8],
) -> Outcome {
    let arena: &Arena = trie.arena();

    if P::MULTI_WRITER {
        let Some(locked) = node.lock() else {
            return Outcome::Restart;
        };
        if locked.is_final() {
            // Lost to an earlier writer; surface its slot.
            let vi: u32 = node.value_idx().load(RELAXED);
            node.unlock(locked);
            token.core.set_value_ptr(arena.ptr(vi));
            return Outcome::Done(false);
        }
        let Some((vslot, vptr)) = alloc_value(trie, token, value) else {
            node.unlock(locked);
            return oom(token);
        };
        // Slot first, flag second: the release store below publishes both.
        node.value_idx().store(vslot, RELAXED);
        node.finalize_and_unlock(locked);
        trie.stats().count_mark_final();
        log_event!(trace, "mark_final");
        return succeed(trie, token, vptr);
    }

    let meta: Meta = node.meta(P::LOAD);
    if meta.is_final() {
        let vi: u32 = node.value_idx().load(P::LOAD);
        token.core.set_value_ptr(arena.ptr(vi));
        return Outcome::Done(false);
    }
    let Some((vslot, vptr)) = alloc_value(trie, token, value) else {
        return oom(token);
    };
    node.value_idx().store(vslot, P::STORE);
    node.publish_final(P::STORE);
    trie.stats().count_mark_final();
    succeed(trie, token, vptr)
}

// ============================================================================
//  add-state-move / fork
// ============================================================================

/// `node` has no edge for `b`: install a new leaf chain, in place when
/// the child map has room, otherwise by forking a replacement node.
#[allow(clippy::too_many_arguments)]
fn add_child<P: SyncPolicy>(
    trie: &Patricia,
    token: &mut WriterToken,
    parent: Option<NodeRef>,
    parent_slot: &AtomicU32,
    idx: u32,
    node: NodeRef,
    meta: Meta,
    b: u8,
    key: &[u8],
    pos: usize,
    value: &[u8],
) -> Outcome {
    let arena: &Arena = trie.arena();
    let mut guard: AllocGuard<'_> = AllocGuard::new(arena);

    let Some((vslot, vptr)) = alloc_value(trie, token, value) else {
        return oom(token);
    };
    guard.push_cell(vslot, trie.get_valsize());
    let Some(chain) = build_suffix_chain(arena, &key[pos + 1..], vslot) else {
        return oom(token); // guard frees the value slot
    };
    guard.push_chain(chain);

    match meta.layout() {
        Layout::Linear if meta.n_children() < meta.linear_capacity() => {
            if P::MULTI_WRITER {
                let Some(locked) = node.lock() else {
                    return Outcome::Restart;
                };
                if node.find_child(locked, b, RELAXED).is_some() {
                    // Another writer installed this byte first.
                    node.unlock(locked);
                    return Outcome::Restart;
                }
                if locked.n_children() >= locked.linear_capacity() {
                    // Filled up while we were building; fork on retry.
                    node.unlock(locked);
                    return Outcome::Restart;
                }
                node.append_child_linear(locked, b, chain, P::STORE);
            } else {
                node.append_child_linear(meta, b, chain, P::STORE);
            }
            guard.disarm();
            trie.stats().count_add_state_move();
            log_event!(trace, byte = b, "add_state_move(linear)");
            succeed(trie, token, vptr)
        }
        Layout::Full => {
            if P::MULTI_WRITER {
                // The lock excludes a concurrent split of this node, which
                // would otherwise copy the table while we store into it.
                let Some(locked) = node.lock() else {
                    return Outcome::Restart;
                };
                if !node.install_child_full_locked(locked, b, chain) {
                    // Another writer owns this byte; descend on retry.
                    node.unlock(locked);
                    return Outcome::Restart;
                }
            } else if node.install_child_full(meta, b, chain).is_err() {
                return Outcome::Restart;
            }
            guard.disarm();
            trie.stats().count_add_state_move();
            log_event!(trace, byte = b, "add_state_move(full)");
            succeed(trie, token, vptr)
        }
        _ => fork_node::<P>(
            trie,
            token,
            parent,
            parent_slot,
            idx,
            node,
            b,
            chain,
            vptr,
            guard,
        ),
    }
}

/// Replace `node` with a copy whose child map also holds `(b, chain)`.
#[allow(clippy::too_many_arguments)]
fn fork_node<P: SyncPolicy>(
    trie: &Patricia,
    token: &mut WriterToken,
    parent: Option<NodeRef>,
    parent_slot: &AtomicU32,
    idx: u32,
    node: NodeRef,
    b: u8,
    chain: u32,
    vptr: *mut u8,
    guard: AllocGuard<'_>,
) -> Outcome {
    let arena: &Arena = trie.arena();

    if P::MULTI_WRITER {
        // Parent before child, always; the root anchor needs no lock.
        let plock: Option<(NodeRef, Meta)> = match parent {
            Some(p) => match p.lock() {
                Some(m) => Some((p, m)),
                None => return Outcome::Restart,
            },
            None => None,
        };
        if parent_slot.load(RELAXED) != idx {
            unlock_parent(plock);
            return Outcome::Restart;
        }
        let Some(locked) = node.lock() else {
            unlock_parent(plock);
            return Outcome::Restart;
        };
        if node.find_child(locked, b, RELAXED).is_some() {
            node.unlock(locked);
            unlock_parent(plock);
            return Outcome::Restart;
        }

        let mut kids: Vec<(u8, u32)> = Vec::with_capacity(locked.n_children() + 1);
        node.for_each_child(locked, RELAXED, |kb, kc| kids.push((kb, kc)));
        kids.push((b, chain));
        let plan = grown_plan(locked);
        let vi: u32 = node.value_idx().load(RELAXED);
        let label: &[u8] = node.label(locked);

        let Some(new_idx) = build_node_with(arena, label, &kids, vi, locked.is_final(), plan)
        else {
            node.unlock(locked);
            unlock_parent(plock);
            return oom(token);
        };

        if parent_slot
            .compare_exchange(idx, new_idx, CAS_SUCCESS, CAS_FAILURE)
            .is_err()
        {
            // Only possible on the root anchor (no parent lock there).
            arena.free_now(new_idx, node_size(plan, label.len()));
            node.unlock(locked);
            unlock_parent(plock);
            return Outcome::Restart;
        }

        node.retire_and_unlock(locked);
        unlock_parent(plock);
        guard.disarm();
        token.core.defer_free(trie, idx, node_size_of(locked));
        trie.stats().count_fork();
        log_event!(trace, byte = b, children = kids.len(), "fork");
        return succeed(trie, token, vptr);
    }

    // Single-writer: rebuild from the current shape and publish.
    let meta: Meta = node.meta(P::LOAD);
    let mut kids: Vec<(u8, u32)> = Vec::with_capacity(meta.n_children() + 1);
    node.for_each_child(meta, P::LOAD, |kb, kc| kids.push((kb, kc)));
    kids.push((b, chain));
    let plan = grown_plan(meta);
    let vi: u32 = node.value_idx().load(P::LOAD);
    let label: &[u8] = node.label(meta);

    let Some(new_idx) = build_node_with(arena, label, &kids, vi, meta.is_final(), plan) else {
        return oom(token);
    };
    parent_slot.store(new_idx, P::STORE);
    guard.disarm();
    token.core.defer_free(trie, idx, node_size_of(meta));
    trie.stats().count_fork();
    succeed(trie, token, vptr)
}

fn unlock_parent(plock: Option<(NodeRef, Meta)>) {
    if let Some((p, pm)) = plock {
        p.unlock(pm);
    }
}

// ============================================================================
//  split
// ============================================================================

/// The key diverges inside `node`'s label at depth `d` (`pos` bytes of
/// the key were matched before this node's label). Install a branch node
/// at the divergence point.
#[allow(clippy::too_many_arguments)]
fn split_node<P: SyncPolicy>(
    trie: &Patricia,
    token: &mut WriterToken,
    parent: Option<NodeRef>,
    parent_slot: &AtomicU32,
    idx: u32,
    node: NodeRef,
    key: &[u8],
    pos: usize,
    d: usize,
    value: &[u8],
) -> Outcome {
    let rem: &[u8] = &key[pos..];
    debug_assert!(d < node.meta(RELAXED).label_len());

    if P::MULTI_WRITER {
        let plock: Option<(NodeRef, Meta)> = match parent {
            Some(p) => match p.lock() {
                Some(m) => Some((p, m)),
                None => return Outcome::Restart,
            },
            None => None,
        };
        if parent_slot.load(RELAXED) != idx {
            unlock_parent(plock);
            return Outcome::Restart;
        }
        let Some(locked) = node.lock() else {
            unlock_parent(plock);
            return Outcome::Restart;
        };

        match build_split_pieces(trie, token, node, locked, rem, d, value) {
            Ok((upper, _upper_len, vptr, guard)) => {
                if parent_slot
                    .compare_exchange(idx, upper, CAS_SUCCESS, CAS_FAILURE)
                    .is_err()
                {
                    // Root anchor raced; everything is still unpublished
                    // and the dropped guard frees the whole batch.
                    node.unlock(locked);
                    unlock_parent(plock);
                    return Outcome::Restart;
                }
                node.retire_and_unlock(locked);
                unlock_parent(plock);
                guard.disarm();
                token.core.defer_free(trie, idx, node_size_of(locked));
                trie.stats().count_split();
                log_event!(trace, depth = d, "split");
                succeed(trie, token, vptr)
            }
            Err(()) => {
                node.unlock(locked);
                unlock_parent(plock);
                oom(token)
            }
        }
    } else {
        let meta: Meta = node.meta(P::LOAD);
        match build_split_pieces(trie, token, node, meta, rem, d, value) {
            Ok((upper, _upper_len, vptr, guard)) => {
                parent_slot.store(upper, P::STORE);
                guard.disarm();
                token.core.defer_free(trie, idx, node_size_of(meta));
                trie.stats().count_split();
                succeed(trie, token, vptr)
            }
            Err(()) => oom(token),
        }
    }
}

/// Build the lower copy, the new continuation and the branch node for a
/// split. Returns the branch index plus its size (for an abort free), the
/// new value pointer, and the armed guard covering every piece.
///
/// The split has two shapes:
/// - the key is exhausted at the divergence point: the branch itself is
///   terminal with the new value;
/// - the key continues: the branch carries two continuations, the old
///   suffix and a fresh leaf chain.
fn build_split_pieces<'a>(
    trie: &'a Patricia,
    token: &WriterToken,
    node: NodeRef,
    meta: Meta,
    rem: &[u8],
    d: usize,
    value: &[u8],
) -> Result<(u32, usize, *mut u8, AllocGuard<'a>), ()> {
    let arena: &Arena = trie.arena();
    let mut guard: AllocGuard<'_> = AllocGuard::new(arena);
    let label: &[u8] = node.label(meta);

    // Old suffix keeps the node's children, value and terminal flag.
    let mut kids: Vec<(u8, u32)> = Vec::with_capacity(meta.n_children());
    node.for_each_child(meta, RELAXED, |kb, kc| kids.push((kb, kc)));
    let old_vi: u32 = node.value_idx().load(RELAXED);
    let lower: u32 = build_node(arena, &label[d + 1..], &kids, old_vi, meta.is_final())
        .ok_or(())?;
    guard.push_cell(
        lower,
        node_size_of(NodeRef::at(arena, lower).meta(RELAXED)),
    );

    let Some((vslot, vptr)) = alloc_value(trie, token, value) else {
        return Err(());
    };
    guard.push_cell(vslot, trie.get_valsize());

    let (upper, upper_children) = if rem.len() == d {
        // Key ends here: terminal branch.
        let children: [(u8, u32); 1] = [(label[d], lower)];
        (
            build_node(arena, &label[..d], &children, vslot, true).ok_or(())?,
            1usize,
        )
    } else {
        let chain: u32 = build_suffix_chain(arena, &rem[d + 1..], vslot).ok_or(())?;
        guard.push_chain(chain);
        let children: [(u8, u32); 2] = [(label[d], lower), (rem[d], chain)];
        (
            build_node(arena, &label[..d], &children, NIL, false).ok_or(())?,
            2usize,
        )
    };
    let upper_len: usize = node_size(crate::node::plan_for(upper_children), d);
    guard.push_cell(upper, upper_len);

    Ok((upper, upper_len, vptr, guard))
}

// ============================================================================
//  Tests
// ============================================================================
