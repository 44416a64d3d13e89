//! Lexicographic cursor over a trie.
//!
//! The cursor carries its own [`ReaderToken`], so the nodes it is
//! standing on cannot be reclaimed underneath it. A long-lived cursor
//! should call [`PatriciaIter::refresh`] between batches so it stops
//! pinning old reclamations, and must [`PatriciaIter::detach`] (or drop)
//! before the application expects the trie's memory to quiesce.
//!
//! Keys come out in unsigned-byte lexicographic order. A node's own
//! terminal precedes its subtree (the shorter key is the smaller one);
//! linear child maps publish in append order, so each visited node's
//! edges are sorted on entry.

use std::sync::Arc;

use crate::arena::NIL;
use crate::node::{Meta, NodeRef};
use crate::ordering::READ_ORD;
use crate::token::ReaderToken;
use crate::trie::Patricia;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterState {
    /// Before the first element.
    Fresh,
    /// Standing on a key.
    Positioned,
    /// Past the last key.
    Exhausted,
    /// Token surrendered; the cursor is inert.
    Detached,
}

/// One node on the descent path.
struct Frame {
    /// Sorted `(edge_byte, child_idx)` snapshot of this node.
    children: Vec<(u8, u32)>,
    /// Next child to visit.
    next_child: usize,
    /// Key length after this node's label (restore point for siblings).
    key_len: usize,
}

/// Lexicographic iterator; see the module docs.
pub struct PatriciaIter {
    trie: Arc<Patricia>,
    token: ReaderToken,
    stack: Vec<Frame>,
    key: Vec<u8>,
    state: IterState,
}

impl PatriciaIter {
    pub(crate) fn new(trie: &Arc<Patricia>) -> Self {
        let mut token: ReaderToken = ReaderToken::new();
        token.acquire(trie);
        Self {
            trie: Arc::clone(trie),
            token,
            stack: Vec::new(),
            key: Vec::new(),
            state: IterState::Fresh,
        }
    }

    /// Step to the next key. Returns `false` once exhausted or detached.
    pub fn advance(&mut self) -> bool {
        match self.state {
            IterState::Detached | IterState::Exhausted => return false,
            IterState::Fresh => {
                self.state = IterState::Positioned;
                let root: u32 = self.trie.root_slot().load(READ_ORD);
                if self.enter(root) {
                    return true;
                }
            }
            IterState::Positioned => {}
        }

        loop {
            let Some(top) = self.stack.last_mut() else {
                self.state = IterState::Exhausted;
                self.token.core.set_value_ptr(std::ptr::null_mut());
                return false;
            };
            if top.next_child >= top.children.len() {
                self.stack.pop();
                continue;
            }
            let key_len: usize = top.key_len;
            let (edge, child): (u8, u32) = top.children[top.next_child];
            top.next_child += 1;

            self.key.truncate(key_len);
            self.key.push(edge);
            if self.enter(child) {
                return true;
            }
        }
    }

    /// Push a node onto the path; true when it is terminal.
    fn enter(&mut self, idx: u32) -> bool {
        let node: NodeRef = NodeRef::at(self.trie.arena(), idx);
        let meta: Meta = node.meta(READ_ORD);
        self.key.extend_from_slice(node.label(meta));

        let mut children: Vec<(u8, u32)> = Vec::with_capacity(meta.n_children());
        node.for_each_child(meta, READ_ORD, |b, c| children.push((b, c)));
        children.sort_unstable_by_key(|&(b, _)| b);

        self.stack.push(Frame {
            children,
            next_child: 0,
            key_len: self.key.len(),
        });

        if meta.is_final() {
            let vi: u32 = node.value_idx().load(READ_ORD);
            debug_assert_ne!(vi, NIL);
            self.token.core.set_value_ptr(self.trie.arena().ptr(vi));
            true
        } else {
            false
        }
    }

    /// The key currently stood on. Meaningful only after `advance`
    /// returned `true`.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value slot of the current key.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        if self.state == IterState::Positioned {
            self.token.value_bytes()
        } else {
            None
        }
    }

    /// Refresh the carried token's version stamp between batches.
    pub fn refresh(&mut self) {
        if self.state != IterState::Detached {
            self.token.update();
        }
    }

    /// Surrender the carried token. The cursor is inert afterwards; call
    /// this before expecting the trie's deferred memory to drain.
    pub fn detach(&mut self) {
        if self.state != IterState::Detached {
            self.token.release();
            self.state = IterState::Detached;
            self.stack.clear();
        }
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.state == IterState::Detached
    }
}

impl Drop for PatriciaIter {
    fn drop(&mut self) {
        self.detach();
    }
}

// ============================================================================
//  Tests
// ============================================================================
