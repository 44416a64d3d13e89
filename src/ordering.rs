//! Standard memory orderings for concurrent trie access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during a concurrent walk.
/// Pairs with a writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields.
/// Pairs with a reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (compare-and-swap).
/// Used for child-slot swings, fastbin push/pop, token link updates.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads and stores a single-writer level performs, and for
/// statistics counters. Safe because the single-writer contract (or the
/// counter's advisory nature) provides the synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the global version counter bump.
/// The bump only needs atomicity; the value is published through the
/// token link afterwards.
pub const VERSEQ_ORD: Ordering = Ordering::Relaxed;
