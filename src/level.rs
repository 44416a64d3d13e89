//! Concurrency levels and the insert/lookup dispatch machinery.
//!
//! A trie is created at one of five [`ConcurrentLevel`]s, ranging from a
//! frozen read-only index to a fully concurrent many-writer map. The level
//! selects which specialization of the shared walker runs for `insert` and
//! `lookup`: the walkers in `trie::insert` are monomorphized over a
//! [`SyncPolicy`], so the single-threaded levels compile down to plain
//! loads and stores while the concurrent levels pay for ordering and CAS.
//!
//! `set_readonly()` swaps the stored [`DispatchTag`] to [`DispatchTag::ReadOnly`]
//! with a single atomic store; the swap is monotonic and cannot be undone.

use std::fmt;
use std::sync::atomic::Ordering;

// ============================================================================
//  ConcurrentLevel
// ============================================================================

/// The operating mode of a trie, fixed at creation.
///
/// | Level | Writers | Readers |
/// |-------|---------|---------|
/// | `NoWriteReadOnly`    | 0    | many, lock-free |
/// | `SingleThreadStrict` | 1    | 0 |
/// | `SingleThreadShared` | 1    | many, with tokens |
/// | `OneWriteMultiRead`  | 1    | many |
/// | `MultiWriteMultiRead`| many | many |
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConcurrentLevel {
    /// Frozen index: every insert fails with the read-only surface.
    NoWriteReadOnly = 0,

    /// One thread total. No atomicity is needed anywhere.
    SingleThreadStrict = 1,

    /// One writer plus token-holding readers; iterators and tokens stay
    /// valid across mutations.
    SingleThreadShared = 2,

    /// One writer using ordered stores, readers using acquire loads.
    OneWriteMultiRead = 3,

    /// Full CAS protocol on nodes, tokens and the allocator.
    MultiWriteMultiRead = 4,
}

impl ConcurrentLevel {
    /// All levels, in numeric order.
    pub const ALL: [Self; 5] = [
        Self::NoWriteReadOnly,
        Self::SingleThreadStrict,
        Self::SingleThreadShared,
        Self::OneWriteMultiRead,
        Self::MultiWriteMultiRead,
    ];

    /// Decode from the wire/config representation.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NoWriteReadOnly),
            1 => Some(Self::SingleThreadStrict),
            2 => Some(Self::SingleThreadShared),
            3 => Some(Self::OneWriteMultiRead),
            4 => Some(Self::MultiWriteMultiRead),
            _ => None,
        }
    }

    /// True when more than one writer may mutate concurrently.
    #[inline]
    #[must_use]
    pub const fn multi_writer(self) -> bool {
        matches!(self, Self::MultiWriteMultiRead)
    }

    /// True when readers may run concurrently with the writer(s), which
    /// means mutations must be published with ordered stores.
    #[inline]
    #[must_use]
    pub const fn concurrent_readers(self) -> bool {
        !matches!(self, Self::SingleThreadStrict)
    }

    /// True when accessors must carry live registry tokens.
    ///
    /// Levels 0 and 1 have no reclamation hazard: nothing is ever freed
    /// while another accessor can observe it.
    #[inline]
    #[must_use]
    pub const fn tokens_required(self) -> bool {
        matches!(
            self,
            Self::SingleThreadShared | Self::OneWriteMultiRead | Self::MultiWriteMultiRead
        )
    }

    /// The dispatch tag a freshly created trie starts with.
    #[inline]
    pub(crate) const fn initial_dispatch(self) -> DispatchTag {
        match self {
            Self::NoWriteReadOnly => DispatchTag::ReadOnly,
            Self::SingleThreadStrict => DispatchTag::NoSync,
            Self::SingleThreadShared | Self::OneWriteMultiRead => DispatchTag::Ordered,
            Self::MultiWriteMultiRead => DispatchTag::FullCas,
        }
    }
}

impl fmt::Display for ConcurrentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            Self::NoWriteReadOnly => "NoWriteReadOnly",
            Self::SingleThreadStrict => "SingleThreadStrict",
            Self::SingleThreadShared => "SingleThreadShared",
            Self::OneWriteMultiRead => "OneWriteMultiRead",
            Self::MultiWriteMultiRead => "MultiWriteMultiRead",
        };
        f.write_str(name)
    }
}

// ============================================================================
//  DispatchTag
// ============================================================================

/// The insert-path selector stored on the trie in an `AtomicU8`.
///
/// `Patricia::insert` loads this tag once and matches on it: a single
/// O(1) dispatch point for the whole write path.
/// `set_readonly()` stores [`DispatchTag::ReadOnly`]; because the swap is
/// one-way, a relaxed load in `insert` is sufficient (a racing insert is
/// allowed to win or lose against `set_readonly`, never to tear).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum DispatchTag {
    ReadOnly = 0,
    NoSync = 1,
    Ordered = 2,
    FullCas = 3,
}

impl DispatchTag {
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ReadOnly,
            1 => Self::NoSync,
            2 => Self::Ordered,
            _ => Self::FullCas,
        }
    }
}

// ============================================================================
//  SyncPolicy
// ============================================================================

/// Synchronization policy a walker is monomorphized over.
///
/// Three policies cover the five levels:
///
/// - [`NoSync`]: level 1. Plain (relaxed) loads and stores; no node locks.
/// - [`Ordered`]: levels 2 and 3. Release stores so concurrent readers see
///   whole nodes; still no node locks or CAS retry loops, because a single
///   writer cannot race itself.
/// - [`FullCas`]: level 4. Acquire/release plus per-node lock bits and CAS
///   on every published slot.
pub(crate) trait SyncPolicy {
    /// Whether concurrent writers exist (node locks + slot CAS required).
    const MULTI_WRITER: bool;

    /// Ordering for loads during the walk.
    const LOAD: Ordering;

    /// Ordering for stores that publish structure.
    const STORE: Ordering;
}

/// Level 1: one thread total.
pub(crate) struct NoSync;

/// Levels 2-3: one writer, concurrent readers.
pub(crate) struct Ordered;

/// Level 4: many writers, many readers.
pub(crate) struct FullCas;

impl SyncPolicy for NoSync {
    const MULTI_WRITER: bool = false;
    const LOAD: Ordering = Ordering::Relaxed;
    const STORE: Ordering = Ordering::Relaxed;
}

impl SyncPolicy for Ordered {
    const MULTI_WRITER: bool = false;
    const LOAD: Ordering = Ordering::Acquire;
    const STORE: Ordering = Ordering::Release;
}

impl SyncPolicy for FullCas {
    const MULTI_WRITER: bool = true;
    const LOAD: Ordering = Ordering::Acquire;
    const STORE: Ordering = Ordering::Release;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip_u8() {
        for level in ConcurrentLevel::ALL {
            assert_eq!(ConcurrentLevel::from_u8(level as u8), Some(level));
        }
        assert_eq!(ConcurrentLevel::from_u8(5), None);
        assert_eq!(ConcurrentLevel::from_u8(255), None);
    }

    #[test]
    fn test_level_display_names() {
        assert_eq!(
            ConcurrentLevel::NoWriteReadOnly.to_string(),
            "NoWriteReadOnly"
        );
        assert_eq!(
            ConcurrentLevel::MultiWriteMultiRead.to_string(),
            "MultiWriteMultiRead"
        );
    }

    #[test]
    fn test_level_predicates() {
        assert!(!ConcurrentLevel::SingleThreadStrict.concurrent_readers());
        assert!(ConcurrentLevel::SingleThreadShared.concurrent_readers());
        assert!(ConcurrentLevel::NoWriteReadOnly.concurrent_readers());

        assert!(!ConcurrentLevel::OneWriteMultiRead.multi_writer());
        assert!(ConcurrentLevel::MultiWriteMultiRead.multi_writer());

        assert!(!ConcurrentLevel::NoWriteReadOnly.tokens_required());
        assert!(!ConcurrentLevel::SingleThreadStrict.tokens_required());
        assert!(ConcurrentLevel::SingleThreadShared.tokens_required());
        assert!(ConcurrentLevel::MultiWriteMultiRead.tokens_required());
    }

    #[test]
    fn test_initial_dispatch_mapping() {
        assert_eq!(
            ConcurrentLevel::NoWriteReadOnly.initial_dispatch(),
            DispatchTag::ReadOnly
        );
        assert_eq!(
            ConcurrentLevel::SingleThreadStrict.initial_dispatch(),
            DispatchTag::NoSync
        );
        assert_eq!(
            ConcurrentLevel::SingleThreadShared.initial_dispatch(),
            DispatchTag::Ordered
        );
        assert_eq!(
            ConcurrentLevel::OneWriteMultiRead.initial_dispatch(),
            DispatchTag::Ordered
        );
        assert_eq!(
            ConcurrentLevel::MultiWriteMultiRead.initial_dispatch(),
            DispatchTag::FullCas
        );
    }

    #[test]
    fn test_dispatch_tag_roundtrip() {
        for tag in [
            DispatchTag::ReadOnly,
            DispatchTag::NoSync,
            DispatchTag::Ordered,
            DispatchTag::FullCas,
        ] {
            assert_eq!(DispatchTag::from_u8(tag as u8), tag);
        }
    }
}
