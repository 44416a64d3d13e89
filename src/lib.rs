//! # patrie
//!
//! A concurrent in-memory Patricia (radix) trie mapping byte-string keys
//! to fixed-size values, built as the hot index layer of a key-value
//! store or search engine.
//!
//! Three subsystems carry the design:
//!
//! - **Trie + arena** ([`arena`], `node`, [`trie`]): path-compressed
//!   radix nodes in a contiguous arena addressed by 32-bit indices, with
//!   compact child-map encodings (linear / bitmap / dense table) and the
//!   four structural mutations (fork, split, mark-final, add-state-move)
//!   published so concurrent readers see whole shapes, never torn ones.
//! - **Tokens** ([`token`]): every accessor carries a version-stamped
//!   token on a process-wide registry list; freed cells wait on
//!   per-token lazy-free queues until no older token can observe them.
//! - **Levels** ([`level`]): five operating modes, from a frozen
//!   read-only index to many-writer/many-reader, select specialized
//!   insert/lookup paths at trie creation.
//!
//! ## Quick start
//!
//! ```rust
//! use patrie::{ConcurrentLevel, Patricia, ReaderToken, WriterToken};
//!
//! let trie = Patricia::create(8, 1 << 20, ConcurrentLevel::MultiWriteMultiRead).unwrap();
//!
//! let mut w = WriterToken::new();
//! w.acquire(&trie);
//! assert!(trie.insert(b"meaning", &42u64.to_le_bytes(), &mut w));
//! w.release();
//!
//! let mut r = ReaderToken::new();
//! r.acquire(&trie);
//! assert!(trie.lookup(b"meaning", &mut r));
//! assert_eq!(r.value_of::<u64>(), 42);
//! r.release();
//! ```
//!
//! ## Concurrency contract
//!
//! Tokens are thread-affine: one thread uses a token at a time, and
//! moving one across threads needs an external synchronization edge.
//! Within a token, operations are strictly ordered. Across tokens, a
//! successful insert happens-before any lookup that observes its
//! acknowledgement through the caller's own synchronization. Nothing in
//! the crate blocks on a condition variable or sleeps; contended paths
//! spin briefly and yield.
//!
//! ## Non-goals
//!
//! Persistence, key removal, range scans beyond the lexicographic
//! cursor, dynamic value sizes, multi-key transactions.

pub mod arena;
pub mod iter;
pub mod level;
mod log;
mod node;
mod ordering;
pub mod token;
pub mod trie;

pub use arena::{ArenaBacking, MemStat};
pub use iter::PatriciaIter;
pub use level::ConcurrentLevel;
pub use token::{CopyValueHooks, ReaderToken, TokenState, ValueHooks, WriterToken};
pub use trie::{CreateError, Patricia, PatriciaConfig, TrieStat};
