//! Logging for the trie's structural-mutation and token-protocol edges.
//!
//! Only a handful of places in the crate are worth instrumenting: the
//! four mutation sites in the insert walker (fork, split, mark-final,
//! add-state-move), the token acquire/release/gc edges, and trie
//! creation. All of them sit on hot paths, so the instrumentation must
//! cost nothing unless somebody asked for it.
//!
//! [`log_event!`] is the single entry point. The first argument names the
//! `tracing` level, the rest is an ordinary `tracing` field list:
//!
//! ```rust,ignore
//! log_event!(trace, depth = d, "split");
//! log_event!(debug, capacity = arena.capacity(), "patricia created");
//! ```
//!
//! With the `tracing` cargo feature enabled, the call forwards to the
//! matching `tracing` macro and the event carries the call site's module
//! path, so `RUST_LOG=patrie::trie=trace` isolates the walker and
//! `RUST_LOG=patrie::token=trace` isolates the reclamation protocol.
//! Without the feature (the default), the macro expands to nothing and
//! the walker compiles as if the call were never written.

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! log_event {
    ($level:ident, $($field:tt)*) => {
        tracing::$level!($($field)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_event {
    ($level:ident, $($field:tt)*) => {
        // Expands to nothing; the field expressions are never evaluated.
    };
}

pub(crate) use log_event;
