//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g. `patrie=debug,patrie::trie=trace`)
//! - `PATRIE_LOG_DIR`: log directory (default: `logs/`)
//! - `PATRIE_LOG_CONSOLE`: set to "0" to disable console output
//!
//! When a log directory is writable, events also go to
//! `logs/patrie.json` as NDJSON, one event per line:
//!
//! ```bash
//! cat logs/patrie.json | jq .
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with console and file logging.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

fn setup_tracing() {
    let log_dir: PathBuf =
        PathBuf::from(env::var("PATRIE_LOG_DIR").unwrap_or_else(|_| "logs".into()));
    let console_enabled: bool = !env::var("PATRIE_LOG_CONSOLE").is_ok_and(|v| v == "0");

    // === Console Layer ===
    let console_layer = if console_enabled {
        Some(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(true)
                .with_line_number(true)
                .compact()
                .with_filter(make_filter(Level::INFO)),
        )
    } else {
        None
    };

    // === File Layer (NDJSON) ===
    let file_layer = std::fs::create_dir_all(&log_dir)
        .ok()
        .and_then(|()| File::create(log_dir.join("patrie.json")).ok())
        .map(|file: File| {
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_thread_ids(true)
                .with_target(true)
                .with_line_number(true)
                .json()
                .with_filter(make_filter(Level::INFO))
        });

    // Compose and install (try_init: the lib may have set one already).
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
