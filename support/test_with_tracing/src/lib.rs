// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides a `#[test]` attribute that initializes a `tracing` subscriber
//! before running the test body, so that `tracing` events emitted by the code
//! under test show up in the captured test output.
//!
//! ```ignore
//! use test_with_tracing::test;
//!
//! #[test]
//! fn my_test() {
//!     tracing::info!("visible with --nocapture or on failure");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use test_with_tracing_macro::test;

use std::sync::Once;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Installs the global test subscriber. Called by the code generated by
/// [`test`]; calling it more than once is harmless.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::TRACE.into())
            .from_env_lossy();

        // Another harness in the same process may have already installed a
        // global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
