//! Testing utilities for conflux channels and pipelines.
//!
//! This module provides:
//! - Mock transforms (recording, failing, slow)
//! - Tracing initialization for tests

mod transforms;

pub use transforms::{FailingTransform, RecordingTransform, SlowTransform};

/// Initializes tracing for tests, honoring `RUST_LOG`. Safe to call more
/// than once; only the first initialization takes effect.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
