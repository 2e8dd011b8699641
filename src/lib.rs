/// dagshield-train library crate.
///
/// Exposes the training pipeline stages as a public API so that
/// integration tests in tests/ can import them via `dagshield_train::`.
///
/// The binary entry point (src/main.rs) drives the same stages through
/// `pipeline::run`.
pub mod config;
pub mod evaluator;
pub mod input;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod plot;
pub mod preprocess;
pub mod synth;
pub mod trainer;
pub mod utils;
