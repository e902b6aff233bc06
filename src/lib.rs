//! bughunt library crate
//!
//! Deep code diagnostics: an eight-phase bug-hunting pipeline, an escalation
//! ladder, multi-model deliberation over candidate fixes, a risk-gated
//! autonomy table, durable sessions and a convergence loop tying them together.
//! The binary and benchmarks drive everything through these modules.

pub mod autonomy;
pub mod catalog;
pub mod chamber;
pub mod config;
pub mod convergence;
pub mod diff;
pub mod error;
pub mod ladder;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod unit;
pub mod util;

pub use config::Config;
pub use error::{HuntError, HuntResult, InputError};
pub use pipeline::Analyzer;
pub use report::Report;
pub use unit::CodeUnit;
